//! Blocking PDU transport over Unix-domain streams
//!
//! PDUs are self-delimiting via the `frag_length` field in the header, so a
//! stream can carry any number of them back to back.

use std::io::{ErrorKind, Read, Write};
use std::os::unix::net::{UnixListener, UnixStream};
use std::time::Duration;

use bytes::{Bytes, BytesMut};
use tracing::debug;

use crate::endpoint::Endpoint;
use crate::error::{Result, WireError};
use crate::pdu::{Pdu, PduHeader};

/// Maximum PDU size (1 MiB default)
pub const DEFAULT_MAX_PDU_SIZE: usize = 1 << 20;

/// PDU transport for reading/writing PDUs over a byte stream
pub struct PduTransport<T> {
    inner: T,
    max_pdu_size: usize,
}

impl<T> PduTransport<T> {
    pub fn new(inner: T) -> Self {
        Self {
            inner,
            max_pdu_size: DEFAULT_MAX_PDU_SIZE,
        }
    }

    pub fn with_max_pdu_size(mut self, max_size: usize) -> Self {
        self.max_pdu_size = max_size;
        self
    }

    pub fn into_inner(self) -> T {
        self.inner
    }

    pub fn get_ref(&self) -> &T {
        &self.inner
    }

    pub fn get_mut(&mut self) -> &mut T {
        &mut self.inner
    }
}

impl<T: Read> PduTransport<T> {
    /// Read a complete PDU
    pub fn read_pdu(&mut self) -> Result<Bytes> {
        let mut header = [0u8; PduHeader::SIZE];
        let got = self.fill(&mut header)?;
        if got == 0 {
            return Err(WireError::ConnectionClosed);
        }
        if got < PduHeader::SIZE {
            return Err(WireError::Io(std::io::Error::new(
                ErrorKind::UnexpectedEof,
                "incomplete PDU header",
            )));
        }

        let frag_length = PduHeader::decode(&header)?.frag_length as usize;
        if frag_length < PduHeader::SIZE {
            return Err(WireError::InvalidPdu(format!(
                "invalid fragment length: {} < header size",
                frag_length
            )));
        }
        if frag_length > self.max_pdu_size {
            return Err(WireError::PduTooLarge {
                size: frag_length,
                max: self.max_pdu_size,
            });
        }

        let mut pdu = BytesMut::zeroed(frag_length);
        pdu[..PduHeader::SIZE].copy_from_slice(&header);
        let body_len = frag_length - PduHeader::SIZE;
        let got = self.fill(&mut pdu[PduHeader::SIZE..])?;
        if got < body_len {
            return Err(WireError::Io(std::io::Error::new(
                ErrorKind::UnexpectedEof,
                format!("incomplete PDU: expected {} bytes, got {}", frag_length, PduHeader::SIZE + got),
            )));
        }
        Ok(pdu.freeze())
    }

    /// Read and decode a complete PDU
    pub fn read_pdu_decoded(&mut self) -> Result<Pdu> {
        let data = self.read_pdu()?;
        Pdu::decode(&data)
    }

    /// Read until `buf` is full or EOF; returns the number of bytes read.
    fn fill(&mut self, buf: &mut [u8]) -> Result<usize> {
        let mut filled = 0;
        while filled < buf.len() {
            match self.inner.read(&mut buf[filled..]) {
                Ok(0) => break,
                Ok(n) => filled += n,
                Err(e) if e.kind() == ErrorKind::Interrupted => continue,
                Err(e) if matches!(e.kind(), ErrorKind::WouldBlock | ErrorKind::TimedOut) => {
                    return Err(WireError::Timeout)
                }
                Err(e) => return Err(e.into()),
            }
        }
        Ok(filled)
    }
}

impl<T: Write> PduTransport<T> {
    /// Write a complete PDU (already encoded)
    pub fn write_pdu(&mut self, data: &[u8]) -> Result<()> {
        self.inner.write_all(data)?;
        self.inner.flush()?;
        Ok(())
    }

    /// Encode and write a PDU
    pub fn write_pdu_encoded(&mut self, pdu: &Pdu) -> Result<()> {
        self.write_pdu(&pdu.encode())
    }
}

/// Connect to an endpoint; `timeout` bounds every subsequent read and write.
pub fn connect(endpoint: &Endpoint, timeout: Option<Duration>) -> Result<UnixStream> {
    endpoint.validate()?;
    let stream = UnixStream::connect(endpoint.path())?;
    stream.set_read_timeout(timeout)?;
    stream.set_write_timeout(timeout)?;
    Ok(stream)
}

/// Bind a listener, refusing to steal an endpoint that another process serves.
///
/// A successful connect attempt means a live listener owns the path. A stale
/// socket file left behind by a dead process is removed before binding.
pub fn bind_exclusive(endpoint: &Endpoint) -> Result<UnixListener> {
    endpoint.validate()?;
    let path = endpoint.path();
    if UnixStream::connect(path).is_ok() {
        return Err(WireError::EndpointInUse(endpoint.to_string()));
    }
    match std::fs::remove_file(path) {
        Ok(()) => debug!("Removed stale socket file {}", path.display()),
        Err(e) if e.kind() == ErrorKind::NotFound => {}
        Err(e) => return Err(e.into()),
    }
    Ok(UnixListener::bind(path)?)
}
