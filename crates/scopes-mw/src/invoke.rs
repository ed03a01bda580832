//! Outgoing invocations
//!
//! `ObjectProxy` is the untyped client handle every typed proxy wraps. A
//! call borrows one of the facade's invoker pools; the pool task opens a
//! connection to the proxy's endpoint, writes the request and, for twoway
//! calls, waits for the response under the proxy timeout.

use std::fmt;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use bytes::Bytes;
use scopes_wire::{connect, Pdu, PduTransport, ReplyStatus, RequestPdu, WireError};
use tracing::debug;

use crate::middleware::Middleware;
use crate::types::{Category, InvocationMode, MwError, ProxyAddress, Result};

static NEXT_CALL_ID: AtomicU32 = AtomicU32::new(1);

fn next_call_id() -> u32 {
    NEXT_CALL_ID.fetch_add(1, Ordering::Relaxed)
}

/// Untyped proxy bound to one servant
#[derive(Clone)]
pub struct ObjectProxy {
    mw: Weak<Middleware>,
    address: ProxyAddress,
}

impl ObjectProxy {
    pub fn new(mw: Weak<Middleware>, address: ProxyAddress) -> Self {
        Self { mw, address }
    }

    pub fn address(&self) -> &ProxyAddress {
        &self.address
    }

    pub fn identity(&self) -> &str {
        self.address.identity()
    }

    pub fn category(&self) -> Category {
        self.address.category()
    }

    pub fn mode(&self) -> InvocationMode {
        self.address.mode()
    }

    /// Timeout in milliseconds; -1 is infinite
    pub fn timeout(&self) -> i64 {
        self.address.timeout()
    }

    /// Same servant, different timeout
    pub fn with_timeout(&self, timeout_ms: i64) -> Result<Self> {
        Ok(Self {
            mw: self.mw.clone(),
            address: self.address.clone().with_timeout(timeout_ms)?,
        })
    }

    pub(crate) fn middleware_ref(&self) -> &Weak<Middleware> {
        &self.mw
    }

    fn middleware(&self) -> Result<Arc<Middleware>> {
        self.mw.upgrade().ok_or_else(MwError::stopped)
    }

    /// Invoke `operation` and block for its result.
    pub fn invoke_twoway(&self, operation: &str, payload: Bytes) -> Result<Bytes> {
        let handle = {
            let pool = self.middleware()?.twoway_pool()?;
            let address = self.address.clone();
            let operation = operation.to_string();
            pool.submit(move || twoway_call(&address, &operation, payload))?
        };
        handle.get()?
    }

    /// Queue `operation`; failures are logged and dropped.
    pub fn invoke_oneway(&self, operation: &str, payload: Bytes) -> Result<()> {
        let pool = self.middleware()?.oneway_pool()?;
        let address = self.address.clone();
        let operation = operation.to_string();
        pool.execute(move || {
            if let Err(e) = oneway_call(&address, &operation, payload) {
                debug!("Oneway {} to {} failed: {}", operation, address, e);
            }
        })
    }
}

impl fmt::Display for ObjectProxy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(&self.address, f)
    }
}

impl fmt::Debug for ObjectProxy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("ObjectProxy").field(&self.address.to_string()).finish()
    }
}

impl PartialEq for ObjectProxy {
    fn eq(&self, other: &Self) -> bool {
        self.address == other.address
    }
}

fn io_timeout(timeout_ms: i64) -> Option<Duration> {
    // A zero socket timeout means "block forever", so round up to 1 ms.
    u64::try_from(timeout_ms)
        .ok()
        .map(|ms| Duration::from_millis(ms.max(1)))
}

fn open(address: &ProxyAddress) -> Result<PduTransport<std::os::unix::net::UnixStream>> {
    let stream = connect(address.endpoint(), io_timeout(address.timeout())).map_err(|e| match e {
        WireError::Io(io) if matches!(
            io.kind(),
            std::io::ErrorKind::NotFound | std::io::ErrorKind::ConnectionRefused
        ) =>
        {
            MwError::ObjectNotExist {
                identity: address.identity().to_string(),
                endpoint: address.endpoint().to_string(),
            }
        }
        other => other.into(),
    })?;
    Ok(PduTransport::new(stream))
}

fn twoway_call(address: &ProxyAddress, operation: &str, payload: Bytes) -> Result<Bytes> {
    let call_id = next_call_id();
    let mut transport = open(address)?;
    let request = RequestPdu::new(
        call_id,
        address.identity(),
        address.category().as_str(),
        operation,
        payload,
        false,
    );
    transport.write_pdu(&request.encode())?;

    let response = match transport.read_pdu_decoded() {
        Ok(Pdu::Response(response)) => response,
        Ok(Pdu::Request(_)) => {
            return Err(WireError::InvalidPdu("expected response PDU".to_string()).into())
        }
        Err(WireError::Timeout) => {
            return Err(MwError::Timeout {
                endpoint: address.endpoint().to_string(),
                timeout_ms: address.timeout(),
            })
        }
        Err(e) => return Err(e.into()),
    };
    if response.header.call_id != call_id {
        return Err(WireError::InvalidPdu(format!(
            "response call_id {} does not match request {}",
            response.header.call_id, call_id
        ))
        .into());
    }

    match response.status {
        ReplyStatus::Success => Ok(response.payload),
        ReplyStatus::ObjectNotExist => Err(MwError::ObjectNotExist {
            identity: address.identity().to_string(),
            endpoint: address.endpoint().to_string(),
        }),
        ReplyStatus::OperationNotExist => Err(MwError::OperationNotExist {
            identity: address.identity().to_string(),
            operation: operation.to_string(),
        }),
        ReplyStatus::RuntimeFault => Err(MwError::Remote(
            response.fault_message().unwrap_or_else(|| "unknown remote fault".to_string()),
        )),
    }
}

fn oneway_call(address: &ProxyAddress, operation: &str, payload: Bytes) -> Result<()> {
    let mut transport = open(address)?;
    let request = RequestPdu::new(
        next_call_id(),
        address.identity(),
        address.category().as_str(),
        operation,
        payload,
        true,
    );
    transport.write_pdu(&request.encode())?;
    Ok(())
}
