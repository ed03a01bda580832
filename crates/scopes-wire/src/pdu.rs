//! Middleware PDU definitions
//!
//! Every invocation travels as one request PDU; twoway invocations are
//! answered with exactly one response PDU on the same connection.
//!
//! ```text
//! 0        1        2        3        4                8               12
//! +--------+--------+--------+--------+----------------+----------------+
//! |version | ptype  | flags  |reserved|  frag_length   |    call_id     |
//! +--------+--------+--------+--------+----------------+----------------+
//! |                          body (frag_length - 12)                    |
//! +---------------------------------------------------------------------+
//! ```
//!
//! Multi-byte header fields are little-endian.

use bytes::{Buf, BufMut, Bytes, BytesMut};

use crate::error::{Result, WireError};
use crate::marshal::{Marshal, Unmarshal};

/// Wire protocol version
pub const WIRE_VERSION: u8 = 1;

/// Packet types
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum PacketType {
    /// Invocation of an operation on a servant
    Request = 0,
    /// Result of a twoway invocation
    Response = 1,
}

impl PacketType {
    pub fn from_u8(value: u8) -> Option<Self> {
        match value {
            0 => Some(Self::Request),
            1 => Some(Self::Response),
            _ => None,
        }
    }
}

/// Packet flags
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PacketFlags(u8);

impl PacketFlags {
    /// The sender does not wait for a response
    pub const ONEWAY: u8 = 0x01;

    pub fn from_u8(value: u8) -> Self {
        Self(value)
    }

    pub fn as_u8(self) -> u8 {
        self.0
    }

    pub fn oneway() -> Self {
        Self(Self::ONEWAY)
    }

    pub fn is_oneway(self) -> bool {
        self.0 & Self::ONEWAY != 0
    }
}

/// Common PDU header
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PduHeader {
    pub version: u8,
    pub packet_type: PacketType,
    pub flags: PacketFlags,
    /// Total length of the PDU, header included
    pub frag_length: u32,
    pub call_id: u32,
}

impl PduHeader {
    /// PDU header size in bytes
    pub const SIZE: usize = 12;

    pub fn new(packet_type: PacketType, flags: PacketFlags, call_id: u32) -> Self {
        Self {
            version: WIRE_VERSION,
            packet_type,
            flags,
            frag_length: 0, // Set when encoding
            call_id,
        }
    }

    pub fn encode(&self, buf: &mut BytesMut) {
        buf.put_u8(self.version);
        buf.put_u8(self.packet_type as u8);
        buf.put_u8(self.flags.as_u8());
        buf.put_u8(0);
        buf.put_u32_le(self.frag_length);
        buf.put_u32_le(self.call_id);
    }

    pub fn decode(data: &[u8]) -> Result<Self> {
        if data.len() < Self::SIZE {
            return Err(WireError::BufferUnderflow {
                needed: Self::SIZE,
                have: data.len(),
            });
        }

        let version = data[0];
        if version != WIRE_VERSION {
            return Err(WireError::VersionMismatch {
                expected: WIRE_VERSION,
                got: version,
            });
        }

        let packet_type = PacketType::from_u8(data[1])
            .ok_or_else(|| WireError::InvalidPdu(format!("unknown packet type {}", data[1])))?;
        let flags = PacketFlags::from_u8(data[2]);
        let frag_length = u32::from_le_bytes([data[4], data[5], data[6], data[7]]);
        let call_id = u32::from_le_bytes([data[8], data[9], data[10], data[11]]);

        Ok(Self {
            version,
            packet_type,
            flags,
            frag_length,
            call_id,
        })
    }
}

fn finish_pdu(header: &PduHeader, body: BytesMut) -> Bytes {
    let mut header = header.clone();
    header.frag_length = (PduHeader::SIZE + body.len()) as u32;
    let mut buf = BytesMut::with_capacity(header.frag_length as usize);
    header.encode(&mut buf);
    buf.extend_from_slice(&body);
    buf.freeze()
}

fn body_of(data: &[u8], header: &PduHeader) -> Result<Bytes> {
    let frag_length = header.frag_length as usize;
    if frag_length < PduHeader::SIZE || data.len() < frag_length {
        return Err(WireError::InvalidPdu(format!(
            "fragment length {} does not match {} received bytes",
            frag_length,
            data.len()
        )));
    }
    Ok(Bytes::copy_from_slice(&data[PduHeader::SIZE..frag_length]))
}

/// Request PDU
///
/// Addresses one operation on one servant: the identity selects the servant
/// inside the adapter, the category selects the fallback default servant.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RequestPdu {
    pub header: PduHeader,
    pub identity: String,
    pub category: String,
    pub operation: String,
    pub payload: Bytes,
}

impl RequestPdu {
    pub fn new(
        call_id: u32,
        identity: impl Into<String>,
        category: impl Into<String>,
        operation: impl Into<String>,
        payload: Bytes,
        oneway: bool,
    ) -> Self {
        let flags = if oneway {
            PacketFlags::oneway()
        } else {
            PacketFlags::default()
        };
        Self {
            header: PduHeader::new(PacketType::Request, flags, call_id),
            identity: identity.into(),
            category: category.into(),
            operation: operation.into(),
            payload,
        }
    }

    pub fn is_oneway(&self) -> bool {
        self.header.flags.is_oneway()
    }

    pub fn encode(&self) -> Bytes {
        let mut body = BytesMut::new();
        self.identity.marshal(&mut body);
        self.category.marshal(&mut body);
        self.operation.marshal(&mut body);
        body.extend_from_slice(&self.payload);
        finish_pdu(&self.header, body)
    }

    pub fn decode(data: &[u8]) -> Result<Self> {
        let header = PduHeader::decode(data)?;
        if header.packet_type != PacketType::Request {
            return Err(WireError::InvalidPdu("expected request PDU".to_string()));
        }
        let mut body = body_of(data, &header)?;
        let identity = String::unmarshal(&mut body)?;
        let category = String::unmarshal(&mut body)?;
        let operation = String::unmarshal(&mut body)?;
        Ok(Self {
            header,
            identity,
            category,
            operation,
            payload: body,
        })
    }
}

/// Outcome of a dispatched request
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ReplyStatus {
    /// The operation completed; the payload holds its result
    Success = 0,
    /// No servant (and no default servant) matched the identity
    ObjectNotExist = 1,
    /// The servant has no handler for the operation
    OperationNotExist = 2,
    /// The handler raised a fault; the payload holds the message
    RuntimeFault = 3,
}

impl ReplyStatus {
    pub fn from_u8(value: u8) -> Option<Self> {
        match value {
            0 => Some(Self::Success),
            1 => Some(Self::ObjectNotExist),
            2 => Some(Self::OperationNotExist),
            3 => Some(Self::RuntimeFault),
            _ => None,
        }
    }
}

/// Response PDU
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResponsePdu {
    pub header: PduHeader,
    pub status: ReplyStatus,
    pub payload: Bytes,
}

impl ResponsePdu {
    pub fn success(call_id: u32, payload: Bytes) -> Self {
        Self {
            header: PduHeader::new(PacketType::Response, PacketFlags::default(), call_id),
            status: ReplyStatus::Success,
            payload,
        }
    }

    pub fn fault(call_id: u32, status: ReplyStatus, message: &str) -> Self {
        let mut payload = BytesMut::new();
        message.marshal(&mut payload);
        Self {
            header: PduHeader::new(PacketType::Response, PacketFlags::default(), call_id),
            status,
            payload: payload.freeze(),
        }
    }

    /// The fault message carried by a non-success response.
    pub fn fault_message(&self) -> Option<String> {
        if self.status == ReplyStatus::Success {
            return None;
        }
        let mut payload = self.payload.clone();
        String::unmarshal(&mut payload).ok()
    }

    pub fn encode(&self) -> Bytes {
        let mut body = BytesMut::with_capacity(1 + self.payload.len());
        body.put_u8(self.status as u8);
        body.extend_from_slice(&self.payload);
        finish_pdu(&self.header, body)
    }

    pub fn decode(data: &[u8]) -> Result<Self> {
        let header = PduHeader::decode(data)?;
        if header.packet_type != PacketType::Response {
            return Err(WireError::InvalidPdu("expected response PDU".to_string()));
        }
        let mut body = body_of(data, &header)?;
        if !body.has_remaining() {
            return Err(WireError::InvalidPdu("response PDU without status".to_string()));
        }
        let raw_status = body.get_u8();
        let status = ReplyStatus::from_u8(raw_status)
            .ok_or_else(|| WireError::InvalidPdu(format!("unknown reply status {}", raw_status)))?;
        Ok(Self {
            header,
            status,
            payload: body,
        })
    }
}

/// Any decoded PDU
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Pdu {
    Request(RequestPdu),
    Response(ResponsePdu),
}

impl Pdu {
    pub fn decode(data: &[u8]) -> Result<Self> {
        let header = PduHeader::decode(data)?;
        match header.packet_type {
            PacketType::Request => Ok(Pdu::Request(RequestPdu::decode(data)?)),
            PacketType::Response => Ok(Pdu::Response(ResponsePdu::decode(data)?)),
        }
    }

    pub fn encode(&self) -> Bytes {
        match self {
            Pdu::Request(req) => req.encode(),
            Pdu::Response(resp) => resp.encode(),
        }
    }

    pub fn call_id(&self) -> u32 {
        match self {
            Pdu::Request(req) => req.header.call_id,
            Pdu::Response(resp) => resp.header.call_id,
        }
    }
}
