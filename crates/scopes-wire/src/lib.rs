//! Wire layer for the scopes middleware
//!
//! This crate frames middleware invocations into PDUs and moves them over
//! local Unix-domain sockets. It knows nothing about servants or adapters;
//! the `scopes-mw` crate builds the object model on top of it.
//!
//! # Example
//!
//! ```no_run
//! use scopes_wire::{connect, Endpoint, PduTransport, RequestPdu, Pdu};
//! use bytes::Bytes;
//!
//! let endpoint: Endpoint = "ipc:///tmp/scopes/priv/scope-A".parse().unwrap();
//! let stream = connect(&endpoint, None).unwrap();
//! let mut transport = PduTransport::new(stream);
//!
//! let request = RequestPdu::new(1, "scope-A", "Scope", "preview", Bytes::new(), false);
//! transport.write_pdu(&request.encode()).unwrap();
//! match transport.read_pdu_decoded().unwrap() {
//!     Pdu::Response(resp) => println!("status: {:?}", resp.status),
//!     Pdu::Request(_) => unreachable!(),
//! }
//! ```

pub mod endpoint;
pub mod error;
pub mod marshal;
pub mod pdu;
pub mod transport;

pub use endpoint::{Endpoint, IPC_SCHEME, MAX_SOCKET_PATH};
pub use error::{Result, WireError};
pub use marshal::{Marshal, PayloadReader, PayloadWriter, Unmarshal};
pub use pdu::{
    PacketFlags, PacketType, Pdu, PduHeader, ReplyStatus, RequestPdu, ResponsePdu, WIRE_VERSION,
};
pub use transport::{bind_exclusive, connect, PduTransport, DEFAULT_MAX_PDU_SIZE};
