//! Object adapters and servant dispatch
//!
//! - `ObjectAdapter`: one listening endpoint, its pool and its servants
//! - `Servant`: category tag plus operation table
//! - `Disconnector`: idempotent removal callback handed to object implementations

mod disconnect;
mod object_adapter;
mod servant;

pub use disconnect::{DisconnectSlot, Disconnector};
pub use object_adapter::{AdapterState, AdapterStats, AdapterStatsSnapshot, ObjectAdapter};
pub use servant::{Current, OperationHandler, Servant, ServantBuilder};
