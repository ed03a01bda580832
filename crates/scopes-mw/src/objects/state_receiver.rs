//! State category: scope processes report readiness to the registry

use std::fmt;
use std::sync::Arc;

use bytes::{Bytes, BytesMut};
use scopes_wire::{Marshal, PayloadReader, PayloadWriter, Unmarshal, WireError};

use super::AbstractObject;
use crate::adapter::Servant;
use crate::types::{Category, Result};

const PUSH_STATE: &str = "push_state";

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ScopeState {
    ScopeReady,
    ScopeStopping,
}

impl fmt::Display for ScopeState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ScopeState::ScopeReady => f.write_str("ScopeReady"),
            ScopeState::ScopeStopping => f.write_str("ScopeStopping"),
        }
    }
}

impl Marshal for ScopeState {
    fn marshal(&self, buf: &mut BytesMut) {
        let tag: u8 = match self {
            ScopeState::ScopeReady => 0,
            ScopeState::ScopeStopping => 1,
        };
        tag.marshal(buf);
    }
}

impl Unmarshal for ScopeState {
    fn unmarshal(buf: &mut Bytes) -> scopes_wire::Result<Self> {
        match u8::unmarshal(buf)? {
            0 => Ok(ScopeState::ScopeReady),
            1 => Ok(ScopeState::ScopeStopping),
            other => Err(WireError::InvalidPdu(format!("unknown scope state {}", other))),
        }
    }
}

pub trait StateReceiverObject: AbstractObject {
    fn push_state(&self, sender_id: &str, state: ScopeState) -> Result<()>;
}

pub(crate) fn state_receiver_servant(receiver: Arc<dyn StateReceiverObject>) -> Arc<Servant> {
    Servant::builder(Category::State)
        .operation(PUSH_STATE, move |_, payload| {
            let mut reader = PayloadReader::new(payload);
            let sender_id: String = reader.get()?;
            let state: ScopeState = reader.get()?;
            reader.finish()?;
            receiver.push_state(&sender_id, state)?;
            Ok(Bytes::new())
        })
        .build()
}

typed_proxy! {
    /// Oneway proxy to the registry's state receiver
    StateReceiverProxy
}

impl StateReceiverProxy {
    pub fn push_state(&self, sender_id: &str, state: ScopeState) -> Result<()> {
        self.proxy
            .invoke_oneway(PUSH_STATE, PayloadWriter::new().put(sender_id).put(&state).finish())
    }
}
