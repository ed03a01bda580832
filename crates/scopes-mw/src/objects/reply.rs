//! Reply category: results flowing back to the query originator

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use bytes::Bytes;
use scopes_wire::{PayloadReader, PayloadWriter};
use tracing::debug;

use super::AbstractObject;
use crate::adapter::{DisconnectSlot, Servant};
use crate::types::{Category, FinishReason, Result};

const PUSH: &str = "push";
const FINISHED: &str = "finished";

/// Receiver of query results
pub trait ReplyObject: AbstractObject {
    fn push(&self, payload: Bytes) -> Result<()>;
    fn finished(&self, reason: FinishReason) -> Result<()>;
}

/// Reply servant; forwards the first `finished` only, drops pushes that
/// arrive after it, and disconnects itself once finished.
pub(crate) fn reply_servant(reply: Arc<dyn ReplyObject>, slot: Arc<DisconnectSlot>) -> Arc<Servant> {
    let done = Arc::new(AtomicBool::new(false));
    let push_reply = reply.clone();
    let push_done = done.clone();
    Servant::builder(Category::Reply)
        .operation(PUSH, move |current, payload| {
            if push_done.load(Ordering::Acquire) {
                debug!("Ignoring push to finished reply {}", current.identity);
                return Ok(Bytes::new());
            }
            push_reply.push(payload)?;
            Ok(Bytes::new())
        })
        .operation(FINISHED, move |current, payload| {
            let mut reader = PayloadReader::new(payload);
            let reason: FinishReason = reader.get()?;
            reader.finish()?;
            if done.swap(true, Ordering::AcqRel) {
                debug!("Ignoring repeated finished on reply {}", current.identity);
                return Ok(Bytes::new());
            }
            let result = reply.finished(reason);
            slot.disconnect();
            result.map(|()| Bytes::new())
        })
        .build()
}

typed_proxy! {
    /// Oneway proxy to a reply servant
    ReplyProxy
}

impl ReplyProxy {
    pub fn push(&self, payload: Bytes) -> Result<()> {
        self.proxy.invoke_oneway(PUSH, payload)
    }

    pub fn finished(&self, reason: &FinishReason) -> Result<()> {
        self.proxy
            .invoke_oneway(FINISHED, PayloadWriter::new().put(reason).finish())
    }
}
