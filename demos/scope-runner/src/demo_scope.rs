//! A scope that answers every query with a few numbered echoes

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use bytes::Bytes;
use parking_lot::Mutex;
use tracing::{debug, info};

use scopes_mw::{
    AbstractObject, Disconnector, FinishReason, Hints, InvokeInfo, QueryCtrlObject,
    QueryCtrlProxy, QueryObject, ReplyProxy, Result, ScopeObject,
};

/// Results pushed per query
const RESULTS_PER_QUERY: usize = 3;

pub struct DemoScope {
    id: String,
}

impl DemoScope {
    pub fn new(id: impl Into<String>) -> Self {
        Self { id: id.into() }
    }

    /// Register a query and its control object, then start the query.
    fn spawn_query(&self, text: String, reply: ReplyProxy, info: &InvokeInfo) -> Result<QueryCtrlProxy> {
        let cancelled = Arc::new(AtomicBool::new(false));
        let ctrl = info.middleware.add_query_ctrl_object(Arc::new(DemoQueryCtrl {
            cancelled: cancelled.clone(),
            disconnector: Mutex::new(None),
        }))?;
        let query = info.middleware.add_query_object(Arc::new(DemoQuery {
            scope_id: self.id.clone(),
            text,
            cancelled,
            disconnector: Mutex::new(None),
        }))?;
        query.run(&reply)?;
        Ok(ctrl)
    }
}

impl AbstractObject for DemoScope {
    fn set_disconnect_function(&self, _disconnector: Disconnector) {}
}

impl ScopeObject for DemoScope {
    fn create_query(&self, query: &str, _hints: &Hints, reply: ReplyProxy, info: &InvokeInfo) -> Result<QueryCtrlProxy> {
        info!("{}: query \"{}\"", self.id, query);
        self.spawn_query(query.to_string(), reply, info)
    }

    fn activate(&self, result: &str, _hints: &Hints, reply: ReplyProxy, info: &InvokeInfo) -> Result<QueryCtrlProxy> {
        self.spawn_query(format!("activate {}", result), reply, info)
    }

    fn activate_preview_action(
        &self,
        result: &str,
        _hints: &Hints,
        action_id: &str,
        reply: ReplyProxy,
        info: &InvokeInfo,
    ) -> Result<QueryCtrlProxy> {
        self.spawn_query(format!("{} {}", action_id, result), reply, info)
    }

    fn preview(&self, result: &str, _hints: &Hints, reply: ReplyProxy, info: &InvokeInfo) -> Result<QueryCtrlProxy> {
        self.spawn_query(format!("preview {}", result), reply, info)
    }
}

struct DemoQuery {
    scope_id: String,
    text: String,
    cancelled: Arc<AtomicBool>,
    disconnector: Mutex<Option<Disconnector>>,
}

impl AbstractObject for DemoQuery {
    fn set_disconnect_function(&self, disconnector: Disconnector) {
        *self.disconnector.lock() = Some(disconnector);
    }
}

impl QueryObject for DemoQuery {
    fn run(&self, reply: ReplyProxy, _info: &InvokeInfo) -> Result<()> {
        let mut reason = FinishReason::Finished;
        for n in 1..=RESULTS_PER_QUERY {
            if self.cancelled.load(Ordering::Acquire) {
                reason = FinishReason::Cancelled;
                break;
            }
            reply.push(Bytes::from(format!("{} #{}: {}", self.scope_id, n, self.text)))?;
        }
        reply.finished(&reason)?;
        if let Some(disconnector) = self.disconnector.lock().take() {
            disconnector.disconnect();
        }
        Ok(())
    }
}

struct DemoQueryCtrl {
    cancelled: Arc<AtomicBool>,
    disconnector: Mutex<Option<Disconnector>>,
}

impl AbstractObject for DemoQueryCtrl {
    fn set_disconnect_function(&self, disconnector: Disconnector) {
        *self.disconnector.lock() = Some(disconnector);
    }
}

impl QueryCtrlObject for DemoQueryCtrl {
    fn cancel(&self, info: &InvokeInfo) -> Result<()> {
        debug!("Cancelling query {}", info.identity());
        self.cancelled.store(true, Ordering::Release);
        Ok(())
    }

    fn destroy(&self, _info: &InvokeInfo) -> Result<()> {
        if let Some(disconnector) = self.disconnector.lock().take() {
            disconnector.disconnect();
        }
        Ok(())
    }
}
