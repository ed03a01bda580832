//! Disconnect callbacks
//!
//! Every servant registered through the facade is handed a callback that
//! removes it from its adapter. The callback may race with other removals
//! (explicit disconnect, adapter shutdown, a second disconnect), so it runs
//! its removal at most once and never fails.

use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;

type DisconnectFn = Box<dyn Fn() + Send + Sync>;

/// Idempotent removal callback
#[derive(Clone)]
pub struct Disconnector {
    inner: Arc<DisconnectorInner>,
}

struct DisconnectorInner {
    done: AtomicBool,
    action: DisconnectFn,
}

impl Disconnector {
    pub fn new<F>(action: F) -> Self
    where
        F: Fn() + Send + Sync + 'static,
    {
        Self {
            inner: Arc::new(DisconnectorInner {
                done: AtomicBool::new(false),
                action: Box::new(action),
            }),
        }
    }

    /// Run the removal unless some caller already did.
    ///
    /// Returns true for the one caller that performed it.
    pub fn disconnect(&self) -> bool {
        if self.inner.done.swap(true, Ordering::AcqRel) {
            return false;
        }
        (self.inner.action)();
        true
    }

    pub fn is_disconnected(&self) -> bool {
        self.inner.done.load(Ordering::Acquire)
    }
}

impl fmt::Debug for Disconnector {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Disconnector")
            .field("disconnected", &self.is_disconnected())
            .finish()
    }
}

/// Holder for the disconnect callback inside an object implementation
#[derive(Default)]
pub struct DisconnectSlot {
    slot: Mutex<Option<Disconnector>>,
}

impl DisconnectSlot {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set(&self, disconnector: Disconnector) {
        *self.slot.lock() = Some(disconnector);
    }

    /// Disconnect the owning object; a no-op if no callback was set.
    pub fn disconnect(&self) {
        let disconnector = self.slot.lock().clone();
        if let Some(d) = disconnector {
            d.disconnect();
        }
    }
}
