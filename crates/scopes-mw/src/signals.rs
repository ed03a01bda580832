//! Termination signal masking
//!
//! A process hosting middleware threads wants SIGINT, SIGTERM and SIGCHLD
//! delivered to one place only (typically a thread that calls `sigwait`).
//! Signal masks are inherited by threads at spawn time, so the mask has to
//! be set on the main thread before the middleware starts any thread.

use std::marker::PhantomData;

use nix::sys::signal::{pthread_sigmask, SigSet, SigmaskHow};
pub use nix::sys::signal::Signal;
use tracing::{debug, warn};

use crate::types::{MwError, Result};

/// Signals blocked by [`SignalMask::block_termination`]
pub const TERMINATION_SIGNALS: [Signal; 3] = [Signal::SIGINT, Signal::SIGTERM, Signal::SIGCHLD];

/// Restores the calling thread's previous signal mask when dropped
#[derive(Debug)]
pub struct SignalMask {
    previous: SigSet,
    // The mask belongs to the thread that set it.
    _not_send: PhantomData<*const ()>,
}

impl SignalMask {
    /// Block the termination signals for the calling thread and every
    /// thread it spawns from now on.
    pub fn block_termination() -> Result<Self> {
        let mut previous = SigSet::empty();
        pthread_sigmask(SigmaskHow::SIG_BLOCK, Some(&Self::termination_set()), Some(&mut previous))
            .map_err(|e| MwError::Io(e.into()))?;
        debug!("Blocked {:?}", TERMINATION_SIGNALS);
        Ok(Self {
            previous,
            _not_send: PhantomData,
        })
    }

    /// The set of blocked termination signals, for use with `sigwait`
    pub fn termination_set() -> SigSet {
        let mut set = SigSet::empty();
        for signal in TERMINATION_SIGNALS {
            set.add(signal);
        }
        set
    }

    /// Wait for one of the blocked termination signals.
    pub fn wait(&self) -> Result<Signal> {
        Self::termination_set().wait().map_err(|e| MwError::Io(e.into()))
    }
}

impl Drop for SignalMask {
    fn drop(&mut self) {
        if let Err(e) = pthread_sigmask(SigmaskHow::SIG_SETMASK, Some(&self.previous), None) {
            warn!("Cannot restore signal mask: {}", e);
        }
    }
}
