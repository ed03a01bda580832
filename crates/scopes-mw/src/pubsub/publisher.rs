//! Publisher
//!
//! A background thread owns the bound endpoint. It waits for queued
//! messages, accepts newly connected subscribers and writes each message to
//! every subscriber in queue order. A stop request is honoured only once the
//! queue is empty, so nothing queued before the stop is lost.

use std::collections::VecDeque;
use std::io::ErrorKind;
use std::os::unix::net::{UnixListener, UnixStream};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use parking_lot::{Condvar, Mutex};
use scopes_wire::{bind_exclusive, Endpoint, WireError};
use tracing::{debug, info, warn};

use super::{encode_frame, write_frame};
use crate::types::{MwError, Result};

/// How often an idle publisher checks for new subscribers
const ACCEPT_INTERVAL: Duration = Duration::from_millis(20);

/// Bound on a single write to a slow subscriber
const SUBSCRIBER_WRITE_TIMEOUT: Duration = Duration::from_secs(1);

/// Lifecycle of a publisher thread
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PublisherState {
    NotRunning,
    Running,
    Stopping,
    Failed,
}

struct Inner {
    state: PublisherState,
    queue: VecDeque<Vec<u8>>,
    error: Option<MwError>,
    subscribers: usize,
}

struct Shared {
    inner: Mutex<Inner>,
    cond: Condvar,
}

/// Topic publisher bound to `<dir>/<id>-p`
pub struct Publisher {
    id: String,
    endpoint: Endpoint,
    shared: Arc<Shared>,
    thread: Option<JoinHandle<()>>,
}

impl Publisher {
    /// Bind `endpoint` and start publishing.
    ///
    /// Returns only once the publisher is running; a bind failure (for
    /// example another live publisher on the endpoint) is returned here.
    pub fn new(id: impl Into<String>, endpoint: Endpoint) -> Result<Self> {
        let id = id.into();
        if id.is_empty() || id.contains('/') {
            return Err(MwError::InvalidArgument(format!(
                "publisher id must be non-empty and cannot contain '/': \"{}\"",
                id
            )));
        }

        let shared = Arc::new(Shared {
            inner: Mutex::new(Inner {
                state: PublisherState::NotRunning,
                queue: VecDeque::new(),
                error: None,
                subscribers: 0,
            }),
            cond: Condvar::new(),
        });

        let thread_shared = shared.clone();
        let thread_endpoint = endpoint.clone();
        let thread = thread::Builder::new()
            .name(format!("pub-{}", id))
            .spawn(move || publisher_thread(thread_shared, thread_endpoint))
            .map_err(|e| MwError::Resource(format!("publisher {}: cannot start thread: {}", id, e)))?;

        let mut inner = shared.inner.lock();
        while inner.state == PublisherState::NotRunning {
            shared.cond.wait(&mut inner);
        }
        if inner.state == PublisherState::Failed {
            let err = inner.error.take();
            drop(inner);
            let _ = thread.join();
            return Err(err.unwrap_or_else(|| {
                MwError::Resource(format!("publisher thread failed to start (endpoint: {})", endpoint))
            }));
        }
        drop(inner);

        info!("Publisher {} bound to {}", id, endpoint);
        Ok(Self {
            id,
            endpoint,
            shared,
            thread: Some(thread),
        })
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn endpoint(&self) -> &Endpoint {
        &self.endpoint
    }

    pub fn state(&self) -> PublisherState {
        self.shared.inner.lock().state
    }

    /// Number of subscribers currently connected
    pub fn subscriber_count(&self) -> usize {
        self.shared.inner.lock().subscribers
    }

    /// Queue `message` for every subscriber of `topic`.
    ///
    /// Topics cannot contain ':' and a frame is limited to
    /// [`MAX_FRAME_SIZE`](super::MAX_FRAME_SIZE) bytes.
    pub fn send_message(&self, message: &str, topic: &str) -> Result<()> {
        let frame = encode_frame(topic, message)?;
        let mut inner = self.shared.inner.lock();
        if inner.state != PublisherState::Running {
            return Err(MwError::Middleware(format!(
                "publisher {} is not running",
                self.id
            )));
        }
        inner.queue.push_back(frame.to_vec());
        self.shared.cond.notify_all();
        Ok(())
    }

    /// Flush the queue and stop the background thread.
    pub fn stop(&mut self) -> Result<()> {
        {
            let mut inner = self.shared.inner.lock();
            if inner.state == PublisherState::Running {
                inner.state = PublisherState::Stopping;
                self.shared.cond.notify_all();
            }
        }
        if let Some(thread) = self.thread.take() {
            let _ = thread.join();
            debug!("Publisher {} stopped", self.id);
        }
        match self.shared.inner.lock().error.take() {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }
}

impl Drop for Publisher {
    fn drop(&mut self) {
        if let Err(e) = self.stop() {
            warn!("Publisher {}: {}", self.id, e);
        }
    }
}

fn publisher_thread(shared: Arc<Shared>, endpoint: Endpoint) {
    let listener = match bind_listener(&endpoint) {
        Ok(listener) => listener,
        Err(e) => {
            let mut inner = shared.inner.lock();
            inner.error = Some(e);
            inner.state = PublisherState::Failed;
            shared.cond.notify_all();
            return;
        }
    };

    {
        let mut inner = shared.inner.lock();
        inner.state = PublisherState::Running;
        shared.cond.notify_all();
    }

    let mut subscribers: Vec<UnixStream> = Vec::new();
    loop {
        let (messages, stopping) = {
            let mut inner = shared.inner.lock();
            if inner.queue.is_empty() && inner.state == PublisherState::Running {
                shared.cond.wait_for(&mut inner, ACCEPT_INTERVAL);
            }
            let messages: Vec<Vec<u8>> = inner.queue.drain(..).collect();
            (messages, inner.state == PublisherState::Stopping)
        };

        accept_subscribers(&listener, &mut subscribers);
        for frame in &messages {
            subscribers.retain_mut(|sub| match write_frame(sub, frame) {
                Ok(()) => true,
                Err(e) => {
                    debug!("Dropping subscriber of {}: {}", endpoint, e);
                    false
                }
            });
        }
        shared.inner.lock().subscribers = subscribers.len();

        if stopping {
            break;
        }
    }

    drop(listener);
    if let Err(e) = std::fs::remove_file(endpoint.path()) {
        if e.kind() != ErrorKind::NotFound {
            debug!("Cannot remove {}: {}", endpoint, e);
        }
    }
}

fn bind_listener(endpoint: &Endpoint) -> Result<UnixListener> {
    let listener = bind_exclusive(endpoint).map_err(|e| match e {
        WireError::EndpointInUse(ep) => MwError::Resource(format!("publisher endpoint in use: {}", ep)),
        other => MwError::Resource(format!("publisher cannot bind {}: {}", endpoint, other)),
    })?;
    listener.set_nonblocking(true)?;
    Ok(listener)
}

fn accept_subscribers(listener: &UnixListener, subscribers: &mut Vec<UnixStream>) {
    loop {
        match listener.accept() {
            Ok((stream, _)) => {
                let configured = stream
                    .set_nonblocking(false)
                    .and_then(|()| stream.set_write_timeout(Some(SUBSCRIBER_WRITE_TIMEOUT)));
                match configured {
                    Ok(()) => subscribers.push(stream),
                    Err(e) => warn!("Cannot configure subscriber connection: {}", e),
                }
            }
            Err(e) if e.kind() == ErrorKind::WouldBlock => break,
            Err(e) if e.kind() == ErrorKind::Interrupted => {}
            Err(e) => {
                warn!("Publisher accept failed: {}", e);
                break;
            }
        }
    }
}
