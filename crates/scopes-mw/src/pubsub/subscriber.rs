//! Subscriber
//!
//! A background thread connects to a publisher endpoint, reads frames and
//! hands the message of every frame matching the topic to a callback. If
//! the publisher is not there yet, or goes away, the thread keeps trying to
//! (re)connect until it is stopped.
//!
//! A stream that fails mid-frame or carries a malformed frame is dropped
//! and the thread reconnects, resuming at the next frame the publisher
//! sends. The last such failure is kept and returned by the next `stop()`.

use std::io::ErrorKind;
use std::os::unix::net::UnixStream;
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use parking_lot::{Condvar, Mutex};
use scopes_wire::Endpoint;
use tracing::{debug, info, warn};

use super::{match_topic, read_frame, validate_topic, ReadOutcome};
use crate::types::{MwError, Result};

/// Read timeout used to poll for a stop request
const POLL_INTERVAL: Duration = Duration::from_millis(50);

/// Delay between connection attempts
const RECONNECT_INTERVAL: Duration = Duration::from_millis(50);

/// Callback receiving the message part of each matching frame
pub type MessageCallback = Box<dyn Fn(&str) + Send + 'static>;

/// Lifecycle of a subscriber thread
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SubscriberState {
    NotRunning,
    Running,
    Stopping,
    Stopped,
}

struct Inner {
    state: SubscriberState,
    connected: bool,
    error: Option<MwError>,
}

struct Shared {
    inner: Mutex<Inner>,
    cond: Condvar,
}

impl Shared {
    fn stop_requested(&self) -> bool {
        self.inner.lock().state == SubscriberState::Stopping
    }

    fn set_connected(&self, connected: bool) {
        self.inner.lock().connected = connected;
        self.cond.notify_all();
    }
}

/// Topic subscriber; dropping it unsubscribes
pub struct Subscriber {
    endpoint: Endpoint,
    topic: String,
    shared: Arc<Shared>,
    thread: Option<JoinHandle<()>>,
}

impl Subscriber {
    pub fn new(endpoint: Endpoint, topic: impl Into<String>, callback: MessageCallback) -> Result<Self> {
        let topic = topic.into();
        validate_topic(&topic)?;
        endpoint.validate()?;

        let shared = Arc::new(Shared {
            inner: Mutex::new(Inner {
                state: SubscriberState::NotRunning,
                connected: false,
                error: None,
            }),
            cond: Condvar::new(),
        });

        let thread_shared = shared.clone();
        let thread_endpoint = endpoint.clone();
        let thread_topic = topic.clone();
        let thread = thread::Builder::new()
            .name(format!("sub-{}", topic))
            .spawn(move || subscriber_thread(thread_shared, thread_endpoint, thread_topic, callback))
            .map_err(|e| MwError::Resource(format!("subscriber: cannot start thread: {}", e)))?;

        {
            let mut inner = shared.inner.lock();
            while inner.state == SubscriberState::NotRunning {
                shared.cond.wait(&mut inner);
            }
        }

        debug!("Subscribed to \"{}\" on {}", topic, endpoint);
        Ok(Self {
            endpoint,
            topic,
            shared,
            thread: Some(thread),
        })
    }

    pub fn endpoint(&self) -> &Endpoint {
        &self.endpoint
    }

    pub fn topic(&self) -> &str {
        &self.topic
    }

    pub fn state(&self) -> SubscriberState {
        self.shared.inner.lock().state
    }

    pub fn is_connected(&self) -> bool {
        self.shared.inner.lock().connected
    }

    /// Wait until connected to the publisher; false on timeout.
    pub fn wait_until_connected(&self, timeout: Duration) -> bool {
        let mut inner = self.shared.inner.lock();
        if !inner.connected {
            self.shared
                .cond
                .wait_while_for(&mut inner, |inner| !inner.connected, timeout);
        }
        inner.connected
    }

    /// Stop the background thread, returning any failure it recorded.
    pub fn stop(&mut self) -> Result<()> {
        {
            let mut inner = self.shared.inner.lock();
            if inner.state == SubscriberState::Running {
                inner.state = SubscriberState::Stopping;
            }
        }
        if let Some(thread) = self.thread.take() {
            let _ = thread.join();
        }
        match self.shared.inner.lock().error.take() {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }
}

impl Drop for Subscriber {
    fn drop(&mut self) {
        if let Err(e) = self.stop() {
            warn!("Subscriber of \"{}\" on {}: {}", self.topic, self.endpoint, e);
        }
    }
}

fn subscriber_thread(shared: Arc<Shared>, endpoint: Endpoint, topic: String, callback: MessageCallback) {
    // Try once before reporting Running, so a live publisher is already
    // connected when the constructor returns.
    let mut stream = try_connect(&endpoint);
    {
        let mut inner = shared.inner.lock();
        inner.state = SubscriberState::Running;
        inner.connected = stream.is_some();
        shared.cond.notify_all();
    }

    run(&shared, &endpoint, &topic, &callback, &mut stream);

    let mut inner = shared.inner.lock();
    inner.connected = false;
    inner.state = SubscriberState::Stopped;
    shared.cond.notify_all();
}

fn run(
    shared: &Shared,
    endpoint: &Endpoint,
    topic: &str,
    callback: &MessageCallback,
    stream: &mut Option<UnixStream>,
) {
    let stop = || shared.stop_requested();
    loop {
        if stop() {
            return;
        }
        let Some(conn) = stream.as_mut() else {
            thread::sleep(RECONNECT_INTERVAL);
            *stream = try_connect(endpoint);
            if stream.is_some() {
                info!("Subscriber of \"{}\" connected to {}", topic, endpoint);
                shared.set_connected(true);
            }
            continue;
        };

        match read_frame(conn, &stop) {
            Ok(ReadOutcome::Frame(frame)) => {
                if let Some(message) = match_topic(&frame, topic) {
                    callback(message);
                }
            }
            Ok(ReadOutcome::Stopped) => return,
            Ok(ReadOutcome::Closed) => {
                debug!("Publisher at {} went away", endpoint);
                *stream = None;
                shared.set_connected(false);
            }
            Err(e) if e.kind() == ErrorKind::ConnectionReset => {
                *stream = None;
                shared.set_connected(false);
            }
            Err(e) => {
                warn!("Subscriber of \"{}\" on {}: {}, reconnecting", topic, endpoint, e);
                shared.inner.lock().error = Some(MwError::Middleware(format!(
                    "subscriber of \"{}\" on {}: {}",
                    topic, endpoint, e
                )));
                *stream = None;
                shared.set_connected(false);
            }
        }
    }
}

fn try_connect(endpoint: &Endpoint) -> Option<UnixStream> {
    let stream = UnixStream::connect(endpoint.path()).ok()?;
    match stream.set_read_timeout(Some(POLL_INTERVAL)) {
        Ok(()) => Some(stream),
        Err(e) => {
            warn!("Cannot configure subscription to {}: {}", endpoint, e);
            None
        }
    }
}
