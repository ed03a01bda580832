//! Object adapter
//!
//! An adapter owns one listening endpoint, a worker pool and the servants
//! registered on it. A dedicated thread accepts connections; each
//! connection carries exactly one request and is handed to the pool, which
//! reads the request, dispatches it and (for twoway calls) writes the
//! response back.
//!
//! Lookup order for an inbound call is the identity map first, then the
//! default servant of the request's category.

use std::collections::HashMap;
use std::io::ErrorKind;
use std::os::unix::net::{UnixListener, UnixStream};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use bytes::Bytes;
use parking_lot::{Condvar, Mutex};
use scopes_wire::{bind_exclusive, Endpoint, Pdu, PduTransport, ReplyStatus, RequestPdu, ResponsePdu, WireError};
use tracing::{debug, error, info, warn};

use super::servant::{Current, Servant};
use crate::pool::ThreadPool;
use crate::types::{identity_or_generate, Category, InvocationMode, MwError, ProxyAddress, Result, INFINITE_TIMEOUT};

/// How long a worker waits for a connected peer to send its request
const REQUEST_READ_TIMEOUT: Duration = Duration::from_secs(5);

/// Lifecycle of an adapter
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum AdapterState {
    Created,
    Activated,
    ShuttingDown,
    Shutdown,
}

/// Adapter statistics
#[derive(Debug, Default)]
pub struct AdapterStats {
    pub connections_accepted: AtomicU64,
    pub requests_dispatched: AtomicU64,
    pub requests_failed: AtomicU64,
    pub oneway_dropped: AtomicU64,
}

impl AdapterStats {
    pub fn snapshot(&self) -> AdapterStatsSnapshot {
        AdapterStatsSnapshot {
            connections_accepted: self.connections_accepted.load(Ordering::Relaxed),
            requests_dispatched: self.requests_dispatched.load(Ordering::Relaxed),
            requests_failed: self.requests_failed.load(Ordering::Relaxed),
            oneway_dropped: self.oneway_dropped.load(Ordering::Relaxed),
        }
    }
}

/// Snapshot of adapter statistics
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AdapterStatsSnapshot {
    pub connections_accepted: u64,
    pub requests_dispatched: u64,
    pub requests_failed: u64,
    pub oneway_dropped: u64,
}

/// Servants by identity and per-category defaults.
///
/// `accepting` is cleared under the same lock that guards insertion, so an
/// add either lands before the adapter closes or fails.
struct ServantMap {
    by_identity: HashMap<String, Arc<Servant>>,
    defaults: HashMap<Category, Arc<Servant>>,
    accepting: bool,
}

impl ServantMap {
    fn new() -> Self {
        Self {
            by_identity: HashMap::new(),
            defaults: HashMap::new(),
            accepting: true,
        }
    }

    fn is_empty(&self) -> bool {
        self.by_identity.is_empty() && self.defaults.is_empty()
    }
}

/// Listening endpoint plus the servants it serves
pub struct ObjectAdapter {
    name: String,
    endpoint: Endpoint,
    mode: InvocationMode,
    pool_size: usize,
    servants: Mutex<ServantMap>,
    state: Mutex<AdapterState>,
    state_changed: Condvar,
    runner: Mutex<Option<JoinHandle<()>>>,
    idle_timeout: Mutex<Duration>,
    idle_generation: AtomicU64,
    stats: AdapterStats,
    self_ref: Weak<ObjectAdapter>,
}

impl ObjectAdapter {
    pub fn new(name: impl Into<String>, endpoint: Endpoint, mode: InvocationMode, pool_size: usize) -> Arc<Self> {
        Arc::new_cyclic(|self_ref| Self {
            name: name.into(),
            endpoint,
            mode,
            pool_size,
            servants: Mutex::new(ServantMap::new()),
            state: Mutex::new(AdapterState::Created),
            state_changed: Condvar::new(),
            runner: Mutex::new(None),
            idle_timeout: Mutex::new(Duration::ZERO),
            idle_generation: AtomicU64::new(0),
            stats: AdapterStats::default(),
            self_ref: self_ref.clone(),
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn endpoint(&self) -> &Endpoint {
        &self.endpoint
    }

    pub fn mode(&self) -> InvocationMode {
        self.mode
    }

    pub fn state(&self) -> AdapterState {
        *self.state.lock()
    }

    pub fn stats(&self) -> AdapterStatsSnapshot {
        self.stats.snapshot()
    }

    fn destroyed_error(&self) -> MwError {
        MwError::Middleware(format!(
            "Object adapter in Destroyed state (adapter: {})",
            self.name
        ))
    }

    /// False once the adapter has started shutting down
    pub fn is_accepting(&self) -> bool {
        self.servants.lock().accepting
    }

    /// Register `servant` under `identity`; an empty identity is replaced
    /// by a generated one. Returns a proxy for the new servant.
    pub fn add(&self, identity: &str, servant: Arc<Servant>) -> Result<ProxyAddress> {
        let identity = identity_or_generate(identity);
        let proxy = ProxyAddress::new(
            self.endpoint.clone(),
            identity.clone(),
            servant.category(),
            self.mode,
            INFINITE_TIMEOUT,
        )?;

        let mut servants = self.servants.lock();
        if !servants.accepting {
            return Err(self.destroyed_error());
        }
        if servants.by_identity.contains_key(&identity) {
            return Err(MwError::AlreadyRegistered(format!(
                "identity \"{}\" on adapter {}",
                identity, self.name
            )));
        }
        servants.by_identity.insert(identity.clone(), servant);
        drop(servants);

        self.cancel_idle_timer();
        debug!("Added servant {} to adapter {}", identity, self.name);
        Ok(proxy)
    }

    /// Remove whatever servant is registered under `identity`.
    ///
    /// Removing an identity that is not registered is a no-op.
    pub fn remove(&self, identity: &str) -> bool {
        let removed = self.servants.lock().by_identity.remove(identity).is_some();
        if removed {
            debug!("Removed servant {} from adapter {}", identity, self.name);
            self.schedule_idle_shutdown_if_empty();
        }
        removed
    }

    /// Remove `identity` only if it still maps to `servant`.
    pub fn remove_servant(&self, identity: &str, servant: &Arc<Servant>) -> bool {
        let mut servants = self.servants.lock();
        let matches = servants
            .by_identity
            .get(identity)
            .is_some_and(|current| Arc::ptr_eq(current, servant));
        if !matches {
            return false;
        }
        servants.by_identity.remove(identity);
        drop(servants);
        debug!("Removed servant {} from adapter {}", identity, self.name);
        self.schedule_idle_shutdown_if_empty();
        true
    }

    pub fn add_default_servant(&self, category: Category, servant: Arc<Servant>) -> Result<()> {
        let mut servants = self.servants.lock();
        if !servants.accepting {
            return Err(self.destroyed_error());
        }
        if servants.defaults.contains_key(&category) {
            return Err(MwError::AlreadyRegistered(format!(
                "default servant for category {} on adapter {}",
                category, self.name
            )));
        }
        servants.defaults.insert(category, servant);
        drop(servants);

        self.cancel_idle_timer();
        debug!("Added default servant for {} to adapter {}", category, self.name);
        Ok(())
    }

    pub fn remove_default_servant(&self, category: Category) -> bool {
        let removed = self.servants.lock().defaults.remove(&category).is_some();
        if removed {
            debug!("Removed default servant for {} from adapter {}", category, self.name);
            self.schedule_idle_shutdown_if_empty();
        }
        removed
    }

    /// Remove the default servant of `category` only if it is `servant`.
    pub fn remove_default_servant_if(&self, category: Category, servant: &Arc<Servant>) -> bool {
        let mut servants = self.servants.lock();
        let matches = servants
            .defaults
            .get(&category)
            .is_some_and(|current| Arc::ptr_eq(current, servant));
        if !matches {
            return false;
        }
        servants.defaults.remove(&category);
        drop(servants);
        self.schedule_idle_shutdown_if_empty();
        true
    }

    /// Servant that would handle a call for `identity` in `category`
    pub fn find_servant(&self, identity: &str, category: Option<Category>) -> Option<Arc<Servant>> {
        let servants = self.servants.lock();
        servants
            .by_identity
            .get(identity)
            .or_else(|| category.and_then(|c| servants.defaults.get(&c)))
            .cloned()
    }

    /// Start listening.
    ///
    /// With a non-zero `idle_timeout` the adapter shuts itself down once it
    /// has had no servants for that long.
    pub fn activate(&self, idle_timeout: Duration) -> Result<()> {
        let mut state = self.state.lock();
        match *state {
            AdapterState::Created => {}
            AdapterState::Activated => {
                return Err(MwError::Middleware(format!(
                    "Object adapter {} is already active",
                    self.name
                )))
            }
            AdapterState::ShuttingDown | AdapterState::Shutdown => return Err(self.destroyed_error()),
        }

        let listener = bind_exclusive(&self.endpoint).map_err(|e| {
            MwError::Resource(format!("adapter {}: cannot listen on {}: {}", self.name, self.endpoint, e))
        })?;
        let pool = ThreadPool::new(self.name.clone(), self.pool_size)?;
        let this = self
            .self_ref
            .upgrade()
            .ok_or_else(|| self.destroyed_error())?;
        let handle = thread::Builder::new()
            .name(format!("adapter-{}", self.name))
            .spawn(move || this.run(listener, pool))
            .map_err(|e| MwError::Resource(format!("adapter {}: cannot start listener: {}", self.name, e)))?;

        *self.runner.lock() = Some(handle);
        *self.idle_timeout.lock() = idle_timeout;
        *state = AdapterState::Activated;
        self.state_changed.notify_all();
        drop(state);

        info!(
            "Adapter {} listening on {} ({:?}, {} thread(s))",
            self.name, self.endpoint, self.mode, self.pool_size
        );
        self.schedule_idle_shutdown_if_empty();
        Ok(())
    }

    /// Ask the listening loop to stop; safe to call repeatedly.
    pub fn shutdown(&self) {
        self.servants.lock().accepting = false;
        if self.mark_shutting_down() {
            self.wake_listener();
        }
    }

    /// Leave the active states; true if a listener is running and must be
    /// woken. Lock order is servants before state.
    fn mark_shutting_down(&self) -> bool {
        let mut state = self.state.lock();
        let running = match *state {
            AdapterState::Created => {
                *state = AdapterState::Shutdown;
                false
            }
            AdapterState::Activated => {
                *state = AdapterState::ShuttingDown;
                true
            }
            AdapterState::ShuttingDown | AdapterState::Shutdown => return false,
        };
        self.state_changed.notify_all();
        running
    }

    fn wake_listener(&self) {
        self.cancel_idle_timer();
        // Wake the blocking accept.
        if let Err(e) = UnixStream::connect(self.endpoint.path()) {
            warn!("Adapter {}: cannot wake listener: {}", self.name, e);
        }
        info!("Adapter {} shutting down", self.name);
    }

    /// Block until the listening loop has drained and exited.
    pub fn wait_for_shutdown(&self) {
        let mut state = self.state.lock();
        while *state != AdapterState::Shutdown {
            self.state_changed.wait(&mut state);
        }
        drop(state);

        let handle = self.runner.lock().take();
        if let Some(handle) = handle {
            if handle.thread().id() != thread::current().id() {
                let _ = handle.join();
            }
        }
    }

    fn is_stopping(&self) -> bool {
        matches!(self.state(), AdapterState::ShuttingDown | AdapterState::Shutdown)
    }

    fn run(self: Arc<Self>, listener: UnixListener, pool: ThreadPool) {
        for stream in listener.incoming() {
            match stream {
                Ok(stream) => self.accept_connection(stream, &pool),
                Err(e) if e.kind() == ErrorKind::Interrupted => {}
                Err(e) => {
                    warn!("Adapter {}: accept failed: {}", self.name, e);
                    thread::sleep(Duration::from_millis(10));
                }
            }
            if self.is_stopping() {
                break;
            }
        }

        // Serve connections queued before the shutdown request.
        if listener.set_nonblocking(true).is_ok() {
            while let Ok((stream, _)) = listener.accept() {
                if stream.set_nonblocking(false).is_ok() {
                    self.accept_connection(stream, &pool);
                }
            }
        }

        drop(listener);
        if let Err(e) = std::fs::remove_file(self.endpoint.path()) {
            if e.kind() != ErrorKind::NotFound {
                debug!("Adapter {}: cannot remove {}: {}", self.name, self.endpoint, e);
            }
        }
        // Finish in-flight dispatches before declaring the adapter dead.
        drop(pool);

        let mut servants = self.servants.lock();
        servants.by_identity.clear();
        servants.defaults.clear();
        drop(servants);

        *self.state.lock() = AdapterState::Shutdown;
        self.state_changed.notify_all();
        info!("Adapter {} shut down", self.name);
    }

    fn accept_connection(self: &Arc<Self>, stream: UnixStream, pool: &ThreadPool) {
        self.stats.connections_accepted.fetch_add(1, Ordering::Relaxed);
        let adapter = self.clone();
        if let Err(e) = pool.execute(move || adapter.serve(stream)) {
            warn!("Adapter {}: dropping connection: {}", self.name, e);
        }
    }

    fn serve(&self, stream: UnixStream) {
        if let Err(e) = stream.set_read_timeout(Some(REQUEST_READ_TIMEOUT)) {
            warn!("Adapter {}: cannot set read timeout: {}", self.name, e);
        }
        let mut transport = PduTransport::new(stream);
        let request = match transport.read_pdu_decoded() {
            Ok(Pdu::Request(request)) => request,
            Ok(other) => {
                warn!("Adapter {}: unexpected PDU with call_id {}", self.name, other.call_id());
                return;
            }
            // Shutdown wake-ups and callers that gave up.
            Err(WireError::ConnectionClosed) => return,
            Err(e) => {
                warn!("Adapter {}: cannot read request: {}", self.name, e);
                return;
            }
        };

        let call_id = request.header.call_id;
        if request.is_oneway() {
            if self.mode != InvocationMode::Oneway {
                warn!(
                    "Adapter {}: dropping oneway request for {} on twoway adapter",
                    self.name, request.operation
                );
                self.stats.oneway_dropped.fetch_add(1, Ordering::Relaxed);
                return;
            }
            if let Err(e) = self.dispatch(&request) {
                debug!("Adapter {}: dropping oneway failure: {}", self.name, e);
                self.stats.oneway_dropped.fetch_add(1, Ordering::Relaxed);
            }
            return;
        }

        let response = if self.mode != InvocationMode::Twoway {
            self.stats.requests_failed.fetch_add(1, Ordering::Relaxed);
            ResponsePdu::fault(
                call_id,
                ReplyStatus::RuntimeFault,
                &format!("adapter {} accepts oneway requests only", self.name),
            )
        } else {
            match self.dispatch(&request) {
                Ok(payload) => ResponsePdu::success(call_id, payload),
                Err(e) => {
                    self.stats.requests_failed.fetch_add(1, Ordering::Relaxed);
                    fault_response(call_id, &e)
                }
            }
        };
        if let Err(e) = transport.write_pdu(&response.encode()) {
            debug!("Adapter {}: cannot deliver response for call {}: {}", self.name, call_id, e);
        }
    }

    fn dispatch(&self, request: &RequestPdu) -> Result<Bytes> {
        let category = request.category.parse::<Category>().ok();
        let servant = self
            .find_servant(&request.identity, category)
            .ok_or_else(|| MwError::ObjectNotExist {
                identity: request.identity.clone(),
                endpoint: self.endpoint.to_string(),
            })?;

        let current = Current {
            identity: request.identity.clone(),
            category: servant.category(),
            operation: request.operation.clone(),
            adapter_name: self.name.clone(),
        };
        self.stats.requests_dispatched.fetch_add(1, Ordering::Relaxed);
        let result = servant.dispatch(&current, request.payload.clone());
        if let Err(e) = &result {
            if !e.is_routing() {
                error!(
                    "Adapter {}: {} on {} failed: {}",
                    self.name, current.operation, current.identity, e
                );
            }
        }
        result
    }

    fn cancel_idle_timer(&self) {
        self.idle_generation.fetch_add(1, Ordering::AcqRel);
    }

    fn schedule_idle_shutdown_if_empty(&self) {
        let timeout = *self.idle_timeout.lock();
        if timeout.is_zero() || self.state() != AdapterState::Activated || !self.servants.lock().is_empty() {
            return;
        }
        let generation = self.idle_generation.fetch_add(1, Ordering::AcqRel) + 1;
        let adapter = self.self_ref.clone();
        let spawned = thread::Builder::new()
            .name(format!("idle-{}", self.name))
            .spawn(move || {
                thread::sleep(timeout);
                let Some(adapter) = adapter.upgrade() else { return };
                let mut servants = adapter.servants.lock();
                if adapter.idle_generation.load(Ordering::Acquire) != generation || !servants.is_empty() {
                    return;
                }
                // Close while still holding the map so no add slips in.
                servants.accepting = false;
                let running = adapter.mark_shutting_down();
                drop(servants);
                if running {
                    info!("Adapter {} idle for {:?}, shutting down", adapter.name, timeout);
                    adapter.wake_listener();
                }
            });
        if let Err(e) = spawned {
            warn!("Adapter {}: cannot start idle timer: {}", self.name, e);
        }
    }
}

fn fault_response(call_id: u32, err: &MwError) -> ResponsePdu {
    let status = match err {
        MwError::ObjectNotExist { .. } => ReplyStatus::ObjectNotExist,
        MwError::OperationNotExist { .. } => ReplyStatus::OperationNotExist,
        _ => ReplyStatus::RuntimeFault,
    };
    let message = match err {
        MwError::Remote(msg) => msg.clone(),
        other => other.to_string(),
    };
    ResponsePdu::fault(call_id, status, &message)
}
