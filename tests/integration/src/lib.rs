//! Shared fixtures for the integration tests
//!
//! Every test runs several middleware instances inside one process, each
//! with its own server name, all sharing one temporary base directory. A
//! scope "process" is simulated by a middleware instance started by
//! [`InProcessLauncher`].
//!
//! Run with increased logging:
//! ```text
//! RUST_LOG=debug cargo test -p integration-tests
//! ```

use std::collections::HashMap;
use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::mpsc::{self, Receiver, RecvTimeoutError, Sender};
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};

use bytes::Bytes;
use parking_lot::Mutex;
use tracing_subscriber::EnvFilter;

use scopes_mw::{
    AbstractObject, Disconnector, FinishReason, Hints, InvokeInfo, LocalRegistry, Middleware,
    MiddlewareConfig, MwError, ProcessState, QueryCtrlObject, QueryCtrlProxy, ReplyObject, ReplyProxy, Result,
    ScopeLauncher, ScopeMetadata, ScopeObject, ScopeState,
};

/// Identity of the registry in every test deployment
pub const REGISTRY: &str = "Registry";

/// How long the registry waits for a launched scope to report ready
pub const REGISTRY_LOCATE_TIMEOUT: Duration = Duration::from_millis(1500);

/// Upper bound for anything the tests wait on
pub const WAIT: Duration = Duration::from_secs(5);

pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

pub fn config(base: &Path) -> MiddlewareConfig {
    MiddlewareConfig::with_base_dir(base)
        .with_twoway_timeout(2000)
        .with_locate_timeout(3000)
        .with_registry(REGISTRY)
}

/// A started middleware named `name` under `base`
pub fn start(base: &Path, name: &str) -> Arc<Middleware> {
    let mw = Middleware::new(name, config(base)).unwrap();
    mw.start().unwrap();
    mw
}

/// Poll `condition` until it holds or `timeout` expires.
pub fn wait_until(timeout: Duration, mut condition: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + timeout;
    loop {
        if condition() {
            return true;
        }
        if Instant::now() >= deadline {
            return false;
        }
        std::thread::sleep(Duration::from_millis(10));
    }
}

/// Query control object that records what it was asked to do
#[derive(Default)]
pub struct RecordingCtrl {
    pub cancelled: AtomicUsize,
    pub destroyed: AtomicUsize,
    disconnector: Mutex<Option<Disconnector>>,
}

impl AbstractObject for RecordingCtrl {
    fn set_disconnect_function(&self, disconnector: Disconnector) {
        *self.disconnector.lock() = Some(disconnector);
    }
}

impl QueryCtrlObject for RecordingCtrl {
    fn cancel(&self, _info: &InvokeInfo) -> Result<()> {
        self.cancelled.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    fn destroy(&self, _info: &InvokeInfo) -> Result<()> {
        self.destroyed.fetch_add(1, Ordering::SeqCst);
        if let Some(disconnector) = self.disconnector.lock().take() {
            disconnector.disconnect();
        }
        Ok(())
    }
}

/// Scope answering each request with `results` echoes of its text
pub struct EchoScope {
    pub id: String,
    pub results: usize,
    pub requests: AtomicUsize,
    pub ctrl: Arc<RecordingCtrl>,
    disconnector: Mutex<Option<Disconnector>>,
}

impl EchoScope {
    pub fn new(id: &str, results: usize) -> Arc<Self> {
        Arc::new(Self {
            id: id.to_string(),
            results,
            requests: AtomicUsize::new(0),
            ctrl: Arc::new(RecordingCtrl::default()),
            disconnector: Mutex::new(None),
        })
    }

    /// Remove the scope from the adapter it was last added to.
    pub fn disconnect(&self) -> bool {
        self.disconnector
            .lock()
            .take()
            .map_or(false, |disconnector| disconnector.disconnect())
    }

    fn answer(&self, text: String, reply: ReplyProxy, info: &InvokeInfo) -> Result<QueryCtrlProxy> {
        self.requests.fetch_add(1, Ordering::SeqCst);
        for n in 0..self.results {
            reply.push(Bytes::from(format!("{}:{}:{}", self.id, text, n)))?;
        }
        reply.finished(&FinishReason::Finished)?;
        info.middleware.add_query_ctrl_object(self.ctrl.clone())
    }
}

impl AbstractObject for EchoScope {
    fn set_disconnect_function(&self, disconnector: Disconnector) {
        *self.disconnector.lock() = Some(disconnector);
    }
}

impl ScopeObject for EchoScope {
    fn create_query(&self, query: &str, _hints: &Hints, reply: ReplyProxy, info: &InvokeInfo) -> Result<QueryCtrlProxy> {
        self.answer(query.to_string(), reply, info)
    }

    fn activate(&self, result: &str, _hints: &Hints, reply: ReplyProxy, info: &InvokeInfo) -> Result<QueryCtrlProxy> {
        self.answer(format!("activate {}", result), reply, info)
    }

    fn activate_preview_action(
        &self,
        result: &str,
        _hints: &Hints,
        action_id: &str,
        reply: ReplyProxy,
        info: &InvokeInfo,
    ) -> Result<QueryCtrlProxy> {
        self.answer(format!("{} {}", action_id, result), reply, info)
    }

    fn preview(&self, result: &str, _hints: &Hints, reply: ReplyProxy, info: &InvokeInfo) -> Result<QueryCtrlProxy> {
        self.answer(format!("preview {}", result), reply, info)
    }
}

/// What a reply object was told
#[derive(Debug, PartialEq)]
pub enum ReplyEvent {
    Push(String),
    Finished(FinishReason),
}

/// Reply object forwarding its callbacks to a channel
pub struct ChannelReply {
    events: Mutex<Sender<ReplyEvent>>,
}

impl ChannelReply {
    pub fn new() -> (Arc<Self>, Receiver<ReplyEvent>) {
        let (tx, rx) = mpsc::channel();
        (Arc::new(Self { events: Mutex::new(tx) }), rx)
    }
}

impl AbstractObject for ChannelReply {
    fn set_disconnect_function(&self, _disconnector: Disconnector) {}
}

impl ReplyObject for ChannelReply {
    fn push(&self, payload: Bytes) -> Result<()> {
        let _ = self
            .events
            .lock()
            .send(ReplyEvent::Push(String::from_utf8_lossy(&payload).into_owned()));
        Ok(())
    }

    fn finished(&self, reason: FinishReason) -> Result<()> {
        let _ = self.events.lock().send(ReplyEvent::Finished(reason));
        Ok(())
    }
}

/// Receive events until `Finished`, returning the pushed payloads.
pub fn collect_until_finished(rx: &Receiver<ReplyEvent>) -> (Vec<String>, FinishReason) {
    let deadline = Instant::now() + WAIT;
    let mut pushed = Vec::new();
    loop {
        match rx.recv_timeout(deadline.saturating_duration_since(Instant::now())) {
            Ok(ReplyEvent::Push(payload)) => pushed.push(payload),
            Ok(ReplyEvent::Finished(reason)) => return (pushed, reason),
            Err(RecvTimeoutError::Timeout) => panic!("no finished() after {:?}; got {:?}", WAIT, pushed),
            Err(RecvTimeoutError::Disconnected) => panic!("reply channel closed"),
        }
    }
}

/// Launches scopes as middleware instances of the current process
pub struct InProcessLauncher {
    base: std::path::PathBuf,
    /// Scope ids that fail to report ready
    silent: Mutex<Vec<String>>,
    running: Mutex<HashMap<String, Arc<Middleware>>>,
    registry: Mutex<Weak<LocalRegistry>>,
    pub launched: AtomicUsize,
    pub killed: AtomicUsize,
}

impl InProcessLauncher {
    pub fn new(base: &Path) -> Arc<Self> {
        Arc::new(Self {
            base: base.to_path_buf(),
            silent: Mutex::new(Vec::new()),
            running: Mutex::new(HashMap::new()),
            registry: Mutex::new(Weak::new()),
            launched: AtomicUsize::new(0),
            killed: AtomicUsize::new(0),
        })
    }

    /// Launched scope `scope_id` never reports `ScopeReady`.
    pub fn keep_silent(&self, scope_id: &str) {
        self.silent.lock().push(scope_id.to_string());
    }

    pub fn set_registry(&self, registry: &Arc<LocalRegistry>) {
        *self.registry.lock() = Arc::downgrade(registry);
    }

    pub fn is_running(&self, scope_id: &str) -> bool {
        self.running.lock().contains_key(scope_id)
    }

    /// Stop scope `scope_id` the way a scope process shuts down.
    pub fn stop_scope(&self, scope_id: &str) {
        let Some(mw) = self.running.lock().remove(scope_id) else {
            return;
        };
        let registry = self.registry.lock().upgrade();
        if let Ok(state) = mw.create_state_receiver_proxy(REGISTRY) {
            if state.push_state(scope_id, ScopeState::ScopeStopping).is_ok() {
                if let Some(registry) = &registry {
                    wait_until(WAIT, || registry.process_state(scope_id) == Some(ProcessState::Stopping));
                }
            }
        }
        mw.stop();
        mw.wait_for_shutdown();
        if let Some(registry) = registry {
            registry.on_process_exit(scope_id);
        }
    }

    pub fn stop_all(&self) {
        let ids: Vec<String> = self.running.lock().keys().cloned().collect();
        for id in ids {
            self.stop_scope(&id);
        }
    }
}

impl ScopeLauncher for InProcessLauncher {
    fn launch(&self, metadata: &ScopeMetadata) -> Result<()> {
        self.launched.fetch_add(1, Ordering::SeqCst);
        let scope_id = metadata.scope_id.as_str();
        let mw = Middleware::new(scope_id, config(&self.base))?;
        mw.start()?;
        mw.add_scope_object(scope_id, EchoScope::new(scope_id, 2), Duration::ZERO)?;
        if !self.silent.lock().iter().any(|id| id == scope_id) {
            mw.create_state_receiver_proxy(REGISTRY)?
                .push_state(scope_id, ScopeState::ScopeReady)?;
        }
        self.running.lock().insert(scope_id.to_string(), mw);
        Ok(())
    }

    fn kill(&self, scope_id: &str) -> Result<()> {
        self.killed.fetch_add(1, Ordering::SeqCst);
        match self.running.lock().remove(scope_id) {
            Some(mw) => {
                mw.stop();
                Ok(())
            }
            None => Err(MwError::NotFound(format!("scope {} is not running", scope_id))),
        }
    }
}

/// A registry middleware serving a [`LocalRegistry`] with the given scopes
pub struct RegistryHost {
    pub mw: Arc<Middleware>,
    pub registry: Arc<LocalRegistry>,
    pub launcher: Arc<InProcessLauncher>,
}

impl RegistryHost {
    pub fn start(base: &Path, scope_ids: &[&str]) -> Self {
        let mw = start(base, REGISTRY);
        let launcher = InProcessLauncher::new(base);
        let registry = Arc::new(LocalRegistry::new(launcher.clone(), REGISTRY_LOCATE_TIMEOUT));
        launcher.set_registry(&registry);
        registry.set_publisher(mw.create_publisher(REGISTRY).unwrap());
        for id in scope_ids {
            let proxy = mw.create_scope_proxy(id).unwrap();
            let metadata = ScopeMetadata::new(*id, proxy.address().clone())
                .with_display_name(format!("{} scope", id))
                .with_author("integration");
            registry.add_local_scope(metadata).unwrap();
        }
        mw.add_registry_object(REGISTRY, registry.clone()).unwrap();
        mw.add_state_receiver_object(REGISTRY, registry.clone()).unwrap();
        Self { mw, registry, launcher }
    }
}

impl Drop for RegistryHost {
    fn drop(&mut self) {
        self.launcher.stop_all();
        self.registry.disconnect();
        self.mw.stop();
    }
}
