//! Local scope registry
//!
//! `LocalRegistry` keeps the metadata of the scopes installed on this
//! machine and the state of their processes. It serves the Registry
//! category, and the State category through which scope processes report
//! that they are ready or about to stop.
//!
//! Starting a process is delegated to a [`ScopeLauncher`]; whoever
//! supervises the child reports its exit through
//! [`LocalRegistry::on_process_exit`].

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};
use tracing::{debug, info, warn};

use crate::adapter::Disconnector;
use crate::objects::{
    AbstractObject, InvokeInfo, RegistryObject, RegistryProxy, ScopeState, StateReceiverObject,
    LIST_UPDATE_TOPIC, SCOPE_STARTED, SCOPE_STOPPED,
};
use crate::pubsub::Publisher;
use crate::types::{MetadataMap, MwError, ProxyAddress, Result, ScopeMetadata};

/// How long a stopping scope gets before it is killed
const STOP_GRACE: Duration = Duration::from_millis(1500);

/// Default wait for a launched scope to report ready, in milliseconds.
///
/// Kept below [`DEFAULT_LOCATE_TIMEOUT_MS`](crate::config::DEFAULT_LOCATE_TIMEOUT_MS)
/// so a caller of `locate` receives the registry's start failure rather
/// than its own call timing out first.
pub const DEFAULT_START_TIMEOUT_MS: u64 = 1500;

/// State of a scope process as seen by the registry
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ProcessState {
    Stopped,
    Starting,
    Running,
    Stopping,
}

/// Starts and kills scope processes on behalf of the registry
pub trait ScopeLauncher: Send + Sync {
    /// Start the process serving `metadata`. The scope is considered
    /// running once it pushes `ScopeReady`.
    fn launch(&self, metadata: &ScopeMetadata) -> Result<()>;

    /// Forcibly stop the process of `scope_id`.
    fn kill(&self, scope_id: &str) -> Result<()>;
}

#[derive(Debug)]
struct ScopeProcess {
    state: Mutex<ProcessState>,
    changed: Condvar,
}

impl ScopeProcess {
    fn new() -> Self {
        Self {
            state: Mutex::new(ProcessState::Stopped),
            changed: Condvar::new(),
        }
    }

    fn state(&self) -> ProcessState {
        *self.state.lock()
    }

    fn update(&self, state: ProcessState) -> ProcessState {
        let mut current = self.state.lock();
        let previous = std::mem::replace(&mut *current, state);
        self.changed.notify_all();
        previous
    }

    /// Move from `from` to `to`; false if the process was in another state.
    fn transition(&self, from: ProcessState, to: ProcessState) -> bool {
        let mut current = self.state.lock();
        if *current != from {
            return false;
        }
        *current = to;
        self.changed.notify_all();
        true
    }

    fn wait_for(&self, state: ProcessState, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        let mut current = self.state.lock();
        while *current != state {
            if self.changed.wait_until(&mut current, deadline).timed_out() {
                break;
            }
        }
        *current == state
    }
}

struct LocalScope {
    metadata: ScopeMetadata,
    process: Arc<ScopeProcess>,
}

/// Registry of the scopes installed on this machine
pub struct LocalRegistry {
    scopes: Mutex<BTreeMap<String, LocalScope>>,
    remote: Mutex<Option<RegistryProxy>>,
    launcher: Arc<dyn ScopeLauncher>,
    publisher: Mutex<Option<Publisher>>,
    locate_timeout: Duration,
    disconnectors: Mutex<Vec<Disconnector>>,
}

impl LocalRegistry {
    pub fn new(launcher: Arc<dyn ScopeLauncher>, locate_timeout: Duration) -> Self {
        Self {
            scopes: Mutex::new(BTreeMap::new()),
            remote: Mutex::new(None),
            launcher,
            publisher: Mutex::new(None),
            locate_timeout,
            disconnectors: Mutex::new(Vec::new()),
        }
    }

    /// Announce scope state changes and list updates through `publisher`.
    pub fn set_publisher(&self, publisher: Publisher) {
        *self.publisher.lock() = Some(publisher);
    }

    /// Consult `remote` for scopes that are not installed locally.
    pub fn set_remote_registry(&self, remote: RegistryProxy) {
        *self.remote.lock() = Some(remote);
    }

    /// Add or replace a local scope; returns false if it replaced one.
    pub fn add_local_scope(&self, metadata: ScopeMetadata) -> Result<bool> {
        let scope_id = metadata.scope_id.clone();
        if scope_id.is_empty() {
            return Err(MwError::InvalidArgument(
                "Registry: Cannot add scope with empty name".to_string(),
            ));
        }
        if scope_id.contains('/') {
            return Err(MwError::InvalidArgument(format!(
                "Registry: Cannot create a scope with a slash in its name: {}",
                scope_id
            )));
        }
        if scope_id.contains(':') {
            return Err(MwError::InvalidArgument(format!(
                "Registry: Cannot create a scope with a colon in its name: {}",
                scope_id
            )));
        }

        let replaced = self
            .scopes
            .lock()
            .insert(
                scope_id.clone(),
                LocalScope {
                    metadata,
                    process: Arc::new(ScopeProcess::new()),
                },
            )
            .is_some();
        debug!(
            "Registry: {} local scope {}",
            if replaced { "replaced" } else { "added" },
            scope_id
        );
        self.publish(LIST_UPDATE_TOPIC, "");
        Ok(!replaced)
    }

    pub fn remove_local_scope(&self, scope_id: &str) -> Result<bool> {
        require_name(scope_id, "remove")?;
        let removed = self.scopes.lock().remove(scope_id).is_some();
        if removed {
            debug!("Registry: removed local scope {}", scope_id);
            self.publish(LIST_UPDATE_TOPIC, "");
        }
        Ok(removed)
    }

    pub fn process_state(&self, scope_id: &str) -> Option<ProcessState> {
        self.process(scope_id).map(|p| p.state())
    }

    /// Wait up to `timeout` for the process of `scope_id` to reach `state`.
    pub fn wait_for_state(&self, scope_id: &str, state: ProcessState, timeout: Duration) -> bool {
        match self.process(scope_id) {
            Some(process) => process.wait_for(state, timeout),
            None => false,
        }
    }

    /// Record that the process of `scope_id` has exited.
    pub fn on_process_exit(&self, scope_id: &str) {
        let Some(process) = self.process(scope_id) else {
            debug!("Registry: exit of unknown scope {}", scope_id);
            return;
        };
        if process.update(ProcessState::Stopped) != ProcessState::Stopped {
            info!("Registry: scope {} stopped", scope_id);
            self.publish(scope_id, SCOPE_STOPPED);
        }
    }

    /// Remove this registry from every adapter it was added to.
    pub fn disconnect(&self) {
        let disconnectors = std::mem::take(&mut *self.disconnectors.lock());
        for disconnector in disconnectors {
            disconnector.disconnect();
        }
    }

    fn process(&self, scope_id: &str) -> Option<Arc<ScopeProcess>> {
        self.scopes.lock().get(scope_id).map(|s| s.process.clone())
    }

    fn remote(&self) -> Option<RegistryProxy> {
        self.remote.lock().clone()
    }

    fn publish(&self, topic: &str, message: &str) {
        if let Some(publisher) = self.publisher.lock().as_ref() {
            if let Err(e) = publisher.send_message(message, topic) {
                warn!("Registry: cannot publish \"{}\" on {}: {}", message, topic, e);
            }
        }
    }

    /// Bring the process of `scope_id` to `Running`.
    fn ensure_running(&self, metadata: &ScopeMetadata, process: &ScopeProcess) -> Result<()> {
        let scope_id = &metadata.scope_id;
        if process.state() == ProcessState::Stopping && !process.wait_for(ProcessState::Stopped, STOP_GRACE) {
            warn!("Registry: scope {} took too long to stop, killing it", scope_id);
            self.launcher.kill(scope_id)?;
            process.update(ProcessState::Stopped);
        }

        if process.transition(ProcessState::Stopped, ProcessState::Starting) {
            info!("Registry: starting scope {}", scope_id);
            if let Err(e) = self.launcher.launch(metadata) {
                process.update(ProcessState::Stopped);
                return Err(MwError::Resource(format!(
                    "Registry: failed to start scope {}: {}",
                    scope_id, e
                )));
            }
        }

        if !process.wait_for(ProcessState::Running, self.locate_timeout) {
            if let Err(e) = self.launcher.kill(scope_id) {
                warn!("Registry: cannot kill scope {}: {}", scope_id, e);
            }
            process.update(ProcessState::Stopped);
            return Err(MwError::Resource(format!(
                "Registry: scope {} took too long to start",
                scope_id
            )));
        }
        Ok(())
    }
}

fn require_name(scope_id: &str, what: &str) -> Result<()> {
    if scope_id.is_empty() {
        return Err(MwError::InvalidArgument(format!(
            "Registry: Cannot {} scope with empty name",
            what
        )));
    }
    Ok(())
}

impl AbstractObject for LocalRegistry {
    fn set_disconnect_function(&self, disconnector: Disconnector) {
        self.disconnectors.lock().push(disconnector);
    }
}

impl RegistryObject for LocalRegistry {
    fn get_metadata(&self, scope_id: &str, _info: &InvokeInfo) -> Result<ScopeMetadata> {
        require_name(scope_id, "search for")?;
        if let Some(scope) = self.scopes.lock().get(scope_id) {
            return Ok(scope.metadata.clone());
        }
        match self.remote() {
            Some(remote) => remote.get_metadata(scope_id),
            None => Err(MwError::NotFound(format!(
                "Registry::get_metadata(): no such scope: {}",
                scope_id
            ))),
        }
    }

    fn list(&self, _info: &InvokeInfo) -> Result<MetadataMap> {
        let mut all: MetadataMap = self
            .scopes
            .lock()
            .iter()
            .map(|(id, scope)| (id.clone(), scope.metadata.clone()))
            .collect();
        if let Some(remote) = self.remote() {
            for (id, metadata) in remote.list()? {
                all.entry(id).or_insert(metadata);
            }
        }
        Ok(all)
    }

    fn find(&self, scope_id: &str, _info: &InvokeInfo) -> Result<ProxyAddress> {
        require_name(scope_id, "find")?;
        if let Some(scope) = self.scopes.lock().get(scope_id) {
            return Ok(scope.metadata.proxy.clone());
        }
        match self.remote() {
            Some(remote) => Ok(remote.find(scope_id)?.address().clone()),
            None => Err(MwError::NotFound(format!(
                "Registry::find(): no such scope: {}",
                scope_id
            ))),
        }
    }

    fn locate(&self, scope_id: &str, _info: &InvokeInfo) -> Result<ProxyAddress> {
        require_name(scope_id, "locate")?;
        let (metadata, process) = match self.scopes.lock().get(scope_id) {
            Some(scope) => (scope.metadata.clone(), scope.process.clone()),
            None => {
                return Err(MwError::NotFound(format!(
                    "Tried to locate unknown local scope: {}",
                    scope_id
                )))
            }
        };
        self.ensure_running(&metadata, &process)?;
        Ok(metadata.proxy)
    }
}

impl StateReceiverObject for LocalRegistry {
    fn push_state(&self, sender_id: &str, state: ScopeState) -> Result<()> {
        let Some(process) = self.process(sender_id) else {
            debug!("Registry: {} from unknown scope {}", state, sender_id);
            return Ok(());
        };
        match state {
            ScopeState::ScopeReady => {
                if process.update(ProcessState::Running) != ProcessState::Running {
                    info!("Registry: scope {} is ready", sender_id);
                    self.publish(sender_id, SCOPE_STARTED);
                }
            }
            ScopeState::ScopeStopping => {
                process.update(ProcessState::Stopping);
                debug!("Registry: scope {} is stopping", sender_id);
            }
        }
        Ok(())
    }
}
