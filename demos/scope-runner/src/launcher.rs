//! Starts scope processes for the registry by re-executing this binary

use std::collections::HashMap;
use std::ffi::OsString;
use std::path::PathBuf;
use std::process::{Child, Command};
use std::sync::{Arc, Weak};
use std::thread;
use std::time::Duration;

use parking_lot::Mutex;
use tracing::{debug, info, warn};

use scopes_mw::{LocalRegistry, MwError, Result, ScopeLauncher, ScopeMetadata};

const EXIT_POLL_INTERVAL: Duration = Duration::from_millis(100);

pub struct ProcessLauncher {
    program: PathBuf,
    /// Global options passed ahead of the `scope` subcommand
    options: Vec<OsString>,
    children: Arc<Mutex<HashMap<String, Child>>>,
    registry: Mutex<Weak<LocalRegistry>>,
}

impl ProcessLauncher {
    pub fn new(program: PathBuf, options: Vec<OsString>) -> Self {
        Self {
            program,
            options,
            children: Arc::new(Mutex::new(HashMap::new())),
            registry: Mutex::new(Weak::new()),
        }
    }

    /// Registry told about process exits
    pub fn set_registry(&self, registry: Weak<LocalRegistry>) {
        *self.registry.lock() = registry;
    }

    pub fn kill_all(&self) {
        for (scope_id, child) in self.children.lock().iter_mut() {
            if let Err(e) = child.kill() {
                debug!("Cannot kill scope {}: {}", scope_id, e);
            }
        }
    }

    fn watch(&self, scope_id: String) {
        let children = self.children.clone();
        let registry = self.registry.lock().clone();
        let spawned = thread::Builder::new()
            .name(format!("watch-{}", scope_id))
            .spawn(move || loop {
                thread::sleep(EXIT_POLL_INTERVAL);
                let mut children = children.lock();
                let exited = match children.get_mut(&scope_id) {
                    Some(child) => !matches!(child.try_wait(), Ok(None)),
                    None => true,
                };
                if exited {
                    children.remove(&scope_id);
                    drop(children);
                    if let Some(registry) = registry.upgrade() {
                        registry.on_process_exit(&scope_id);
                    }
                    return;
                }
            });
        if let Err(e) = spawned {
            warn!("Cannot watch scope process: {}", e);
        }
    }
}

impl ScopeLauncher for ProcessLauncher {
    fn launch(&self, metadata: &ScopeMetadata) -> Result<()> {
        let child = Command::new(&self.program)
            .args(&self.options)
            .arg("scope")
            .arg(&metadata.scope_id)
            .spawn()?;
        info!("Started scope {} (pid {})", metadata.scope_id, child.id());
        self.children.lock().insert(metadata.scope_id.clone(), child);
        self.watch(metadata.scope_id.clone());
        Ok(())
    }

    fn kill(&self, scope_id: &str) -> Result<()> {
        match self.children.lock().get_mut(scope_id) {
            Some(child) => Ok(child.kill()?),
            None => Err(MwError::NotFound(format!("no process for scope {}", scope_id))),
        }
    }
}
