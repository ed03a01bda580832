//! Middleware configuration and the adapter kind table

use std::path::{Path, PathBuf};

use crate::types::{Category, InvocationMode};

/// Default timeout for twoway invocations (milliseconds)
pub const DEFAULT_TWOWAY_TIMEOUT_MS: i64 = 300;

/// Default time to wait for a scope process to come up (milliseconds)
pub const DEFAULT_LOCATE_TIMEOUT_MS: i64 = 2000;

/// Handling an inbound twoway call may issue a nested twoway call, so the
/// outgoing twoway pool never shrinks below this.
pub const MIN_TWOWAY_INVOKE_THREADS: usize = 2;

/// Which of the two endpoint directories an adapter listens in
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum EndpointDir {
    /// Reachable by any process of the user
    Public,
    /// Reserved for the owning server
    Private,
}

/// One entry per kind of adapter a middleware instance may create
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum AdapterKind {
    Scope,
    Registry,
    Query,
    Ctrl,
    Reply,
    State,
}

impl AdapterKind {
    pub const ALL: [AdapterKind; 6] = [
        AdapterKind::Scope,
        AdapterKind::Registry,
        AdapterKind::Query,
        AdapterKind::Ctrl,
        AdapterKind::Reply,
        AdapterKind::State,
    ];

    /// Suffix appended to the server name to form the adapter name
    pub fn suffix(self) -> &'static str {
        match self {
            AdapterKind::Scope | AdapterKind::Registry => "",
            AdapterKind::Query => "-q",
            AdapterKind::Ctrl => "-c",
            AdapterKind::Reply => "-r",
            AdapterKind::State => "-s",
        }
    }

    pub fn directory(self) -> EndpointDir {
        match self {
            AdapterKind::Registry | AdapterKind::Reply => EndpointDir::Public,
            _ => EndpointDir::Private,
        }
    }

    pub fn mode(self) -> InvocationMode {
        match self {
            AdapterKind::Scope | AdapterKind::Registry => InvocationMode::Twoway,
            _ => InvocationMode::Oneway,
        }
    }

    /// Category of the servants this adapter hosts
    pub fn category(self) -> Category {
        match self {
            AdapterKind::Scope => Category::Scope,
            AdapterKind::Registry => Category::Registry,
            AdapterKind::Query => Category::Query,
            AdapterKind::Ctrl => Category::QueryCtrl,
            AdapterKind::Reply => Category::Reply,
            AdapterKind::State => Category::State,
        }
    }

    pub fn adapter_name(self, server_name: &str) -> String {
        format!("{}{}", server_name, self.suffix())
    }

    fn default_pool_size(self) -> usize {
        match self {
            AdapterKind::Registry => 6,
            _ => 1,
        }
    }
}

/// Middleware configuration
#[derive(Clone, Debug)]
pub struct MiddlewareConfig {
    /// Directory for endpoints other processes connect to
    pub public_dir: PathBuf,
    /// Directory for endpoints private to the server
    pub private_dir: PathBuf,
    /// Timeout of twoway proxies created by the facade; -1 is infinite
    pub twoway_timeout_ms: i64,
    /// How long `locate` waits for a scope process to start
    pub locate_timeout_ms: i64,
    /// Identity of the registry; no registry proxy without it
    pub registry_identity: Option<String>,
    /// Identity of the remote ("smart") registry
    pub ss_registry_identity: Option<String>,
    /// Threads in the outgoing oneway pool
    pub oneway_invoke_threads: usize,
    /// Threads in the outgoing twoway pool
    pub twoway_invoke_threads: usize,
    pool_sizes: [usize; 6],
}

impl Default for MiddlewareConfig {
    fn default() -> Self {
        let base = std::env::var_os("XDG_RUNTIME_DIR")
            .map(PathBuf::from)
            .unwrap_or_else(std::env::temp_dir)
            .join("scopes");
        Self {
            public_dir: base.join("pub"),
            private_dir: base.join("priv"),
            twoway_timeout_ms: DEFAULT_TWOWAY_TIMEOUT_MS,
            locate_timeout_ms: DEFAULT_LOCATE_TIMEOUT_MS,
            registry_identity: None,
            ss_registry_identity: None,
            oneway_invoke_threads: 1,
            twoway_invoke_threads: MIN_TWOWAY_INVOKE_THREADS,
            pool_sizes: AdapterKind::ALL.map(AdapterKind::default_pool_size),
        }
    }
}

impl MiddlewareConfig {
    /// Configuration with both endpoint directories under `base`
    pub fn with_base_dir(base: &Path) -> Self {
        Self::default().with_dirs(base.join("pub"), base.join("priv"))
    }

    pub fn with_dirs(mut self, public_dir: impl Into<PathBuf>, private_dir: impl Into<PathBuf>) -> Self {
        self.public_dir = public_dir.into();
        self.private_dir = private_dir.into();
        self
    }

    pub fn with_twoway_timeout(mut self, timeout_ms: i64) -> Self {
        self.twoway_timeout_ms = timeout_ms;
        self
    }

    pub fn with_locate_timeout(mut self, timeout_ms: i64) -> Self {
        self.locate_timeout_ms = timeout_ms;
        self
    }

    pub fn with_registry(mut self, identity: impl Into<String>) -> Self {
        self.registry_identity = Some(identity.into());
        self
    }

    pub fn with_ss_registry(mut self, identity: impl Into<String>) -> Self {
        self.ss_registry_identity = Some(identity.into());
        self
    }

    pub fn with_invoke_threads(mut self, oneway: usize, twoway: usize) -> Self {
        self.oneway_invoke_threads = oneway.max(1);
        self.twoway_invoke_threads = twoway.max(MIN_TWOWAY_INVOKE_THREADS);
        self
    }

    pub fn with_pool_size(mut self, kind: AdapterKind, threads: usize) -> Self {
        self.pool_sizes[kind as usize] = threads.max(1);
        self
    }

    pub fn pool_size(&self, kind: AdapterKind) -> usize {
        self.pool_sizes[kind as usize]
    }

    pub fn dir(&self, dir: EndpointDir) -> &Path {
        match dir {
            EndpointDir::Public => &self.public_dir,
            EndpointDir::Private => &self.private_dir,
        }
    }
}
