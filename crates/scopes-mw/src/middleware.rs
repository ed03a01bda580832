//! Middleware facade
//!
//! One `Middleware` per process owns every object adapter of that process
//! and the two pools that carry outgoing invocations. Adapters are created
//! on first use, one per [`AdapterKind`], and live until the facade stops
//! (or, for adapters with an idle timeout, until they shut themselves down,
//! in which case the next registration creates a fresh one).
//!
//! # Example
//!
//! ```no_run
//! use scopes_mw::{Middleware, MiddlewareConfig};
//!
//! let config = MiddlewareConfig::default().with_registry("Registry");
//! let mw = Middleware::new("scope-A", config)?;
//! mw.start()?;
//! if let Some(registry) = mw.registry_proxy()? {
//!     for (id, meta) in registry.list()? {
//!         println!("{}: {}", id, meta.display_name);
//!     }
//! }
//! mw.stop();
//! # Ok::<(), scopes_mw::MwError>(())
//! ```

use std::collections::HashMap;
use std::fmt;
use std::fs::DirBuilder;
use std::io::ErrorKind;
use std::os::unix::fs::DirBuilderExt;
use std::path::Path;
use std::sync::{Arc, Weak};
use std::time::Duration;

use parking_lot::{Condvar, Mutex};
use scopes_wire::Endpoint;
use tracing::{debug, error, info};

use crate::adapter::{AdapterState, DisconnectSlot, Disconnector, ObjectAdapter, Servant};
use crate::config::{AdapterKind, EndpointDir, MiddlewareConfig};
use crate::invoke::ObjectProxy;
use crate::objects::{
    query_ctrl_servant, query_servant, registry_servant, reply_servant, scope_servant,
    state_receiver_servant, QueryCtrlObject, QueryCtrlProxy, QueryObject, QueryProxy,
    RegistryObject, RegistryProxy, ReplyObject, ReplyProxy, ScopeObject, ScopeProxy,
    StateReceiverObject, StateReceiverProxy,
};
use crate::pool::ThreadPool;
use crate::pubsub::{Publisher, Subscriber, PUBLISHER_SUFFIX};
use crate::types::{
    identity_or_generate, Category, InvocationMode, MwError, ProxyAddress, Result,
    INFINITE_TIMEOUT,
};

/// Endpoint directories are owner-only, with the sticky bit set so that
/// runtime-dir cleanup leaves them alone.
const ENDPOINT_DIR_MODE: u32 = 0o1700;

/// Registrations tried before giving up on adapters closing underneath them
const REGISTER_ATTEMPTS: usize = 3;

/// Lifecycle of the facade
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum MiddlewareState {
    Stopped,
    Starting,
    Started,
}

struct Lifecycle {
    state: MiddlewareState,
    oneway: Option<Arc<ThreadPool>>,
    twoway: Option<Arc<ThreadPool>>,
}

/// Proxy produced by [`Middleware::string_to_proxy`]
#[derive(Clone, Debug, PartialEq)]
pub enum TypedProxy {
    Scope(ScopeProxy),
    Registry(RegistryProxy),
}

impl TypedProxy {
    pub fn address(&self) -> &ProxyAddress {
        match self {
            TypedProxy::Scope(p) => p.address(),
            TypedProxy::Registry(p) => p.address(),
        }
    }
}

impl fmt::Display for TypedProxy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(self.address(), f)
    }
}

/// Per-process middleware root
pub struct Middleware {
    server_name: String,
    config: MiddlewareConfig,
    lifecycle: Mutex<Lifecycle>,
    state_changed: Condvar,
    adapters: Mutex<HashMap<AdapterKind, Arc<ObjectAdapter>>>,
    registry: Mutex<Option<RegistryProxy>>,
    ss_registry: Mutex<Option<RegistryProxy>>,
    self_ref: Weak<Middleware>,
}

impl Middleware {
    /// Create a stopped facade for `server_name`, creating the endpoint
    /// directories if they do not exist yet.
    pub fn new(server_name: impl Into<String>, config: MiddlewareConfig) -> Result<Arc<Self>> {
        let server_name = server_name.into();
        if server_name.is_empty() || server_name.contains('/') {
            return Err(MwError::InvalidArgument(format!(
                "invalid server name: \"{}\"",
                server_name
            )));
        }
        for dir in [EndpointDir::Public, EndpointDir::Private] {
            create_endpoint_dir(config.dir(dir)).map_err(|e| {
                MwError::Middleware(format!(
                    "cannot initialize middleware for scope {}: cannot create endpoint directory {}: {}",
                    server_name,
                    config.dir(dir).display(),
                    e
                ))
            })?;
        }
        debug!(
            "Middleware {} using {} (public) and {} (private)",
            server_name,
            config.public_dir.display(),
            config.private_dir.display()
        );

        Ok(Arc::new_cyclic(|self_ref| Self {
            server_name,
            config,
            lifecycle: Mutex::new(Lifecycle {
                state: MiddlewareState::Stopped,
                oneway: None,
                twoway: None,
            }),
            state_changed: Condvar::new(),
            adapters: Mutex::new(HashMap::new()),
            registry: Mutex::new(None),
            ss_registry: Mutex::new(None),
            self_ref: self_ref.clone(),
        }))
    }

    pub fn server_name(&self) -> &str {
        &self.server_name
    }

    pub fn config(&self) -> &MiddlewareConfig {
        &self.config
    }

    pub fn state(&self) -> MiddlewareState {
        self.lifecycle.lock().state
    }

    /// Allocate the invoker pools; a no-op unless stopped.
    pub fn start(&self) -> Result<()> {
        let mut lifecycle = self.lifecycle.lock();
        if lifecycle.state != MiddlewareState::Stopped {
            return Ok(());
        }
        lifecycle.state = MiddlewareState::Starting;
        drop(lifecycle);

        let pools = ThreadPool::new(format!("{}-oneway", self.server_name), self.config.oneway_invoke_threads)
            .and_then(|oneway| {
                let twoway = ThreadPool::new(
                    format!("{}-twoway", self.server_name),
                    self.config.twoway_invoke_threads,
                )?;
                Ok((oneway, twoway))
            });

        let mut lifecycle = self.lifecycle.lock();
        let result = match pools {
            Ok((oneway, twoway)) => {
                lifecycle.oneway = Some(Arc::new(oneway));
                lifecycle.twoway = Some(Arc::new(twoway));
                lifecycle.state = MiddlewareState::Started;
                info!("Middleware {} started", self.server_name);
                Ok(())
            }
            Err(e) => {
                lifecycle.state = MiddlewareState::Stopped;
                error!("Middleware {} failed to start: {}", self.server_name, e);
                Err(e)
            }
        };
        self.state_changed.notify_all();
        result
    }

    /// Shut down every adapter, wait for them to drain, then release the
    /// invoker pools. A no-op if already stopped.
    pub fn stop(&self) {
        let mut lifecycle = self.lifecycle.lock();
        while lifecycle.state == MiddlewareState::Starting {
            self.state_changed.wait(&mut lifecycle);
        }
        if lifecycle.state == MiddlewareState::Stopped {
            return;
        }

        let adapters = std::mem::take(&mut *self.adapters.lock());
        for adapter in adapters.values() {
            adapter.shutdown();
        }
        let pools = (lifecycle.oneway.take(), lifecycle.twoway.take());
        lifecycle.state = MiddlewareState::Stopped;
        self.state_changed.notify_all();
        drop(lifecycle);

        for adapter in adapters.values() {
            adapter.wait_for_shutdown();
        }
        drop(pools);
        info!("Middleware {} stopped", self.server_name);
    }

    /// Block until the facade is stopped.
    pub fn wait_for_shutdown(&self) {
        let mut lifecycle = self.lifecycle.lock();
        while lifecycle.state != MiddlewareState::Stopped {
            self.state_changed.wait(&mut lifecycle);
        }
    }

    pub(crate) fn oneway_pool(&self) -> Result<Arc<ThreadPool>> {
        self.pool(|lifecycle| lifecycle.oneway.clone())
    }

    pub(crate) fn twoway_pool(&self) -> Result<Arc<ThreadPool>> {
        self.pool(|lifecycle| lifecycle.twoway.clone())
    }

    fn pool(&self, pick: impl Fn(&Lifecycle) -> Option<Arc<ThreadPool>>) -> Result<Arc<ThreadPool>> {
        let mut lifecycle = self.lifecycle.lock();
        while lifecycle.state == MiddlewareState::Starting {
            self.state_changed.wait(&mut lifecycle);
        }
        match lifecycle.state {
            MiddlewareState::Started => pick(&lifecycle).ok_or_else(MwError::stopped),
            _ => Err(MwError::stopped()),
        }
    }

    /// How long `RegistryProxy::locate` waits (milliseconds)
    pub fn locate_timeout(&self) -> i64 {
        self.config.locate_timeout_ms
    }

    /// Adapter for `kind`, created and activated on first use.
    ///
    /// A cached adapter that has shut itself down is waited for and then
    /// replaced, so the endpoint is free again before the new one binds.
    fn find_adapter(&self, kind: AdapterKind, idle_timeout: Duration) -> Result<Arc<ObjectAdapter>> {
        loop {
            let stale = {
                let mut lifecycle = self.lifecycle.lock();
                while lifecycle.state == MiddlewareState::Starting {
                    self.state_changed.wait(&mut lifecycle);
                }
                if lifecycle.state == MiddlewareState::Stopped {
                    return Err(MwError::Middleware(format!(
                        "Cannot add objects while middleware {} is stopped",
                        self.server_name
                    )));
                }

                let mut adapters = self.adapters.lock();
                match adapters.get(&kind) {
                    Some(adapter)
                        if !matches!(
                            adapter.state(),
                            AdapterState::ShuttingDown | AdapterState::Shutdown
                        ) =>
                    {
                        return Ok(adapter.clone())
                    }
                    Some(adapter) => adapter.clone(),
                    None => {
                        let adapter = ObjectAdapter::new(
                            kind.adapter_name(&self.server_name),
                            self.endpoint_for(kind),
                            kind.mode(),
                            self.config.pool_size(kind),
                        );
                        adapter.activate(idle_timeout)?;
                        adapters.insert(kind, adapter.clone());
                        return Ok(adapter);
                    }
                }
            };

            debug!("Replacing dead adapter {}", stale.name());
            stale.wait_for_shutdown();
            let mut adapters = self.adapters.lock();
            if adapters.get(&kind).is_some_and(|current| Arc::ptr_eq(current, &stale)) {
                adapters.remove(&kind);
            }
        }
    }

    fn endpoint_for(&self, kind: AdapterKind) -> Endpoint {
        Endpoint::in_dir(
            self.config.dir(kind.directory()),
            &kind.adapter_name(&self.server_name),
        )
    }

    /// Run `register` against the adapter for `kind`.
    ///
    /// An adapter can close itself between lookup and registration when its
    /// idle timer fires; registration then moves to a fresh adapter.
    fn register_on<T>(
        &self,
        kind: AdapterKind,
        idle_timeout: Duration,
        register: impl Fn(&ObjectAdapter) -> Result<T>,
    ) -> Result<(Arc<ObjectAdapter>, T)> {
        let mut attempt = 1;
        loop {
            let adapter = self.find_adapter(kind, idle_timeout)?;
            match register(&adapter) {
                Err(e) if !adapter.is_accepting() && attempt < REGISTER_ATTEMPTS => {
                    debug!("Adapter {} closed during registration ({}), retrying", adapter.name(), e);
                    attempt += 1;
                }
                result => return result.map(|value| (adapter, value)),
            }
        }
    }

    /// Register `servant` and build the disconnector that removes exactly
    /// this servant from its adapter.
    fn safe_add(
        &self,
        what: &str,
        kind: AdapterKind,
        identity: &str,
        servant: Arc<Servant>,
        idle_timeout: Duration,
    ) -> Result<(ProxyAddress, Disconnector)> {
        let add = || -> Result<(ProxyAddress, Disconnector)> {
            let identity = identity_or_generate(identity);
            let (adapter, proxy) =
                self.register_on(kind, idle_timeout, |adapter| adapter.add(&identity, servant.clone()))?;
            let servant = Arc::downgrade(&servant);
            let disconnector = Disconnector::new(move || {
                if let Some(servant) = servant.upgrade() {
                    adapter.remove_servant(&identity, &servant);
                }
            });
            Ok((proxy, disconnector))
        };
        add().map_err(|e| {
            error!("unexpected error in {}(): {}", what, e);
            e
        })
    }

    fn safe_dflt_add(&self, what: &str, kind: AdapterKind, servant: Arc<Servant>) -> Result<Disconnector> {
        let add = || -> Result<Disconnector> {
            let category = servant.category();
            let (adapter, ()) = self.register_on(kind, Duration::ZERO, |adapter| {
                adapter.add_default_servant(category, servant.clone())
            })?;
            let servant = Arc::downgrade(&servant);
            Ok(Disconnector::new(move || {
                if let Some(servant) = servant.upgrade() {
                    adapter.remove_default_servant_if(category, &servant);
                }
            }))
        };
        add().map_err(|e| {
            error!("unexpected error in {}(): {}", what, e);
            e
        })
    }

    fn bind(&self, address: ProxyAddress) -> ObjectProxy {
        ObjectProxy::new(self.self_ref.clone(), address)
    }

    fn bind_twoway(&self, address: ProxyAddress) -> Result<ObjectProxy> {
        Ok(self.bind(address.with_timeout(self.config.twoway_timeout_ms)?))
    }

    /// Register a scope under `identity`. A non-zero `idle_timeout` lets the
    /// scope adapter shut down once no scope is registered on it.
    pub fn add_scope_object(
        &self,
        identity: &str,
        scope: Arc<dyn ScopeObject>,
        idle_timeout: Duration,
    ) -> Result<ScopeProxy> {
        require_identity(identity)?;
        let servant = scope_servant(scope.clone(), self.self_ref.clone());
        let (address, disconnector) =
            self.safe_add("add_scope_object", AdapterKind::Scope, identity, servant, idle_timeout)?;
        scope.set_disconnect_function(disconnector);
        Ok(ScopeProxy::new(self.bind_twoway(address)?))
    }

    pub fn add_dflt_scope_object(&self, scope: Arc<dyn ScopeObject>) -> Result<()> {
        let servant = scope_servant(scope.clone(), self.self_ref.clone());
        let disconnector = self.safe_dflt_add("add_dflt_scope_object", AdapterKind::Scope, servant)?;
        scope.set_disconnect_function(disconnector);
        Ok(())
    }

    pub fn add_query_object(&self, query: Arc<dyn QueryObject>) -> Result<QueryProxy> {
        let servant = query_servant(query.clone(), self.self_ref.clone());
        let (address, disconnector) =
            self.safe_add("add_query_object", AdapterKind::Query, "", servant, Duration::ZERO)?;
        query.set_disconnect_function(disconnector);
        Ok(QueryProxy::new(self.bind(address)))
    }

    pub fn add_dflt_query_object(&self, query: Arc<dyn QueryObject>) -> Result<()> {
        let servant = query_servant(query.clone(), self.self_ref.clone());
        let disconnector = self.safe_dflt_add("add_dflt_query_object", AdapterKind::Query, servant)?;
        query.set_disconnect_function(disconnector);
        Ok(())
    }

    pub fn add_query_ctrl_object(&self, ctrl: Arc<dyn QueryCtrlObject>) -> Result<QueryCtrlProxy> {
        let servant = query_ctrl_servant(ctrl.clone(), self.self_ref.clone());
        let (address, disconnector) =
            self.safe_add("add_query_ctrl_object", AdapterKind::Ctrl, "", servant, Duration::ZERO)?;
        ctrl.set_disconnect_function(disconnector);
        Ok(QueryCtrlProxy::new(self.bind(address)))
    }

    pub fn add_dflt_query_ctrl_object(&self, ctrl: Arc<dyn QueryCtrlObject>) -> Result<()> {
        let servant = query_ctrl_servant(ctrl.clone(), self.self_ref.clone());
        let disconnector = self.safe_dflt_add("add_dflt_query_ctrl_object", AdapterKind::Ctrl, servant)?;
        ctrl.set_disconnect_function(disconnector);
        Ok(())
    }

    /// Register a reply object. The servant disconnects itself after the
    /// first `finished`.
    pub fn add_reply_object(&self, reply: Arc<dyn ReplyObject>) -> Result<ReplyProxy> {
        let slot = Arc::new(DisconnectSlot::new());
        let servant = reply_servant(reply.clone(), slot.clone());
        let (address, disconnector) =
            self.safe_add("add_reply_object", AdapterKind::Reply, "", servant, Duration::ZERO)?;
        slot.set(disconnector.clone());
        reply.set_disconnect_function(disconnector);
        Ok(ReplyProxy::new(self.bind(address)))
    }

    pub fn add_registry_object(&self, identity: &str, registry: Arc<dyn RegistryObject>) -> Result<RegistryProxy> {
        require_identity(identity)?;
        let servant = registry_servant(registry.clone(), self.self_ref.clone());
        let (address, disconnector) =
            self.safe_add("add_registry_object", AdapterKind::Registry, identity, servant, Duration::ZERO)?;
        registry.set_disconnect_function(disconnector);
        Ok(RegistryProxy::new(self.bind_twoway(address)?))
    }

    pub fn add_state_receiver_object(
        &self,
        identity: &str,
        receiver: Arc<dyn StateReceiverObject>,
    ) -> Result<StateReceiverProxy> {
        require_identity(identity)?;
        let servant = state_receiver_servant(receiver.clone());
        let (address, disconnector) =
            self.safe_add("add_state_receiver_object", AdapterKind::State, identity, servant, Duration::ZERO)?;
        receiver.set_disconnect_function(disconnector);
        Ok(StateReceiverProxy::new(self.bind(address)))
    }

    /// Proxy for a scope served by the process named `identity`
    pub fn create_scope_proxy(&self, identity: &str) -> Result<ScopeProxy> {
        let endpoint = Endpoint::in_dir(self.config.dir(EndpointDir::Private), identity);
        self.create_scope_proxy_on(identity, endpoint)
    }

    pub fn create_scope_proxy_at(&self, identity: &str, endpoint: &str) -> Result<ScopeProxy> {
        self.create_scope_proxy_on(identity, endpoint.parse()?)
    }

    fn create_scope_proxy_on(&self, identity: &str, endpoint: Endpoint) -> Result<ScopeProxy> {
        let address = ProxyAddress::new(
            endpoint,
            identity,
            Category::Scope,
            InvocationMode::Twoway,
            self.config.twoway_timeout_ms,
        )?;
        Ok(ScopeProxy::new(self.bind(address)))
    }

    pub fn create_query_proxy(&self, identity: &str, endpoint: &str) -> Result<QueryProxy> {
        let address = oneway_address(identity, endpoint, Category::Query)?;
        Ok(QueryProxy::new(self.bind(address)))
    }

    pub fn create_query_ctrl_proxy(&self, identity: &str, endpoint: &str) -> Result<QueryCtrlProxy> {
        let address = oneway_address(identity, endpoint, Category::QueryCtrl)?;
        Ok(QueryCtrlProxy::new(self.bind(address)))
    }

    /// Proxy for the state receiver registered as `identity` by the server
    /// of the same name (the registry registers its receiver that way).
    pub fn create_state_receiver_proxy(&self, identity: &str) -> Result<StateReceiverProxy> {
        let address = ProxyAddress::new(
            Endpoint::in_dir(
                self.config.dir(AdapterKind::State.directory()),
                &AdapterKind::State.adapter_name(identity),
            ),
            identity,
            Category::State,
            InvocationMode::Oneway,
            INFINITE_TIMEOUT,
        )?;
        Ok(StateReceiverProxy::new(self.bind(address)))
    }

    /// Parse a stringified proxy. Only twoway scope and registry proxies
    /// can be created this way; `"nullproxy:"` yields `None`.
    pub fn string_to_proxy(&self, s: &str) -> Result<Option<TypedProxy>> {
        let Some(address) = ProxyAddress::parse(s)? else {
            return Ok(None);
        };
        if address.mode() != InvocationMode::Twoway {
            return Err(MwError::InvalidArgument(
                "make_typed_proxy(): cannot create oneway proxies".to_string(),
            ));
        }
        let proxy = match address.category() {
            Category::Scope => TypedProxy::Scope(ScopeProxy::new(self.bind(address))),
            Category::Registry => TypedProxy::Registry(RegistryProxy::new(self.bind(address))),
            other => {
                return Err(MwError::InvalidArgument(format!(
                    "make_typed_proxy(): unknown category: {}",
                    other
                )))
            }
        };
        Ok(Some(proxy))
    }

    pub fn proxy_to_string(proxy: Option<&ProxyAddress>) -> String {
        ProxyAddress::format(proxy)
    }

    /// Proxy for the configured registry, or `None` if there is none
    pub fn registry_proxy(&self) -> Result<Option<RegistryProxy>> {
        self.cached_registry(&self.registry, self.config.registry_identity.as_deref())
    }

    /// Proxy for the configured remote registry, or `None` if there is none
    pub fn ss_registry_proxy(&self) -> Result<Option<RegistryProxy>> {
        self.cached_registry(&self.ss_registry, self.config.ss_registry_identity.as_deref())
    }

    fn cached_registry(
        &self,
        cache: &Mutex<Option<RegistryProxy>>,
        identity: Option<&str>,
    ) -> Result<Option<RegistryProxy>> {
        let mut cache = cache.lock();
        if cache.is_none() {
            if let Some(identity) = identity.filter(|id| !id.is_empty()) {
                let address = ProxyAddress::new(
                    Endpoint::in_dir(self.config.dir(EndpointDir::Public), identity),
                    identity,
                    Category::Registry,
                    InvocationMode::Twoway,
                    self.config.twoway_timeout_ms,
                )?;
                *cache = Some(RegistryProxy::new(self.bind(address)));
            }
        }
        Ok(cache.clone())
    }

    /// Start a publisher named `id` in the public directory.
    pub fn create_publisher(&self, id: &str) -> Result<Publisher> {
        Publisher::new(id, self.publisher_endpoint(id))
    }

    /// Subscribe to `topic` of the publisher named `publisher_id`; an empty
    /// topic receives every message.
    pub fn create_subscriber<F>(&self, publisher_id: &str, topic: &str, callback: F) -> Result<Subscriber>
    where
        F: Fn(&str) + Send + 'static,
    {
        Subscriber::new(self.publisher_endpoint(publisher_id), topic, Box::new(callback))
    }

    fn publisher_endpoint(&self, id: &str) -> Endpoint {
        Endpoint::in_dir(
            self.config.dir(EndpointDir::Public),
            &format!("{}{}", id, PUBLISHER_SUFFIX),
        )
    }

    pub fn get_scope_endpoint(&self) -> String {
        self.endpoint_for(AdapterKind::Scope).to_string()
    }

    pub fn get_query_endpoint(&self) -> String {
        self.endpoint_for(AdapterKind::Query).to_string()
    }

    pub fn get_query_ctrl_endpoint(&self) -> String {
        self.endpoint_for(AdapterKind::Ctrl).to_string()
    }
}

impl Drop for Middleware {
    fn drop(&mut self) {
        self.stop();
        self.wait_for_shutdown();
    }
}

impl fmt::Debug for Middleware {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Middleware")
            .field("server_name", &self.server_name)
            .field("state", &self.state())
            .finish()
    }
}

fn create_endpoint_dir(dir: &Path) -> std::io::Result<()> {
    if let Some(parent) = dir.parent() {
        std::fs::create_dir_all(parent)?;
    }
    match DirBuilder::new().mode(ENDPOINT_DIR_MODE).create(dir) {
        Err(e) if e.kind() != ErrorKind::AlreadyExists => Err(e),
        _ => Ok(()),
    }
}

fn require_identity(identity: &str) -> Result<()> {
    if identity.is_empty() {
        return Err(MwError::InvalidArgument("identity cannot be empty".to_string()));
    }
    Ok(())
}

fn oneway_address(identity: &str, endpoint: &str, category: Category) -> Result<ProxyAddress> {
    ProxyAddress::new(
        endpoint.parse()?,
        identity,
        category,
        InvocationMode::Oneway,
        INFINITE_TIMEOUT,
    )
}
