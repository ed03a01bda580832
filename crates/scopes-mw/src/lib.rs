//! Process-separation RPC middleware for scopes
//!
//! Every scope runs in its own process. This crate lets those processes,
//! the registry and the clients that query them call each other through
//! local Unix-domain sockets.
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │  Middleware facade (one per process)                        │
//! │  - add_*_object / create_*_proxy factories                  │
//! │  - invoker pools for outgoing oneway / twoway calls         │
//! ├──────────────────────────────┬──────────────────────────────┤
//! │  Object adapters             │  Typed proxies               │
//! │  - one endpoint, one pool    │  - ScopeProxy, ReplyProxy .. │
//! │  - identity → servant map    │  - ObjectProxy invoker       │
//! │  - default servants          │                              │
//! ├──────────────────────────────┴──────────────────────────────┤
//! │  Publisher / Subscriber (topic-filtered notifications)      │
//! ├─────────────────────────────────────────────────────────────┤
//! │  scopes-wire: PDU framing over Unix-domain sockets          │
//! └─────────────────────────────────────────────────────────────┘
//! ```
//!
//! # Modules
//!
//! - [`types`]: proxy strings, categories, metadata, errors
//! - [`adapter`]: object adapters and servant dispatch tables
//! - [`objects`]: the servant categories and their typed proxies
//! - [`middleware`]: the per-process facade
//! - [`pubsub`]: publisher and subscriber
//! - [`registry`]: the local scope registry
//! - [`signals`]: termination signal masking for hosting processes

pub mod adapter;
pub mod config;
pub mod invoke;
pub mod middleware;
pub mod objects;
pub mod pool;
pub mod pubsub;
pub mod registry;
pub mod signals;
pub mod types;

pub use config::{AdapterKind, EndpointDir, MiddlewareConfig};
pub use invoke::ObjectProxy;
pub use middleware::{Middleware, MiddlewareState, TypedProxy};
pub use objects::{
    AbstractObject, InvokeInfo, QueryCtrlObject, QueryCtrlProxy, QueryObject, QueryProxy,
    RegistryObject, RegistryProxy, ReplyObject, ReplyProxy, ScopeObject, ScopeProxy, ScopeState,
    StateReceiverObject, StateReceiverProxy,
};
pub use pubsub::{Publisher, Subscriber};
pub use registry::{LocalRegistry, ProcessState, ScopeLauncher};
pub use signals::SignalMask;
pub use types::{
    Category, FinishReason, Hints, InvocationMode, MetadataMap, MwError, ProxyAddress, Result,
    ScopeMetadata,
};

pub use adapter::{Current, Disconnector};
