//! Servant categories
//!
//! Each category has three parts: an object trait the application
//! implements, a servant table that unmarshals requests and calls the
//! trait, and a typed proxy that marshals calls on the client side.
//!
//! | Category  | Mode   | Operations                                              |
//! |-----------|--------|---------------------------------------------------------|
//! | Scope     | twoway | create_query, activate, activate_preview_action, preview |
//! | Query     | oneway | run                                                     |
//! | QueryCtrl | oneway | cancel, destroy                                         |
//! | Reply     | oneway | push, finished                                          |
//! | Registry  | twoway | get_metadata, list, find, locate                        |
//! | State     | oneway | push_state                                              |

use std::sync::{Arc, Weak};

use bytes::{Bytes, BytesMut};
use scopes_wire::{Marshal, PayloadReader};

use crate::adapter::{Current, Disconnector};
use crate::invoke::ObjectProxy;
use crate::middleware::Middleware;
use crate::types::{MwError, ProxyAddress, Result};

/// Base of every object implementation
pub trait AbstractObject: Send + Sync {
    /// Receive the callback that removes this object from its adapter.
    fn set_disconnect_function(&self, disconnector: Disconnector);
}

/// What an object implementation learns about the call it is serving
pub struct InvokeInfo<'a> {
    pub current: &'a Current,
    pub middleware: Arc<Middleware>,
}

impl<'a> InvokeInfo<'a> {
    pub(crate) fn new(current: &'a Current, mw: &Weak<Middleware>) -> Result<Self> {
        Ok(Self {
            current,
            middleware: mw.upgrade().ok_or_else(MwError::stopped)?,
        })
    }

    pub fn identity(&self) -> &str {
        &self.current.identity
    }
}

macro_rules! typed_proxy {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Clone, Debug, PartialEq)]
        pub struct $name {
            proxy: $crate::invoke::ObjectProxy,
        }

        impl $name {
            pub fn new(proxy: $crate::invoke::ObjectProxy) -> Self {
                Self { proxy }
            }

            pub fn object(&self) -> &$crate::invoke::ObjectProxy {
                &self.proxy
            }

            pub fn address(&self) -> &$crate::types::ProxyAddress {
                self.proxy.address()
            }

            pub fn identity(&self) -> &str {
                self.proxy.identity()
            }
        }

        impl std::fmt::Display for $name {
            fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                std::fmt::Display::fmt(&self.proxy, f)
            }
        }
    };
}

mod query;
mod query_ctrl;
mod registry;
mod reply;
mod scope;
mod state_receiver;

pub use query::{QueryObject, QueryProxy};
pub use query_ctrl::{QueryCtrlObject, QueryCtrlProxy};
pub use registry::{RegistryObject, RegistryProxy, LIST_UPDATE_TOPIC, SCOPE_STARTED, SCOPE_STOPPED};
pub use reply::{ReplyObject, ReplyProxy};
pub use scope::{ScopeObject, ScopeProxy};
pub use state_receiver::{ScopeState, StateReceiverObject, StateReceiverProxy};

pub(crate) use query::query_servant;
pub(crate) use query_ctrl::query_ctrl_servant;
pub(crate) use registry::registry_servant;
pub(crate) use reply::reply_servant;
pub(crate) use scope::scope_servant;
pub(crate) use state_receiver::state_receiver_servant;

/// Read a non-null proxy string from a request payload.
fn read_proxy(reader: &mut PayloadReader, what: &str) -> Result<ProxyAddress> {
    let s: String = reader.get()?;
    ProxyAddress::parse(&s)?.ok_or_else(|| MwError::InvalidArgument(format!("null {} proxy", what)))
}

fn proxy_payload(proxy: &ProxyAddress) -> Bytes {
    let mut buf = BytesMut::new();
    proxy.to_string().marshal(&mut buf);
    buf.freeze()
}

/// Read the proxy a twoway operation returned and bind it to the caller's middleware.
fn returned_proxy(caller: &ObjectProxy, payload: Bytes, what: &str) -> Result<ObjectProxy> {
    let mut reader = PayloadReader::new(payload);
    let address = read_proxy(&mut reader, what)?;
    reader.finish()?;
    Ok(ObjectProxy::new(caller.middleware_ref().clone(), address))
}
