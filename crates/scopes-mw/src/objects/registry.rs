//! Registry category
//!
//! Registry responses carry a status byte ahead of the result so that a
//! missing scope comes back as `MwError::NotFound` rather than as a
//! generic remote fault.

use std::sync::{Arc, Weak};

use bytes::{Bytes, BytesMut};
use scopes_wire::{Marshal, PayloadReader, PayloadWriter, Unmarshal};
use tracing::debug;

use super::{AbstractObject, InvokeInfo, ScopeProxy};
use crate::adapter::Servant;
use crate::invoke::ObjectProxy;
use crate::middleware::Middleware;
use crate::pubsub::Subscriber;
use crate::types::{
    marshal_metadata_map, marshal_proxy, unmarshal_metadata_map, unmarshal_proxy, Category,
    MetadataMap, MwError, ProxyAddress, Result, ScopeMetadata,
};

const GET_METADATA: &str = "get_metadata";
const LIST: &str = "list";
const FIND: &str = "find";
const LOCATE: &str = "locate";

const STATUS_OK: u8 = 0;
const STATUS_NOT_FOUND: u8 = 1;

/// Topic on which the registry announces changes to its scope list
///
/// Scope ids cannot contain '/', so this never collides with a scope's
/// state topic.
pub const LIST_UPDATE_TOPIC: &str = "/list_update";

/// Published on a scope's topic when its process comes up
pub const SCOPE_STARTED: &str = "started";

/// Published on a scope's topic when its process goes away
pub const SCOPE_STOPPED: &str = "stopped";

pub trait RegistryObject: AbstractObject {
    fn get_metadata(&self, scope_id: &str, info: &InvokeInfo) -> Result<ScopeMetadata>;

    fn list(&self, info: &InvokeInfo) -> Result<MetadataMap>;

    /// Proxy of a scope, without starting it
    fn find(&self, scope_id: &str, info: &InvokeInfo) -> Result<ProxyAddress>;

    /// Proxy of a scope, starting its process first if necessary
    fn locate(&self, scope_id: &str, info: &InvokeInfo) -> Result<ProxyAddress>;
}

/// Encode a registry result, turning `NotFound` into a status instead of a fault.
fn respond<T>(result: Result<T>, encode: impl FnOnce(&T, &mut BytesMut)) -> Result<Bytes> {
    let mut buf = BytesMut::new();
    match result {
        Ok(value) => {
            STATUS_OK.marshal(&mut buf);
            encode(&value, &mut buf);
        }
        Err(MwError::NotFound(msg)) => {
            STATUS_NOT_FOUND.marshal(&mut buf);
            msg.marshal(&mut buf);
        }
        Err(e) => return Err(e),
    }
    Ok(buf.freeze())
}

fn read_name(payload: Bytes) -> Result<String> {
    let mut reader = PayloadReader::new(payload);
    let name: String = reader.get()?;
    reader.finish()?;
    Ok(name)
}

pub(crate) fn registry_servant(registry: Arc<dyn RegistryObject>, mw: Weak<Middleware>) -> Arc<Servant> {
    let (r1, r2, r3) = (registry.clone(), registry.clone(), registry.clone());
    let (m1, m2, m3) = (mw.clone(), mw.clone(), mw.clone());
    Servant::builder(Category::Registry)
        .operation(GET_METADATA, move |current, payload| {
            let name = read_name(payload)?;
            let info = InvokeInfo::new(current, &m1)?;
            respond(r1.get_metadata(&name, &info), |meta, buf| meta.marshal(buf))
        })
        .operation(LIST, move |current, payload| {
            PayloadReader::new(payload).finish()?;
            let info = InvokeInfo::new(current, &m2)?;
            respond(r2.list(&info), marshal_metadata_map)
        })
        .operation(FIND, move |current, payload| {
            let name = read_name(payload)?;
            let info = InvokeInfo::new(current, &m3)?;
            respond(r3.find(&name, &info), |proxy, buf| marshal_proxy(Some(proxy), buf))
        })
        .operation(LOCATE, move |current, payload| {
            let name = read_name(payload)?;
            let info = InvokeInfo::new(current, &mw)?;
            respond(registry.locate(&name, &info), |proxy, buf| marshal_proxy(Some(proxy), buf))
        })
        .build()
}

/// Split a registry response into its result bytes or a `NotFound` error.
fn unwrap_status(mut payload: Bytes) -> Result<Bytes> {
    match u8::unmarshal(&mut payload)? {
        STATUS_OK => Ok(payload),
        STATUS_NOT_FOUND => {
            let mut reader = PayloadReader::new(payload);
            let msg: String = reader.get()?;
            reader.finish()?;
            Err(MwError::NotFound(msg))
        }
        other => Err(MwError::Remote(format!("unknown registry status {}", other))),
    }
}

typed_proxy! {
    /// Twoway proxy to a registry
    RegistryProxy
}

impl RegistryProxy {
    pub fn get_metadata(&self, scope_id: &str) -> Result<ScopeMetadata> {
        let mut payload = self.call(&self.proxy, GET_METADATA, scope_id)?;
        let meta = ScopeMetadata::unmarshal(&mut payload)?;
        PayloadReader::new(payload).finish()?;
        Ok(meta)
    }

    pub fn list(&self) -> Result<MetadataMap> {
        let response = self.proxy.invoke_twoway(LIST, Bytes::new())?;
        let mut payload = unwrap_status(response)?;
        let map = unmarshal_metadata_map(&mut payload)?;
        PayloadReader::new(payload).finish()?;
        Ok(map)
    }

    pub fn find(&self, scope_id: &str) -> Result<ScopeProxy> {
        let payload = self.call(&self.proxy, FIND, scope_id)?;
        self.scope_proxy(payload)
    }

    /// Like `find`, but the registry starts the scope if it is not running.
    /// The call may take as long as the middleware's locate timeout.
    pub fn locate(&self, scope_id: &str) -> Result<ScopeProxy> {
        let timeout = self.middleware()?.locate_timeout();
        let proxy = self.proxy.with_timeout(timeout)?;
        let payload = self.call(&proxy, LOCATE, scope_id)?;
        self.scope_proxy(payload)
    }

    /// Call `callback` with `true` when the scope starts and `false` when it stops.
    pub fn set_scope_state_callback<F>(&self, scope_id: &str, callback: F) -> Result<Subscriber>
    where
        F: Fn(bool) + Send + 'static,
    {
        if scope_id.is_empty() || scope_id.contains(['/', ':']) {
            return Err(MwError::InvalidArgument(format!("invalid scope id: \"{}\"", scope_id)));
        }
        self.middleware()?
            .create_subscriber(self.identity(), scope_id, move |message: &str| match message {
                SCOPE_STARTED => callback(true),
                SCOPE_STOPPED => callback(false),
                other => debug!("Ignoring unknown scope state message \"{}\"", other),
            })
    }

    /// Call `callback` whenever the registry's scope list changes.
    pub fn set_list_update_callback<F>(&self, callback: F) -> Result<Subscriber>
    where
        F: Fn() + Send + 'static,
    {
        self.middleware()?
            .create_subscriber(self.identity(), LIST_UPDATE_TOPIC, move |_: &str| callback())
    }

    fn middleware(&self) -> Result<Arc<Middleware>> {
        self.proxy.middleware_ref().upgrade().ok_or_else(MwError::stopped)
    }

    fn call(&self, proxy: &ObjectProxy, operation: &str, scope_id: &str) -> Result<Bytes> {
        let response = proxy.invoke_twoway(operation, PayloadWriter::new().put(scope_id).finish())?;
        unwrap_status(response)
    }

    fn scope_proxy(&self, mut payload: Bytes) -> Result<ScopeProxy> {
        let address = unmarshal_proxy(&mut payload)?
            .ok_or_else(|| MwError::Remote("registry returned a null scope proxy".to_string()))?;
        PayloadReader::new(payload).finish()?;
        Ok(ScopeProxy::new(ObjectProxy::new(self.proxy.middleware_ref().clone(), address)))
    }
}
