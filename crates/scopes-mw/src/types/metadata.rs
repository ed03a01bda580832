//! Values carried by servant operations

use std::collections::BTreeMap;

use bytes::{Bytes, BytesMut};
use scopes_wire::{Marshal, Unmarshal, WireError};

use super::proxy::ProxyAddress;

/// Free-form key/value hints passed along with a query
pub type Hints = BTreeMap<String, String>;

/// Metadata of every known scope, keyed by scope id
pub type MetadataMap = BTreeMap<String, ScopeMetadata>;

/// Description of one scope as known to a registry
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ScopeMetadata {
    pub scope_id: String,
    /// Twoway proxy of the scope servant
    pub proxy: ProxyAddress,
    pub display_name: String,
    pub description: String,
    pub author: String,
    pub icon: Option<String>,
    pub search_hint: Option<String>,
    pub invisible: bool,
    pub appearance: BTreeMap<String, String>,
}

impl ScopeMetadata {
    pub fn new(scope_id: impl Into<String>, proxy: ProxyAddress) -> Self {
        Self {
            scope_id: scope_id.into(),
            proxy,
            display_name: String::new(),
            description: String::new(),
            author: String::new(),
            icon: None,
            search_hint: None,
            invisible: false,
            appearance: BTreeMap::new(),
        }
    }

    pub fn with_display_name(mut self, name: impl Into<String>) -> Self {
        self.display_name = name.into();
        self
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = description.into();
        self
    }

    pub fn with_author(mut self, author: impl Into<String>) -> Self {
        self.author = author.into();
        self
    }
}

impl Marshal for ScopeMetadata {
    fn marshal(&self, buf: &mut BytesMut) {
        self.scope_id.marshal(buf);
        self.proxy.to_string().marshal(buf);
        self.display_name.marshal(buf);
        self.description.marshal(buf);
        self.author.marshal(buf);
        self.icon.marshal(buf);
        self.search_hint.marshal(buf);
        self.invisible.marshal(buf);
        self.appearance.marshal(buf);
    }
}

impl Unmarshal for ScopeMetadata {
    fn unmarshal(buf: &mut Bytes) -> scopes_wire::Result<Self> {
        let scope_id = String::unmarshal(buf)?;
        let proxy = unmarshal_proxy(buf)?
            .ok_or_else(|| WireError::InvalidPdu(format!("scope {} has a null proxy", scope_id)))?;
        Ok(Self {
            scope_id,
            proxy,
            display_name: String::unmarshal(buf)?,
            description: String::unmarshal(buf)?,
            author: String::unmarshal(buf)?,
            icon: Option::<String>::unmarshal(buf)?,
            search_hint: Option::<String>::unmarshal(buf)?,
            invisible: bool::unmarshal(buf)?,
            appearance: BTreeMap::<String, String>::unmarshal(buf)?,
        })
    }
}

pub fn marshal_metadata_map(map: &MetadataMap, buf: &mut BytesMut) {
    (map.len() as u32).marshal(buf);
    for meta in map.values() {
        meta.marshal(buf);
    }
}

pub fn unmarshal_metadata_map(buf: &mut Bytes) -> scopes_wire::Result<MetadataMap> {
    let count = u32::unmarshal(buf)?;
    let mut map = MetadataMap::new();
    for _ in 0..count {
        let meta = ScopeMetadata::unmarshal(buf)?;
        map.insert(meta.scope_id.clone(), meta);
    }
    Ok(map)
}

/// Proxies travel as their string form; `"nullproxy:"` is allowed.
pub fn marshal_proxy(proxy: Option<&ProxyAddress>, buf: &mut BytesMut) {
    ProxyAddress::format(proxy).marshal(buf);
}

pub fn unmarshal_proxy(buf: &mut Bytes) -> scopes_wire::Result<Option<ProxyAddress>> {
    let s = String::unmarshal(buf)?;
    ProxyAddress::parse(&s).map_err(|e| WireError::InvalidPdu(e.to_string()))
}

/// Why a query finished
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum FinishReason {
    Finished,
    Cancelled,
    Error(String),
}

impl Marshal for FinishReason {
    fn marshal(&self, buf: &mut BytesMut) {
        match self {
            FinishReason::Finished => 0u8.marshal(buf),
            FinishReason::Cancelled => 1u8.marshal(buf),
            FinishReason::Error(msg) => {
                2u8.marshal(buf);
                msg.marshal(buf);
            }
        }
    }
}

impl Unmarshal for FinishReason {
    fn unmarshal(buf: &mut Bytes) -> scopes_wire::Result<Self> {
        match u8::unmarshal(buf)? {
            0 => Ok(FinishReason::Finished),
            1 => Ok(FinishReason::Cancelled),
            2 => Ok(FinishReason::Error(String::unmarshal(buf)?)),
            other => Err(WireError::InvalidPdu(format!("unknown finish reason {}", other))),
        }
    }
}
