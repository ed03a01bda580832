//! Core middleware types
//!
//! - Errors shared by every layer
//! - Servant categories and invocation modes
//! - Proxy addressing (parse/format of proxy strings)
//! - Identities and the values servant operations exchange

mod category;
mod error;
mod identity;
mod metadata;
mod proxy;

pub use category::{Category, InvocationMode};
pub use error::{MwError, Result};
pub use identity::{generate_identity, identity_or_generate};
pub use metadata::{
    marshal_metadata_map, marshal_proxy, unmarshal_metadata_map, unmarshal_proxy, FinishReason,
    Hints, MetadataMap, ScopeMetadata,
};
pub use proxy::{ProxyAddress, INFINITE_TIMEOUT, NULL_PROXY};
