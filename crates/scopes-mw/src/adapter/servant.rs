//! Servants and their operation tables
//!
//! A servant is a category tag plus a table mapping operation names to
//! handlers. The table is fixed when the servant is built; dispatch is a
//! single lookup.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use bytes::Bytes;

use crate::types::{Category, MwError, Result};

/// Context of one inbound call
#[derive(Clone, Debug)]
pub struct Current {
    /// Identity the caller addressed
    pub identity: String,
    pub category: Category,
    pub operation: String,
    /// Name of the adapter that received the call
    pub adapter_name: String,
}

/// Operation handler function type
pub type OperationHandler = Arc<dyn Fn(&Current, Bytes) -> Result<Bytes> + Send + Sync>;

/// One addressable object implementation
pub struct Servant {
    category: Category,
    operations: HashMap<&'static str, OperationHandler>,
}

impl Servant {
    pub fn builder(category: Category) -> ServantBuilder {
        ServantBuilder {
            servant: Servant {
                category,
                operations: HashMap::new(),
            },
        }
    }

    pub fn category(&self) -> Category {
        self.category
    }

    pub fn has_operation(&self, name: &str) -> bool {
        self.operations.contains_key(name)
    }

    /// Names of the operations this servant handles, sorted
    pub fn operation_names(&self) -> Vec<&'static str> {
        let mut names: Vec<_> = self.operations.keys().copied().collect();
        names.sort_unstable();
        names
    }

    /// Run the handler for `current.operation`.
    pub fn dispatch(&self, current: &Current, payload: Bytes) -> Result<Bytes> {
        let handler = self
            .operations
            .get(current.operation.as_str())
            .ok_or_else(|| MwError::OperationNotExist {
                identity: current.identity.clone(),
                operation: current.operation.clone(),
            })?;
        handler(current, payload)
    }
}

impl fmt::Debug for Servant {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Servant")
            .field("category", &self.category)
            .field("operations", &self.operation_names())
            .finish()
    }
}

/// Builder for servants with a fluent API
pub struct ServantBuilder {
    servant: Servant,
}

impl ServantBuilder {
    pub fn operation<F>(mut self, name: &'static str, handler: F) -> Self
    where
        F: Fn(&Current, Bytes) -> Result<Bytes> + Send + Sync + 'static,
    {
        self.servant.operations.insert(name, Arc::new(handler));
        self
    }

    pub fn build(self) -> Arc<Servant> {
        Arc::new(self.servant)
    }
}
