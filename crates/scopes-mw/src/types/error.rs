//! Middleware error types

use thiserror::Error;

/// Result type for middleware operations
pub type Result<T> = std::result::Result<T, MwError>;

/// Middleware errors
#[derive(Error, Debug)]
pub enum MwError {
    /// Underlying wire error
    #[error("wire error: {0}")]
    Wire(#[from] scopes_wire::WireError),

    /// Malformed input (bad proxy string, bad field, bad name)
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// No servant is registered for the identity, and there is no default servant
    #[error("object does not exist: identity \"{identity}\" on endpoint {endpoint}")]
    ObjectNotExist { identity: String, endpoint: String },

    /// The servant has no handler for the operation
    #[error("operation does not exist: \"{operation}\" on identity \"{identity}\"")]
    OperationNotExist { identity: String, operation: String },

    /// Lifecycle violation (stopped middleware, shut down adapter, double activation)
    #[error("middleware error: {0}")]
    Middleware(String),

    /// A twoway invocation did not complete within the proxy timeout
    #[error("twoway invocation on {endpoint} timed out after {timeout_ms} ms")]
    Timeout { endpoint: String, timeout_ms: i64 },

    /// The remote servant raised a fault
    #[error("remote fault: {0}")]
    Remote(String),

    /// The identity (or default servant category) is already taken
    #[error("already registered: {0}")]
    AlreadyRegistered(String),

    /// A lookup found nothing
    #[error("not found: {0}")]
    NotFound(String),

    /// Endpoint in use, directory not creatable, and similar
    #[error("resource error: {0}")]
    Resource(String),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl MwError {
    /// Lifecycle error for invocations on a stopped middleware
    pub fn stopped() -> Self {
        MwError::Middleware("Cannot invoke operations while middleware is stopped".to_string())
    }

    /// Whether this is a routing failure (no servant or no operation)
    pub fn is_routing(&self) -> bool {
        matches!(
            self,
            MwError::ObjectNotExist { .. } | MwError::OperationNotExist { .. }
        )
    }

    /// Whether this is a lifecycle failure
    pub fn is_lifecycle(&self) -> bool {
        matches!(self, MwError::Middleware(_))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_classification() {
        assert!(MwError::stopped().is_lifecycle());
        assert!(MwError::ObjectNotExist {
            identity: "a".into(),
            endpoint: "ipc:///x".into()
        }
        .is_routing());
        assert!(!MwError::Timeout {
            endpoint: "ipc:///x".into(),
            timeout_ms: 10
        }
        .is_routing());
    }

    #[test]
    fn test_wire_conversion() {
        let err: MwError = scopes_wire::WireError::ConnectionClosed.into();
        assert!(matches!(err, MwError::Wire(_)));
        assert_eq!(err.to_string(), "wire error: connection closed");
    }
}
