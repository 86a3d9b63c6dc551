use std::collections::HashMap;
use thiserror::Error;

/// Unified error type for the convoy library.
///
/// Subsystems keep their own narrow error enums (`GraphError`, `LockError`);
/// this type is the aggregate surface callers see at the crate boundary.
#[derive(Debug, Error)]
pub enum ConvoyError {
    /// Execution-related errors
    #[error("Execution failed in {component}: {message}")]
    Execution {
        component: String,
        message: String,
        context: HashMap<String, String>,
        #[source]
        source: Option<Box<dyn std::error::Error + Send + Sync>>,
    },

    /// Validation errors
    #[error("Validation failed: {message}")]
    Validation {
        message: String,
        field: Option<String>,
        #[source]
        source: Option<Box<dyn std::error::Error + Send + Sync>>,
    },

    /// Configuration errors
    #[error("Configuration error: {message}")]
    Configuration {
        message: String,
        field: Option<String>,
        expected: Option<String>,
        actual: Option<String>,
    },

    /// Serialization errors
    #[error("Serialization failed: {format}")]
    Serialization {
        format: String,
        #[source]
        source: Box<dyn std::error::Error + Send + Sync>,
    },

    /// Network/RPC errors against a peer
    #[error("Peer call failed: {operation} (peer: {peer})")]
    Network {
        operation: String,
        peer: String,
        status: Option<u16>,
        #[source]
        source: Option<Box<dyn std::error::Error + Send + Sync>>,
    },

    /// Graph errors
    #[error(transparent)]
    Graph(#[from] crate::graph::GraphError),

    /// Locking errors (state machine, priority, distributed handshake)
    #[error(transparent)]
    Lock(#[from] crate::lock::LockError),

    /// Timeout errors
    #[error("Operation timed out: {operation} (timeout: {timeout_ms}ms)")]
    Timeout { operation: String, timeout_ms: u64 },

    /// Cancellation errors
    #[error("Operation was cancelled: {operation}")]
    Cancelled {
        operation: String,
        reason: Option<String>,
    },

    /// Generic internal errors
    #[error("Internal error: {message}")]
    Internal {
        message: String,
        #[source]
        source: Option<Box<dyn std::error::Error + Send + Sync>>,
    },
}

impl ConvoyError {
    /// Create an execution error with context
    pub fn execution<S: Into<String>>(component: S, message: S) -> Self {
        Self::Execution {
            component: component.into(),
            message: message.into(),
            context: HashMap::new(),
            source: None,
        }
    }

    /// Add context to an execution error
    pub fn with_context<K: Into<String>, V: Into<String>>(mut self, key: K, value: V) -> Self {
        if let Self::Execution {
            ref mut context, ..
        } = self
        {
            context.insert(key.into(), value.into());
        }
        self
    }

    /// Create a validation error
    pub fn validation<S: Into<String>>(message: S) -> Self {
        Self::Validation {
            message: message.into(),
            field: None,
            source: None,
        }
    }

    /// Create a validation error with field
    pub fn validation_field<S: Into<String>, F: Into<String>>(message: S, field: F) -> Self {
        Self::Validation {
            message: message.into(),
            field: Some(field.into()),
            source: None,
        }
    }

    /// Create a configuration error
    pub fn configuration<S: Into<String>>(message: S) -> Self {
        Self::Configuration {
            message: message.into(),
            field: None,
            expected: None,
            actual: None,
        }
    }

    /// Create a serialization error
    pub fn serialization<S: Into<String>, E: std::error::Error + Send + Sync + 'static>(
        format: S,
        source: E,
    ) -> Self {
        Self::Serialization {
            format: format.into(),
            source: Box::new(source),
        }
    }

    /// Create a network error against a named peer
    pub fn network<S: Into<String>, P: Into<String>>(
        operation: S,
        peer: P,
        status: Option<u16>,
    ) -> Self {
        Self::Network {
            operation: operation.into(),
            peer: peer.into(),
            status,
            source: None,
        }
    }

    /// Create a timeout error
    pub fn timeout<S: Into<String>>(operation: S, timeout_ms: u64) -> Self {
        Self::Timeout {
            operation: operation.into(),
            timeout_ms,
        }
    }

    /// Create a cancellation error
    pub fn cancelled<S: Into<String>>(operation: S) -> Self {
        Self::Cancelled {
            operation: operation.into(),
            reason: None,
        }
    }

    /// Create an internal error
    pub fn internal<S: Into<String>>(message: S) -> Self {
        Self::Internal {
            message: message.into(),
            source: None,
        }
    }

    /// Check if error is recoverable
    pub fn is_recoverable(&self) -> bool {
        match self {
            Self::Timeout { .. } | Self::Network { .. } => true,
            Self::Lock(e) => e.is_recoverable(),
            Self::Validation { .. } | Self::Configuration { .. } => false,
            Self::Graph(_) => false,
            Self::Cancelled { .. } => false,
            _ => false,
        }
    }

    /// Get error category for metrics/logging
    pub fn category(&self) -> &'static str {
        match self {
            Self::Execution { .. } => "execution",
            Self::Validation { .. } => "validation",
            Self::Configuration { .. } => "configuration",
            Self::Serialization { .. } => "serialization",
            Self::Network { .. } => "network",
            Self::Graph(_) => "graph",
            Self::Lock(_) => "lock",
            Self::Timeout { .. } => "timeout",
            Self::Cancelled { .. } => "cancelled",
            Self::Internal { .. } => "internal",
        }
    }
}

/// Result type alias for convenience
pub type Result<T> = std::result::Result<T, ConvoyError>;

/// Convert from common error types
impl From<serde_json::Error> for ConvoyError {
    fn from(err: serde_json::Error) -> Self {
        Self::serialization("json", err)
    }
}

impl From<serde_yaml::Error> for ConvoyError {
    fn from(err: serde_yaml::Error) -> Self {
        Self::serialization("yaml", err)
    }
}

impl From<std::io::Error> for ConvoyError {
    fn from(err: std::io::Error) -> Self {
        Self::Internal {
            message: "io operation failed".to_string(),
            source: Some(Box::new(err)),
        }
    }
}

impl From<anyhow::Error> for ConvoyError {
    fn from(err: anyhow::Error) -> Self {
        Self::internal(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_creation() {
        let err = ConvoyError::execution("scheduler", "level walk failed");
        assert!(matches!(err, ConvoyError::Execution { .. }));
        assert_eq!(err.category(), "execution");
    }

    #[test]
    fn test_error_context() {
        let err = ConvoyError::execution("scheduler", "message")
            .with_context("level", "2")
            .with_context("node", "db/install");

        if let ConvoyError::Execution { context, .. } = err {
            assert_eq!(context.get("level"), Some(&"2".to_string()));
            assert_eq!(context.get("node"), Some(&"db/install".to_string()));
        } else {
            panic!("Expected execution error");
        }
    }

    #[test]
    fn test_error_recoverability() {
        assert!(ConvoyError::timeout("peer launch", 1000).is_recoverable());
        assert!(!ConvoyError::validation("bad template").is_recoverable());
        assert!(!ConvoyError::configuration("missing field").is_recoverable());
    }
}
