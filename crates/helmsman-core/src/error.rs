// Allow unused assignments for diagnostic fields - they're used by the macros
#![allow(unused_assignments)]

use miette::Diagnostic;
use thiserror::Error;

/// Error taxonomy shared by the storage backend, the runtime and the controllers
#[derive(Error, Debug, Diagnostic)]
pub enum HelmsmanError {
    /// Resource not found
    #[error("Resource not found: {resource_key}")]
    #[diagnostic(
        code(helmsman::not_found),
        help("Verify the resource name, namespace, and kind are correct")
    )]
    NotFound {
        #[allow(unused)]
        resource_key: String,
    },

    /// Resource already exists
    #[error("Resource already exists: {resource_key}")]
    #[diagnostic(
        code(helmsman::already_exists),
        help("Update the existing resource instead, or delete it first")
    )]
    AlreadyExists {
        #[allow(unused)]
        resource_key: String,
    },

    /// Optimistic concurrency or precondition failure
    #[error("Conflict on {resource_key}: {message}")]
    #[diagnostic(
        code(helmsman::conflict),
        help("The resource was modified concurrently. Re-read it and retry with the latest resourceVersion")
    )]
    Conflict {
        #[allow(unused)]
        resource_key: String,
        #[allow(unused)]
        message: String,
    },

    /// Invalid resource
    #[error("Invalid resource: {reason}")]
    #[diagnostic(code(helmsman::invalid), help("{suggestion}"))]
    Invalid {
        #[allow(unused)]
        reason: String,
        #[allow(unused)]
        suggestion: String,
    },

    /// Operation not permitted
    #[error("Forbidden: {message}")]
    #[diagnostic(code(helmsman::forbidden))]
    Forbidden {
        #[allow(unused)]
        message: String,
    },

    /// A call did not complete within its deadline
    #[error("Timed out after {timeout_secs}s waiting for {operation}")]
    #[diagnostic(
        code(helmsman::server_timeout),
        help("The backend is slow or overloaded. The operation will be retried")
    )]
    ServerTimeout {
        #[allow(unused)]
        operation: String,
        #[allow(unused)]
        timeout_secs: u64,
    },

    /// Backend temporarily unavailable
    #[error("Service unavailable: {message}")]
    #[diagnostic(code(helmsman::service_unavailable))]
    ServiceUnavailable {
        #[allow(unused)]
        message: String,
    },

    /// Watch requested from a revision that is no longer retained
    #[error("Resource version {resource_version} is too old")]
    #[diagnostic(
        code(helmsman::expired),
        help("Relist the collection and start a new watch from the returned resourceVersion")
    )]
    Expired {
        #[allow(unused)]
        resource_version: String,
    },

    /// Storage error
    #[error("Storage error: {message}")]
    #[diagnostic(
        code(helmsman::storage_error),
        help("Check storage backend logs and ensure the data directory is accessible")
    )]
    StorageError {
        #[allow(unused)]
        message: String,
        #[source]
        #[allow(unused)]
        source: Option<Box<dyn std::error::Error + Send + Sync>>,
    },

    /// Serialization error
    #[error("Serialization error: {message}")]
    #[diagnostic(
        code(helmsman::serialization_error),
        help("Ensure the resource format is valid JSON or YAML")
    )]
    SerializationError {
        #[allow(unused)]
        message: String,
        #[source]
        #[allow(unused)]
        source: Option<Box<dyn std::error::Error + Send + Sync>>,
    },

    /// Internal error
    #[error("Internal error: {message}")]
    #[diagnostic(
        code(helmsman::internal_error),
        help("This is likely a bug. Please report it with the full error details")
    )]
    InternalError {
        #[allow(unused)]
        message: String,
    },
}

/// Result type alias for Helmsman operations
pub type Result<T> = std::result::Result<T, HelmsmanError>;

impl HelmsmanError {
    pub fn not_found(resource_key: impl Into<String>) -> Self {
        Self::NotFound {
            resource_key: resource_key.into(),
        }
    }

    pub fn already_exists(resource_key: impl Into<String>) -> Self {
        Self::AlreadyExists {
            resource_key: resource_key.into(),
        }
    }

    pub fn conflict(resource_key: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Conflict {
            resource_key: resource_key.into(),
            message: message.into(),
        }
    }

    pub fn invalid(reason: impl Into<String>, suggestion: impl Into<String>) -> Self {
        Self::Invalid {
            reason: reason.into(),
            suggestion: suggestion.into(),
        }
    }

    pub fn forbidden(message: impl Into<String>) -> Self {
        Self::Forbidden {
            message: message.into(),
        }
    }

    pub fn server_timeout(operation: impl Into<String>, timeout: std::time::Duration) -> Self {
        Self::ServerTimeout {
            operation: operation.into(),
            timeout_secs: timeout.as_secs(),
        }
    }

    pub fn service_unavailable(message: impl Into<String>) -> Self {
        Self::ServiceUnavailable {
            message: message.into(),
        }
    }

    pub fn expired(resource_version: impl Into<String>) -> Self {
        Self::Expired {
            resource_version: resource_version.into(),
        }
    }

    pub fn storage_error(
        message: impl Into<String>,
        source: Option<Box<dyn std::error::Error + Send + Sync>>,
    ) -> Self {
        Self::StorageError {
            message: message.into(),
            source,
        }
    }

    pub fn serialization_error(
        message: impl Into<String>,
        source: Option<Box<dyn std::error::Error + Send + Sync>>,
    ) -> Self {
        Self::SerializationError {
            message: message.into(),
            source,
        }
    }

    pub fn internal_error(message: impl Into<String>) -> Self {
        Self::InternalError {
            message: message.into(),
        }
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound { .. })
    }

    pub fn is_already_exists(&self) -> bool {
        matches!(self, Self::AlreadyExists { .. })
    }

    pub fn is_conflict(&self) -> bool {
        matches!(self, Self::Conflict { .. })
    }

    pub fn is_expired(&self) -> bool {
        matches!(self, Self::Expired { .. })
    }

    /// Whether retrying the same request later may succeed
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            Self::ServerTimeout { .. }
                | Self::ServiceUnavailable { .. }
                | Self::StorageError { .. }
                | Self::Expired { .. }
                | Self::Conflict { .. }
        )
    }
}

impl From<serde_json::Error> for HelmsmanError {
    fn from(err: serde_json::Error) -> Self {
        HelmsmanError::serialization_error(format!("JSON error: {}", err), Some(Box::new(err)))
    }
}
