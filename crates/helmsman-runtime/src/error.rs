use miette::Diagnostic;
use thiserror::Error;

/// Error type for the controller runtime substrate
#[derive(Error, Debug, Diagnostic)]
pub enum RuntimeError {
    /// An informer did not complete its initial list in time
    #[error("Timed out after {timeout_secs}s waiting for caches to sync: {pending}")]
    #[diagnostic(
        code(helmsman::runtime::cache_sync_timeout),
        help("The storage backend may be unreachable or very slow. Check its logs and retry")
    )]
    CacheSyncTimeout {
        #[allow(unused)]
        timeout_secs: u64,
        #[allow(unused)]
        pending: String,
    },

    /// The work queue was shut down
    #[error("Work queue '{queue}' is shut down")]
    #[diagnostic(code(helmsman::runtime::queue_shut_down))]
    QueueShutDown {
        #[allow(unused)]
        queue: String,
    },

    /// Invalid configuration
    #[error("Invalid configuration: {message}")]
    #[diagnostic(code(helmsman::runtime::invalid_config), help("{suggestion}"))]
    InvalidConfig {
        #[allow(unused)]
        message: String,
        #[allow(unused)]
        suggestion: String,
    },

    /// Core library error
    #[error(transparent)]
    #[diagnostic(transparent)]
    CoreError(#[from] helmsman_core::HelmsmanError),

    /// Internal error
    #[error("Internal runtime error: {message}")]
    #[diagnostic(
        code(helmsman::runtime::internal_error),
        help("This is likely a bug in helmsman-runtime. Please report it with the full error details")
    )]
    InternalError {
        #[allow(unused)]
        message: String,
    },
}

/// Result type alias for runtime operations
pub type Result<T> = std::result::Result<T, RuntimeError>;

impl RuntimeError {
    pub fn cache_sync_timeout(timeout: std::time::Duration, pending: impl Into<String>) -> Self {
        Self::CacheSyncTimeout {
            timeout_secs: timeout.as_secs(),
            pending: pending.into(),
        }
    }

    pub fn queue_shut_down(queue: impl Into<String>) -> Self {
        Self::QueueShutDown {
            queue: queue.into(),
        }
    }

    pub fn invalid_config(message: impl Into<String>, suggestion: impl Into<String>) -> Self {
        Self::InvalidConfig {
            message: message.into(),
            suggestion: suggestion.into(),
        }
    }

    pub fn internal_error(message: impl Into<String>) -> Self {
        Self::InternalError {
            message: message.into(),
        }
    }
}
