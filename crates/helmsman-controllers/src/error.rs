use crate::cloud::CloudError;
use helmsman_core::HelmsmanError;
use helmsman_runtime::{Classify, ErrorClass, RuntimeError};
use miette::Diagnostic;
use thiserror::Error;

/// Error type for the controllers
#[derive(Error, Debug, Diagnostic)]
pub enum ControllerError {
    /// Storage or API error
    #[error(transparent)]
    #[diagnostic(transparent)]
    Api(#[from] HelmsmanError),

    /// Cloud provider error
    #[error(transparent)]
    #[diagnostic(transparent)]
    Cloud(#[from] CloudError),

    /// Runtime substrate error
    #[error(transparent)]
    #[diagnostic(transparent)]
    Runtime(#[from] RuntimeError),

    /// The object's spec cannot be acted on until the user fixes it
    #[error("Invalid spec for {object}: {reason}")]
    #[diagnostic(
        code(helmsman::controllers::invalid_spec),
        help("Fix the object; it will not be retried until it changes")
    )]
    InvalidSpec {
        #[allow(unused)]
        object: String,
        #[allow(unused)]
        reason: String,
    },

    /// A finished object lacks the timestamp needed to schedule cleanup
    #[error("Cannot determine when {object} finished")]
    #[diagnostic(
        code(helmsman::controllers::missing_finish_time),
        help("The object reports a finished state but carries no finish timestamp")
    )]
    MissingFinishTime {
        #[allow(unused)]
        object: String,
    },

    /// Invalid controller manager configuration
    #[error("Invalid configuration: {message}")]
    #[diagnostic(code(helmsman::controllers::invalid_config), help("{suggestion}"))]
    InvalidConfig {
        #[allow(unused)]
        message: String,
        #[allow(unused)]
        suggestion: String,
    },
}

/// Result type alias for controller operations
pub type Result<T> = std::result::Result<T, ControllerError>;

impl ControllerError {
    pub fn invalid_spec(object: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::InvalidSpec {
            object: object.into(),
            reason: reason.into(),
        }
    }

    pub fn missing_finish_time(object: impl Into<String>) -> Self {
        Self::MissingFinishTime {
            object: object.into(),
        }
    }

    pub fn invalid_config(message: impl Into<String>, suggestion: impl Into<String>) -> Self {
        Self::InvalidConfig {
            message: message.into(),
            suggestion: suggestion.into(),
        }
    }
}

impl Classify for ControllerError {
    fn classify(&self) -> ErrorClass {
        match self {
            ControllerError::Api(e) => e.classify(),
            ControllerError::Cloud(_) | ControllerError::Runtime(_) => ErrorClass::Transient,
            ControllerError::InvalidSpec { .. }
            | ControllerError::MissingFinishTime { .. }
            | ControllerError::InvalidConfig { .. } => ErrorClass::Permanent,
        }
    }
}
