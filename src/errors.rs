use thiserror::Error;

pub type Result<T> = std::result::Result<T, SandboxError>;

/// Engine-level errors.
///
/// These never describe the outcome of a submitted execution; those are
/// reported through [`crate::ExecutionResult`] with a
/// [`crate::FailureReason`].
#[derive(Error, Debug)]
pub enum SandboxError {
    #[error("Python not installed or not found in PATH")]
    PythonNotFound,

    #[error("Invalid policy '{name}': {reason}")]
    InvalidPolicy { name: String, reason: String },

    #[error("Unknown policy: {0}")]
    UnknownPolicy(String),

    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("Failed to launch execution host: {0}")]
    LaunchFailed(String),

    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    JsonError(#[from] serde_json::Error),

    #[error("Internal error: {0}")]
    InternalError(String),
}
