//! Control-plane error types.

use thiserror::Error;

/// Result type alias for control-plane calls.
pub type ControlResult<T> = Result<T, ControlError>;

/// Errors returned by control-plane calls.
#[derive(Debug, Clone, Error)]
pub enum ControlError {
    #[error("{0} timed out")]
    Timeout(String),

    #[error("transport error: {0}")]
    Transport(String),

    #[error("control plane returned {status}: {message}")]
    Status { status: u16, message: String },

    #[error("not found: {0}")]
    NotFound(String),

    #[error("malformed response: {0}")]
    Decode(String),

    #[error("rejected: {0}")]
    Rejected(String),

    #[error("client configuration error: {0}")]
    Config(String),
}

impl ControlError {
    /// Whether retrying on a later cycle may succeed.
    pub fn is_transient(&self) -> bool {
        match self {
            ControlError::Timeout(_) | ControlError::Transport(_) => true,
            ControlError::Status { status, .. } => *status >= 500,
            _ => false,
        }
    }
}
