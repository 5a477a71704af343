//! Error types for corral-core.

use corral_hv::HvError;
use thiserror::Error;

/// Result type alias for corral-core operations.
pub type Result<T> = std::result::Result<T, SandboxError>;

/// Errors that can occur during sandbox operations.
#[derive(Debug, Error)]
pub enum SandboxError {
    /// Hypervisor unreachable or connection URI malformed
    #[error("connection failed: {0}")]
    Connection(String),

    /// Operation not allowed in the current state
    #[error("invalid state: expected {expected}, got {actual}")]
    InvalidState {
        /// State(s) the operation requires
        expected: String,
        /// State the context was in
        actual: String,
    },

    /// Backend could not create or find the domain
    #[error("failed to start sandbox: {0}")]
    Start(String),

    /// A console channel is already attached
    #[error("console is already attached")]
    AlreadyAttached,

    /// Hypervisor connection is not open
    #[error("not connected to a hypervisor")]
    NotConnected,

    /// Configuration rejected during validation
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    /// Console stream failure
    #[error("console error: {0}")]
    Console(String),

    /// Any other hypervisor error
    #[error("hypervisor error: {0}")]
    Hypervisor(#[source] HvError),

    /// JSON serialization/deserialization error
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl SandboxError {
    pub(crate) fn invalid_state(expected: &str, actual: impl std::fmt::Display) -> Self {
        Self::InvalidState {
            expected: expected.to_string(),
            actual: actual.to_string(),
        }
    }
}

impl From<HvError> for SandboxError {
    fn from(err: HvError) -> Self {
        match err {
            HvError::NotConnected => Self::NotConnected,
            HvError::Connection(_) | HvError::InvalidUri { .. } => Self::Connection(err.to_string()),
            other => Self::Hypervisor(other),
        }
    }
}
