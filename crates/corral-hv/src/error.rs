//! Error types for corral-hv.

use crate::domain::DomainId;
use thiserror::Error;

/// Result type alias for corral-hv operations.
pub type Result<T> = std::result::Result<T, HvError>;

/// Errors that can occur while talking to a hypervisor backend.
#[derive(Debug, Error)]
pub enum HvError {
    /// Operation attempted before the connection was opened
    #[error("not connected to a hypervisor")]
    NotConnected,

    /// Connection URI could not be parsed
    #[error("invalid connection URI '{uri}': {reason}")]
    InvalidUri {
        /// The URI as given by the caller
        uri: String,
        /// Why it was rejected
        reason: String,
    },

    /// Backend could not be reached or has no driver
    #[error("connection failed: {0}")]
    Connection(String),

    /// Domain is not known to this connection
    #[error("domain not found: {0}")]
    DomainNotFound(DomainId),

    /// Backend rejected domain creation
    #[error("failed to create domain: {0}")]
    Create(String),

    /// Backend failed to destroy a domain
    #[error("failed to destroy domain: {0}")]
    Destroy(String),

    /// Console stream could not be opened
    #[error("console unavailable: {0}")]
    Console(String),

    /// Requested feature is not supported by this driver
    #[error("{driver} driver does not support {what}")]
    Unsupported {
        /// Driver name
        driver: &'static str,
        /// Unsupported feature
        what: String,
    },

    /// Configuration error
    #[error("configuration error: {0}")]
    Config(String),

    /// Firecracker/firepilot error
    #[error("firepilot error: {0}")]
    Firepilot(String),

    /// Guest agent returned an error
    #[error("agent error {code}: {message}")]
    Agent {
        /// Error code from the agent
        code: i32,
        /// Error message from the agent
        message: String,
    },

    /// Timeout waiting for operation
    #[error("operation timed out after {0:?}")]
    Timeout(std::time::Duration),

    /// JSON serialization/deserialization error
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl HvError {
    /// Shorthand for [`HvError::Unsupported`].
    pub fn unsupported(driver: &'static str, what: impl Into<String>) -> Self {
        Self::Unsupported {
            driver,
            what: what.into(),
        }
    }
}
