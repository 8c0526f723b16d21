//! Error types for the overlay hub
//!
//! Every fallible operation in the core returns [`Error`]. The variants
//! follow the hub's failure taxonomy so callers can decide how to surface
//! a failure without inspecting messages.

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Result type alias for hub operations
pub type Result<T> = std::result::Result<T, Error>;

/// Core error type for the overlay hub
#[derive(Error, Debug)]
pub enum Error {
    /// Malformed input rejected before any mutation
    #[error("Validation error: {0}")]
    Validation(String),

    /// Address pool has no free slot left
    #[error("Resource exhausted: {0}")]
    ResourceExhausted(String),

    /// VPN management socket or DNS API unreachable, timed out or refused
    #[error("Transport error ({transport}): {message}")]
    Transport {
        /// Transport name (e.g. "openvpn-servers", "zone-api")
        transport: String,
        /// Error message
        message: String,
    },

    /// Packet-filter command failed
    #[error("Packet filter error: {0}")]
    Firewall(String),

    /// Persistence store errors
    #[error("Store error: {0}")]
    Store(String),

    /// Configuration errors
    #[error("Configuration error: {0}")]
    Config(String),

    /// Referenced entity does not exist
    #[error("Not found: {0}")]
    NotFound(String),

    /// I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON serialization/deserialization errors
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Generic error with context
    #[error("{0}")]
    Other(String),
}

/// Coarse classification used by administrative surfaces to pick exit codes
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorClass {
    /// Malformed input or exhausted pool
    Invalid,
    /// Management transport or DNS API failure
    Transport,
    /// Fatal configuration problem
    Config,
    /// Anything else
    Failure,
}

impl Error {
    /// Create a validation error
    pub fn validation(msg: impl Into<String>) -> Self {
        Self::Validation(msg.into())
    }

    /// Create a resource exhausted error
    pub fn exhausted(msg: impl Into<String>) -> Self {
        Self::ResourceExhausted(msg.into())
    }

    /// Create a transport error
    pub fn transport(transport: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Transport {
            transport: transport.into(),
            message: message.into(),
        }
    }

    /// Create a packet filter error
    pub fn firewall(msg: impl Into<String>) -> Self {
        Self::Firewall(msg.into())
    }

    /// Create a store error
    pub fn store(msg: impl Into<String>) -> Self {
        Self::Store(msg.into())
    }

    /// Create a configuration error
    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config(msg.into())
    }

    /// Create a "not found" error
    pub fn not_found(msg: impl Into<String>) -> Self {
        Self::NotFound(msg.into())
    }

    /// Classify this error for exit-code mapping
    pub fn class(&self) -> ErrorClass {
        match self {
            Self::Validation(_) | Self::ResourceExhausted(_) | Self::NotFound(_) => {
                ErrorClass::Invalid
            }
            Self::Transport { .. } => ErrorClass::Transport,
            Self::Config(_) => ErrorClass::Config,
            _ => ErrorClass::Failure,
        }
    }

    /// Whether this error came from an external transport
    pub fn is_transport(&self) -> bool {
        matches!(self, Self::Transport { .. })
    }
}

/// Helper for converting anyhow::Error to our Error type
impl From<anyhow::Error> for Error {
    fn from(err: anyhow::Error) -> Self {
        Self::Other(err.to_string())
    }
}
