//! Error types shared by the manager and plugin-side clients.

use std::path::PathBuf;
use thiserror::Error;

/// Wire code for a malformed request envelope.
pub const CODE_INVALID_REQUEST: &str = "INVALID_REQUEST";
/// Wire code for an envelope `version` the server does not speak.
pub const CODE_VERSION_MISMATCH: &str = "VERSION_MISMATCH";
/// Wire code for a command the server does not know.
pub const CODE_UNKNOWN_COMMAND: &str = "UNKNOWN_COMMAND";
/// Wire code for a payload that does not match the command.
pub const CODE_INVALID_PAYLOAD: &str = "INVALID_PAYLOAD";
pub const CODE_INVALID_RESOURCE_NAME: &str = "INVALID_RESOURCE_NAME";
pub const CODE_UNSUPPORTED_VERSION: &str = "UNSUPPORTED_VERSION";
pub const CODE_INVALID_ENDPOINT: &str = "INVALID_ENDPOINT";
pub const CODE_SHUTTING_DOWN: &str = "SHUTTING_DOWN";

/// Why a registration was refused.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RegistrationError {
    #[error("invalid resource name '{name}': {reason}")]
    InvalidResourceName { name: String, reason: String },

    #[error("unsupported device plugin API version '{version}'")]
    UnsupportedVersion { version: String },

    #[error("invalid plugin endpoint '{endpoint}': {reason}")]
    InvalidEndpoint { endpoint: String, reason: String },

    #[error("device plugin manager is shutting down")]
    ShuttingDown,
}

impl RegistrationError {
    /// Machine-readable code carried in the error response.
    pub fn code(&self) -> &'static str {
        match self {
            RegistrationError::InvalidResourceName { .. } => CODE_INVALID_RESOURCE_NAME,
            RegistrationError::UnsupportedVersion { .. } => CODE_UNSUPPORTED_VERSION,
            RegistrationError::InvalidEndpoint { .. } => CODE_INVALID_ENDPOINT,
            RegistrationError::ShuttingDown => CODE_SHUTTING_DOWN,
        }
    }

    /// Rebuild a registration error from a wire code.
    ///
    /// The structured fields are not on the wire, so the server's message is
    /// carried in `reason` (or `version`) instead. Returns `None` for codes
    /// that are not registration refusals.
    pub fn from_code(code: &str, message: &str) -> Option<Self> {
        let message = message.to_string();
        match code {
            CODE_INVALID_RESOURCE_NAME => Some(RegistrationError::InvalidResourceName {
                name: String::new(),
                reason: message,
            }),
            CODE_UNSUPPORTED_VERSION => {
                Some(RegistrationError::UnsupportedVersion { version: message })
            }
            CODE_INVALID_ENDPOINT => Some(RegistrationError::InvalidEndpoint {
                endpoint: String::new(),
                reason: message,
            }),
            CODE_SHUTTING_DOWN => Some(RegistrationError::ShuttingDown),
            _ => None,
        }
    }
}

/// Errors returned by [`crate::client::register`].
#[derive(Debug, Error)]
pub enum ClientError {
    #[error("I/O error talking to {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// The manager answered with something that is not a valid response.
    #[error("protocol error: {0}")]
    Protocol(String),

    #[error("registration rejected: {0}")]
    Rejected(#[from] RegistrationError),
}
