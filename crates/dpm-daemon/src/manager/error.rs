use std::path::PathBuf;

/// Errors surfaced to the process embedding the manager.
///
/// Only construction and start-up failures are reported this way; faults of
/// an individual plugin stay inside its endpoint.
#[derive(Debug, thiserror::Error)]
pub enum ManagerError {
    #[error("invalid manager configuration: {message}")]
    Config { message: String },

    #[error("device plugin manager is already running")]
    AlreadyRunning,

    #[error("failed to bind registration socket {path}: {source}")]
    Bind {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("I/O error on {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

/// Errors establishing a plugin's device stream.
#[derive(Debug, thiserror::Error)]
pub enum EndpointError {
    #[error("failed to dial plugin socket {path}: {source}")]
    Dial {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("timed out dialling plugin socket {path}")]
    DialTimeout { path: PathBuf },

    #[error("failed to open device stream on {path}: {source}")]
    Handshake {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to encode stream request: {0}")]
    Json(#[from] serde_json::Error),
}
