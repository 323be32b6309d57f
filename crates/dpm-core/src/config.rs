//! Manager configuration.
//!
//! The only required setting is the registration socket path; everything
//! else has a default. A TOML file may supply any subset:
//!
//! ```toml
//! socket_path = "/var/lib/kubelet/device-plugins/kubelet.sock"
//! dial_timeout_ms = 10000
//! event_buffer = 64
//! shutdown_timeout_ms = 5000
//! registration_timeout_ms = 5000
//! max_frame_bytes = 1048576
//! ```

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

/// Well-known location of the registration socket.
pub const DEFAULT_SOCKET_PATH: &str = "/var/lib/kubelet/device-plugins/kubelet.sock";

/// Configuration error
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse config file {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: toml::de::Error,
    },
}

/// Settings for a device plugin manager instance.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ManagerConfig {
    /// Path of the registration socket the manager binds.
    #[serde(default)]
    pub socket_path: PathBuf,
    /// How long to wait when dialling a plugin's device socket.
    #[serde(default = "default_dial_timeout_ms")]
    pub dial_timeout_ms: u64,
    /// Capacity of the channel carrying endpoint updates to the manager.
    #[serde(default = "default_event_buffer")]
    pub event_buffer: usize,
    /// Upper bound on waiting for background tasks during stop.
    #[serde(default = "default_shutdown_timeout_ms")]
    pub shutdown_timeout_ms: u64,
    /// How long a registration client may take to send its request line.
    #[serde(default = "default_registration_timeout_ms")]
    pub registration_timeout_ms: u64,
    /// Longest accepted line on either socket, in bytes.
    #[serde(default = "default_max_frame_bytes")]
    pub max_frame_bytes: usize,
}

impl Default for ManagerConfig {
    fn default() -> Self {
        Self::new(DEFAULT_SOCKET_PATH)
    }
}

fn default_dial_timeout_ms() -> u64 {
    10_000
}

fn default_event_buffer() -> usize {
    64
}

fn default_shutdown_timeout_ms() -> u64 {
    5_000
}

fn default_registration_timeout_ms() -> u64 {
    5_000
}

fn default_max_frame_bytes() -> usize {
    1024 * 1024
}

impl ManagerConfig {
    /// Configuration with defaults for everything but the socket path.
    pub fn new(socket_path: impl Into<PathBuf>) -> Self {
        Self {
            socket_path: socket_path.into(),
            dial_timeout_ms: default_dial_timeout_ms(),
            event_buffer: default_event_buffer(),
            shutdown_timeout_ms: default_shutdown_timeout_ms(),
            registration_timeout_ms: default_registration_timeout_ms(),
            max_frame_bytes: default_max_frame_bytes(),
        }
    }

    /// Load configuration from a TOML file.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        toml::from_str(&content).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })
    }

    pub fn dial_timeout(&self) -> Duration {
        Duration::from_millis(self.dial_timeout_ms)
    }

    pub fn shutdown_timeout(&self) -> Duration {
        Duration::from_millis(self.shutdown_timeout_ms)
    }

    pub fn registration_timeout(&self) -> Duration {
        Duration::from_millis(self.registration_timeout_ms)
    }

    /// Directory relative plugin endpoints are resolved against.
    pub fn plugin_dir(&self) -> &Path {
        self.socket_path.parent().unwrap_or_else(|| Path::new("."))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_config_defaults() {
        let config = ManagerConfig::default();
        assert_eq!(config.socket_path, PathBuf::from(DEFAULT_SOCKET_PATH));
        assert_eq!(config.dial_timeout(), Duration::from_secs(10));
        assert_eq!(config.event_buffer, 64);
        assert_eq!(config.shutdown_timeout(), Duration::from_secs(5));
        assert_eq!(config.registration_timeout(), Duration::from_secs(5));
        assert_eq!(config.max_frame_bytes, 1024 * 1024);
        assert_eq!(
            config.plugin_dir(),
            Path::new("/var/lib/kubelet/device-plugins")
        );
    }

    #[test]
    fn test_partial_toml_fills_defaults() {
        let config: ManagerConfig = toml::from_str(
            r#"
socket_path = "/run/dpm/manager.sock"
dial_timeout_ms = 250
"#,
        )
        .unwrap();

        assert_eq!(config.socket_path, PathBuf::from("/run/dpm/manager.sock"));
        assert_eq!(config.dial_timeout(), Duration::from_millis(250));
        assert_eq!(config.event_buffer, 64);
    }

    #[test]
    fn test_missing_socket_path_is_empty() {
        let config: ManagerConfig = toml::from_str("event_buffer = 8").unwrap();
        assert!(config.socket_path.as_os_str().is_empty());
    }

    #[test]
    fn test_load_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("dpm.toml");
        std::fs::write(&path, "socket_path = \"/tmp/x.sock\"\nevent_buffer = 4\n").unwrap();

        let config = ManagerConfig::load(&path).unwrap();
        assert_eq!(config.event_buffer, 4);

        let err = ManagerConfig::load(&dir.path().join("missing.toml")).unwrap_err();
        assert!(matches!(err, ConfigError::Read { .. }));

        std::fs::write(&path, "event_buffer = \"lots\"").unwrap();
        assert!(matches!(
            ManagerConfig::load(&path).unwrap_err(),
            ConfigError::Parse { .. }
        ));
    }
}
