//! Shared logging initialization for device plugin manager binaries.
//!
//! Output goes to stderr. `DPM_LOG` takes `EnvFilter` directives, e.g.
//! `info` or `warn,device_plugin_manager::manager=debug`; `--verbose`
//! overrides it with `debug`.

use std::sync::OnceLock;

use tracing_subscriber::EnvFilter;

/// Environment variable holding the filter directives.
pub const LOG_ENV: &str = "DPM_LOG";

const DEFAULT_FILTER: &str = "info";
const VERBOSE_FILTER: &str = "debug";

static INIT: OnceLock<()> = OnceLock::new();

fn filter_directives(env_value: Option<String>, verbose: bool) -> String {
    if verbose {
        return VERBOSE_FILTER.to_string();
    }
    env_value
        .map(|value| value.trim().to_string())
        .filter(|value| !value.is_empty())
        .unwrap_or_else(|| DEFAULT_FILTER.to_string())
}

/// Install the process-wide subscriber.
///
/// Safe to call multiple times; only the first call installs anything. An
/// unparsable `DPM_LOG` falls back to `info` and is reported once logging
/// is up.
pub fn init(verbose: bool) {
    INIT.get_or_init(|| {
        let directives = filter_directives(std::env::var(LOG_ENV).ok(), verbose);
        let (filter, rejected) = match EnvFilter::try_new(&directives) {
            Ok(filter) => (filter, None),
            Err(e) => (EnvFilter::new(DEFAULT_FILTER), Some(e)),
        };
        let _ = tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_target(false)
            .with_writer(std::io::stderr)
            .try_init();
        if let Some(e) = rejected {
            tracing::warn!("Ignoring invalid {LOG_ENV} value {directives:?}: {e}");
        }
    });
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_filter_directives() {
        assert_eq!(filter_directives(None, false), "info");
        assert_eq!(filter_directives(Some("  ".into()), false), "info");
        assert_eq!(
            filter_directives(Some(" warn,device_plugin_manager=debug ".into()), false),
            "warn,device_plugin_manager=debug"
        );
        assert_eq!(filter_directives(Some("error".into()), true), "debug");
    }

    #[test]
    fn test_directives_parse_as_env_filter() {
        assert!(EnvFilter::try_new(filter_directives(None, false)).is_ok());
        assert!(EnvFilter::try_new(filter_directives(None, true)).is_ok());
        assert!(EnvFilter::try_new("warn,device_plugin_manager::manager=debug").is_ok());
        assert!(EnvFilter::try_new("device_plugin_manager=loud").is_err());
    }
}
