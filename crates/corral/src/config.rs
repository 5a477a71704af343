//! Runtime configuration for the CLI.
//!
//! Configuration is loaded from environment variables with sensible defaults.
//! Command-line flags take precedence.

use corral_hv::ConnectUri;
use std::path::PathBuf;

/// Connection URI used when neither `-c` nor `CORRAL_URI` is given.
pub const DEFAULT_URI: &str = "local:///";

/// Log filter used when `CORRAL_LOG` is unset.
pub const DEFAULT_LOG_FILTER: &str = "warn";

/// Configuration for the `corral` binary.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Config {
    /// Hypervisor connection URI.
    pub uri: String,

    /// `tracing` filter directives.
    pub log_filter: String,

    /// Parent of per-sandbox state directories; the user cache dir if unset.
    pub state_root: Option<PathBuf>,
}

/// Configuration validation error.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("invalid connection URI: {0}")]
    InvalidUri(#[from] corral_hv::HvError),
}

impl Default for Config {
    fn default() -> Self {
        Self {
            uri: DEFAULT_URI.to_string(),
            log_filter: DEFAULT_LOG_FILTER.to_string(),
            state_root: None,
        }
    }
}

impl Config {
    /// Load configuration from environment variables.
    ///
    /// | Variable | Default |
    /// |----------|---------|
    /// | `CORRAL_URI` | `local:///` |
    /// | `CORRAL_LOG` | `warn` |
    /// | `CORRAL_STATE_DIR` | `<user cache dir>/corral` |
    ///
    /// The Firecracker driver reads its own `CORRAL_*` variables.
    pub fn from_env() -> Self {
        Self::from_vars(|key| std::env::var(key).ok())
    }

    fn from_vars(var: impl Fn(&str) -> Option<String>) -> Self {
        let default = Self::default();
        Self {
            uri: var("CORRAL_URI")
                .filter(|v| !v.is_empty())
                .unwrap_or(default.uri),
            log_filter: var("CORRAL_LOG")
                .filter(|v| !v.is_empty())
                .unwrap_or(default.log_filter),
            state_root: var("CORRAL_STATE_DIR")
                .filter(|v| !v.is_empty())
                .map(PathBuf::from),
        }
    }

    /// Check that the URI is well formed.
    pub fn validate(&self) -> Result<(), ConfigError> {
        ConnectUri::parse(&self.uri)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn from(vars: &[(&str, &str)]) -> Config {
        let vars: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        Config::from_vars(|key| vars.get(key).cloned())
    }

    #[test]
    fn test_defaults() {
        let config = from(&[]);
        assert_eq!(config, Config::default());
        assert_eq!(config.uri, "local:///");
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_overrides() {
        let config = from(&[
            ("CORRAL_URI", "firecracker:///"),
            ("CORRAL_LOG", "corral=debug"),
            ("CORRAL_STATE_DIR", "/var/tmp/corral"),
        ]);
        assert_eq!(config.uri, "firecracker:///");
        assert_eq!(config.log_filter, "corral=debug");
        assert_eq!(config.state_root, Some(PathBuf::from("/var/tmp/corral")));
    }

    #[test]
    fn test_empty_values_fall_back() {
        let config = from(&[("CORRAL_URI", ""), ("CORRAL_STATE_DIR", "")]);
        assert_eq!(config.uri, DEFAULT_URI);
        assert!(config.state_root.is_none());
    }

    #[test]
    fn test_validate_rejects_bad_uri() {
        let config = Config {
            uri: "not a uri".into(),
            ..Config::default()
        };
        assert!(matches!(config.validate(), Err(ConfigError::InvalidUri(_))));
    }
}
