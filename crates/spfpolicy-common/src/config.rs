//! Configuration for spfpolicy
//!
//! Values are layered: built-in defaults, then an optional TOML file, then
//! `SPFPOLICY_*` environment variables. The daemon binary applies its
//! command-line flags on top of the loaded value.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// Default explanation attached to SPF failures
pub const DEFAULT_EXPLANATION: &str =
    "Please see http://www.openspf.org/Why?id=%{S}&ip=%{C}&receiver=%{R}";

/// Main configuration structure
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    /// Policy session configuration
    #[serde(default)]
    pub policy: PolicyConfig,

    /// SPF evaluation engine configuration
    #[serde(default)]
    pub spf: SpfConfig,

    /// Logging configuration
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Policy session configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PolicyConfig {
    /// Transactions served by one process before it exits
    #[serde(default = "default_request_limit")]
    pub request_limit: usize,

    /// Also check each recipient's domain when the sender check does not pass
    #[serde(default)]
    pub rcpt_to_mx: bool,
}

impl Default for PolicyConfig {
    fn default() -> Self {
        Self {
            request_limit: default_request_limit(),
            rcpt_to_mx: false,
        }
    }
}

fn default_request_limit() -> usize {
    100
}

/// SPF evaluation engine configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SpfConfig {
    /// Local policy mechanisms, e.g. `ip4:192.0.2.0/24 a:relay.example.com`
    pub local_policy: Option<String>,

    /// Append the trusted-forwarder include to the local policy
    #[serde(default)]
    pub use_trusted: bool,

    /// Best-guess record used when a domain publishes none
    pub fallback: Option<String>,

    /// Explanation macro string for failures
    #[serde(default = "default_explanation")]
    pub explanation: String,

    /// Maximum number of DNS-querying mechanisms
    pub max_lookup: Option<usize>,

    /// Replace non-printable characters in generated output
    #[serde(default)]
    pub sanitize: bool,

    /// Name of the host doing the checking (defaults to the local hostname)
    pub rec_dom: Option<String>,
}

impl Default for SpfConfig {
    fn default() -> Self {
        Self {
            local_policy: None,
            use_trusted: false,
            fallback: None,
            explanation: default_explanation(),
            max_lookup: None,
            sanitize: false,
            rec_dom: None,
        }
    }
}

fn default_explanation() -> String {
    DEFAULT_EXPLANATION.to_string()
}

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Debug verbosity (0 = quiet, 1 = log decisions, 2 = protocol trace)
    #[serde(default)]
    pub debug: u8,

    /// Log format: "json" or "text"
    #[serde(default = "default_log_format")]
    pub format: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            debug: 0,
            format: default_log_format(),
        }
    }
}

fn default_log_format() -> String {
    "text".to_string()
}

impl LoggingConfig {
    /// Filter directive derived from the debug level
    pub fn filter_directive(&self) -> &'static str {
        match self.debug {
            0 | 1 => "info",
            2 => "debug",
            _ => "trace",
        }
    }
}

impl Config {
    /// Load configuration from an explicit file or the default locations,
    /// then apply environment overrides
    pub fn load(explicit: Option<&Path>) -> crate::Result<Self> {
        let mut builder = config::Config::builder();

        match explicit {
            Some(path) => {
                builder = builder.add_source(config::File::from(path).required(true));
            }
            None => {
                let paths = [
                    PathBuf::from("./spfpolicy.toml"),
                    PathBuf::from("/etc/spfpolicy/config.toml"),
                ];
                if let Some(path) = paths.into_iter().find(|p| p.exists()) {
                    tracing::debug!("Using configuration file {}", path.display());
                    builder = builder.add_source(config::File::from(path).required(false));
                }
            }
        }

        builder
            .add_source(
                config::Environment::with_prefix("SPFPOLICY")
                    .prefix_separator("_")
                    .separator("__"),
            )
            .build()
            .and_then(|c| c.try_deserialize::<Config>())
            .map_err(|e| crate::Error::Config(format!("Failed to load config: {}", e)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_default_config() {
        let config = Config::default();
        assert_eq!(config.policy.request_limit, 100);
        assert!(!config.policy.rcpt_to_mx);
        assert_eq!(config.spf.explanation, DEFAULT_EXPLANATION);
        assert_eq!(config.spf.max_lookup, None);
        assert_eq!(config.logging.debug, 0);
        assert_eq!(config.logging.format, "text");
    }

    #[test]
    fn test_parse_config() {
        let toml = r#"
[policy]
request_limit = 10

[spf]
local_policy = "ip4:192.0.2.0/24"
use_trusted = true
fallback = "v=spf1 a/24 mx/24 ptr ?all"
rec_dom = "mx.example.com"

[logging]
debug = 2
"#;

        let config: Config = toml::from_str(toml).unwrap();
        assert_eq!(config.policy.request_limit, 10);
        assert_eq!(config.spf.local_policy.as_deref(), Some("ip4:192.0.2.0/24"));
        assert!(config.spf.use_trusted);
        assert_eq!(config.spf.rec_dom.as_deref(), Some("mx.example.com"));
        assert_eq!(config.spf.explanation, DEFAULT_EXPLANATION);
        assert_eq!(config.logging.filter_directive(), "debug");
    }

    #[test]
    fn test_load_explicit_file() {
        let path = std::env::temp_dir().join(format!("spfpolicy-{}.toml", std::process::id()));
        std::fs::write(&path, "[policy]\nrequest_limit = 3\n\n[logging]\nformat = \"json\"\n")
            .unwrap();

        let config = Config::load(Some(&path));
        std::fs::remove_file(&path).unwrap();

        let config = config.unwrap();
        assert_eq!(config.policy.request_limit, 3);
        assert_eq!(config.logging.format, "json");
        assert_eq!(config.spf.explanation, DEFAULT_EXPLANATION);
    }

    #[test]
    fn test_load_missing_explicit_file() {
        let err = Config::load(Some(Path::new("/nonexistent/spfpolicy.toml"))).unwrap_err();
        assert_eq!(err.code(), "CONFIG_ERROR");
    }

    #[test]
    fn test_filter_directive() {
        let mut logging = LoggingConfig::default();
        assert_eq!(logging.filter_directive(), "info");
        logging.debug = 5;
        assert_eq!(logging.filter_directive(), "trace");
    }
}
