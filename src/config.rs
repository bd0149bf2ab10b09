//! Configuration management for Tollgate.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::Path;
use std::time::Duration;

use crate::error::{Result, TollgateError};
use crate::ratelimit::{LimiterOptions, Namespace};

/// Main configuration for a Tollgate process.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TollgateConfig {
    /// Counter store configuration
    #[serde(default)]
    pub store: StoreConfig,

    /// Defaults applied to every limiter
    #[serde(default)]
    pub defaults: LimiterDefaults,

    /// Named limiters, each overriding some of the defaults
    #[serde(default)]
    pub limiters: BTreeMap<String, LimiterSettings>,
}

/// Which store backs the limiters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StoreBackend {
    /// Per-process memory
    #[default]
    Memory,
    /// A Redis-compatible server
    Redis,
}

/// Counter store configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoreConfig {
    /// Backend kind
    #[serde(default)]
    pub backend: StoreBackend,

    /// Connection URL, used by the Redis backend
    #[serde(default)]
    pub url: Option<String>,

    /// How often the in-memory store purges expired windows
    #[serde(default = "default_cleanup_interval_ms")]
    pub cleanup_interval_ms: u64,
}

impl StoreConfig {
    pub const DEFAULT_CLEANUP_INTERVAL_MS: u64 = 60_000;

    pub fn cleanup_interval(&self) -> Duration {
        Duration::from_millis(self.cleanup_interval_ms.max(1))
    }
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            backend: StoreBackend::default(),
            url: None,
            cleanup_interval_ms: Self::DEFAULT_CLEANUP_INTERVAL_MS,
        }
    }
}

/// Process-scoped defaults every limiter starts from.
///
/// Values are copied into a limiter when it is built, so changing the
/// defaults later never affects limiters that already exist.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LimiterDefaults {
    /// Trials allowed per window
    #[serde(default = "default_limit")]
    pub limit: i64,

    /// Window length in milliseconds
    #[serde(default = "default_period_ms")]
    pub period_ms: i64,

    /// Wait per excess trial in milliseconds
    #[serde(default = "default_delay_ms")]
    pub delay_ms: i64,

    /// Key prefix; empty means none
    #[serde(default)]
    pub namespace: String,
}

impl LimiterDefaults {
    pub const DEFAULT_LIMIT: i64 = 10;
    pub const DEFAULT_PERIOD_MS: i64 = 60_000;
    pub const DEFAULT_DELAY_MS: i64 = 0;
}

impl Default for LimiterDefaults {
    fn default() -> Self {
        Self {
            limit: default_limit(),
            period_ms: default_period_ms(),
            delay_ms: default_delay_ms(),
            namespace: String::new(),
        }
    }
}

fn default_cleanup_interval_ms() -> u64 {
    StoreConfig::DEFAULT_CLEANUP_INTERVAL_MS
}

fn default_limit() -> i64 {
    LimiterDefaults::DEFAULT_LIMIT
}

fn default_period_ms() -> i64 {
    LimiterDefaults::DEFAULT_PERIOD_MS
}

fn default_delay_ms() -> i64 {
    LimiterDefaults::DEFAULT_DELAY_MS
}

/// Overrides for one named limiter.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct LimiterSettings {
    #[serde(default)]
    pub limit: Option<i64>,
    #[serde(default)]
    pub period_ms: Option<i64>,
    #[serde(default)]
    pub delay_ms: Option<i64>,
    #[serde(default)]
    pub namespace: Option<String>,
}

impl LimiterSettings {
    /// Options carrying only the fields set here. The store is left unset.
    pub fn to_options(&self) -> LimiterOptions {
        LimiterOptions {
            namespace: self.namespace.clone().map(Namespace::from),
            limit: self.limit,
            period_ms: self.period_ms,
            delay_ms: self.delay_ms,
            store: None,
        }
    }
}

impl TollgateConfig {
    /// Environment variable prefix for overrides, e.g. `TOLLGATE_STORE__URL`.
    pub const ENV_PREFIX: &'static str = "TOLLGATE";

    /// Load configuration from a YAML file.
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let contents = std::fs::read_to_string(path)?;
        Self::from_yaml(&contents)
    }

    /// Parse configuration from a YAML string.
    pub fn from_yaml(yaml: &str) -> Result<Self> {
        serde_yaml::from_str(yaml)
            .map_err(|e| TollgateError::Config(format!("Failed to parse configuration: {}", e)))
    }

    /// Load configuration from an optional file, then apply environment overrides.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut builder = config::Config::builder();
        if let Some(path) = path {
            builder = builder.add_source(
                config::File::from(path)
                    .format(config::FileFormat::Yaml)
                    .required(true),
            );
        }
        builder
            .add_source(
                config::Environment::with_prefix(Self::ENV_PREFIX)
                    .prefix_separator("_")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()
            .and_then(|c| c.try_deserialize::<TollgateConfig>())
            .map_err(|e| TollgateError::Config(e.to_string()))
    }

    /// Look up the settings of a named limiter.
    pub fn limiter(&self, name: &str) -> Option<&LimiterSettings> {
        self.limiters.get(name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = TollgateConfig::default();
        assert_eq!(config.store.backend, StoreBackend::Memory);
        assert_eq!(config.store.cleanup_interval(), Duration::from_secs(60));
        assert_eq!(config.defaults.limit, 10);
        assert_eq!(config.defaults.period_ms, 60_000);
        assert_eq!(config.defaults.delay_ms, 0);
        assert!(config.defaults.namespace.is_empty());
        assert!(config.limiters.is_empty());
    }

    #[test]
    fn test_parse_yaml() {
        let yaml = r#"
store:
  backend: redis
  url: redis://127.0.0.1:6379
defaults:
  limit: 100
  namespace: prod
limiters:
  login:
    limit: 5
    period_ms: 500
  search:
    delay_ms: 100
"#;
        let config = TollgateConfig::from_yaml(yaml).unwrap();

        assert_eq!(config.store.backend, StoreBackend::Redis);
        assert_eq!(config.store.url.as_deref(), Some("redis://127.0.0.1:6379"));
        assert_eq!(config.store.cleanup_interval_ms, 60_000);
        assert_eq!(config.defaults.limit, 100);
        assert_eq!(config.defaults.period_ms, 60_000);
        assert_eq!(config.defaults.namespace, "prod");

        let login = config.limiter("login").unwrap();
        assert_eq!(login.limit, Some(5));
        assert_eq!(login.period_ms, Some(500));
        assert_eq!(login.delay_ms, None);
        assert_eq!(config.limiter("search").unwrap().delay_ms, Some(100));
    }

    #[test]
    fn test_parse_yaml_rejects_bad_backend() {
        let err = TollgateConfig::from_yaml("store:\n  backend: etcd\n").unwrap_err();
        assert!(err.is_config());
    }

    #[test]
    fn test_settings_to_options() {
        let settings = LimiterSettings {
            limit: Some(3),
            namespace: Some("edge".to_string()),
            ..Default::default()
        };
        let options = settings.to_options();
        assert_eq!(options.limit, Some(3));
        assert_eq!(options.period_ms, None);
        assert_eq!(options.namespace, Some(Namespace::from("edge")));
        assert!(options.store.is_none());
    }

    #[test]
    fn test_load_without_file_uses_defaults() {
        let config = TollgateConfig::load(None).unwrap();
        assert_eq!(config.defaults, LimiterDefaults::default());
    }
}
