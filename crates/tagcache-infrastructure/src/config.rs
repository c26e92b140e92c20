//! Configuration types and loader
//!
//! Handles loading configuration from defaults, a TOML file, and
//! environment variables, merged in that order with Figment. Unknown keys
//! are ignored so configuration files can carry options for backends that
//! are not in use.

use figment::Figment;
use figment::providers::{Env, Format, Serialized, Toml};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tagcache_domain::constants::DEFAULT_LIFETIME_SECS;
use tagcache_domain::entry::PayloadKind;
use tagcache_domain::error::{Error, Result};
use tracing::{info, warn};
use validator::Validate;

/// Environment variable prefix; nested keys use a double underscore
/// (e.g. `TAGCACHE_CACHE__DEFAULT_LIFETIME`)
const CONFIG_ENV_PREFIX: &str = "TAGCACHE_";

/// Default configuration file name, looked up in the working directory
const CONFIG_FILE_NAME: &str = "tagcache.toml";

/// Storage engine selector
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BackendKind {
    /// Process-local maps
    #[default]
    Memory,
    /// One file per entry
    File,
    /// PostgreSQL tables
    Postgres,
    /// Redis server
    Redis,
}

/// Cache backend configuration
///
/// Only the options relevant to the selected backend are consulted;
/// the rest are ignored. Missing required options (a connection string
/// for `postgres`, a server list for `redis`) surface as configuration
/// errors when the backend is constructed.
#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
pub struct CacheConfig {
    /// Which storage engine to construct
    #[serde(default)]
    pub backend: BackendKind,
    /// Cache identity (namespace) the backend is bound to
    #[validate(length(min = 1))]
    pub identity: String,
    /// Default entry lifetime in seconds; `0` means entries never expire
    #[serde(default)]
    pub default_lifetime: u64,
    /// Root directory for the file backend; defaults to a per-user temp
    /// location
    #[serde(default)]
    pub cache_directory: Option<PathBuf>,
    /// Payload kind stored by the file backend (data or code)
    #[serde(default)]
    pub payload_kind: PayloadKind,
    /// PostgreSQL connection string (postgres backend only)
    #[serde(default)]
    pub data_source_name: Option<String>,
    /// Redis `host:port` server list (redis backend only)
    #[serde(default)]
    pub servers: Vec<String>,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            backend: BackendKind::Memory,
            identity: "Standard".to_string(),
            default_lifetime: DEFAULT_LIFETIME_SECS,
            cache_directory: None,
            payload_kind: PayloadKind::Data,
            data_source_name: None,
            servers: Vec::new(),
        }
    }
}

impl CacheConfig {
    /// Directory used by the file backend, falling back to a temp path
    pub fn effective_cache_directory(&self) -> PathBuf {
        self.cache_directory
            .clone()
            .unwrap_or_else(|| std::env::temp_dir().join("tagcache"))
    }
}

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Log level: trace, debug, info, warn, or error
    pub level: String,
    /// Emit JSON-formatted log lines
    pub json_format: bool,
    /// Optional log file; daily rotation, stdout stays enabled
    pub file_output: Option<PathBuf>,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            json_format: false,
            file_output: None,
        }
    }
}

/// Top-level application configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AppConfig {
    /// Cache backend settings
    pub cache: CacheConfig,
    /// Logging settings
    pub logging: LoggingConfig,
}

/// Configuration loader service
#[derive(Clone)]
pub struct ConfigLoader {
    /// Configuration file path
    config_path: Option<PathBuf>,

    /// Environment prefix
    env_prefix: String,
}

impl ConfigLoader {
    /// Create a new configuration loader with default settings
    pub fn new() -> Self {
        Self {
            config_path: None,
            env_prefix: CONFIG_ENV_PREFIX.to_string(),
        }
    }

    /// Set the configuration file path
    pub fn with_config_path<P: AsRef<Path>>(mut self, path: P) -> Self {
        self.config_path = Some(path.as_ref().to_path_buf());
        self
    }

    /// Set the environment variable prefix
    pub fn with_env_prefix<S: Into<String>>(mut self, prefix: S) -> Self {
        self.env_prefix = prefix.into();
        self
    }

    /// Load configuration from all sources
    ///
    /// Sources are merged in this order (later sources override earlier):
    /// 1. Default values from `AppConfig::default()`
    /// 2. TOML configuration file (if it exists)
    /// 3. Environment variables with the prefix
    ///    (e.g. `TAGCACHE_CACHE__BACKEND=file`)
    pub fn load(&self) -> Result<AppConfig> {
        let mut figment = Figment::new().merge(Serialized::defaults(AppConfig::default()));

        let config_path = self
            .config_path
            .clone()
            .or_else(|| Some(PathBuf::from(CONFIG_FILE_NAME)));
        if let Some(config_path) = config_path {
            if config_path.exists() {
                figment = figment.merge(Toml::file(&config_path));
                info!("Configuration loaded from {}", config_path.display());
            } else if self.config_path.is_some() {
                warn!("Configuration file not found: {}", config_path.display());
            }
        }

        figment = figment.merge(Env::prefixed(&self.env_prefix).split("__"));

        figment
            .extract()
            .map_err(|e| Error::configuration_with_source("cannot load configuration", e))
    }
}

impl Default for ConfigLoader {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_select_the_memory_backend() {
        let config = CacheConfig::default();
        assert_eq!(config.backend, BackendKind::Memory);
        assert_eq!(config.default_lifetime, 0);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn empty_identity_fails_validation() {
        let config = CacheConfig {
            identity: String::new(),
            ..CacheConfig::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn backend_kind_round_trips_through_serde() {
        for (kind, text) in [
            (BackendKind::Memory, "\"memory\""),
            (BackendKind::File, "\"file\""),
            (BackendKind::Postgres, "\"postgres\""),
            (BackendKind::Redis, "\"redis\""),
        ] {
            assert_eq!(serde_json::to_string(&kind).unwrap(), text);
            assert_eq!(serde_json::from_str::<BackendKind>(text).unwrap(), kind);
        }
    }
}
