//! Mirror Configuration
//!
//! Configuration can be loaded from:
//! - Default values
//! - Config file (~/.config/opsmirror/config.toml)
//! - Environment variables (`OPSMIRROR_DATA_DIR`, the API token variable)

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::ConfigError;
use crate::sync::EntityKind;

/// Environment variable overriding `storage.data_dir`
pub const DATA_DIR_ENV: &str = "OPSMIRROR_DATA_DIR";

/// Top-level configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Remote document API
    pub api: ApiConfig,

    /// Source database id per mirrored entity kind, keyed by kind name
    pub sources: BTreeMap<String, String>,

    /// Local storage layout
    pub storage: StorageConfig,

    /// Named environment lifecycle
    pub environments: EnvironmentConfig,

    /// Scheduled sync
    pub sync: ScheduleConfig,

    /// HTTP surface
    pub server: ServerConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ApiConfig {
    /// API base URL
    pub base_url: String,
    /// Value of the API version header
    pub api_version: String,
    /// Name of the environment variable holding the bearer token
    pub token_env: String,
    /// Records per page
    pub page_size: u32,
    /// Delay between successive page requests
    pub page_delay_ms: u64,
    /// Request timeout in seconds
    pub timeout_secs: u64,
    /// Per-page retries on transient failures (0 = none)
    pub max_retries: u32,
    /// Linear retry backoff step
    pub retry_backoff_ms: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    /// Root directory for all store files
    pub data_dir: PathBuf,
    /// Production store file name, relative to `data_dir`
    pub production_db: String,
    /// Environment directory, relative to `data_dir`
    pub environments_dir: String,
    /// SQLite busy timeout
    pub busy_timeout_ms: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EnvironmentConfig {
    /// TTL applied when a create request omits one
    pub default_ttl_secs: i64,
    /// Upper bound on requested TTLs
    pub max_ttl_secs: i64,
    /// TTL watcher period
    pub sweep_interval_secs: u64,
    /// How long finished sync progress entries stay visible
    pub progress_retention_secs: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ScheduleConfig {
    /// Run sync passes periodically while serving
    pub enabled: bool,
    /// Period between sync-all runs
    pub interval_secs: u64,
    /// Whether to sync once on startup
    pub sync_on_start: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// Host to bind to
    pub host: String,
    /// Port to listen on
    pub port: u16,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            api: ApiConfig::default(),
            sources: BTreeMap::new(),
            storage: StorageConfig::default(),
            environments: EnvironmentConfig::default(),
            sync: ScheduleConfig::default(),
            server: ServerConfig::default(),
        }
    }
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            base_url: "https://api.notion.com/v1".to_string(),
            api_version: "2022-06-28".to_string(),
            token_env: "NOTION_TOKEN".to_string(),
            page_size: 100,
            page_delay_ms: 350,
            timeout_secs: 30,
            max_retries: 3,
            retry_backoff_ms: 1000,
        }
    }
}

impl Default for StorageConfig {
    fn default() -> Self {
        let home = dirs::home_dir().unwrap_or_else(|| PathBuf::from("."));
        let data_dir = dirs::data_dir().unwrap_or_else(|| home.join(".local/share"));

        Self {
            data_dir: data_dir.join("opsmirror"),
            production_db: "mirror.db".to_string(),
            environments_dir: "environments".to_string(),
            busy_timeout_ms: 5000,
        }
    }
}

impl Default for EnvironmentConfig {
    fn default() -> Self {
        Self {
            default_ttl_secs: 3600,
            max_ttl_secs: 7 * 24 * 3600,
            sweep_interval_secs: 30,
            progress_retention_secs: 300,
        }
    }
}

impl Default for ScheduleConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            interval_secs: 900,
            sync_on_start: true,
        }
    }
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 8430,
        }
    }
}

impl Config {
    /// Default config file location
    pub fn default_path() -> PathBuf {
        dirs::config_dir()
            .map(|d| d.join("opsmirror/config.toml"))
            .unwrap_or_else(|| PathBuf::from("opsmirror.toml"))
    }

    /// Load configuration from `path` (or the default location), falling back
    /// to defaults when the file does not exist.
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        let config_path = path
            .map(Path::to_path_buf)
            .unwrap_or_else(Self::default_path);

        let mut config = if config_path.exists() {
            let content =
                std::fs::read_to_string(&config_path).map_err(|source| ConfigError::Io {
                    path: config_path.clone(),
                    source,
                })?;
            toml::from_str(&content)?
        } else {
            Self::default()
        };

        if let Ok(dir) = std::env::var(DATA_DIR_ENV) {
            config.storage.data_dir = PathBuf::from(dir);
        }

        config.validate()?;
        Ok(config)
    }

    /// Save configuration to file
    pub fn save(&self, path: &Path) -> Result<(), ConfigError> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|source| ConfigError::Io {
                path: parent.to_path_buf(),
                source,
            })?;
        }

        let content = toml::to_string_pretty(self)?;
        std::fs::write(path, content).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.api.page_size == 0 || self.api.page_size > 100 {
            return Err(ConfigError::Invalid(format!(
                "api.page_size must be within 1..=100, got {}",
                self.api.page_size
            )));
        }
        if self.environments.default_ttl_secs <= 0
            || self.environments.default_ttl_secs > self.environments.max_ttl_secs
        {
            return Err(ConfigError::Invalid(
                "environments.default_ttl_secs must be positive and <= max_ttl_secs".to_string(),
            ));
        }
        for key in self.sources.keys() {
            if key.parse::<EntityKind>().is_err() {
                return Err(ConfigError::Invalid(format!("unknown source kind: {key}")));
            }
        }
        if self.sync.interval_secs == 0 {
            return Err(ConfigError::Invalid(
                "sync.interval_secs must be positive".to_string(),
            ));
        }
        if self.environments.sweep_interval_secs == 0 {
            return Err(ConfigError::Invalid(
                "environments.sweep_interval_secs must be positive".to_string(),
            ));
        }
        Ok(())
    }

    /// Read the API token. A missing token is fatal: there is no degraded mode.
    pub fn api_token(&self) -> Result<String, ConfigError> {
        match std::env::var(&self.api.token_env) {
            Ok(token) if !token.trim().is_empty() => Ok(token),
            _ => Err(ConfigError::MissingCredentials(self.api.token_env.clone())),
        }
    }

    /// Configured (kind, source id) pairs
    pub fn source_ids(&self) -> Vec<(EntityKind, String)> {
        self.sources
            .iter()
            .filter_map(|(key, id)| key.parse().ok().map(|kind| (kind, id.clone())))
            .collect()
    }

    pub fn production_db_path(&self) -> PathBuf {
        self.storage.data_dir.join(&self.storage.production_db)
    }

    pub fn environments_path(&self) -> PathBuf {
        self.storage.data_dir.join(&self.storage.environments_dir)
    }

    pub fn busy_timeout(&self) -> Duration {
        Duration::from_millis(self.storage.busy_timeout_ms)
    }

    pub fn sweep_interval(&self) -> Duration {
        Duration::from_secs(self.environments.sweep_interval_secs)
    }

    pub fn sync_interval(&self) -> Duration {
        Duration::from_secs(self.sync.interval_secs)
    }
}

impl ApiConfig {
    pub fn page_delay(&self) -> Duration {
        Duration::from_millis(self.page_delay_ms)
    }

    pub fn retry_backoff(&self) -> Duration {
        Duration::from_millis(self.retry_backoff_ms)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = Config::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.api.page_size, 100);
        assert_eq!(config.environments.sweep_interval_secs, 30);
        assert!(config.sources.is_empty());
    }

    #[test]
    fn test_parse_sources_table() {
        let config: Config = toml::from_str(
            r#"
            [api]
            page_delay_ms = 10

            [sources]
            entities = "db-entities"
            transactions = "db-transactions"
            "#,
        )
        .unwrap();
        assert_eq!(config.api.page_delay_ms, 10);
        assert_eq!(config.api.page_size, 100);
        assert!(config.validate().is_ok());
        assert!(config
            .source_ids()
            .contains(&(EntityKind::Transactions, "db-transactions".to_string())));
    }

    #[test]
    fn test_rejects_unknown_source_kind() {
        let mut config = Config::default();
        config.sources.insert("invoices".into(), "db-x".into());
        assert!(matches!(config.validate(), Err(ConfigError::Invalid(_))));
    }

    #[test]
    fn test_missing_token_is_fatal() {
        let mut config = Config::default();
        config.api.token_env = "OPSMIRROR_TEST_TOKEN_THAT_IS_NEVER_SET".to_string();
        assert!(matches!(
            config.api_token(),
            Err(ConfigError::MissingCredentials(_))
        ));
    }

    #[test]
    fn test_save_and_load_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");
        let mut config = Config::default();
        config.server.port = 9999;
        config.save(&path).unwrap();

        let loaded = Config::load(Some(&path)).unwrap();
        assert_eq!(loaded.server.port, 9999);
    }

    #[test]
    fn test_rejects_oversized_page() {
        let mut config = Config::default();
        config.api.page_size = 500;
        assert!(matches!(config.validate(), Err(ConfigError::Invalid(_))));
    }

    #[test]
    fn test_rejects_zero_sync_interval() {
        let config: Config = toml::from_str("[sync]\ninterval_secs = 0\n").unwrap();
        assert!(matches!(config.validate(), Err(ConfigError::Invalid(_))));
    }
}
