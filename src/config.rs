use config::{Config, ConfigError, Environment, File};
use serde::Deserialize;
use std::collections::HashSet;
use std::path::PathBuf;
use std::time::Duration;

/// HTTP listener configuration
#[derive(Debug, Deserialize, Clone)]
pub struct WebConfig {
    #[serde(default = "default_web_host")]
    pub host: String,
    #[serde(default = "default_web_port")]
    pub port: u16,
    /// Origins allowed to call the API. Empty means any origin, the UI is
    /// usually served from another port.
    #[serde(default)]
    pub allowed_origins: Vec<String>,
    #[serde(default = "default_max_body_bytes")]
    pub max_body_bytes: usize,
}

fn default_web_host() -> String {
    "0.0.0.0".to_string()
}

fn default_web_port() -> u16 {
    4200
}

fn default_max_body_bytes() -> usize {
    1024 * 1024
}

impl Default for WebConfig {
    fn default() -> Self {
        Self {
            host: default_web_host(),
            port: default_web_port(),
            allowed_origins: Vec::new(),
            max_body_bytes: default_max_body_bytes(),
        }
    }
}

/// Master key location
#[derive(Debug, Deserialize, Clone)]
pub struct VaultConfig {
    /// Base64 encoded 32 byte key. Takes precedence over `key_file`.
    #[serde(default)]
    pub master_key: Option<String>,
    #[serde(default = "default_key_file")]
    pub key_file: PathBuf,
    #[serde(default = "default_true")]
    pub create_key_if_missing: bool,
}

fn default_key_file() -> PathBuf {
    PathBuf::from("encryption.key")
}

fn default_true() -> bool {
    true
}

impl Default for VaultConfig {
    fn default() -> Self {
        Self {
            master_key: None,
            key_file: default_key_file(),
            create_key_if_missing: true,
        }
    }
}

/// Client store configuration
#[derive(Debug, Deserialize, Clone)]
pub struct DatabaseConfig {
    #[serde(default = "default_database_url")]
    pub url: String,
    #[serde(default = "default_max_connections")]
    pub max_connections: u32,
}

fn default_database_url() -> String {
    "sqlite::memory:".to_string()
}

fn default_max_connections() -> u32 {
    5
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            url: default_database_url(),
            max_connections: default_max_connections(),
        }
    }
}

/// Polling scheduler settings
#[derive(Debug, Deserialize, Clone)]
pub struct SchedulerConfig {
    #[serde(default = "default_interval_secs")]
    pub default_interval_secs: u64,
    #[serde(default = "default_fetch_timeout_secs")]
    pub fetch_timeout_secs: u64,
    #[serde(default = "default_max_backoff_secs")]
    pub max_backoff_secs: u64,
    /// Where git sources are checked out
    #[serde(default = "default_checkout_location")]
    pub checkout_location: PathBuf,
}

fn default_interval_secs() -> u64 {
    60
}

fn default_fetch_timeout_secs() -> u64 {
    30
}

fn default_max_backoff_secs() -> u64 {
    900
}

fn default_checkout_location() -> PathBuf {
    std::env::temp_dir().join("configserver")
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            default_interval_secs: default_interval_secs(),
            fetch_timeout_secs: default_fetch_timeout_secs(),
            max_backoff_secs: default_max_backoff_secs(),
            checkout_location: default_checkout_location(),
        }
    }
}

impl SchedulerConfig {
    pub fn fetch_timeout(&self) -> Duration {
        Duration::from_secs(self.fetch_timeout_secs)
    }

    pub fn max_backoff(&self) -> Duration {
        Duration::from_secs(self.max_backoff_secs)
    }
}

/// Client secret lifetime
#[derive(Debug, Deserialize, Clone)]
pub struct SecretsConfig {
    #[serde(default = "default_expiry_days")]
    pub expiry_days: u32,
    /// Reject expired secrets instead of only logging a warning
    #[serde(default)]
    pub enforce_expiry: bool,
    /// Lifetime of access tokens issued by the OAuth2 endpoint
    #[serde(default = "default_access_token_ttl_secs")]
    pub access_token_ttl_secs: u64,
}

fn default_expiry_days() -> u32 {
    365
}

fn default_access_token_ttl_secs() -> u64 {
    24 * 60 * 60
}

impl Default for SecretsConfig {
    fn default() -> Self {
        Self {
            expiry_days: default_expiry_days(),
            enforce_expiry: false,
            access_token_ttl_secs: default_access_token_ttl_secs(),
        }
    }
}

/// Served content cache
#[derive(Debug, Deserialize, Clone)]
pub struct CacheConfig {
    #[serde(default = "default_cache_ttl_secs")]
    pub ttl_secs: u64,
    #[serde(default = "default_cache_max_entries")]
    pub max_entries: usize,
}

fn default_cache_ttl_secs() -> u64 {
    30
}

fn default_cache_max_entries() -> usize {
    1024
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            ttl_secs: default_cache_ttl_secs(),
            max_entries: default_cache_max_entries(),
        }
    }
}

/// How a repository is fetched
#[derive(Debug, Deserialize, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum SourceKind {
    Git,
    Http,
    Directory,
}

/// A single configured repository
#[derive(Debug, Deserialize, Clone)]
pub struct RepositoryConfig {
    pub name: String,
    pub url: String,
    #[serde(default)]
    pub kind: Option<SourceKind>,
    #[serde(default)]
    pub branch: Option<String>,
    #[serde(default)]
    pub refresh_interval_secs: Option<u64>,
}

impl RepositoryConfig {
    /// Explicit kind, or a guess from the locator.
    pub fn source_kind(&self) -> SourceKind {
        if let Some(kind) = self.kind {
            return kind;
        }
        let url = self.url.trim();
        if url.ends_with(".git") || url.starts_with("git@") || url.starts_with("ssh://") {
            SourceKind::Git
        } else if url.starts_with("http://") || url.starts_with("https://") {
            SourceKind::Http
        } else {
            SourceKind::Directory
        }
    }

    pub fn interval(&self, scheduler: &SchedulerConfig) -> Duration {
        Duration::from_secs(
            self.refresh_interval_secs
                .unwrap_or(scheduler.default_interval_secs),
        )
    }
}

/// Root application configuration
#[derive(Debug, Deserialize, Clone)]
pub struct AppConfig {
    /// Deployment kind (dev, int, production...). Anything containing `dev`
    /// switches logs to a human readable format.
    #[serde(default = "default_environment")]
    pub environment: String,
    #[serde(default)]
    pub web: WebConfig,
    #[serde(default)]
    pub vault: VaultConfig,
    #[serde(default)]
    pub database: DatabaseConfig,
    #[serde(default)]
    pub scheduler: SchedulerConfig,
    #[serde(default)]
    pub secrets: SecretsConfig,
    #[serde(default)]
    pub cache: CacheConfig,
    #[serde(default)]
    pub repositories: Vec<RepositoryConfig>,
}

fn default_environment() -> String {
    "production".to_string()
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            environment: default_environment(),
            web: WebConfig::default(),
            vault: VaultConfig::default(),
            database: DatabaseConfig::default(),
            scheduler: SchedulerConfig::default(),
            secrets: SecretsConfig::default(),
            cache: CacheConfig::default(),
            repositories: Vec::new(),
        }
    }
}

impl AppConfig {
    /// Load configuration from files and environment variables
    pub fn load() -> Result<Self, ConfigError> {
        let config = Config::builder()
            // Start with default config file
            .add_source(File::with_name("config/default").required(false))
            // Override with local config if present
            .add_source(File::with_name("config/local").required(false))
            // Override with environment variables (prefix: CONFIGSERVER_)
            // e.g., CONFIGSERVER_WEB__PORT, CONFIGSERVER_VAULT__KEY_FILE
            .add_source(
                Environment::with_prefix("CONFIGSERVER")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?;

        let config: Self = config.try_deserialize()?;
        config.validate()?;
        Ok(config)
    }

    /// Reject configurations the scheduler and registry cannot run with.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let mut seen = HashSet::new();
        for repository in &self.repositories {
            let name = repository.name.trim();
            if name.is_empty() {
                return Err(ConfigError::Message(
                    "repository names must not be empty".to_string(),
                ));
            }
            if !is_single_segment(name) {
                return Err(ConfigError::Message(format!(
                    "repository name '{}' must be a single path segment",
                    name
                )));
            }
            if !seen.insert(name.to_string()) {
                return Err(ConfigError::Message(format!(
                    "repository '{}' is configured more than once",
                    name
                )));
            }
            if repository.interval(&self.scheduler).is_zero() {
                return Err(ConfigError::Message(format!(
                    "repository '{}' has a zero refresh interval",
                    name
                )));
            }
        }
        if self.secrets.access_token_ttl_secs == 0 {
            return Err(ConfigError::Message(
                "secrets.access_token_ttl_secs must be positive".to_string(),
            ));
        }
        if self.scheduler.fetch_timeout_secs == 0 {
            return Err(ConfigError::Message(
                "scheduler.fetch_timeout_secs must be positive".to_string(),
            ));
        }
        Ok(())
    }

    pub fn is_dev(&self) -> bool {
        self.environment.to_lowercase().contains("dev")
    }

    pub fn listen_address(&self) -> String {
        format!("{}:{}", self.web.host, self.web.port)
    }
}

/// Names end up in checkout paths and in `/git/{repository}/...` URLs.
fn is_single_segment(name: &str) -> bool {
    name != "."
        && name != ".."
        && !name.contains(['/', '\\'])
        && !name.chars().any(char::is_control)
}
