//! Configuration management.
//!
//! Sources, later wins: built-in defaults, a TOML file, then `STOWAGE_*`
//! environment variables.
//!
//! ```toml
//! [vector]
//! host = "milvus.internal"
//! dimension = 768
//!
//! [relational]
//! username = "app"
//! password = "secret"
//! pool_max_size = 32
//!
//! [cache]
//! health_check_interval_secs = 30
//!
//! [logging]
//! format = "json"
//! file = "/var/log/stowage/engine_{date}.log"
//! ```

mod store;

pub use store::{StoreKind, StoreSettings};

use secrecy::SecretString;
use serde::Deserialize;
use std::path::Path;
use std::str::FromStr;
use std::time::Duration;

/// Default embedding dimension of the document collection schema.
pub const DEFAULT_VECTOR_DIMENSION: usize = 1024;

/// Main configuration for stowage.
#[derive(Debug, Clone)]
pub struct StowageConfig {
    /// Milvus settings.
    pub vector: StoreSettings,
    /// Dimension of the `vec_content` field in created collections.
    pub vector_dimension: usize,
    /// PostgreSQL settings.
    pub relational: StoreSettings,
    /// Redis settings.
    pub cache: StoreSettings,
    /// Logging settings.
    pub logging: LoggingSettings,
}

/// Raw logging settings; turned into a subscriber configuration by
/// [`crate::observability::LoggingConfig::from_settings`].
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LoggingSettings {
    /// `pretty` or `json`.
    pub format: Option<String>,
    /// Log file path. `{date}` expands to `YYYYMMDD`.
    pub file: Option<String>,
    /// Filter directive used when no filter environment variable is set.
    pub level: Option<String>,
}

/// Configuration file structure (for TOML parsing).
#[derive(Debug, Deserialize, Default)]
pub struct ConfigFile {
    /// Vector store section.
    pub vector: Option<ConfigFileStore>,
    /// Relational store section.
    pub relational: Option<ConfigFileStore>,
    /// Cache section.
    pub cache: Option<ConfigFileStore>,
    /// Logging section.
    pub logging: Option<ConfigFileLogging>,
}

/// Store section in config file.
#[derive(Debug, Deserialize, Default)]
pub struct ConfigFileStore {
    /// Host.
    pub host: Option<String>,
    /// Port.
    pub port: Option<u16>,
    /// User name.
    pub username: Option<String>,
    /// Password.
    pub password: Option<String>,
    /// Database.
    pub database: Option<String>,
    /// Minimum pool size.
    pub pool_min_size: Option<usize>,
    /// Maximum pool size.
    pub pool_max_size: Option<usize>,
    /// Socket timeout in milliseconds.
    pub socket_timeout_ms: Option<u64>,
    /// Connect timeout in milliseconds.
    #[serde(alias = "connection_timeout_ms")]
    pub connect_timeout_ms: Option<u64>,
    /// TCP keep-alive.
    pub keep_alive: Option<bool>,
    /// Health-check interval in seconds.
    pub health_check_interval_secs: Option<u64>,
    /// Read retry attempts.
    pub retry_count: Option<u32>,
    /// Delay between read retries in milliseconds.
    pub retry_delay_ms: Option<u64>,
    /// Acquire timeout in milliseconds.
    pub acquire_timeout_ms: Option<u64>,
    /// Vector dimension (vector section only).
    pub dimension: Option<usize>,
}

/// Logging section in config file.
#[derive(Debug, Deserialize, Default)]
pub struct ConfigFileLogging {
    /// Output format.
    pub format: Option<String>,
    /// Log file path.
    pub file: Option<String>,
    /// Default filter directive.
    pub level: Option<String>,
}

impl Default for StowageConfig {
    fn default() -> Self {
        Self {
            vector: StoreSettings::defaults_for(StoreKind::Vector),
            vector_dimension: DEFAULT_VECTOR_DIMENSION,
            relational: StoreSettings::defaults_for(StoreKind::Relational),
            cache: StoreSettings::defaults_for(StoreKind::Cache),
            logging: LoggingSettings::default(),
        }
    }
}

impl StowageConfig {
    /// Creates a new configuration with default values.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Loads configuration from a file path.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read or parsed.
    pub fn load_from_file(path: &Path) -> crate::Result<Self> {
        let contents =
            std::fs::read_to_string(path).map_err(|e| crate::Error::OperationFailed {
                operation: "read_config_file".to_string(),
                cause: format!("{}: {e}", path.display()),
            })?;

        let file: ConfigFile =
            toml::from_str(&contents).map_err(|e| crate::Error::OperationFailed {
                operation: "parse_config_file".to_string(),
                cause: e.to_string(),
            })?;

        Ok(Self::from_config_file(file))
    }

    /// Loads configuration from the default location.
    ///
    /// Checks the platform config dir (`stowage/config.toml`), then
    /// `~/.config/stowage/config.toml`. Returns defaults if neither exists or
    /// parses.
    #[must_use]
    pub fn load_default() -> Self {
        let Some(base_dirs) = directories::BaseDirs::new() else {
            return Self::default();
        };

        let candidates = [
            base_dirs.config_dir().join("stowage").join("config.toml"),
            base_dirs
                .home_dir()
                .join(".config")
                .join("stowage")
                .join("config.toml"),
        ];

        for path in candidates {
            if !path.exists() {
                continue;
            }
            match Self::load_from_file(&path) {
                Ok(config) => return config,
                Err(e) => {
                    tracing::warn!(path = %path.display(), error = %e, "Ignoring unreadable config file");
                },
            }
        }

        Self::default()
    }

    /// Converts a `ConfigFile` to `StowageConfig`.
    #[must_use]
    pub fn from_config_file(file: ConfigFile) -> Self {
        let mut config = Self::default();

        if let Some(section) = file.vector {
            if let Some(dimension) = section.dimension {
                config.vector_dimension = dimension;
            }
            apply_store_section(&mut config.vector, section);
        }
        if let Some(section) = file.relational {
            apply_store_section(&mut config.relational, section);
        }
        if let Some(section) = file.cache {
            apply_store_section(&mut config.cache, section);
        }
        if let Some(logging) = file.logging {
            config.logging = LoggingSettings {
                format: logging.format,
                file: logging.file,
                level: logging.level,
            };
        }

        config.normalized()
    }

    /// Applies `STOWAGE_*` environment variable overrides.
    #[must_use]
    pub fn with_env_overrides(self) -> Self {
        self.with_env_overrides_from(|key| std::env::var(key).ok())
    }

    /// Applies overrides read through `lookup` instead of the process
    /// environment.
    #[must_use]
    pub fn with_env_overrides_from<F>(mut self, lookup: F) -> Self
    where
        F: Fn(&str) -> Option<String>,
    {
        for kind in StoreKind::ALL {
            apply_store_env(self.store_mut(kind), kind.env_prefix(), &lookup);
        }
        if let Some(dimension) = parse_env(&lookup, "STOWAGE_VECTOR_DIMENSION") {
            self.vector_dimension = dimension;
        }
        if let Some(format) = lookup("STOWAGE_LOG_FORMAT") {
            self.logging.format = Some(format);
        }
        if let Some(file) = lookup("STOWAGE_LOG_FILE") {
            self.logging.file = Some(file);
        }
        self.normalized()
    }

    /// Returns the settings of one store.
    #[must_use]
    pub const fn store(&self, kind: StoreKind) -> &StoreSettings {
        match kind {
            StoreKind::Vector => &self.vector,
            StoreKind::Relational => &self.relational,
            StoreKind::Cache => &self.cache,
        }
    }

    /// Returns the settings of one store, mutably.
    pub const fn store_mut(&mut self, kind: StoreKind) -> &mut StoreSettings {
        match kind {
            StoreKind::Vector => &mut self.vector,
            StoreKind::Relational => &mut self.relational,
            StoreKind::Cache => &mut self.cache,
        }
    }

    /// Clamps every store's pool bounds.
    #[must_use]
    pub fn normalized(mut self) -> Self {
        self.vector = self.vector.normalized();
        self.relational = self.relational.normalized();
        self.cache = self.cache.normalized();
        self
    }
}

fn apply_store_section(settings: &mut StoreSettings, section: ConfigFileStore) {
    if let Some(host) = section.host {
        settings.host = host;
    }
    if let Some(port) = section.port {
        settings.port = port;
    }
    if let Some(username) = section.username {
        settings.username = Some(username);
    }
    if let Some(password) = section.password {
        settings.password = Some(SecretString::from(password));
    }
    if let Some(database) = section.database {
        settings.database = database;
    }
    if let Some(v) = section.pool_min_size {
        settings.pool_min_size = v;
    }
    if let Some(v) = section.pool_max_size {
        settings.pool_max_size = v;
    }
    if let Some(ms) = section.socket_timeout_ms {
        settings.socket_timeout = Duration::from_millis(ms);
    }
    if let Some(ms) = section.connect_timeout_ms {
        settings.connect_timeout = Duration::from_millis(ms);
    }
    if let Some(v) = section.keep_alive {
        settings.keep_alive = v;
    }
    if let Some(secs) = section.health_check_interval_secs {
        settings.health_check_interval = Duration::from_secs(secs);
    }
    if let Some(v) = section.retry_count {
        settings.retry_count = v;
    }
    if let Some(ms) = section.retry_delay_ms {
        settings.retry_delay = Duration::from_millis(ms);
    }
    if let Some(ms) = section.acquire_timeout_ms {
        settings.acquire_timeout = Duration::from_millis(ms);
    }
}

fn apply_store_env<F>(settings: &mut StoreSettings, prefix: &str, lookup: &F)
where
    F: Fn(&str) -> Option<String>,
{
    let key = |suffix: &str| format!("{prefix}_{suffix}");

    if let Some(host) = lookup(&key("HOST")) {
        settings.host = host;
    }
    if let Some(port) = parse_env(lookup, &key("PORT")) {
        settings.port = port;
    }
    if let Some(user) = lookup(&key("USER")) {
        settings.username = Some(user);
    }
    if let Some(password) = lookup(&key("PASSWORD")) {
        settings.password = Some(SecretString::from(password));
    }
    if let Some(database) = lookup(&key("DATABASE")) {
        settings.database = database;
    }
    if let Some(v) = parse_env(lookup, &key("POOL_MIN")) {
        settings.pool_min_size = v;
    }
    if let Some(v) = parse_env(lookup, &key("POOL_MAX")) {
        settings.pool_max_size = v;
    }
    if let Some(ms) = parse_env(lookup, &key("SOCKET_TIMEOUT_MS")) {
        settings.socket_timeout = Duration::from_millis(ms);
    }
    if let Some(ms) = parse_env(lookup, &key("CONNECT_TIMEOUT_MS")) {
        settings.connect_timeout = Duration::from_millis(ms);
    }
    if let Some(v) = lookup(&key("KEEP_ALIVE")) {
        settings.keep_alive = matches!(v.to_lowercase().as_str(), "1" | "true" | "yes" | "on");
    }
    if let Some(secs) = parse_env(lookup, &key("HEALTH_CHECK_INTERVAL_SECS")) {
        settings.health_check_interval = Duration::from_secs(secs);
    }
    if let Some(v) = parse_env(lookup, &key("RETRY_COUNT")) {
        settings.retry_count = v;
    }
    if let Some(ms) = parse_env(lookup, &key("RETRY_DELAY_MS")) {
        settings.retry_delay = Duration::from_millis(ms);
    }
    if let Some(ms) = parse_env(lookup, &key("ACQUIRE_TIMEOUT_MS")) {
        settings.acquire_timeout = Duration::from_millis(ms);
    }
}

fn parse_env<T, F>(lookup: &F, key: &str) -> Option<T>
where
    T: FromStr,
    F: Fn(&str) -> Option<String>,
{
    let raw = lookup(key)?;
    if let Ok(parsed) = raw.trim().parse() {
        Some(parsed)
    } else {
        tracing::warn!(key, value = %raw, "Ignoring unparseable environment override");
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use std::io::Write;

    #[test]
    fn test_defaults() {
        let config = StowageConfig::new();
        assert_eq!(config.vector_dimension, 1024);
        assert_eq!(config.vector.database, "default");
        assert_eq!(config.relational.port, 5432);
        assert_eq!(config.cache.health_check_interval, Duration::from_secs(30));
    }

    #[test]
    fn test_load_from_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(
            file,
            r#"
            [vector]
            host = "milvus.internal"
            dimension = 768

            [relational]
            username = "app"
            password = "s3cret"
            pool_min_size = 50
            pool_max_size = 8
            connection_timeout_ms = 2500

            [cache]
            port = 6380
            unknown_key = "ignored"

            [logging]
            format = "json"
            file = "/tmp/engine_{{date}}.log"
            "#
        )
        .unwrap();

        let config = StowageConfig::load_from_file(file.path()).unwrap();
        assert_eq!(config.vector.host, "milvus.internal");
        assert_eq!(config.vector_dimension, 768);
        assert_eq!(config.relational.username.as_deref(), Some("app"));
        assert_eq!(config.relational.password_str(), Some("s3cret"));
        assert_eq!(config.relational.pool_max_size, 8);
        assert_eq!(config.relational.pool_min_size, 8);
        assert_eq!(config.relational.connect_timeout, Duration::from_millis(2500));
        assert_eq!(config.cache.port, 6380);
        assert_eq!(config.logging.format.as_deref(), Some("json"));
        assert_eq!(config.logging.file.as_deref(), Some("/tmp/engine_{date}.log"));
    }

    #[test]
    fn test_load_from_missing_file_fails() {
        let dir = tempfile::tempdir().unwrap();
        let result = StowageConfig::load_from_file(&dir.path().join("missing.toml"));
        assert!(result.is_err());
    }

    #[test]
    fn test_load_from_invalid_toml_fails() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(file, "[vector\nhost = ").unwrap();
        assert!(StowageConfig::load_from_file(file.path()).is_err());
    }

    #[test]
    fn test_env_overrides() {
        let env: HashMap<&str, &str> = [
            ("STOWAGE_CACHE_HOST", "redis.internal"),
            ("STOWAGE_CACHE_PORT", "6390"),
            ("STOWAGE_CACHE_RETRY_DELAY_MS", "250"),
            ("STOWAGE_RELATIONAL_PASSWORD", "pw"),
            ("STOWAGE_RELATIONAL_POOL_MAX", "0"),
            ("STOWAGE_VECTOR_KEEP_ALIVE", "false"),
            ("STOWAGE_VECTOR_PORT", "not-a-port"),
            ("STOWAGE_VECTOR_DIMENSION", "384"),
            ("STOWAGE_LOG_FORMAT", "json"),
        ]
        .into_iter()
        .collect();

        let config = StowageConfig::default()
            .with_env_overrides_from(|key| env.get(key).map(ToString::to_string));

        assert_eq!(config.cache.host, "redis.internal");
        assert_eq!(config.cache.port, 6390);
        assert_eq!(config.cache.retry_delay, Duration::from_millis(250));
        assert_eq!(config.relational.password_str(), Some("pw"));
        assert_eq!(config.relational.pool_max_size, 1);
        assert!(!config.vector.keep_alive);
        assert_eq!(config.vector.port, 19530);
        assert_eq!(config.vector_dimension, 384);
        assert_eq!(config.logging.format.as_deref(), Some("json"));
    }

    #[test]
    fn test_store_accessors() {
        let mut config = StowageConfig::default();
        config.store_mut(StoreKind::Cache).port = 1;
        assert_eq!(config.store(StoreKind::Cache).port, 1);
        assert_eq!(config.store(StoreKind::Vector).port, 19530);
    }
}
