//! Per-store connection settings.

use secrecy::{ExposeSecret, SecretString};
use std::fmt;
use std::time::Duration;

/// The three stores a configuration describes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StoreKind {
    /// Milvus vector store.
    Vector,
    /// PostgreSQL relational store.
    Relational,
    /// Redis cache.
    Cache,
}

impl StoreKind {
    /// Every store, in display order.
    pub const ALL: [Self; 3] = [Self::Vector, Self::Relational, Self::Cache];

    /// Returns the lowercase name used in config sections and the CLI.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Vector => "vector",
            Self::Relational => "relational",
            Self::Cache => "cache",
        }
    }

    /// Parses a store name.
    #[must_use]
    pub fn parse(s: &str) -> Option<Self> {
        match s.to_lowercase().as_str() {
            "vector" | "milvus" => Some(Self::Vector),
            "relational" | "postgres" | "postgresql" | "sql" => Some(Self::Relational),
            "cache" | "redis" => Some(Self::Cache),
            _ => None,
        }
    }

    /// Prefix of the environment variables overriding this store.
    #[must_use]
    pub const fn env_prefix(self) -> &'static str {
        match self {
            Self::Vector => "STOWAGE_VECTOR",
            Self::Relational => "STOWAGE_RELATIONAL",
            Self::Cache => "STOWAGE_CACHE",
        }
    }
}

impl fmt::Display for StoreKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Connection, pool and retry settings for one store.
#[derive(Debug, Clone)]
pub struct StoreSettings {
    /// Server host.
    pub host: String,
    /// Server port.
    pub port: u16,
    /// User name, if the backend requires one.
    pub username: Option<String>,
    /// Password. Never printed.
    pub password: Option<SecretString>,
    /// Database name (Milvus database, PostgreSQL database, Redis db index).
    pub database: String,
    /// Connections created when the pool is built.
    pub pool_min_size: usize,
    /// Hard cap on pooled connections.
    pub pool_max_size: usize,
    /// Per-request read/write timeout.
    pub socket_timeout: Duration,
    /// Connect timeout.
    pub connect_timeout: Duration,
    /// Whether TCP keep-alive is enabled.
    pub keep_alive: bool,
    /// Idle time after which a slot is probed before use. Zero probes always.
    pub health_check_interval: Duration,
    /// Attempts for bounded read retries.
    pub retry_count: u32,
    /// Delay between bounded read retries.
    pub retry_delay: Duration,
    /// How long `acquire` waits when every slot is outstanding.
    pub acquire_timeout: Duration,
}

impl StoreSettings {
    /// Returns the default settings for a store.
    #[must_use]
    pub fn defaults_for(kind: StoreKind) -> Self {
        match kind {
            StoreKind::Vector => Self {
                host: "localhost".to_string(),
                port: 19530,
                username: None,
                password: None,
                database: "default".to_string(),
                pool_min_size: 10,
                pool_max_size: 10,
                socket_timeout: Duration::from_secs(30),
                connect_timeout: Duration::from_secs(10),
                keep_alive: true,
                health_check_interval: Duration::ZERO,
                retry_count: 3,
                retry_delay: Duration::from_secs(1),
                acquire_timeout: Duration::from_secs(5),
            },
            StoreKind::Relational => Self {
                host: "localhost".to_string(),
                port: 5432,
                username: Some("postgres".to_string()),
                password: None,
                database: "postgres".to_string(),
                pool_min_size: 5,
                pool_max_size: 20,
                socket_timeout: Duration::from_secs(30),
                connect_timeout: Duration::from_secs(10),
                keep_alive: true,
                health_check_interval: Duration::ZERO,
                retry_count: 3,
                retry_delay: Duration::from_secs(1),
                acquire_timeout: Duration::from_secs(5),
            },
            StoreKind::Cache => Self {
                host: "127.0.0.1".to_string(),
                port: 6379,
                username: None,
                password: None,
                database: "0".to_string(),
                pool_min_size: 1,
                pool_max_size: 10,
                socket_timeout: Duration::from_secs(5),
                connect_timeout: Duration::from_secs(5),
                keep_alive: true,
                health_check_interval: Duration::from_secs(30),
                retry_count: 3,
                retry_delay: Duration::from_millis(1000),
                acquire_timeout: Duration::from_secs(5),
            },
        }
    }

    /// Clamps `pool_max_size` to at least one and `pool_min_size` to at most
    /// `pool_max_size`.
    #[must_use]
    pub fn normalized(mut self) -> Self {
        self.pool_max_size = self.pool_max_size.max(1);
        self.pool_min_size = self.pool_min_size.min(self.pool_max_size);
        self
    }

    /// Sets the host and port.
    #[must_use]
    pub fn with_address(mut self, host: impl Into<String>, port: u16) -> Self {
        self.host = host.into();
        self.port = port;
        self
    }

    /// Sets the credentials.
    #[must_use]
    pub fn with_credentials(mut self, username: impl Into<String>, password: impl Into<String>) -> Self {
        self.username = Some(username.into());
        self.password = Some(SecretString::from(password.into()));
        self
    }

    /// Sets the pool bounds.
    #[must_use]
    pub const fn with_pool_size(mut self, min: usize, max: usize) -> Self {
        self.pool_min_size = min;
        self.pool_max_size = max;
        self
    }

    /// Exposes the password, if any, for building a connection string.
    #[must_use]
    pub fn password_str(&self) -> Option<&str> {
        self.password.as_ref().map(ExposeSecret::expose_secret)
    }
}

impl fmt::Display for StoreSettings {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "host = {:?}", self.host)?;
        writeln!(f, "port = {}", self.port)?;
        if let Some(username) = &self.username {
            writeln!(f, "username = {username:?}")?;
        }
        if self.password.is_some() {
            writeln!(f, "password = \"<redacted>\"")?;
        }
        writeln!(f, "database = {:?}", self.database)?;
        writeln!(f, "pool_min_size = {}", self.pool_min_size)?;
        writeln!(f, "pool_max_size = {}", self.pool_max_size)?;
        writeln!(f, "socket_timeout_ms = {}", self.socket_timeout.as_millis())?;
        writeln!(f, "connect_timeout_ms = {}", self.connect_timeout.as_millis())?;
        writeln!(f, "keep_alive = {}", self.keep_alive)?;
        writeln!(
            f,
            "health_check_interval_secs = {}",
            self.health_check_interval.as_secs()
        )?;
        writeln!(f, "retry_count = {}", self.retry_count)?;
        writeln!(f, "retry_delay_ms = {}", self.retry_delay.as_millis())?;
        write!(f, "acquire_timeout_ms = {}", self.acquire_timeout.as_millis())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_store_defaults() {
        let vector = StoreSettings::defaults_for(StoreKind::Vector);
        assert_eq!(vector.port, 19530);
        assert_eq!(vector.pool_max_size, 10);
        assert_eq!(vector.health_check_interval, Duration::ZERO);

        let relational = StoreSettings::defaults_for(StoreKind::Relational);
        assert_eq!((relational.pool_min_size, relational.pool_max_size), (5, 20));

        let cache = StoreSettings::defaults_for(StoreKind::Cache);
        assert_eq!(cache.host, "127.0.0.1");
        assert_eq!(cache.retry_count, 3);
        assert_eq!(cache.retry_delay, Duration::from_millis(1000));
    }

    #[test]
    fn test_display_redacts_password() {
        let settings =
            StoreSettings::defaults_for(StoreKind::Relational).with_credentials("app", "hunter2");
        let rendered = settings.to_string();
        assert!(rendered.contains("<redacted>"));
        assert!(!rendered.contains("hunter2"));
        assert_eq!(settings.password_str(), Some("hunter2"));
    }

    #[test]
    fn test_store_kind_parse() {
        assert_eq!(StoreKind::parse("Redis"), Some(StoreKind::Cache));
        assert_eq!(StoreKind::parse("milvus"), Some(StoreKind::Vector));
        assert_eq!(StoreKind::parse("postgresql"), Some(StoreKind::Relational));
        assert_eq!(StoreKind::parse("mongo"), None);
    }

    #[test]
    fn test_normalized_clamps_pool_bounds() {
        let settings = StoreSettings::defaults_for(StoreKind::Cache)
            .with_pool_size(7, 0)
            .normalized();
        assert_eq!(settings.pool_max_size, 1);
        assert_eq!(settings.pool_min_size, 1);
    }
}
