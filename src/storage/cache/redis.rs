//! Redis connector.
//!
//! One synchronous `redis::Connection` per pooled slot, with read and write
//! timeouts taken from the socket timeout.
//!
//! I/O errors, timeouts, refused and dropped connections map to
//! [`Error::Connection`]; everything the server answers with maps to
//! [`Error::Backend`].

#[cfg(feature = "redis")]
mod implementation {
    use crate::config::StoreSettings;
    use crate::storage::cache::session::CacheSession;
    use crate::storage::pool::{Connector, SlotId};
    use crate::{Error, Result};
    use redis::{Client, Connection, RedisError};
    use std::collections::HashSet;
    use std::time::Duration;

    const BACKEND: &str = "redis";
    const SCAN_COUNT: usize = 500;

    fn command_error(op: &str, e: &RedisError) -> Error {
        if e.is_io_error() || e.is_timeout() || e.is_connection_refusal() || e.is_connection_dropped()
        {
            return Error::Connection {
                backend: BACKEND,
                cause: format!("{op}: {e}"),
            };
        }
        Error::Backend {
            backend: BACKEND,
            code: None,
            message: format!("{op}: {e}"),
        }
    }

    /// Percent-encodes URL userinfo.
    fn encode_userinfo(raw: &str) -> String {
        raw.bytes()
            .map(|b| {
                if b.is_ascii_alphanumeric() || b"-._~".contains(&b) {
                    char::from(b).to_string()
                } else {
                    format!("%{b:02X}")
                }
            })
            .collect()
    }

    /// Builds `redis://[user][:password@]host:port/db` from settings.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidInput`] if `database` is not a number.
    pub fn connection_url(settings: &StoreSettings) -> Result<String> {
        let db: u32 = settings.database.trim().parse().map_err(|_| {
            Error::InvalidInput(format!(
                "cache database must be a number, got '{}'",
                settings.database
            ))
        })?;
        let user = settings.username.as_deref().map(encode_userinfo).unwrap_or_default();
        let auth = match settings.password_str() {
            Some(password) => format!("{user}:{}@", encode_userinfo(password)),
            None if !user.is_empty() => format!("{user}@"),
            None => String::new(),
        };
        Ok(format!("redis://{auth}{}:{}/{db}", settings.host, settings.port))
    }

    /// Escapes glob metacharacters so a prefix matches literally in `SCAN`.
    pub fn escape_glob(prefix: &str) -> String {
        let mut escaped = String::with_capacity(prefix.len() + 1);
        for c in prefix.chars() {
            if matches!(c, '*' | '?' | '[' | ']' | '\\') {
                escaped.push('\\');
            }
            escaped.push(c);
        }
        escaped
    }

    const fn optional(timeout: Duration) -> Option<Duration> {
        if timeout.is_zero() { None } else { Some(timeout) }
    }

    /// Connector for a Redis server.
    pub struct RedisConnector {
        client: Client,
        connect_timeout: Duration,
        socket_timeout: Duration,
    }

    impl RedisConnector {
        /// Creates a connector from store settings.
        ///
        /// # Errors
        ///
        /// Returns [`Error::InvalidInput`] for unusable settings.
        pub fn new(settings: &StoreSettings) -> Result<Self> {
            Self::from_url(&connection_url(settings)?, settings)
        }

        /// Creates a connector from a `redis://` URL; timeouts come from
        /// `settings`.
        ///
        /// # Errors
        ///
        /// Returns [`Error::InvalidInput`] for a malformed URL.
        pub fn from_url(url: &str, settings: &StoreSettings) -> Result<Self> {
            let client = Client::open(url)
                .map_err(|e| Error::InvalidInput(format!("redis url: {e}")))?;
            Ok(Self {
                client,
                connect_timeout: settings.connect_timeout,
                socket_timeout: settings.socket_timeout,
            })
        }
    }

    impl Connector for RedisConnector {
        type Connection = RedisSession;

        fn backend_name(&self) -> &'static str {
            BACKEND
        }

        fn connect(&self, slot: SlotId) -> Result<RedisSession> {
            let conn = match optional(self.connect_timeout) {
                Some(timeout) => self.client.get_connection_with_timeout(timeout),
                None => self.client.get_connection(),
            }
            .map_err(|e| command_error("connect", &e))?;

            let timeout = optional(self.socket_timeout);
            conn.set_read_timeout(timeout)
                .map_err(|e| command_error("set_read_timeout", &e))?;
            conn.set_write_timeout(timeout)
                .map_err(|e| command_error("set_write_timeout", &e))?;

            tracing::debug!(backend = BACKEND, slot, "Connected");
            Ok(RedisSession { conn })
        }

        fn probe(&self, conn: &mut RedisSession) -> Result<()> {
            conn.ping()
        }
    }

    /// A live Redis connection.
    pub struct RedisSession {
        conn: Connection,
    }

    impl CacheSession for RedisSession {
        fn ping(&mut self) -> Result<()> {
            redis::cmd("PING")
                .query::<String>(&mut self.conn)
                .map(|_| ())
                .map_err(|e| command_error("PING", &e))
        }

        fn get(&mut self, key: &str) -> Result<Option<String>> {
            redis::cmd("GET")
                .arg(key)
                .query(&mut self.conn)
                .map_err(|e| command_error("GET", &e))
        }

        fn set(&mut self, key: &str, value: &str, ttl: Option<Duration>) -> Result<()> {
            let mut cmd = redis::cmd("SET");
            cmd.arg(key).arg(value);
            if let Some(ttl) = ttl {
                cmd.arg("PX")
                    .arg(u64::try_from(ttl.as_millis()).unwrap_or(u64::MAX));
            }
            cmd.query::<()>(&mut self.conn)
                .map_err(|e| command_error("SET", &e))
        }

        fn delete(&mut self, keys: &[String]) -> Result<u64> {
            if keys.is_empty() {
                return Ok(0);
            }
            redis::cmd("DEL")
                .arg(keys)
                .query(&mut self.conn)
                .map_err(|e| command_error("DEL", &e))
        }

        fn scan_prefix(&mut self, prefix: &str) -> Result<Vec<String>> {
            let pattern = format!("{}*", escape_glob(prefix));
            let mut cursor: u64 = 0;
            let mut keys = HashSet::new();
            loop {
                let (next, batch): (u64, Vec<String>) = redis::cmd("SCAN")
                    .arg(cursor)
                    .arg("MATCH")
                    .arg(&pattern)
                    .arg("COUNT")
                    .arg(SCAN_COUNT)
                    .query(&mut self.conn)
                    .map_err(|e| command_error("SCAN", &e))?;
                keys.extend(batch);
                if next == 0 {
                    break;
                }
                cursor = next;
            }
            Ok(keys.into_iter().collect())
        }

        fn exists(&mut self, key: &str) -> Result<bool> {
            redis::cmd("EXISTS")
                .arg(key)
                .query::<u64>(&mut self.conn)
                .map(|n| n > 0)
                .map_err(|e| command_error("EXISTS", &e))
        }

        fn push_front(&mut self, key: &str, value: &str) -> Result<u64> {
            redis::cmd("LPUSH")
                .arg(key)
                .arg(value)
                .query(&mut self.conn)
                .map_err(|e| command_error("LPUSH", &e))
        }

        fn pop_back(&mut self, key: &str) -> Result<Option<String>> {
            redis::cmd("RPOP")
                .arg(key)
                .query(&mut self.conn)
                .map_err(|e| command_error("RPOP", &e))
        }
    }

}

#[cfg(feature = "redis")]
pub use implementation::{RedisConnector, RedisSession, connection_url, escape_glob};
