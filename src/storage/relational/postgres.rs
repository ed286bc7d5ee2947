//! PostgreSQL connector.
//!
//! Drives `tokio-postgres` synchronously: each connector owns a small tokio
//! runtime that runs the connection tasks, and sessions block on it for every
//! call. Calling into a session from inside another tokio runtime panics.
//!
//! # Error mapping
//!
//! | Failure | Error |
//! |---------|-------|
//! | Closed connection, socket error, timeout | [`Error::Connection`] |
//! | SQLSTATE class `08` (connection exception), `57P` (operator intervention) | [`Error::Connection`] |
//! | Any other server error | [`Error::Backend`], message prefixed with the SQLSTATE |
//! | Anything else | [`Error::OperationFailed`] |

#[cfg(feature = "postgres")]
mod implementation {
    use crate::config::StoreSettings;
    use crate::storage::pool::{Connector, SlotId};
    use crate::storage::relational::session::{Row, SqlSession, SqlValue};
    use crate::{Error, Result};
    use bytes::BytesMut;
    use serde_json::Value;
    use std::future::Future;
    use std::sync::Arc;
    use std::time::Duration;
    use tokio::runtime::Runtime;
    use tokio_postgres::types::{IsNull, ToSql, Type, to_sql_checked};
    use tokio_postgres::{Client, Config, NoTls};

    const BACKEND: &str = "postgres";

    /// Helper to map errors that are not connectivity or server errors.
    fn query_error(op: &str, e: impl std::fmt::Display) -> Error {
        Error::OperationFailed {
            operation: op.to_string(),
            cause: e.to_string(),
        }
    }

    /// Maps a driver error onto the error taxonomy.
    fn classify(op: &str, e: &tokio_postgres::Error) -> Error {
        if let Some(db) = e.as_db_error() {
            let state = db.code().code();
            if state.starts_with("08") || state.starts_with("57P") {
                return Error::Connection {
                    backend: BACKEND,
                    cause: format!("{op}: {state}: {}", db.message()),
                };
            }
            return Error::Backend {
                backend: BACKEND,
                code: None,
                message: format!("{state}: {}", db.message()),
            };
        }

        let io_failure = std::error::Error::source(e).is_some_and(|s| s.is::<std::io::Error>());
        if e.is_closed() || io_failure {
            return Error::Connection {
                backend: BACKEND,
                cause: format!("{op}: {e}"),
            };
        }
        query_error(op, e)
    }

    /// Connector for a PostgreSQL server.
    pub struct PostgresConnector {
        config: Config,
        runtime: Arc<Runtime>,
        socket_timeout: Duration,
    }

    impl PostgresConnector {
        /// Creates a connector from store settings.
        ///
        /// # Errors
        ///
        /// Returns an error if the driver runtime cannot be created.
        pub fn new(settings: &StoreSettings) -> Result<Self> {
            let mut config = Config::new();
            config
                .host(settings.host.as_str())
                .port(settings.port)
                .dbname(settings.database.as_str())
                .application_name("stowage")
                .keepalives(settings.keep_alive);
            if !settings.connect_timeout.is_zero() {
                config.connect_timeout(settings.connect_timeout);
            }
            if let Some(user) = &settings.username {
                config.user(user.as_str());
            }
            if let Some(password) = settings.password_str() {
                config.password(password);
            }
            Self::with_config(config, settings.socket_timeout)
        }

        /// Creates a connector from a `postgresql://` URL. Only the socket
        /// timeout is taken from `settings`.
        ///
        /// # Errors
        ///
        /// Returns [`Error::InvalidInput`] for a malformed URL, or an error if
        /// the driver runtime cannot be created.
        pub fn from_url(url: &str, settings: &StoreSettings) -> Result<Self> {
            let config: Config = url
                .parse()
                .map_err(|e| Error::InvalidInput(format!("postgres url: {e}")))?;
            Self::with_config(config, settings.socket_timeout)
        }

        fn with_config(config: Config, socket_timeout: Duration) -> Result<Self> {
            let runtime = tokio::runtime::Builder::new_multi_thread()
                .worker_threads(1)
                .thread_name("stowage-postgres")
                .enable_all()
                .build()
                .map_err(|e| query_error("postgres_create_runtime", e))?;
            Ok(Self {
                config,
                runtime: Arc::new(runtime),
                socket_timeout,
            })
        }
    }

    impl Connector for PostgresConnector {
        type Connection = PostgresSession;

        fn backend_name(&self) -> &'static str {
            BACKEND
        }

        fn connect(&self, slot: SlotId) -> Result<PostgresSession> {
            let (client, connection) = self
                .runtime
                .block_on(self.config.connect(NoTls))
                .map_err(|e| classify("connect", &e))?;
            self.runtime.spawn(async move {
                if let Err(e) = connection.await {
                    tracing::warn!(backend = BACKEND, slot, error = %e, "Connection task ended");
                }
            });
            tracing::debug!(backend = BACKEND, slot, "Connected");
            Ok(PostgresSession {
                client,
                runtime: Arc::clone(&self.runtime),
                socket_timeout: self.socket_timeout,
            })
        }

        fn probe(&self, conn: &mut PostgresSession) -> Result<()> {
            conn.ping()
        }
    }

    /// A live PostgreSQL connection.
    pub struct PostgresSession {
        client: Client,
        runtime: Arc<Runtime>,
        socket_timeout: Duration,
    }

    impl PostgresSession {
        fn block_on<T, F>(&self, op: &'static str, f: F) -> Result<T>
        where
            F: Future<Output = std::result::Result<T, tokio_postgres::Error>>,
        {
            let timeout = self.socket_timeout;
            self.runtime.block_on(async move {
                if timeout.is_zero() {
                    return f.await.map_err(|e| classify(op, &e));
                }
                match tokio::time::timeout(timeout, f).await {
                    Ok(result) => result.map_err(|e| classify(op, &e)),
                    Err(_) => Err(Error::Connection {
                        backend: BACKEND,
                        cause: format!("{op} timed out after {}ms", timeout.as_millis()),
                    }),
                }
            })
        }
    }

    fn bind(params: &[SqlValue]) -> Vec<&(dyn ToSql + Sync)> {
        params.iter().map(|p| p as &(dyn ToSql + Sync)).collect()
    }

    impl SqlSession for PostgresSession {
        fn ping(&mut self) -> Result<()> {
            self.block_on("ping", self.client.simple_query("SELECT 1"))
                .map(|_| ())
        }

        fn execute(&mut self, sql: &str, params: &[SqlValue]) -> Result<u64> {
            let params = bind(params);
            self.block_on("execute", self.client.execute(sql, &params))
        }

        fn query(&mut self, sql: &str, params: &[SqlValue]) -> Result<Vec<Row>> {
            let params = bind(params);
            let rows = self.block_on("query", self.client.query(sql, &params))?;
            Ok(rows.iter().map(row_to_map).collect())
        }

        fn begin(&mut self) -> Result<()> {
            self.block_on("begin", self.client.batch_execute("BEGIN"))
        }

        fn commit(&mut self) -> Result<()> {
            self.block_on("commit", self.client.batch_execute("COMMIT"))
        }

        fn rollback(&mut self) -> Result<()> {
            self.block_on("rollback", self.client.batch_execute("ROLLBACK"))
        }
    }

    fn row_to_map(row: &tokio_postgres::Row) -> Row {
        row.columns()
            .iter()
            .enumerate()
            .map(|(i, column)| (column.name().to_string(), column_value(row, i, column.type_())))
            .collect()
    }

    /// Reads a column as JSON. Types without a mapping are read as text and
    /// fall back to `null`.
    fn column_value(row: &tokio_postgres::Row, i: usize, ty: &Type) -> Value {
        let value = match *ty {
            Type::BOOL => row.try_get::<_, Option<bool>>(i).map(|v| v.map(Value::from)),
            Type::INT2 => row.try_get::<_, Option<i16>>(i).map(|v| v.map(Value::from)),
            Type::INT4 => row.try_get::<_, Option<i32>>(i).map(|v| v.map(Value::from)),
            Type::INT8 => row.try_get::<_, Option<i64>>(i).map(|v| v.map(Value::from)),
            Type::FLOAT4 => row
                .try_get::<_, Option<f32>>(i)
                .map(|v| v.map(|f| Value::from(f64::from(f)))),
            Type::FLOAT8 => row.try_get::<_, Option<f64>>(i).map(|v| v.map(Value::from)),
            Type::JSON | Type::JSONB => row.try_get::<_, Option<Value>>(i),
            Type::TIMESTAMP => row
                .try_get::<_, Option<chrono::NaiveDateTime>>(i)
                .map(|v| v.map(|t| Value::from(t.to_string()))),
            Type::TIMESTAMPTZ => row
                .try_get::<_, Option<chrono::DateTime<chrono::Utc>>>(i)
                .map(|v| v.map(|t| Value::from(t.to_rfc3339()))),
            Type::DATE => row
                .try_get::<_, Option<chrono::NaiveDate>>(i)
                .map(|v| v.map(|d| Value::from(d.to_string()))),
            _ => row.try_get::<_, Option<String>>(i).map(|v| v.map(Value::from)),
        };
        value.ok().flatten().unwrap_or(Value::Null)
    }

    impl ToSql for SqlValue {
        #[allow(clippy::cast_possible_truncation, clippy::cast_precision_loss)]
        fn to_sql(
            &self,
            ty: &Type,
            out: &mut BytesMut,
        ) -> std::result::Result<IsNull, Box<dyn std::error::Error + Sync + Send>> {
            match self {
                Self::Null => Ok(IsNull::Yes),
                Self::Bool(b) => b.to_sql(ty, out),
                Self::Int(i) => match *ty {
                    Type::INT2 => i16::try_from(*i)?.to_sql(ty, out),
                    Type::INT4 => i32::try_from(*i)?.to_sql(ty, out),
                    Type::FLOAT4 => (*i as f32).to_sql(ty, out),
                    Type::FLOAT8 => (*i as f64).to_sql(ty, out),
                    _ => i.to_sql(ty, out),
                },
                Self::Float(f) => match *ty {
                    Type::FLOAT4 => (*f as f32).to_sql(ty, out),
                    _ => f.to_sql(ty, out),
                },
                Self::Text(s) => match *ty {
                    Type::JSON | Type::JSONB => serde_json::from_str::<Value>(s)
                        .unwrap_or_else(|_| Value::String(s.clone()))
                        .to_sql(ty, out),
                    _ => s.as_str().to_sql(ty, out),
                },
                Self::Json(v) => v.to_sql(ty, out),
            }
        }

        fn accepts(_ty: &Type) -> bool {
            true
        }

        to_sql_checked!();
    }

}

#[cfg(feature = "postgres")]
pub use implementation::{PostgresConnector, PostgresSession};
