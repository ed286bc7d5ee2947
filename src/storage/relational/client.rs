//! Relational-store client.

use super::builder::{self, Statement};
use super::session::{Record, Row, SqlSession, SqlValue};
use crate::config::StoreSettings;
use crate::storage::pool::{Connector, PoolConfig, PoolStatus, PooledSlot, ResilientPool};
use crate::{Error, Result};
use serde_json::Value;

/// Pooled client for a relational database.
///
/// Writes run inside a transaction that is committed on success and rolled
/// back on failure. Every call goes through the pool's reconnect-and-retry-once
/// discipline and releases its connection on every path.
///
/// Meant to be shared process-wide, typically through a
/// [`ProcessHandle`](crate::storage::ProcessHandle).
pub struct RelationalClient<C>
where
    C: Connector,
    C::Connection: SqlSession,
{
    pool: ResilientPool<C>,
}

impl<C> RelationalClient<C>
where
    C: Connector,
    C::Connection: SqlSession,
{
    /// Creates a client and verifies the database answers.
    ///
    /// # Errors
    ///
    /// Returns an error if no connection can be established.
    pub fn connect(connector: C, settings: &StoreSettings) -> Result<Self> {
        Self::with_pool_config(connector, PoolConfig::from_settings(settings))
    }

    /// Creates a client with an explicit pool configuration.
    ///
    /// # Errors
    ///
    /// Returns an error if no connection can be established.
    pub fn with_pool_config(connector: C, config: PoolConfig) -> Result<Self> {
        let pool = ResilientPool::new(connector, config);
        pool.run("connect", |session| session.ping())?;
        tracing::info!(
            backend = pool.backend_name(),
            connections = pool.status().constructed(),
            "Relational client connected"
        );
        Ok(Self { pool })
    }

    /// Returns the underlying pool.
    #[must_use]
    pub const fn pool(&self) -> &ResilientPool<C> {
        &self.pool
    }

    /// Returns a snapshot of pool occupancy.
    #[must_use]
    pub fn status(&self) -> PoolStatus {
        self.pool.status()
    }

    /// Runs a statement in its own transaction and returns the affected rows.
    ///
    /// # Errors
    ///
    /// Returns the backend error after rolling back.
    pub fn execute(&self, sql: &str, params: &[SqlValue]) -> Result<u64> {
        self.pool.run("execute", |session| {
            in_transaction(session, |s| s.execute(sql, params))
        })
    }

    /// Runs one statement per parameter set, all in a single transaction.
    ///
    /// An empty `param_sets` returns 0 without touching the database.
    ///
    /// # Errors
    ///
    /// Returns the first failing statement's error after rolling back.
    pub fn execute_many(&self, sql: &str, param_sets: &[Vec<SqlValue>]) -> Result<u64> {
        if param_sets.is_empty() {
            return Ok(0);
        }
        self.pool.run("execute_many", |session| {
            in_transaction(session, |s| {
                param_sets
                    .iter()
                    .try_fold(0_u64, |total, params| Ok(total + s.execute(sql, params)?))
            })
        })
    }

    /// Returns the first row of a query.
    ///
    /// # Errors
    ///
    /// Returns the backend error.
    pub fn query_one(&self, sql: &str, params: &[SqlValue]) -> Result<Option<Row>> {
        Ok(self.query_all(sql, params)?.into_iter().next())
    }

    /// Returns every row of a query.
    ///
    /// # Errors
    ///
    /// Returns the backend error.
    pub fn query_all(&self, sql: &str, params: &[SqlValue]) -> Result<Vec<Row>> {
        self.pool.run("query", |session| session.query(sql, params))
    }

    /// Returns one page of a query. Pages are 1-based; anything below one is
    /// the first page.
    ///
    /// # Errors
    ///
    /// Returns the backend error.
    pub fn query_page(
        &self,
        sql: &str,
        page: i64,
        page_size: usize,
        params: &[SqlValue],
    ) -> Result<Vec<Row>> {
        self.query_all(&builder::paginate(sql, page, page_size), params)
    }

    /// Counts the rows a query returns.
    ///
    /// # Errors
    ///
    /// Returns the backend error, or [`Error::OperationFailed`] if the count
    /// column is missing or not a number.
    pub fn count(&self, sql: &str, params: &[SqlValue]) -> Result<u64> {
        let row = self.query_one(&builder::count(sql), params)?;
        row.as_ref()
            .and_then(|r| r.get("count"))
            .and_then(count_value)
            .ok_or_else(|| Error::OperationFailed {
                operation: "count".to_string(),
                cause: format!("unexpected count result: {row:?}"),
            })
    }

    /// Inserts one record.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidInput`] for a bad identifier or empty record,
    /// or the backend error.
    pub fn insert(&self, table: &str, record: &Record) -> Result<u64> {
        let stmt = builder::insert(table, record)?;
        self.execute_statement("insert", &stmt)
    }

    /// Inserts several records in one statement.
    ///
    /// Columns come from the first record; later records missing one of them
    /// bind `NULL`. An empty slice returns 0 without touching the database.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidInput`] for a bad identifier, or the backend
    /// error.
    pub fn insert_many(&self, table: &str, records: &[Record]) -> Result<u64> {
        match builder::insert_many(table, records)? {
            Some(stmt) => self.execute_statement("insert_many", &stmt),
            None => Ok(0),
        }
    }

    /// Updates rows matching `condition`, whose placeholders start at `$1`.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidInput`] for a bad identifier, empty record or
    /// blank condition, or the backend error.
    pub fn update(
        &self,
        table: &str,
        data: &Record,
        condition: &str,
        params: &[SqlValue],
    ) -> Result<u64> {
        let stmt = builder::update(table, data, condition, params)?;
        self.execute_statement("update", &stmt)
    }

    /// Deletes rows matching `condition`; `None` deletes every row.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidInput`] for a bad identifier, or the backend
    /// error.
    pub fn delete(&self, table: &str, condition: Option<&str>, params: &[SqlValue]) -> Result<u64> {
        let stmt = builder::delete(table, condition, params)?;
        self.execute_statement("delete", &stmt)
    }

    /// Runs `work` inside a transaction.
    ///
    /// Commits when `work` returns `Ok`, rolls back and returns the error
    /// otherwise. `work` runs once; it is never retried.
    ///
    /// # Errors
    ///
    /// Returns the error from `begin`, `work` or `commit`.
    pub fn transaction<T, F>(&self, work: F) -> Result<T>
    where
        F: FnOnce(&mut TransactionScope<'_, C>) -> Result<T>,
    {
        let mut scope = self.begin()?;
        match work(&mut scope) {
            Ok(value) => {
                scope.commit()?;
                Ok(value)
            },
            Err(e) => {
                tracing::warn!(
                    backend = self.pool.backend_name(),
                    error = %e,
                    "Transaction failed, rolling back"
                );
                scope.transient |= e.is_transient();
                drop(scope);
                Err(e)
            },
        }
    }

    /// Opens a transaction on a dedicated connection.
    ///
    /// The scope must be finished with [`TransactionScope::commit`]; dropping
    /// it rolls back.
    ///
    /// # Errors
    ///
    /// Returns the acquire error, or the error from `BEGIN` (retried once on
    /// a fresh connection if transient).
    pub fn begin(&self) -> Result<TransactionScope<'_, C>> {
        let mut slot = self.pool.acquire()?;
        if let Err(e) = slot.with(|session| session.begin()) {
            if !e.is_transient() {
                return Err(e);
            }
            tracing::warn!(
                backend = self.pool.backend_name(),
                slot = slot.id(),
                error = %e,
                "BEGIN failed, reconnecting"
            );
            self.pool.reconnect(&mut slot)?;
            slot.with(|session| session.begin())?;
        }
        Ok(TransactionScope {
            pool: &self.pool,
            slot,
            finished: false,
            transient: false,
        })
    }

    /// Closes the pool. Later operations fail with [`Error::Lifecycle`].
    pub fn close(&self) {
        self.pool.close();
    }

    fn execute_statement(&self, operation: &'static str, stmt: &Statement) -> Result<u64> {
        tracing::debug!(operation, sql = %stmt.sql, params = stmt.params.len(), "Executing statement");
        self.pool.run(operation, |session| {
            in_transaction(session, |s| s.execute(&stmt.sql, &stmt.params))
        })
    }
}

/// Brackets `work` with `BEGIN` and `COMMIT`, rolling back on failure.
fn in_transaction<S, T>(session: &mut S, work: impl FnOnce(&mut S) -> Result<T>) -> Result<T>
where
    S: SqlSession + ?Sized,
{
    session.begin()?;
    match work(session) {
        Ok(value) => {
            session.commit()?;
            Ok(value)
        },
        Err(e) => {
            if let Err(rollback_err) = session.rollback() {
                tracing::warn!(error = %rollback_err, "Rollback failed");
            }
            Err(e)
        },
    }
}

fn count_value(value: &Value) -> Option<u64> {
    match value {
        Value::Number(n) => n.as_u64(),
        Value::String(s) => s.parse().ok(),
        _ => None,
    }
}

/// An open transaction holding one pooled connection.
///
/// Finish it with [`commit`](Self::commit) or [`rollback`](Self::rollback);
/// dropping an unfinished scope rolls back. A transient failure inside the
/// transaction reconnects the slot before it goes back to the pool.
pub struct TransactionScope<'p, C>
where
    C: Connector,
    C::Connection: SqlSession,
{
    pool: &'p ResilientPool<C>,
    slot: PooledSlot<'p, C>,
    finished: bool,
    transient: bool,
}

impl<C> TransactionScope<'_, C>
where
    C: Connector,
    C::Connection: SqlSession,
{
    /// Runs a statement inside the transaction.
    ///
    /// # Errors
    ///
    /// Returns the backend error; the transaction should then be abandoned.
    pub fn execute(&mut self, sql: &str, params: &[SqlValue]) -> Result<u64> {
        self.track(|s| s.execute(sql, params))
    }

    /// Runs a query inside the transaction.
    ///
    /// # Errors
    ///
    /// Returns the backend error.
    pub fn query(&mut self, sql: &str, params: &[SqlValue]) -> Result<Vec<Row>> {
        self.track(|s| s.query(sql, params))
    }

    /// Returns the first row of a query inside the transaction.
    ///
    /// # Errors
    ///
    /// Returns the backend error.
    pub fn query_one(&mut self, sql: &str, params: &[SqlValue]) -> Result<Option<Row>> {
        Ok(self.query(sql, params)?.into_iter().next())
    }

    /// Inserts one record inside the transaction.
    ///
    /// # Errors
    ///
    /// Returns a builder or backend error.
    pub fn insert(&mut self, table: &str, record: &Record) -> Result<u64> {
        let stmt = builder::insert(table, record)?;
        self.execute(&stmt.sql, &stmt.params)
    }

    /// Inserts several records inside the transaction.
    ///
    /// # Errors
    ///
    /// Returns a builder or backend error.
    pub fn insert_many(&mut self, table: &str, records: &[Record]) -> Result<u64> {
        match builder::insert_many(table, records)? {
            Some(stmt) => self.execute(&stmt.sql, &stmt.params),
            None => Ok(0),
        }
    }

    /// Updates rows inside the transaction.
    ///
    /// # Errors
    ///
    /// Returns a builder or backend error.
    pub fn update(
        &mut self,
        table: &str,
        data: &Record,
        condition: &str,
        params: &[SqlValue],
    ) -> Result<u64> {
        let stmt = builder::update(table, data, condition, params)?;
        self.execute(&stmt.sql, &stmt.params)
    }

    /// Deletes rows inside the transaction.
    ///
    /// # Errors
    ///
    /// Returns a builder or backend error.
    pub fn delete(&mut self, table: &str, condition: Option<&str>, params: &[SqlValue]) -> Result<u64> {
        let stmt = builder::delete(table, condition, params)?;
        self.execute(&stmt.sql, &stmt.params)
    }

    /// Commits the transaction.
    ///
    /// # Errors
    ///
    /// Returns the commit error; the transaction is rolled back first.
    pub fn commit(mut self) -> Result<()> {
        self.finished = true;
        match self.slot.with(|session| session.commit()) {
            Ok(()) => Ok(()),
            Err(e) => {
                tracing::warn!(
                    backend = self.pool.backend_name(),
                    error = %e,
                    "Commit failed, rolling back"
                );
                self.transient |= e.is_transient();
                self.abandon();
                Err(e)
            },
        }
    }

    /// Rolls the transaction back.
    ///
    /// # Errors
    ///
    /// Returns the rollback error.
    pub fn rollback(mut self) -> Result<()> {
        self.finished = true;
        let result = self.slot.with(|session| session.rollback());
        if let Err(e) = &result {
            self.transient |= e.is_transient();
        }
        self.repair();
        result
    }

    fn track<T>(&mut self, work: impl FnOnce(&mut C::Connection) -> Result<T>) -> Result<T> {
        let result = self.slot.with(work);
        if let Err(e) = &result {
            self.transient |= e.is_transient();
        }
        result
    }

    /// Rolls back, logging instead of returning any failure.
    fn abandon(&mut self) {
        self.finished = true;
        if let Err(e) = self.slot.with(|session| session.rollback()) {
            tracing::warn!(
                backend = self.pool.backend_name(),
                slot = self.slot.id(),
                error = %e,
                "Rollback failed"
            );
            self.transient |= e.is_transient();
        }
        self.repair();
    }

    fn repair(&mut self) {
        if !self.transient {
            return;
        }
        self.transient = false;
        if let Err(e) = self.pool.reconnect(&mut self.slot) {
            tracing::warn!(
                backend = self.pool.backend_name(),
                slot = self.slot.id(),
                error = %e,
                "Reconnect after failed transaction also failed"
            );
        }
    }
}

impl<C> Drop for TransactionScope<'_, C>
where
    C: Connector,
    C::Connection: SqlSession,
{
    fn drop(&mut self) {
        if !self.finished {
            self.abandon();
        }
    }
}
