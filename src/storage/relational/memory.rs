//! In-memory relational store.
//!
//! Understands the statements the builders emit plus simple hand-written
//! selects:
//!
//! - `INSERT INTO t (cols) VALUES (...), (...)`
//! - `UPDATE t SET "a" = $1 WHERE ...`
//! - `DELETE FROM t WHERE ...`
//! - `SELECT * | cols FROM t [WHERE ...] [ORDER BY col [ASC|DESC]] [LIMIT n] [OFFSET m]`
//! - `SELECT COUNT(*) AS count FROM (<select>) AS t`
//!
//! Conditions are `TRUE` or `AND`-joined comparisons of a column with a
//! placeholder or literal. Transactions snapshot every table on `BEGIN` and
//! restore it on `ROLLBACK`; there is no isolation between sessions.
//! Errors carry a PostgreSQL SQLSTATE prefix in their message.

use super::session::{Row, SqlSession, SqlValue};
use crate::storage::faults::FaultInjector;
use crate::storage::pool::{Connector, SlotId};
use crate::{Error, Result};
use once_cell::sync::Lazy;
use regex::{Captures, Regex};
use serde_json::Value;
use std::cmp::Ordering;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

const BACKEND: &str = "sql-memory";

fn pattern(re: &str) -> Regex {
    Regex::new(re).unwrap_or_else(|_| unreachable!("statement pattern is valid"))
}

static INSERT_RE: Lazy<Regex> = Lazy::new(|| {
    pattern(r"(?is)^\s*INSERT\s+INTO\s+([^\s(]+)\s*\(([^)]*)\)\s*VALUES\s*(.+?)\s*;?\s*$")
});
static TUPLE_RE: Lazy<Regex> = Lazy::new(|| pattern(r"\(([^)]*)\)"));
static UPDATE_RE: Lazy<Regex> = Lazy::new(|| {
    pattern(r"(?is)^\s*UPDATE\s+(\S+)\s+SET\s+(.+?)\s+WHERE\s+(.+?)\s*;?\s*$")
});
static DELETE_RE: Lazy<Regex> = Lazy::new(|| {
    pattern(r"(?is)^\s*DELETE\s+FROM\s+(\S+?)(?:\s+WHERE\s+(.+?))?\s*;?\s*$")
});
static COUNT_RE: Lazy<Regex> = Lazy::new(|| {
    pattern(r"(?is)^\s*SELECT\s+COUNT\(\*\)\s+AS\s+count\s+FROM\s+\((.+)\)\s+AS\s+t\s*;?\s*$")
});
static SELECT_RE: Lazy<Regex> = Lazy::new(|| {
    pattern(
        r"(?is)^\s*SELECT\s+(.+?)\s+FROM\s+(\S+?)(?:\s+WHERE\s+(.+?))?(?:\s+ORDER\s+BY\s+(\S+?)(?:\s+(ASC|DESC))?)?(?:\s+LIMIT\s+(\d+))?(?:\s+OFFSET\s+(\d+))?\s*;?\s*$",
    )
});
static AND_RE: Lazy<Regex> = Lazy::new(|| pattern(r"(?i)\s+AND\s+"));
static PREDICATE_RE: Lazy<Regex> = Lazy::new(|| {
    pattern(
        r#"(?i)^("?[A-Za-z_][A-Za-z0-9_]*"?)\s*(=|<>|!=|>=|<=|>|<)\s*(\$\d+|-?\d+(?:\.\d+)?|'(?:[^']|'')*'|TRUE|FALSE|NULL)$"#,
    )
});

type Tables = HashMap<String, Vec<Row>>;

#[derive(Default)]
struct SqlData {
    tables: Tables,
    open_transactions: usize,
}

/// Shared in-memory relational store and its connector.
///
/// Cloning shares the same tables and fault injector.
#[derive(Clone, Default)]
pub struct InMemorySqlStore {
    data: Arc<Mutex<SqlData>>,
    faults: Arc<FaultInjector>,
}

impl InMemorySqlStore {
    /// Creates an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the fault injector driving this store.
    #[must_use]
    pub fn faults(&self) -> Arc<FaultInjector> {
        Arc::clone(&self.faults)
    }

    /// Creates an empty table if it does not exist.
    pub fn create_table(&self, name: &str) {
        lock(&self.data)
            .tables
            .entry(unquote(name))
            .or_default();
    }

    /// Number of rows in a table, if it exists.
    #[must_use]
    pub fn row_count(&self, table: &str) -> Option<usize> {
        lock(&self.data).tables.get(&unquote(table)).map(Vec::len)
    }

    /// Copy of every row in a table.
    #[must_use]
    pub fn rows(&self, table: &str) -> Vec<Row> {
        lock(&self.data)
            .tables
            .get(&unquote(table))
            .cloned()
            .unwrap_or_default()
    }

    /// Transactions begun and not yet finished, across all sessions.
    #[must_use]
    pub fn open_transactions(&self) -> usize {
        lock(&self.data).open_transactions
    }
}

impl Connector for InMemorySqlStore {
    type Connection = InMemorySqlSession;

    fn backend_name(&self) -> &'static str {
        BACKEND
    }

    fn connect(&self, slot: SlotId) -> Result<InMemorySqlSession> {
        self.faults.on_connect(BACKEND)?;
        Ok(InMemorySqlSession {
            slot,
            data: Arc::clone(&self.data),
            faults: Arc::clone(&self.faults),
            snapshot: None,
        })
    }

    fn probe(&self, _conn: &mut InMemorySqlSession) -> Result<()> {
        self.faults.on_probe(BACKEND)
    }
}

/// A session on an [`InMemorySqlStore`].
///
/// Dropping a session with an open transaction rolls it back, as a server
/// does when a client disconnects.
pub struct InMemorySqlSession {
    slot: SlotId,
    data: Arc<Mutex<SqlData>>,
    faults: Arc<FaultInjector>,
    snapshot: Option<Tables>,
}

impl InMemorySqlSession {
    /// Slot this session was created for.
    #[must_use]
    pub const fn slot(&self) -> SlotId {
        self.slot
    }

    fn restore(&mut self) {
        if let Some(snapshot) = self.snapshot.take() {
            let mut data = lock(&self.data);
            data.tables = snapshot;
            data.open_transactions = data.open_transactions.saturating_sub(1);
        }
    }
}

impl SqlSession for InMemorySqlSession {
    fn ping(&mut self) -> Result<()> {
        self.faults.on_operation(BACKEND)
    }

    fn execute(&mut self, sql: &str, params: &[SqlValue]) -> Result<u64> {
        self.faults.on_operation(BACKEND)?;
        let mut data = lock(&self.data);
        if let Some(caps) = INSERT_RE.captures(sql) {
            return run_insert(&mut data.tables, &caps, params);
        }
        if let Some(caps) = UPDATE_RE.captures(sql) {
            return run_update(&mut data.tables, &caps, params);
        }
        if let Some(caps) = DELETE_RE.captures(sql) {
            return run_delete(&mut data.tables, &caps, params);
        }
        Err(sql_error("0A000", format!("unsupported statement: {sql}")))
    }

    fn query(&mut self, sql: &str, params: &[SqlValue]) -> Result<Vec<Row>> {
        self.faults.on_operation(BACKEND)?;
        let data = lock(&self.data);
        if let Some(caps) = COUNT_RE.captures(sql) {
            let rows = run_select(&data.tables, &caps[1], params)?;
            let mut row = Row::new();
            row.insert("count".to_string(), Value::from(rows.len()));
            return Ok(vec![row]);
        }
        run_select(&data.tables, sql, params)
    }

    fn begin(&mut self) -> Result<()> {
        if self.snapshot.is_some() {
            tracing::warn!(slot = self.slot, "BEGIN inside an open transaction ignored");
            return Ok(());
        }
        let mut data = lock(&self.data);
        self.snapshot = Some(data.tables.clone());
        data.open_transactions += 1;
        Ok(())
    }

    fn commit(&mut self) -> Result<()> {
        if self.snapshot.take().is_some() {
            let mut data = lock(&self.data);
            data.open_transactions = data.open_transactions.saturating_sub(1);
        }
        Ok(())
    }

    fn rollback(&mut self) -> Result<()> {
        self.restore();
        Ok(())
    }
}

impl Drop for InMemorySqlSession {
    fn drop(&mut self) {
        self.restore();
    }
}

fn lock(data: &Mutex<SqlData>) -> MutexGuard<'_, SqlData> {
    data.lock().unwrap_or_else(PoisonError::into_inner)
}

fn sql_error(state: &str, message: String) -> Error {
    Error::Backend {
        backend: BACKEND,
        code: None,
        message: format!("{state}: {message}"),
    }
}

/// Strips identifier quotes, keeping schema qualification.
fn unquote(name: &str) -> String {
    name.trim()
        .split('.')
        .map(|part| part.trim().trim_matches('"'))
        .collect::<Vec<_>>()
        .join(".")
}

fn table_mut<'a>(tables: &'a mut Tables, name: &str) -> Result<&'a mut Vec<Row>> {
    let name = unquote(name);
    tables
        .get_mut(&name)
        .ok_or_else(|| sql_error("42P01", format!("relation \"{name}\" does not exist")))
}

fn table<'a>(tables: &'a Tables, name: &str) -> Result<&'a Vec<Row>> {
    let name = unquote(name);
    tables
        .get(&name)
        .ok_or_else(|| sql_error("42P01", format!("relation \"{name}\" does not exist")))
}

/// Resolves a placeholder or literal to a value.
fn operand(token: &str, params: &[SqlValue]) -> Result<Value> {
    let token = token.trim();
    if let Some(index) = token.strip_prefix('$') {
        let n: usize = index
            .parse()
            .map_err(|_| sql_error("42601", format!("bad placeholder {token}")))?;
        return n
            .checked_sub(1)
            .and_then(|i| params.get(i))
            .map(SqlValue::to_json)
            .ok_or_else(|| sql_error("08P01", format!("there is no parameter {token}")));
    }
    if let Some(text) = token.strip_prefix('\'').and_then(|t| t.strip_suffix('\'')) {
        return Ok(Value::from(text.replace("''", "'")));
    }
    match token.to_ascii_uppercase().as_str() {
        "TRUE" => return Ok(Value::Bool(true)),
        "FALSE" => return Ok(Value::Bool(false)),
        "NULL" => return Ok(Value::Null),
        _ => {},
    }
    if let Ok(i) = token.parse::<i64>() {
        return Ok(Value::from(i));
    }
    token
        .parse::<f64>()
        .map(Value::from)
        .map_err(|_| sql_error("42601", format!("cannot parse value {token}")))
}

fn compare(a: &Value, b: &Value) -> Option<Ordering> {
    match (a, b) {
        (Value::Number(x), Value::Number(y)) => x.as_f64()?.partial_cmp(&y.as_f64()?),
        (Value::String(x), Value::String(y)) => Some(x.cmp(y)),
        (Value::Bool(x), Value::Bool(y)) => Some(x.cmp(y)),
        _ => None,
    }
}

struct Predicate {
    column: String,
    op: String,
    value: Value,
}

impl Predicate {
    fn matches(&self, row: &Row) -> bool {
        let Some(ordering) = row
            .get(&self.column)
            .and_then(|actual| compare(actual, &self.value))
        else {
            return false;
        };
        match self.op.as_str() {
            "=" => ordering == Ordering::Equal,
            "<>" | "!=" => ordering != Ordering::Equal,
            ">" => ordering == Ordering::Greater,
            "<" => ordering == Ordering::Less,
            ">=" => ordering != Ordering::Less,
            "<=" => ordering != Ordering::Greater,
            _ => false,
        }
    }
}

/// Parses a `TRUE` / `AND`-joined condition. An empty result matches all rows.
fn parse_condition(condition: Option<&str>, params: &[SqlValue]) -> Result<Vec<Predicate>> {
    let Some(condition) = condition.map(str::trim).filter(|c| !c.is_empty()) else {
        return Ok(Vec::new());
    };
    AND_RE
        .split(condition)
        .map(str::trim)
        .filter(|part| !part.eq_ignore_ascii_case("TRUE"))
        .map(|part| {
            let caps = PREDICATE_RE
                .captures(part)
                .ok_or_else(|| sql_error("42601", format!("unsupported condition: {part}")))?;
            Ok(Predicate {
                column: unquote(&caps[1]),
                op: caps[2].to_string(),
                value: operand(&caps[3], params)?,
            })
        })
        .collect()
}

fn matches_all(predicates: &[Predicate], row: &Row) -> bool {
    predicates.iter().all(|p| p.matches(row))
}

fn split_list(list: &str) -> Vec<&str> {
    list.split(',').map(str::trim).filter(|s| !s.is_empty()).collect()
}

fn run_insert(tables: &mut Tables, caps: &Captures<'_>, params: &[SqlValue]) -> Result<u64> {
    let columns: Vec<String> = split_list(&caps[2]).into_iter().map(unquote).collect();
    let mut rows = Vec::new();
    for tuple in TUPLE_RE.captures_iter(&caps[3]) {
        let values = split_list(&tuple[1]);
        if values.len() != columns.len() {
            return Err(sql_error(
                "42601",
                format!(
                    "INSERT has {} target columns but {} expressions",
                    columns.len(),
                    values.len()
                ),
            ));
        }
        let mut row = Row::new();
        for (column, token) in columns.iter().zip(values) {
            row.insert(column.clone(), operand(token, params)?);
        }
        rows.push(row);
    }
    let target = table_mut(tables, &caps[1])?;
    let inserted = rows.len() as u64;
    target.extend(rows);
    Ok(inserted)
}

fn run_update(tables: &mut Tables, caps: &Captures<'_>, params: &[SqlValue]) -> Result<u64> {
    let assignments = split_list(&caps[2])
        .into_iter()
        .map(|assignment| {
            let (column, token) = assignment
                .split_once('=')
                .ok_or_else(|| sql_error("42601", format!("bad assignment: {assignment}")))?;
            Ok((unquote(column), operand(token, params)?))
        })
        .collect::<Result<Vec<_>>>()?;
    let predicates = parse_condition(Some(&caps[3]), params)?;

    let mut updated = 0;
    for row in table_mut(tables, &caps[1])?.iter_mut() {
        if matches_all(&predicates, row) {
            for (column, value) in &assignments {
                row.insert(column.clone(), value.clone());
            }
            updated += 1;
        }
    }
    Ok(updated)
}

fn run_delete(tables: &mut Tables, caps: &Captures<'_>, params: &[SqlValue]) -> Result<u64> {
    let predicates = parse_condition(caps.get(2).map(|m| m.as_str()), params)?;
    let rows = table_mut(tables, &caps[1])?;
    let before = rows.len();
    rows.retain(|row| !matches_all(&predicates, row));
    Ok((before - rows.len()) as u64)
}

fn run_select(tables: &Tables, sql: &str, params: &[SqlValue]) -> Result<Vec<Row>> {
    let caps = SELECT_RE
        .captures(sql)
        .ok_or_else(|| sql_error("0A000", format!("unsupported query: {sql}")))?;
    let predicates = parse_condition(caps.get(3).map(|m| m.as_str()), params)?;
    let mut rows: Vec<Row> = table(tables, &caps[2])?
        .iter()
        .filter(|row| matches_all(&predicates, row))
        .cloned()
        .collect();

    if let Some(order_by) = caps.get(4) {
        let column = unquote(order_by.as_str());
        let descending = caps
            .get(5)
            .is_some_and(|m| m.as_str().eq_ignore_ascii_case("DESC"));
        rows.sort_by(|a, b| {
            let ordering = match (a.get(&column), b.get(&column)) {
                (Some(x), Some(y)) => compare(x, y).unwrap_or(Ordering::Equal),
                (Some(_), None) => Ordering::Less,
                (None, Some(_)) => Ordering::Greater,
                (None, None) => Ordering::Equal,
            };
            if descending { ordering.reverse() } else { ordering }
        });
    }

    let offset = caps
        .get(7)
        .and_then(|m| m.as_str().parse::<usize>().ok())
        .unwrap_or(0);
    let limit = caps
        .get(6)
        .and_then(|m| m.as_str().parse::<usize>().ok())
        .unwrap_or(usize::MAX);
    let rows = rows.into_iter().skip(offset).take(limit);

    let projection = caps[1].trim();
    if projection == "*" {
        return Ok(rows.collect());
    }
    let columns: Vec<String> = split_list(projection).into_iter().map(unquote).collect();
    Ok(rows
        .map(|row| {
            columns
                .iter()
                .map(|c| (c.clone(), row.get(c).cloned().unwrap_or(Value::Null)))
                .collect()
        })
        .collect())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn session(store: &InMemorySqlStore) -> InMemorySqlSession {
        store.connect(0).unwrap()
    }

    fn seeded() -> (InMemorySqlStore, InMemorySqlSession) {
        let store = InMemorySqlStore::new();
        store.create_table("\"items\"");
        let mut s = session(&store);
        s.execute(
            "INSERT INTO \"items\" (\"id\", \"name\", \"price\") VALUES ($1, $2, $3), ($4, $5, $6), ($7, $8, $9)",
            &[
                SqlValue::Int(1),
                "apple".into(),
                SqlValue::Float(1.5),
                SqlValue::Int(2),
                "pear".into(),
                SqlValue::Float(2.0),
                SqlValue::Int(3),
                "plum".into(),
                SqlValue::Null,
            ],
        )
        .unwrap();
        (store, s)
    }

    #[test]
    fn test_insert_and_select_all() {
        let (store, mut s) = seeded();
        assert_eq!(store.row_count("items"), Some(3));
        let rows = s.query("SELECT * FROM \"items\"", &[]).unwrap();
        assert_eq!(rows.len(), 3);
        assert_eq!(rows[0]["name"], json!("apple"));
    }

    #[test]
    fn test_row_keys_follow_insert_column_order() {
        let store = InMemorySqlStore::new();
        store.create_table("\"items\"");
        let mut s = session(&store);
        s.execute(
            "INSERT INTO \"items\" (\"zeta\", \"alpha\", \"mid\") VALUES ($1, $2, $3)",
            &[SqlValue::Int(1), SqlValue::Int(2), SqlValue::Int(3)],
        )
        .unwrap();
        let rows = s.query("SELECT * FROM \"items\"", &[]).unwrap();
        let keys: Vec<&str> = rows[0].keys().map(String::as_str).collect();
        assert_eq!(keys, ["zeta", "alpha", "mid"]);
    }

    #[test]
    fn test_select_with_condition_order_and_limit() {
        let (_store, mut s) = seeded();
        let rows = s
            .query(
                "SELECT \"name\" FROM \"items\" WHERE \"id\" >= $1 ORDER BY \"id\" DESC LIMIT 1 OFFSET 0",
                &[SqlValue::Int(2)],
            )
            .unwrap();
        assert_eq!(rows, vec![json!({"name": "plum"}).as_object().unwrap().clone()]);
    }

    #[test]
    fn test_null_never_matches_comparison() {
        let (_store, mut s) = seeded();
        let rows = s
            .query("SELECT * FROM items WHERE price > 0", &[])
            .unwrap();
        assert_eq!(rows.len(), 2);
    }

    #[test]
    fn test_count_wrapper() {
        let (_store, mut s) = seeded();
        let rows = s
            .query(
                "SELECT COUNT(*) AS count FROM (SELECT * FROM \"items\" WHERE \"name\" <> 'pear') AS t",
                &[],
            )
            .unwrap();
        assert_eq!(rows[0]["count"], json!(2));
    }

    #[test]
    fn test_update_and_delete() {
        let (store, mut s) = seeded();
        let updated = s
            .execute(
                "UPDATE \"items\" SET \"price\" = $1 WHERE \"id\" = $2",
                &[SqlValue::Float(9.5), SqlValue::Int(3)],
            )
            .unwrap();
        assert_eq!(updated, 1);
        assert_eq!(store.rows("items")[2]["price"], json!(9.5));

        let deleted = s.execute("DELETE FROM \"items\" WHERE TRUE", &[]).unwrap();
        assert_eq!(deleted, 3);
        assert_eq!(store.row_count("items"), Some(0));
    }

    #[test]
    fn test_unknown_table_is_backend_error() {
        let store = InMemorySqlStore::new();
        let err = session(&store)
            .execute("DELETE FROM \"nope\" WHERE TRUE", &[])
            .unwrap_err();
        assert!(err.to_string().contains("42P01"));
    }

    #[test]
    fn test_missing_parameter_is_rejected() {
        let (_store, mut s) = seeded();
        assert!(s.query("SELECT * FROM items WHERE id = $2", &[SqlValue::Int(1)]).is_err());
    }

    #[test]
    fn test_rollback_and_drop_restore_snapshot() {
        let (store, mut s) = seeded();
        s.begin().unwrap();
        s.execute("DELETE FROM items", &[]).unwrap();
        assert_eq!(store.open_transactions(), 1);
        s.rollback().unwrap();
        assert_eq!(store.row_count("items"), Some(3));

        s.begin().unwrap();
        s.execute("DELETE FROM items", &[]).unwrap();
        drop(s);
        assert_eq!(store.row_count("items"), Some(3));
        assert_eq!(store.open_transactions(), 0);
    }

    #[test]
    fn test_commit_keeps_changes() {
        let (store, mut s) = seeded();
        s.begin().unwrap();
        s.execute("DELETE FROM items WHERE id = 1", &[]).unwrap();
        s.commit().unwrap();
        drop(s);
        assert_eq!(store.row_count("items"), Some(2));
    }
}
