//! Relational session contract and value types.

use crate::Result;
use serde_json::{Map, Value};
use std::fmt;

/// A result row: column name to JSON value, in select order.
pub type Row = Map<String, Value>;

/// A bound statement parameter.
#[derive(Debug, Clone, PartialEq)]
pub enum SqlValue {
    /// SQL `NULL`.
    Null,
    /// Boolean.
    Bool(bool),
    /// Any integer column.
    Int(i64),
    /// Any floating-point column.
    Float(f64),
    /// Text.
    Text(String),
    /// A JSON document.
    Json(Value),
}

impl SqlValue {
    /// Returns `true` for [`SqlValue::Null`].
    #[must_use]
    pub const fn is_null(&self) -> bool {
        matches!(self, Self::Null)
    }

    /// Converts the value into its JSON row representation.
    #[must_use]
    pub fn to_json(&self) -> Value {
        match self {
            Self::Null => Value::Null,
            Self::Bool(b) => Value::Bool(*b),
            Self::Int(i) => Value::from(*i),
            Self::Float(f) => Value::from(*f),
            Self::Text(s) => Value::String(s.clone()),
            Self::Json(v) => v.clone(),
        }
    }
}

impl fmt::Display for SqlValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Null => write!(f, "NULL"),
            Self::Bool(b) => write!(f, "{b}"),
            Self::Int(i) => write!(f, "{i}"),
            Self::Float(x) => write!(f, "{x}"),
            Self::Text(s) => write!(f, "'{}'", s.replace('\'', "''")),
            Self::Json(v) => write!(f, "'{v}'"),
        }
    }
}

macro_rules! sql_value_from {
    ($variant:ident: $($ty:ty),+) => {
        $(
            impl From<$ty> for SqlValue {
                fn from(value: $ty) -> Self {
                    Self::$variant(value.into())
                }
            }
        )+
    };
}

sql_value_from!(Bool: bool);
sql_value_from!(Int: i8, i16, i32, i64, u8, u16, u32);
sql_value_from!(Float: f32, f64);
sql_value_from!(Text: String, &str);
sql_value_from!(Json: Value);

impl<T: Into<Self>> From<Option<T>> for SqlValue {
    fn from(value: Option<T>) -> Self {
        value.map_or(Self::Null, Into::into)
    }
}

/// Column to value mapping for insert and update statements.
///
/// Keeps insertion order so generated column lists are deterministic.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Record {
    columns: Vec<(String, SqlValue)>,
}

impl Record {
    /// Creates an empty record.
    #[must_use]
    pub const fn new() -> Self {
        Self {
            columns: Vec::new(),
        }
    }

    /// Adds or replaces a column (builder style).
    #[must_use]
    pub fn with(mut self, column: impl Into<String>, value: impl Into<SqlValue>) -> Self {
        self.set(column, value);
        self
    }

    /// Adds or replaces a column.
    pub fn set(&mut self, column: impl Into<String>, value: impl Into<SqlValue>) {
        let column = column.into();
        let value = value.into();
        if let Some(slot) = self.columns.iter_mut().find(|(name, _)| *name == column) {
            slot.1 = value;
        } else {
            self.columns.push((column, value));
        }
    }

    /// Returns the value bound to a column.
    #[must_use]
    pub fn get(&self, column: &str) -> Option<&SqlValue> {
        self.columns
            .iter()
            .find(|(name, _)| name == column)
            .map(|(_, value)| value)
    }

    /// Column names in insertion order.
    pub fn column_names(&self) -> impl Iterator<Item = &str> {
        self.columns.iter().map(|(name, _)| name.as_str())
    }

    /// Values in insertion order.
    pub fn values(&self) -> impl Iterator<Item = &SqlValue> {
        self.columns.iter().map(|(_, value)| value)
    }

    /// Number of columns.
    #[must_use]
    pub fn len(&self) -> usize {
        self.columns.len()
    }

    /// Returns `true` if no column is set.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.columns.is_empty()
    }
}

impl<K, V> FromIterator<(K, V)> for Record
where
    K: Into<String>,
    V: Into<SqlValue>,
{
    fn from_iter<I: IntoIterator<Item = (K, V)>>(iter: I) -> Self {
        let mut record = Self::new();
        for (column, value) in iter {
            record.set(column, value);
        }
        record
    }
}

/// Operations the relational client needs from a live connection.
///
/// Statements use `$n` positional placeholders. Transactions are explicit:
/// the client brackets writes with [`begin`](Self::begin) and
/// [`commit`](Self::commit) or [`rollback`](Self::rollback).
pub trait SqlSession: Send {
    /// Cheap round trip (`SELECT 1`).
    ///
    /// # Errors
    ///
    /// Returns an error if the connection is unusable.
    fn ping(&mut self) -> Result<()>;

    /// Runs a statement and returns the affected row count.
    ///
    /// # Errors
    ///
    /// Returns an error if the statement fails.
    fn execute(&mut self, sql: &str, params: &[SqlValue]) -> Result<u64>;

    /// Runs a query and returns every row.
    ///
    /// # Errors
    ///
    /// Returns an error if the query fails.
    fn query(&mut self, sql: &str, params: &[SqlValue]) -> Result<Vec<Row>>;

    /// Opens a transaction.
    ///
    /// # Errors
    ///
    /// Returns an error if the backend refuses.
    fn begin(&mut self) -> Result<()>;

    /// Commits the open transaction.
    ///
    /// # Errors
    ///
    /// Returns an error if the commit fails.
    fn commit(&mut self) -> Result<()>;

    /// Rolls back the open transaction.
    ///
    /// # Errors
    ///
    /// Returns an error if the rollback fails.
    fn rollback(&mut self) -> Result<()>;
}
