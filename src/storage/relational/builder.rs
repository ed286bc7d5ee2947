//! SQL statement builders.
//!
//! Identifiers are validated and double-quoted; values are always bound
//! through `$n` placeholders, never interpolated.

use super::session::{Record, SqlValue};
use crate::{Error, Result};
use once_cell::sync::Lazy;
use regex::{Captures, Regex};

/// Default page size when a caller passes zero.
pub const DEFAULT_PAGE_SIZE: usize = 20;

static IDENTIFIER_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^[A-Za-z_][A-Za-z0-9_]*$")
        .unwrap_or_else(|_| unreachable!("identifier pattern is valid"))
});

static PLACEHOLDER_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"\$(\d+)").unwrap_or_else(|_| unreachable!("placeholder pattern is valid"))
});

/// A statement and its bound parameters.
#[derive(Debug, Clone, PartialEq)]
pub struct Statement {
    /// SQL text with `$n` placeholders.
    pub sql: String,
    /// Parameters, `params[0]` binds `$1`.
    pub params: Vec<SqlValue>,
}

/// Quotes a possibly schema-qualified identifier (`schema.table`).
///
/// # Errors
///
/// Returns [`Error::InvalidInput`] if any part is not a plain identifier.
pub fn quote_identifier(name: &str) -> Result<String> {
    let parts = name
        .split('.')
        .map(|part| {
            if IDENTIFIER_RE.is_match(part) {
                Ok(format!("\"{part}\""))
            } else {
                Err(Error::InvalidInput(format!("invalid SQL identifier: '{name}'")))
            }
        })
        .collect::<Result<Vec<_>>>()?;
    Ok(parts.join("."))
}

fn placeholders(start: usize, count: usize) -> String {
    (start..start + count)
        .map(|n| format!("${n}"))
        .collect::<Vec<_>>()
        .join(", ")
}

fn quoted_columns<'a>(columns: impl Iterator<Item = &'a str>) -> Result<Vec<String>> {
    columns.map(quote_identifier).collect()
}

/// Builds a single-row `INSERT`.
///
/// # Errors
///
/// Returns [`Error::InvalidInput`] for an empty record or a bad identifier.
pub fn insert(table: &str, record: &Record) -> Result<Statement> {
    if record.is_empty() {
        return Err(Error::InvalidInput(format!(
            "insert into '{table}' needs at least one column"
        )));
    }
    let columns = quoted_columns(record.column_names())?;
    Ok(Statement {
        sql: format!(
            "INSERT INTO {} ({}) VALUES ({})",
            quote_identifier(table)?,
            columns.join(", "),
            placeholders(1, columns.len())
        ),
        params: record.values().cloned().collect(),
    })
}

/// Builds a multi-row `INSERT`.
///
/// The column list comes from the first record; a later record missing one of
/// those columns binds `NULL` for it, and columns only later records carry are
/// ignored. Returns `None` for an empty slice.
///
/// # Errors
///
/// Returns [`Error::InvalidInput`] for an empty first record or a bad
/// identifier.
pub fn insert_many(table: &str, records: &[Record]) -> Result<Option<Statement>> {
    let Some(first) = records.first() else {
        return Ok(None);
    };
    if first.is_empty() {
        return Err(Error::InvalidInput(format!(
            "insert into '{table}' needs at least one column"
        )));
    }

    let names: Vec<&str> = first.column_names().collect();
    let columns = quoted_columns(names.iter().copied())?;
    let mut params = Vec::with_capacity(names.len() * records.len());
    let mut tuples = Vec::with_capacity(records.len());
    for record in records {
        tuples.push(format!("({})", placeholders(params.len() + 1, names.len())));
        params.extend(
            names
                .iter()
                .map(|name| record.get(name).cloned().unwrap_or(SqlValue::Null)),
        );
    }

    Ok(Some(Statement {
        sql: format!(
            "INSERT INTO {} ({}) VALUES {}",
            quote_identifier(table)?,
            columns.join(", "),
            tuples.join(", ")
        ),
        params,
    }))
}

/// Builds an `UPDATE ... SET ... WHERE condition`.
///
/// `condition` numbers its own placeholders from `$1`; they are shifted past
/// the `SET` parameters.
///
/// # Errors
///
/// Returns [`Error::InvalidInput`] for an empty record, a blank condition or a
/// bad identifier.
pub fn update(
    table: &str,
    data: &Record,
    condition: &str,
    condition_params: &[SqlValue],
) -> Result<Statement> {
    if data.is_empty() {
        return Err(Error::InvalidInput(format!(
            "update of '{table}' needs at least one column"
        )));
    }
    if condition.trim().is_empty() {
        return Err(Error::InvalidInput(format!(
            "update of '{table}' needs a condition"
        )));
    }

    let assignments = data
        .column_names()
        .enumerate()
        .map(|(i, name)| Ok(format!("{} = ${}", quote_identifier(name)?, i + 1)))
        .collect::<Result<Vec<_>>>()?;
    let offset = data.len();
    let condition = shift_placeholders(condition, offset);

    let mut params: Vec<SqlValue> = data.values().cloned().collect();
    params.extend_from_slice(condition_params);
    Ok(Statement {
        sql: format!(
            "UPDATE {} SET {} WHERE {condition}",
            quote_identifier(table)?,
            assignments.join(", ")
        ),
        params,
    })
}

/// Builds a `DELETE`. A missing condition deletes every row.
///
/// # Errors
///
/// Returns [`Error::InvalidInput`] for a bad identifier.
pub fn delete(table: &str, condition: Option<&str>, params: &[SqlValue]) -> Result<Statement> {
    let condition = condition
        .map(str::trim)
        .filter(|c| !c.is_empty())
        .unwrap_or("TRUE");
    Ok(Statement {
        sql: format!("DELETE FROM {} WHERE {condition}", quote_identifier(table)?),
        params: params.to_vec(),
    })
}

/// Appends `LIMIT`/`OFFSET` for a 1-based page. Pages below one are treated
/// as the first page; a zero page size becomes [`DEFAULT_PAGE_SIZE`].
#[must_use]
pub fn paginate(sql: &str, page: i64, page_size: usize) -> String {
    let page_size = if page_size == 0 {
        DEFAULT_PAGE_SIZE
    } else {
        page_size
    };
    let page = usize::try_from(page.max(1)).unwrap_or(1);
    let offset = (page - 1).saturating_mul(page_size);
    format!("{} LIMIT {page_size} OFFSET {offset}", trim_statement(sql))
}

/// Wraps a query so it returns a single `count` column.
#[must_use]
pub fn count(sql: &str) -> String {
    format!(
        "SELECT COUNT(*) AS count FROM ({}) AS t",
        trim_statement(sql)
    )
}

fn trim_statement(sql: &str) -> &str {
    sql.trim().trim_end_matches(';').trim_end()
}

fn shift_placeholders(condition: &str, offset: usize) -> String {
    PLACEHOLDER_RE
        .replace_all(condition, |caps: &Captures<'_>| {
            caps[1].parse::<usize>().map_or_else(
                |_| caps[0].to_string(),
                |n| format!("${}", n + offset),
            )
        })
        .into_owned()
}
