use rusqlite::types::Value as SqlValue;

use crate::errors::{Result, StoreError};

/// Reject statement templates carrying quoted literals; values must travel
/// as positional parameters.
pub(crate) fn check_template(sql: &str) -> Result<()> {
    if sql.contains('\'') {
        return Err(StoreError::UnsafeStatement(sql.to_string()));
    }
    Ok(())
}

/// Integer column of a result row, returning `CorruptRow` on failure.
pub(crate) fn int_at(row: &[SqlValue], idx: usize, table: &str, column: &'static str) -> Result<i64> {
    match row.get(idx) {
        Some(SqlValue::Integer(v)) => Ok(*v),
        other => Err(StoreError::CorruptRow {
            table: table.to_string(),
            column,
            detail: format!("expected integer, got {other:?}"),
        }),
    }
}

/// Text column of a result row, returning `CorruptRow` on failure.
pub(crate) fn text_at(row: &[SqlValue], idx: usize, table: &str, column: &'static str) -> Result<String> {
    match row.get(idx) {
        Some(SqlValue::Text(v)) => Ok(v.clone()),
        other => Err(StoreError::CorruptRow {
            table: table.to_string(),
            column,
            detail: format!("expected text, got {other:?}"),
        }),
    }
}

/// Parse a string into an enum, returning `CorruptRow` on failure.
pub(crate) fn parse_enum<T: std::str::FromStr>(raw: &str, table: &str, column: &'static str) -> Result<T> {
    raw.parse().map_err(|_| StoreError::CorruptRow {
        table: table.to_string(),
        column,
        detail: format!("unknown variant: {raw}"),
    })
}

/// Escape LIKE special characters for safe pattern matching.
pub(crate) fn escape_like(s: &str) -> String {
    s.replace('\\', "\\\\")
        .replace('%', "\\%")
        .replace('_', "\\_")
}
