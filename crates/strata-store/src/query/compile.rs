//! Query compilation to parameterized SQL.

use std::sync::Arc;

use rusqlite::types::Value as SqlValue;

use super::{Column, CompareOp, Direction, Operand, Predicate, Sort};
use crate::errors::{Result, StoreError};
use crate::record::{RecordType, TypeKey};
use crate::sqlite::row_helpers::escape_like;
use crate::value::{FieldKind, StoreId, Value};

/// Everything a query says, independent of how its result is consumed.
#[derive(Clone, Debug)]
pub(crate) struct QueryShape {
    pub(crate) target: Arc<RecordType>,
    pub(crate) predicate: Option<Predicate>,
    pub(crate) sort: Vec<Sort>,
    pub(crate) limit: Option<u64>,
    pub(crate) offset: Option<u64>,
    pub(crate) distinct: bool,
}

/// Result form requested from the compiler.
#[derive(Clone, Copy, Debug)]
pub(crate) enum Mode<'a> {
    /// `oid` plus every persisted column of the target.
    Items,
    /// One row holding the number of matches.
    Count,
    /// One row holding the sum of a column (null when nothing matched).
    Sum(&'a Column),
    /// `oid` plus one column per matching row.
    Values(&'a Column),
}

#[derive(Debug)]
pub(crate) struct Compiled {
    pub(crate) sql: String,
    pub(crate) params: Vec<SqlValue>,
    /// Every table the statement reads, target first.
    pub(crate) tables: Vec<TypeKey>,
}

/// Compile `shape` for `mode`. References in literals must belong to `store`.
pub(crate) fn compile(shape: &QueryShape, mode: Mode<'_>, store: StoreId) -> Result<Compiled> {
    let target = shape.target.key();
    let mut c = Compiler {
        store,
        tables: vec![target.clone()],
        params: Vec::new(),
    };

    let where_clause = match &shape.predicate {
        Some(p) => format!(" WHERE {}", c.predicate(p)?),
        None => String::new(),
    };
    let order_clause = c.order_by(&shape.sort);
    let id = format!("{}.oid", target.table_name());

    let sql = match mode {
        Mode::Items => {
            let mut columns = vec![id];
            columns.extend(
                shape
                    .target
                    .persisted_fields()
                    .map(|f| format!("{}.\"{}\"", target.table_name(), f.name)),
            );
            let head = format!("SELECT {}{}", distinct(shape), columns.join(", "));
            let from = c.from();
            let tail = c.window(shape);
            format!("{head} FROM {from}{where_clause}{order_clause}{tail}")
        }
        Mode::Values(column) => {
            c.note_table(&column.key);
            let head = format!("SELECT {}{}", distinct(shape), column.sql());
            let from = c.from();
            let tail = c.window(shape);
            format!("{head} FROM {from}{where_clause}{order_clause}{tail}")
        }
        Mode::Count => {
            let from = c.from();
            if shape.distinct {
                format!("SELECT COUNT(DISTINCT {id}) FROM {from}{where_clause}")
            } else {
                format!("SELECT COUNT(*) FROM {from}{where_clause}")
            }
        }
        Mode::Sum(column) => {
            if column.field.is_some() && !matches!(column.kind, FieldKind::Integer | FieldKind::Real) {
                return Err(StoreError::InvalidOperation(format!(
                    "cannot sum {} column {}",
                    column.kind,
                    column.sql()
                )));
            }
            c.note_table(&column.key);
            let from = c.from();
            if shape.distinct {
                format!(
                    "SELECT SUM(v) FROM (SELECT DISTINCT {id}, {} AS v FROM {from}{where_clause})",
                    column.sql()
                )
            } else {
                format!("SELECT SUM({}) FROM {from}{where_clause}", column.sql())
            }
        }
    };

    Ok(Compiled {
        sql,
        params: c.params,
        tables: c.tables,
    })
}

fn distinct(shape: &QueryShape) -> &'static str {
    if shape.distinct { "DISTINCT " } else { "" }
}

struct Compiler {
    store: StoreId,
    tables: Vec<TypeKey>,
    params: Vec<SqlValue>,
}

impl Compiler {
    fn note_table(&mut self, key: &TypeKey) {
        if !self.tables.contains(key) {
            self.tables.push(key.clone());
        }
    }

    fn from(&self) -> String {
        self.tables
            .iter()
            .map(TypeKey::table_name)
            .collect::<Vec<_>>()
            .join(", ")
    }

    fn predicate(&mut self, predicate: &Predicate) -> Result<String> {
        Ok(match predicate {
            Predicate::Compare {
                column,
                op,
                operand,
            } => {
                self.note_table(&column.key);
                match operand {
                    Operand::Value(Value::Null) => match op {
                        CompareOp::Eq => format!("{} IS NULL", column.sql()),
                        CompareOp::Ne => format!("{} IS NOT NULL", column.sql()),
                        _ => {
                            return Err(StoreError::InvalidOperation(format!(
                                "{} cannot be ordered against null",
                                column.sql()
                            )));
                        }
                    },
                    Operand::Value(value) => {
                        self.bind(column, value)?;
                        format!("{} {} ?", column.sql(), op.sql())
                    }
                    Operand::Column(other) => {
                        self.note_table(&other.key);
                        format!("{} {} {}", column.sql(), op.sql(), other.sql())
                    }
                }
            }
            Predicate::In {
                column,
                values,
                negated,
            } => {
                self.note_table(&column.key);
                if values.is_empty() {
                    return Ok(if *negated { "1" } else { "0" }.to_string());
                }
                for value in values {
                    if value.is_null() {
                        return Err(StoreError::InvalidOperation(format!(
                            "null in IN list for {}",
                            column.sql()
                        )));
                    }
                    self.bind(column, value)?;
                }
                let marks = vec!["?"; values.len()].join(", ");
                let not = if *negated { "NOT " } else { "" };
                format!("{} {not}IN ({marks})", column.sql())
            }
            Predicate::Like {
                column,
                pattern,
                prefix,
            } => {
                self.note_table(&column.key);
                if !matches!(column.kind, FieldKind::Text | FieldKind::Path) || column.field.is_none() {
                    return Err(StoreError::InvalidOperation(format!(
                        "LIKE on non-text column {}",
                        column.sql()
                    )));
                }
                if *prefix {
                    self.params.push(SqlValue::Text(format!("{}%", escape_like(pattern))));
                    self.params.push(SqlValue::Text("\\".to_string()));
                    format!("{} LIKE ? ESCAPE ?", column.sql())
                } else {
                    self.params.push(SqlValue::Text(pattern.clone()));
                    format!("{} LIKE ?", column.sql())
                }
            }
            Predicate::And(parts) => self.junction(parts, " AND ", "1")?,
            Predicate::Or(parts) => self.junction(parts, " OR ", "0")?,
            Predicate::Not(inner) => format!("(NOT {})", self.predicate(inner)?),
        })
    }

    fn junction(&mut self, parts: &[Predicate], joiner: &str, empty: &str) -> Result<String> {
        if parts.is_empty() {
            return Ok(empty.to_string());
        }
        let compiled = parts
            .iter()
            .map(|p| self.predicate(p))
            .collect::<Result<Vec<_>>>()?;
        Ok(format!("({})", compiled.join(joiner)))
    }

    /// Bind a literal compared against `column`, checking kind and owner.
    fn bind(&mut self, column: &Column, value: &Value) -> Result<()> {
        let name = column.field.as_deref().unwrap_or("oid");
        match (value, &column.field) {
            (Value::Reference(r), _) if r.store != self.store => {
                return Err(StoreError::NoCrossStoreReference {
                    field: name.to_string(),
                });
            }
            // Row identifiers compare against integers or item references.
            (Value::Reference(_) | Value::Integer(_), None) => {}
            (_, None) => value.check_kind(name, FieldKind::Integer)?,
            (_, Some(_)) => value.check_kind(name, column.kind)?,
        }
        self.params.push(value.to_sql());
        Ok(())
    }

    fn order_by(&mut self, sort: &[Sort]) -> String {
        if sort.is_empty() {
            return String::new();
        }
        let terms: Vec<String> = sort
            .iter()
            .map(|s| {
                self.note_table(&s.column.key);
                let dir = match s.direction {
                    Direction::Asc => "ASC",
                    Direction::Desc => "DESC",
                };
                format!("{} {dir}", s.column.sql())
            })
            .collect();
        format!(" ORDER BY {}", terms.join(", "))
    }

    /// `LIMIT`/`OFFSET` tail; the backend needs a limit before an offset.
    fn window(&mut self, shape: &QueryShape) -> String {
        match (shape.limit, shape.offset) {
            (None, None) => String::new(),
            (limit, offset) => {
                let limit = limit.map_or(-1, |n| i64::try_from(n).unwrap_or(i64::MAX));
                self.params.push(SqlValue::Integer(limit));
                match offset {
                    Some(n) => {
                        self.params.push(SqlValue::Integer(i64::try_from(n).unwrap_or(i64::MAX)));
                        " LIMIT ? OFFSET ?".to_string()
                    }
                    None => " LIMIT ?".to_string(),
                }
            }
        }
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────────────────
