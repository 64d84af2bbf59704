//! Field kinds and in-memory field values.
//!
//! Every persisted kind maps onto one backend column type. Timestamps are
//! stored as integer microseconds since the Unix epoch, booleans as 0/1 and
//! references as the target's row identifier.

use std::collections::BTreeMap;
use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use rusqlite::types::Value as SqlValue;
use serde::{Deserialize, Serialize};

use crate::errors::{Result, StoreError};

/// Field values keyed by field name.
pub type Values = BTreeMap<String, Value>;

/// Row identifier reserved for the store itself.
pub const STORE_ID: i64 = -1;

/// Unique identity of one opened [`Store`](crate::Store) in this process.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct StoreId(pub(crate) u64);

/// Semantic kind of a field.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FieldKind {
    /// Signed 64-bit integer.
    Integer,
    /// IEEE double.
    Real,
    /// UTF-8 text.
    Text,
    /// Raw bytes.
    Bytes,
    /// Boolean.
    Boolean,
    /// UTC timestamp with microsecond precision.
    Timestamp,
    /// Reference to another item in the same store (or the store itself).
    Reference,
    /// Filesystem path to an attachment.
    Path,
    /// Kept in memory only, never persisted.
    Transient,
}

impl FieldKind {
    /// Backend column type, `None` for transient fields.
    pub fn sql_type(self) -> Option<&'static str> {
        match self {
            Self::Integer | Self::Timestamp | Self::Reference => Some("INTEGER"),
            Self::Real => Some("REAL"),
            Self::Text | Self::Path => Some("TEXT"),
            Self::Bytes => Some("BLOB"),
            Self::Boolean => Some("BOOLEAN"),
            Self::Transient => None,
        }
    }

    /// Tag stored in the attribute catalog.
    pub fn tag(self) -> &'static str {
        match self {
            Self::Integer => "integer",
            Self::Real => "real",
            Self::Text => "text",
            Self::Bytes => "bytes",
            Self::Boolean => "boolean",
            Self::Timestamp => "timestamp",
            Self::Reference => "reference",
            Self::Path => "path",
            Self::Transient => "transient",
        }
    }

    /// Whether values of this kind live in a table column.
    pub fn is_persisted(self) -> bool {
        self != Self::Transient
    }
}

impl fmt::Display for FieldKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.tag())
    }
}

impl FromStr for FieldKind {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        Ok(match s {
            "integer" => Self::Integer,
            "real" => Self::Real,
            "text" => Self::Text,
            "bytes" => Self::Bytes,
            "boolean" => Self::Boolean,
            "timestamp" => Self::Timestamp,
            "reference" => Self::Reference,
            "path" => Self::Path,
            "transient" => Self::Transient,
            other => return Err(format!("unknown field kind: {other}")),
        })
    }
}

/// Target of a reference value.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Reference {
    pub(crate) store: StoreId,
    pub(crate) id: i64,
}

impl Reference {
    /// Row identifier of the target ([`STORE_ID`] for the store itself).
    pub fn id(&self) -> i64 {
        self.id
    }

    /// Whether this reference names the store rather than an item.
    pub fn is_store(&self) -> bool {
        self.id == STORE_ID
    }
}

/// A single field value.
#[derive(Clone, Debug, PartialEq)]
pub enum Value {
    /// Absent value.
    Null,
    /// Integer value.
    Integer(i64),
    /// Floating point value.
    Real(f64),
    /// Text value.
    Text(String),
    /// Byte string.
    Bytes(Vec<u8>),
    /// Boolean value.
    Boolean(bool),
    /// Timestamp value.
    Timestamp(DateTime<Utc>),
    /// Reference to an item or the store.
    Reference(Reference),
    /// Filesystem path.
    Path(PathBuf),
}

impl Value {
    /// Whether this is [`Value::Null`].
    pub fn is_null(&self) -> bool {
        matches!(self, Self::Null)
    }

    /// Integer payload, if any.
    pub fn as_i64(&self) -> Option<i64> {
        match self {
            Self::Integer(v) => Some(*v),
            _ => None,
        }
    }

    /// Float payload, if any.
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Self::Real(v) => Some(*v),
            _ => None,
        }
    }

    /// Text payload, if any.
    pub fn as_str(&self) -> Option<&str> {
        match self {
            Self::Text(v) => Some(v),
            _ => None,
        }
    }

    /// Boolean payload, if any.
    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Self::Boolean(v) => Some(*v),
            _ => None,
        }
    }

    /// Timestamp payload, if any.
    pub fn as_timestamp(&self) -> Option<DateTime<Utc>> {
        match self {
            Self::Timestamp(v) => Some(*v),
            _ => None,
        }
    }

    /// Reference payload, if any.
    pub fn as_reference(&self) -> Option<Reference> {
        match self {
            Self::Reference(v) => Some(*v),
            _ => None,
        }
    }

    /// Kind this value naturally belongs to, `None` for null.
    pub fn natural_kind(&self) -> Option<FieldKind> {
        Some(match self {
            Self::Null => return None,
            Self::Integer(_) => FieldKind::Integer,
            Self::Real(_) => FieldKind::Real,
            Self::Text(_) => FieldKind::Text,
            Self::Bytes(_) => FieldKind::Bytes,
            Self::Boolean(_) => FieldKind::Boolean,
            Self::Timestamp(_) => FieldKind::Timestamp,
            Self::Reference(_) => FieldKind::Reference,
            Self::Path(_) => FieldKind::Path,
        })
    }

    /// Check that this value may be stored in a field of `kind`.
    ///
    /// Transient fields accept anything.
    pub(crate) fn check_kind(&self, field: &str, kind: FieldKind) -> Result<()> {
        match self.natural_kind() {
            None => Ok(()),
            Some(_) if kind == FieldKind::Transient => Ok(()),
            Some(actual) if actual == kind => Ok(()),
            Some(actual) => Err(StoreError::InvalidValue {
                field: field.to_string(),
                detail: format!("expected {kind}, got {actual}"),
            }),
        }
    }

    /// Backend representation used as a statement parameter.
    pub(crate) fn to_sql(&self) -> SqlValue {
        match self {
            Self::Null => SqlValue::Null,
            Self::Integer(v) => SqlValue::Integer(*v),
            Self::Real(v) => SqlValue::Real(*v),
            Self::Text(v) => SqlValue::Text(v.clone()),
            Self::Bytes(v) => SqlValue::Blob(v.clone()),
            Self::Boolean(v) => SqlValue::Integer(i64::from(*v)),
            Self::Timestamp(v) => SqlValue::Integer(v.timestamp_micros()),
            Self::Reference(r) => SqlValue::Integer(r.id),
            Self::Path(p) => SqlValue::Text(p.to_string_lossy().into_owned()),
        }
    }

    /// Decode a backend value for a field of `kind` owned by store `store`.
    pub(crate) fn from_sql(raw: SqlValue, kind: FieldKind, store: StoreId, field: &str) -> Result<Self> {
        let corrupt = |detail: String| StoreError::InvalidValue {
            field: field.to_string(),
            detail,
        };
        Ok(match (kind, raw) {
            (_, SqlValue::Null) => Self::Null,
            (FieldKind::Integer, SqlValue::Integer(v)) => Self::Integer(v),
            (FieldKind::Real, SqlValue::Real(v)) => Self::Real(v),
            (FieldKind::Real, SqlValue::Integer(v)) => Self::Real(v as f64),
            (FieldKind::Text, SqlValue::Text(v)) => Self::Text(v),
            (FieldKind::Bytes, SqlValue::Blob(v)) => Self::Bytes(v),
            (FieldKind::Boolean, SqlValue::Integer(v)) => Self::Boolean(v != 0),
            (FieldKind::Timestamp, SqlValue::Integer(v)) => Self::Timestamp(
                DateTime::from_timestamp_micros(v)
                    .ok_or_else(|| corrupt(format!("timestamp out of range: {v}")))?,
            ),
            (FieldKind::Reference, SqlValue::Integer(id)) => Self::Reference(Reference { store, id }),
            (FieldKind::Path, SqlValue::Text(v)) => Self::Path(PathBuf::from(v)),
            (kind, raw) => {
                return Err(corrupt(format!(
                    "column holds {:?} for a {kind} field",
                    raw.data_type()
                )));
            }
        })
    }
}

impl From<i64> for Value {
    fn from(v: i64) -> Self {
        Self::Integer(v)
    }
}

impl From<i32> for Value {
    fn from(v: i32) -> Self {
        Self::Integer(i64::from(v))
    }
}

impl From<f64> for Value {
    fn from(v: f64) -> Self {
        Self::Real(v)
    }
}

impl From<bool> for Value {
    fn from(v: bool) -> Self {
        Self::Boolean(v)
    }
}

impl From<&str> for Value {
    fn from(v: &str) -> Self {
        Self::Text(v.to_string())
    }
}

impl From<String> for Value {
    fn from(v: String) -> Self {
        Self::Text(v)
    }
}

impl From<Vec<u8>> for Value {
    fn from(v: Vec<u8>) -> Self {
        Self::Bytes(v)
    }
}

impl From<DateTime<Utc>> for Value {
    fn from(v: DateTime<Utc>) -> Self {
        Self::Timestamp(v)
    }
}

impl From<PathBuf> for Value {
    fn from(v: PathBuf) -> Self {
        Self::Path(v)
    }
}

impl From<Reference> for Value {
    fn from(v: Reference) -> Self {
        Self::Reference(v)
    }
}

impl<T: Into<Value>> From<Option<T>> for Value {
    fn from(v: Option<T>) -> Self {
        v.map_or(Self::Null, Into::into)
    }
}

/// Build a [`Values`] map from `name => value` pairs.
///
/// ```ignore
/// let v = values! { "a" => 42, "b" => "hello" };
/// ```
#[macro_export]
macro_rules! values {
    () => {
        $crate::Values::new()
    };
    ($($name:expr => $value:expr),+ $(,)?) => {{
        let mut map = $crate::Values::new();
        $(
            let _ = map.insert(::std::string::String::from($name), $crate::Value::from($value));
        )+
        map
    }};
}

// ─────────────────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────────────────
