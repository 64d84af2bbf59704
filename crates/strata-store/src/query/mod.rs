//! Typed queries over record types.
//!
//! Predicates are built from [`Column`]s obtained from a [`RecordType`]
//! and combined with [`Predicate::and`] / [`Predicate::or`]. A predicate that
//! compares columns of two types joins their tables. Every literal travels as
//! a positional parameter; compiled statement text never contains one.

mod compile;

use std::sync::Arc;

use chrono::{DateTime, Utc};

pub(crate) use compile::{Compiled, Mode, QueryShape, compile};

use crate::errors::Result;
use crate::item::Item;
use crate::record::{RecordType, TypeKey};
use crate::store::Store;
use crate::value::{FieldKind, Reference, Value};

/// A queryable column: a persisted field or the row identifier of a type.
#[derive(Clone, Debug, PartialEq)]
pub struct Column {
    pub(crate) key: TypeKey,
    /// `None` is the row identifier.
    pub(crate) field: Option<String>,
    pub(crate) kind: FieldKind,
}

/// Comparison operators.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CompareOp {
    /// `=`
    Eq,
    /// `!=`
    Ne,
    /// `<`
    Lt,
    /// `<=`
    Le,
    /// `>`
    Gt,
    /// `>=`
    Ge,
}

impl CompareOp {
    pub(crate) fn sql(self) -> &'static str {
        match self {
            Self::Eq => "=",
            Self::Ne => "!=",
            Self::Lt => "<",
            Self::Le => "<=",
            Self::Gt => ">",
            Self::Ge => ">=",
        }
    }
}

/// Right-hand side of a comparison.
#[derive(Clone, Debug, PartialEq)]
pub enum Operand {
    /// A literal, bound as a parameter.
    Value(Value),
    /// Another column, possibly of another type (implies a join).
    Column(Column),
}

macro_rules! operand_from_value {
    ($($ty:ty),+ $(,)?) => {
        $(
            impl From<$ty> for Operand {
                fn from(v: $ty) -> Self {
                    Self::Value(Value::from(v))
                }
            }
        )+
    };
}

operand_from_value!(Value, i64, i32, f64, bool, &str, String, Vec<u8>, DateTime<Utc>, Reference, &Item, Item);

impl From<Column> for Operand {
    fn from(c: Column) -> Self {
        Self::Column(c)
    }
}

impl From<&Column> for Operand {
    fn from(c: &Column) -> Self {
        Self::Column(c.clone())
    }
}

/// Boolean condition over one or more record types.
#[derive(Clone, Debug, PartialEq)]
pub enum Predicate {
    /// `column op operand`; comparing to null means `IS [NOT] NULL`.
    Compare {
        /// Left-hand column.
        column: Column,
        /// Operator.
        op: CompareOp,
        /// Right-hand side.
        operand: Operand,
    },
    /// `column [NOT] IN (values)`.
    In {
        /// Tested column.
        column: Column,
        /// Candidate values.
        values: Vec<Value>,
        /// `NOT IN` when set.
        negated: bool,
    },
    /// `column LIKE pattern`.
    Like {
        /// Tested column.
        column: Column,
        /// Pattern, or literal prefix when `prefix` is set.
        pattern: String,
        /// Match `pattern` literally as a prefix.
        prefix: bool,
    },
    /// All must hold; empty is true.
    And(Vec<Predicate>),
    /// Any must hold; empty is false.
    Or(Vec<Predicate>),
    /// Negation.
    Not(Box<Predicate>),
}

impl Predicate {
    /// Both conditions.
    #[must_use]
    pub fn and(self, other: Predicate) -> Predicate {
        match self {
            Self::And(mut parts) => {
                parts.push(other);
                Self::And(parts)
            }
            first => Self::And(vec![first, other]),
        }
    }

    /// Either condition.
    #[must_use]
    pub fn or(self, other: Predicate) -> Predicate {
        match self {
            Self::Or(mut parts) => {
                parts.push(other);
                Self::Or(parts)
            }
            first => Self::Or(vec![first, other]),
        }
    }

    /// Logical negation.
    #[must_use]
    pub fn negate(self) -> Predicate {
        Self::Not(Box::new(self))
    }

    /// Conjunction of every predicate in `parts`.
    pub fn all(parts: impl IntoIterator<Item = Predicate>) -> Predicate {
        Self::And(parts.into_iter().collect())
    }

    /// Disjunction of every predicate in `parts`.
    pub fn any(parts: impl IntoIterator<Item = Predicate>) -> Predicate {
        Self::Or(parts.into_iter().collect())
    }
}

impl Column {
    pub(crate) fn field(key: TypeKey, name: String, kind: FieldKind) -> Self {
        Self {
            key,
            field: Some(name),
            kind,
        }
    }

    pub(crate) fn id(key: TypeKey) -> Self {
        Self {
            key,
            field: None,
            kind: FieldKind::Integer,
        }
    }

    /// Type the column belongs to.
    pub fn key(&self) -> &TypeKey {
        &self.key
    }

    /// Field name, `None` for the row identifier.
    pub fn field_name(&self) -> Option<&str> {
        self.field.as_deref()
    }

    /// Fully qualified column expression.
    pub(crate) fn sql(&self) -> String {
        let table = self.key.table_name();
        match &self.field {
            Some(name) => format!("{table}.\"{name}\""),
            None => format!("{table}.oid"),
        }
    }

    fn compare(&self, op: CompareOp, operand: impl Into<Operand>) -> Predicate {
        Predicate::Compare {
            column: self.clone(),
            op,
            operand: operand.into(),
        }
    }

    /// `column = operand`
    pub fn eq(&self, operand: impl Into<Operand>) -> Predicate {
        self.compare(CompareOp::Eq, operand)
    }

    /// `column != operand`
    pub fn ne(&self, operand: impl Into<Operand>) -> Predicate {
        self.compare(CompareOp::Ne, operand)
    }

    /// `column < operand`
    pub fn lt(&self, operand: impl Into<Operand>) -> Predicate {
        self.compare(CompareOp::Lt, operand)
    }

    /// `column <= operand`
    pub fn le(&self, operand: impl Into<Operand>) -> Predicate {
        self.compare(CompareOp::Le, operand)
    }

    /// `column > operand`
    pub fn gt(&self, operand: impl Into<Operand>) -> Predicate {
        self.compare(CompareOp::Gt, operand)
    }

    /// `column >= operand`
    pub fn ge(&self, operand: impl Into<Operand>) -> Predicate {
        self.compare(CompareOp::Ge, operand)
    }

    /// `column IS NULL`
    pub fn is_null(&self) -> Predicate {
        self.eq(Value::Null)
    }

    /// `column IS NOT NULL`
    pub fn is_not_null(&self) -> Predicate {
        self.ne(Value::Null)
    }

    /// `column IN (values)`; an empty list matches nothing.
    pub fn is_in<V: Into<Value>>(&self, values: impl IntoIterator<Item = V>) -> Predicate {
        Predicate::In {
            column: self.clone(),
            values: values.into_iter().map(Into::into).collect(),
            negated: false,
        }
    }

    /// `column NOT IN (values)`; an empty list matches everything.
    pub fn not_in<V: Into<Value>>(&self, values: impl IntoIterator<Item = V>) -> Predicate {
        Predicate::In {
            column: self.clone(),
            values: values.into_iter().map(Into::into).collect(),
            negated: true,
        }
    }

    /// `column LIKE pattern` with the backend's `%` and `_` wildcards.
    pub fn like(&self, pattern: impl Into<String>) -> Predicate {
        Predicate::Like {
            column: self.clone(),
            pattern: pattern.into(),
            prefix: false,
        }
    }

    /// Text starting with `prefix`, taken literally.
    pub fn starts_with(&self, prefix: impl Into<String>) -> Predicate {
        Predicate::Like {
            column: self.clone(),
            pattern: prefix.into(),
            prefix: true,
        }
    }

    /// Ascending sort on this column.
    pub fn ascending(&self) -> Sort {
        Sort {
            column: self.clone(),
            direction: Direction::Asc,
        }
    }

    /// Descending sort on this column.
    pub fn descending(&self) -> Sort {
        Sort {
            column: self.clone(),
            direction: Direction::Desc,
        }
    }
}

/// Sort direction.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Direction {
    /// Smallest first.
    Asc,
    /// Largest first.
    Desc,
}

/// One `ORDER BY` term.
#[derive(Clone, Debug, PartialEq)]
pub struct Sort {
    /// Sorted column.
    pub column: Column,
    /// Direction.
    pub direction: Direction,
}

/// A lazily executed query for items of one type.
///
/// Nothing touches the database until a terminal method
/// ([`items`](Self::items), [`count`](Self::count), ...) runs. Pending
/// changes of the open transaction are written first, so results always
/// reflect in-memory state.
#[derive(Clone, Debug)]
pub struct Query {
    store: Store,
    shape: QueryShape,
}

impl Query {
    pub(crate) fn new(store: Store, target: Arc<RecordType>) -> Self {
        Self {
            store,
            shape: QueryShape {
                target,
                predicate: None,
                sort: Vec::new(),
                limit: None,
                offset: None,
                distinct: false,
            },
        }
    }

    /// Add a condition; successive filters are combined with AND.
    #[must_use]
    pub fn filter(mut self, predicate: Predicate) -> Self {
        self.shape.predicate = Some(match self.shape.predicate.take() {
            Some(existing) => existing.and(predicate),
            None => predicate,
        });
        self
    }

    /// Append a sort term.
    #[must_use]
    pub fn sort(mut self, sort: Sort) -> Self {
        self.shape.sort.push(sort);
        self
    }

    /// Return at most `n` rows.
    #[must_use]
    pub fn limit(mut self, n: u64) -> Self {
        self.shape.limit = Some(n);
        self
    }

    /// Skip the first `n` rows.
    #[must_use]
    pub fn offset(mut self, n: u64) -> Self {
        self.shape.offset = Some(n);
        self
    }

    /// Collapse duplicate target rows produced by joins, or duplicate values
    /// for [`values`](Self::values).
    #[must_use]
    pub fn distinct(mut self) -> Self {
        self.shape.distinct = true;
        self
    }

    /// Every matching item.
    pub fn items(&self) -> Result<Vec<Item>> {
        self.store.query_items(&self.shape)
    }

    /// First matching item, honoring the sort order.
    pub fn first(&self) -> Result<Option<Item>> {
        let mut shape = self.shape.clone();
        shape.limit = Some(1);
        Ok(self.store.query_items(&shape)?.into_iter().next())
    }

    /// The single matching item; `None` when nothing matches, an error when
    /// more than one does.
    pub fn unique(&self) -> Result<Option<Item>> {
        let mut shape = self.shape.clone();
        shape.limit = Some(2);
        let mut found = self.store.query_items(&shape)?;
        if found.len() > 1 {
            return Err(crate::StoreError::InvalidOperation(format!(
                "expected at most one {} item, found several",
                self.shape.target.name()
            )));
        }
        Ok(found.pop())
    }

    /// Number of matching rows.
    pub fn count(&self) -> Result<u64> {
        self.store.query_count(&self.shape)
    }

    /// Sum of an integer or real column over matching rows; zero when
    /// nothing matches.
    pub fn sum(&self, column: &Column) -> Result<Value> {
        self.store.query_sum(&self.shape, column)
    }

    /// Values of one column for every matching row. With
    /// [`distinct`](Self::distinct), each value appears once.
    pub fn values(&self, column: &Column) -> Result<Vec<Value>> {
        self.store.query_values(&self.shape, column)
    }

    /// Delete every matching item, applying delete policies. Returns how
    /// many were deleted.
    pub fn delete_all(&self) -> Result<usize> {
        self.store.transact(|| {
            let doomed = self.items()?;
            for item in &doomed {
                if item.is_live() {
                    item.delete()?;
                }
            }
            Ok(doomed.len())
        })
    }
}
