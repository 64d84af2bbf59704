//! Record type descriptors.
//!
//! A [`RecordType`] is an immutable `(name, version, fields)` triple plus
//! optional lifecycle hooks. Types are built with [`RecordType::builder`] and
//! registered in a [`Registry`](crate::Registry) before any store is opened.

use std::collections::HashSet;
use std::fmt;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::errors::{Result, StoreError};
use crate::item::Item;
use crate::query::Column;
use crate::value::{FieldKind, Value, Values};

/// What happens to dependents when a referenced item is deleted.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DeletePolicy {
    /// Dependents keep existing; their reference becomes null.
    #[default]
    Nullify,
    /// Dependents are deleted too.
    Cascade,
    /// The delete is rejected while any dependent exists.
    Disallow,
}

/// `(name, version)` pair identifying one on-disk layout.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TypeKey {
    /// Type name.
    pub name: String,
    /// Type version.
    pub version: u32,
}

impl TypeKey {
    /// Build a key.
    pub fn new(name: impl Into<String>, version: u32) -> Self {
        Self {
            name: name.into(),
            version,
        }
    }

    /// Name of the backing data table.
    pub fn table_name(&self) -> String {
        format!("item_{}_v{}", self.name.to_lowercase(), self.version)
    }
}

impl fmt::Display for TypeKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} v{}", self.name, self.version)
    }
}

/// Descriptor of one field.
#[derive(Clone, Debug, PartialEq)]
pub struct FieldDescriptor {
    /// Field (and column) name.
    pub name: String,
    /// Semantic kind.
    pub kind: FieldKind,
    /// Value used when construction does not supply one.
    pub default: Value,
    /// Whether null is an acceptable value.
    pub nullable: bool,
    /// Whether the column gets its own index.
    pub indexed: bool,
    /// Delete policy, meaningful for reference fields only.
    pub on_delete: DeletePolicy,
    /// Free-form documentation, persisted in the attribute catalog.
    pub doc: String,
}

impl FieldDescriptor {
    /// Descriptor of the given kind with no default.
    pub fn new(name: impl Into<String>, kind: FieldKind) -> Self {
        Self {
            name: name.into(),
            kind,
            default: Value::Null,
            nullable: true,
            indexed: false,
            on_delete: DeletePolicy::default(),
            doc: String::new(),
        }
    }

    /// Integer field.
    pub fn integer(name: impl Into<String>) -> Self {
        Self::new(name, FieldKind::Integer)
    }

    /// Floating point field.
    pub fn real(name: impl Into<String>) -> Self {
        Self::new(name, FieldKind::Real)
    }

    /// Text field.
    pub fn text(name: impl Into<String>) -> Self {
        Self::new(name, FieldKind::Text)
    }

    /// Bytes field.
    pub fn bytes(name: impl Into<String>) -> Self {
        Self::new(name, FieldKind::Bytes)
    }

    /// Boolean field.
    pub fn boolean(name: impl Into<String>) -> Self {
        Self::new(name, FieldKind::Boolean)
    }

    /// Timestamp field.
    pub fn timestamp(name: impl Into<String>) -> Self {
        Self::new(name, FieldKind::Timestamp)
    }

    /// Reference field.
    pub fn reference(name: impl Into<String>) -> Self {
        Self::new(name, FieldKind::Reference)
    }

    /// Attachment path field.
    pub fn path(name: impl Into<String>) -> Self {
        Self::new(name, FieldKind::Path)
    }

    /// In-memory-only field.
    pub fn transient(name: impl Into<String>) -> Self {
        Self::new(name, FieldKind::Transient)
    }

    /// Set the default value.
    #[must_use]
    pub fn default_value(mut self, value: impl Into<Value>) -> Self {
        self.default = value.into();
        self
    }

    /// Reject null values.
    #[must_use]
    pub fn not_null(mut self) -> Self {
        self.nullable = false;
        self
    }

    /// Create an index on this column.
    #[must_use]
    pub fn indexed(mut self) -> Self {
        self.indexed = true;
        self
    }

    /// Set the delete policy of a reference field.
    #[must_use]
    pub fn on_delete(mut self, policy: DeletePolicy) -> Self {
        self.on_delete = policy;
        self
    }

    /// Attach documentation.
    #[must_use]
    pub fn doc(mut self, doc: impl Into<String>) -> Self {
        self.doc = doc.into();
        self
    }

    /// Validate `value` against kind and nullability.
    pub(crate) fn check(&self, value: &Value) -> Result<()> {
        if value.is_null() && !self.nullable {
            return Err(StoreError::InvalidValue {
                field: self.name.clone(),
                detail: "null not allowed".to_string(),
            });
        }
        value.check_kind(&self.name, self.kind)
    }
}

/// Hook invoked after a transaction touching an item commits.
pub type CommittedHook = Arc<dyn Fn(&Item) + Send + Sync>;

/// Hook invoked when the last handle to a cached item is dropped.
/// Receives the item id and its transient values.
pub type ReleaseHook = Arc<dyn Fn(i64, &Values) + Send + Sync>;

/// Immutable description of one version of a record type.
#[derive(Clone)]
pub struct RecordType {
    key: TypeKey,
    fields: Vec<FieldDescriptor>,
    placeholder: bool,
    on_committed: Option<CommittedHook>,
    on_release: Option<ReleaseHook>,
}

impl RecordType {
    /// Start building a type.
    pub fn builder(name: impl Into<String>, version: u32) -> RecordTypeBuilder {
        RecordTypeBuilder {
            key: TypeKey::new(name, version),
            fields: Vec::new(),
            on_committed: None,
            on_release: None,
        }
    }

    /// Structural type synthesized from catalog rows for a version with no
    /// loaded definition.
    pub(crate) fn placeholder(key: TypeKey, fields: Vec<FieldDescriptor>) -> Self {
        Self {
            key,
            fields,
            placeholder: true,
            on_committed: None,
            on_release: None,
        }
    }

    /// `(name, version)` key.
    pub fn key(&self) -> &TypeKey {
        &self.key
    }

    /// Type name.
    pub fn name(&self) -> &str {
        &self.key.name
    }

    /// Type version.
    pub fn version(&self) -> u32 {
        self.key.version
    }

    /// All fields in declaration order.
    pub fn fields(&self) -> &[FieldDescriptor] {
        &self.fields
    }

    /// Fields that own a table column.
    pub fn persisted_fields(&self) -> impl Iterator<Item = &FieldDescriptor> {
        self.fields.iter().filter(|f| f.kind.is_persisted())
    }

    /// Look up a field by name.
    pub fn field(&self, name: &str) -> Result<&FieldDescriptor> {
        self.fields
            .iter()
            .find(|f| f.name == name)
            .ok_or_else(|| StoreError::UnknownField {
                type_name: self.key.name.clone(),
                field: name.to_string(),
            })
    }

    /// Whether this type was synthesized from the attribute catalog.
    pub fn is_placeholder(&self) -> bool {
        self.placeholder
    }

    /// Backing table name.
    pub fn table_name(&self) -> String {
        self.key.table_name()
    }

    /// Query column for a persisted field.
    pub fn column(&self, field: &str) -> Result<Column> {
        let descriptor = self.field(field)?;
        if !descriptor.kind.is_persisted() {
            return Err(StoreError::InvalidOperation(format!(
                "transient field {}.{field} cannot be queried",
                self.key.name
            )));
        }
        Ok(Column::field(self.key.clone(), descriptor.name.clone(), descriptor.kind))
    }

    /// Query column for the row identifier.
    pub fn id_column(&self) -> Column {
        Column::id(self.key.clone())
    }

    pub(crate) fn on_committed(&self) -> Option<&CommittedHook> {
        self.on_committed.as_ref()
    }

    pub(crate) fn on_release(&self) -> Option<&ReleaseHook> {
        self.on_release.as_ref()
    }

    /// Defaults merged with `values`, validated against every field.
    pub(crate) fn complete_values(&self, mut values: Values) -> Result<Values> {
        for name in values.keys() {
            let _ = self.field(name)?;
        }
        for field in &self.fields {
            let value = values
                .entry(field.name.clone())
                .or_insert_with(|| field.default.clone());
            field.check(value)?;
        }
        Ok(values)
    }

    /// Field-for-field structural equality, ignoring hooks.
    pub(crate) fn same_shape(&self, other: &Self) -> bool {
        self.key == other.key && self.fields == other.fields
    }
}

impl fmt::Debug for RecordType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RecordType")
            .field("key", &self.key)
            .field("fields", &self.fields)
            .field("placeholder", &self.placeholder)
            .finish_non_exhaustive()
    }
}

/// Builder for [`RecordType`].
pub struct RecordTypeBuilder {
    key: TypeKey,
    fields: Vec<FieldDescriptor>,
    on_committed: Option<CommittedHook>,
    on_release: Option<ReleaseHook>,
}

impl RecordTypeBuilder {
    /// Append a field.
    #[must_use]
    pub fn field(mut self, field: FieldDescriptor) -> Self {
        self.fields.push(field);
        self
    }

    /// Hook fired for every item of this type touched by a committed
    /// transaction.
    #[must_use]
    pub fn on_committed(mut self, hook: impl Fn(&Item) + Send + Sync + 'static) -> Self {
        self.on_committed = Some(Arc::new(hook));
        self
    }

    /// Hook fired when a cached item of this type is released.
    #[must_use]
    pub fn on_release(mut self, hook: impl Fn(i64, &Values) + Send + Sync + 'static) -> Self {
        self.on_release = Some(Arc::new(hook));
        self
    }

    /// Validate and freeze the type.
    pub fn build(self) -> Result<RecordType> {
        if !is_identifier(&self.key.name) {
            return Err(StoreError::InvalidDefinition(format!(
                "type name {:?} is not an identifier",
                self.key.name
            )));
        }
        let mut seen = HashSet::new();
        for field in &self.fields {
            if !is_identifier(&field.name) {
                return Err(StoreError::InvalidDefinition(format!(
                    "field name {:?} is not an identifier",
                    field.name
                )));
            }
            if field.name.eq_ignore_ascii_case("oid") {
                return Err(StoreError::InvalidDefinition(
                    "field name oid is reserved".to_string(),
                ));
            }
            if !seen.insert(field.name.to_lowercase()) {
                return Err(StoreError::InvalidDefinition(format!(
                    "duplicate field {}",
                    field.name
                )));
            }
            if field.on_delete != DeletePolicy::Nullify && field.kind != FieldKind::Reference {
                return Err(StoreError::InvalidDefinition(format!(
                    "delete policy on non-reference field {}",
                    field.name
                )));
            }
            if field.kind == FieldKind::Reference && !field.default.is_null() {
                return Err(StoreError::InvalidDefinition(format!(
                    "reference field {} cannot have a default",
                    field.name
                )));
            }
            if field.on_delete == DeletePolicy::Nullify && !field.nullable && field.kind == FieldKind::Reference {
                return Err(StoreError::InvalidDefinition(format!(
                    "non-null reference field {} needs a cascade or disallow policy",
                    field.name
                )));
            }
            // A non-null field may omit its default; construction must then supply it.
            field.default.check_kind(&field.name, field.kind)?;
        }
        Ok(RecordType {
            key: self.key,
            fields: self.fields,
            placeholder: false,
            on_committed: self.on_committed,
            on_release: self.on_release,
        })
    }
}

/// ASCII identifier: letter or underscore, then letters, digits, underscores.
pub(crate) fn is_identifier(s: &str) -> bool {
    let mut chars = s.chars();
    matches!(chars.next(), Some(c) if c.is_ascii_alphabetic() || c == '_')
        && chars.all(|c| c.is_ascii_alphanumeric() || c == '_')
}

// ─────────────────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;

    fn person() -> RecordType {
        RecordType::builder("Person", 1)
            .field(FieldDescriptor::text("name").not_null())
            .field(FieldDescriptor::integer("age").default_value(3).indexed())
            .field(FieldDescriptor::transient("scratch"))
            .build()
            .unwrap()
    }

    #[test]
    fn table_name_is_deterministic() {
        assert_eq!(person().table_name(), "item_person_v1");
    }

    #[test]
    fn persisted_fields_skip_transient() {
        let names: Vec<_> = person().persisted_fields().map(|f| f.name.clone()).collect();
        assert_eq!(names, vec!["name", "age"]);
    }

    #[test]
    fn complete_values_applies_defaults() {
        let values = person()
            .complete_values(crate::values! { "name" => "ada" })
            .unwrap();
        assert_eq!(values["age"], Value::Integer(3));
        assert_eq!(values["scratch"], Value::Null);
    }

    #[test]
    fn complete_values_rejects_missing_required() {
        let err = person().complete_values(Values::new()).unwrap_err();
        assert_matches!(err, StoreError::InvalidValue { field, .. } if field == "name");
    }

    #[test]
    fn complete_values_rejects_unknown_field() {
        let err = person()
            .complete_values(crate::values! { "name" => "ada", "height" => 3 })
            .unwrap_err();
        assert_matches!(err, StoreError::UnknownField { .. });
    }

    #[test]
    fn invalid_names_rejected() {
        let err = RecordType::builder("bad name", 1).build().unwrap_err();
        assert_matches!(err, StoreError::InvalidDefinition(_));

        let err = RecordType::builder("T", 1)
            .field(FieldDescriptor::integer("a'b"))
            .build()
            .unwrap_err();
        assert_matches!(err, StoreError::InvalidDefinition(_));
    }

    #[test]
    fn oid_is_reserved() {
        let err = RecordType::builder("T", 1)
            .field(FieldDescriptor::integer("OID"))
            .build()
            .unwrap_err();
        assert_matches!(err, StoreError::InvalidDefinition(_));
    }

    #[test]
    fn duplicate_fields_rejected() {
        let err = RecordType::builder("T", 1)
            .field(FieldDescriptor::integer("a"))
            .field(FieldDescriptor::text("a"))
            .build()
            .unwrap_err();
        assert_matches!(err, StoreError::InvalidDefinition(_));
    }

    #[test]
    fn policy_only_on_references() {
        let err = RecordType::builder("T", 1)
            .field(FieldDescriptor::integer("a").on_delete(DeletePolicy::Cascade))
            .build()
            .unwrap_err();
        assert_matches!(err, StoreError::InvalidDefinition(_));
    }

    #[test]
    fn default_must_match_kind() {
        let err = RecordType::builder("T", 1)
            .field(FieldDescriptor::integer("a").default_value("three"))
            .build()
            .unwrap_err();
        assert_matches!(err, StoreError::InvalidValue { .. });
    }

    #[test]
    fn same_shape_ignores_hooks() {
        let a = person();
        let b = RecordType::builder("Person", 1)
            .field(FieldDescriptor::text("name").not_null())
            .field(FieldDescriptor::integer("age").default_value(3).indexed())
            .field(FieldDescriptor::transient("scratch"))
            .on_committed(|_| {})
            .build()
            .unwrap();
        assert!(a.same_shape(&b));
    }

    #[test]
    fn transient_column_rejected() {
        assert_matches!(person().column("scratch"), Err(StoreError::InvalidOperation(_)));
        assert!(person().column("age").is_ok());
    }

    #[test]
    fn identifier_rules() {
        assert!(is_identifier("_a1"));
        assert!(!is_identifier("1a"));
        assert!(!is_identifier(""));
        assert!(!is_identifier("a-b"));
    }
}
