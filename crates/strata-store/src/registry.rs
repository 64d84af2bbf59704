//! Process-scoped registry of record types and upgraders.
//!
//! The registry is built explicitly at startup, frozen behind an [`Arc`], and
//! handed to every [`Store`](crate::Store) that is opened. The highest
//! registered version of a name is its current version; lower registered
//! versions describe legacy rows.

use std::collections::HashMap;
use std::sync::Arc;

use crate::errors::{Result, StoreError};
use crate::item::Item;
use crate::record::{FieldDescriptor, RecordType, TypeKey};
use crate::value::{FieldKind, Values};

/// Transforms a legacy item at version `v` into field values for `v + 1`.
pub type Upgrader = Arc<dyn Fn(&Item) -> Result<Values> + Send + Sync>;

/// Registry of known record types and their upgrade steps.
#[derive(Default)]
pub struct Registry {
    types: HashMap<TypeKey, Arc<RecordType>>,
    current: HashMap<String, u32>,
    upgraders: HashMap<(String, u32), Upgrader>,
}

impl Registry {
    /// Empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a type version.
    ///
    /// Registering an identical `(name, version)` again returns the existing
    /// descriptor. A divergent definition is a consistency error.
    pub fn register(&mut self, record_type: RecordType) -> Result<Arc<RecordType>> {
        let key = record_type.key().clone();
        if let Some(existing) = self.types.get(&key) {
            if existing.same_shape(&record_type) {
                return Ok(existing.clone());
            }
            return Err(StoreError::SchemaConsistency {
                type_name: key.name,
                version: key.version,
                detail: "registered twice with different fields".to_string(),
            });
        }
        if let Some(other) = self
            .current
            .keys()
            .find(|n| n.eq_ignore_ascii_case(&key.name) && **n != key.name)
        {
            return Err(StoreError::InvalidDefinition(format!(
                "type name {} collides with {other}",
                key.name
            )));
        }

        let current = self.current.entry(key.name.clone()).or_insert(key.version);
        *current = (*current).max(key.version);
        let record_type = Arc::new(record_type);
        let _ = self.types.insert(key, record_type.clone());
        Ok(record_type)
    }

    /// Register the upgrade step `name` v`from` → v`from + 1`.
    pub fn register_upgrader(
        &mut self,
        name: &str,
        from: u32,
        upgrader: impl Fn(&Item) -> Result<Values> + Send + Sync + 'static,
    ) -> Result<()> {
        let key = (name.to_string(), from);
        if self.upgraders.contains_key(&key) {
            return Err(StoreError::InvalidDefinition(format!(
                "upgrader {name} v{from} -> v{} registered twice",
                from + 1
            )));
        }
        let _ = self.upgraders.insert(key, Arc::new(upgrader));
        Ok(())
    }

    /// Descriptor for an exact version.
    pub fn get(&self, name: &str, version: u32) -> Option<Arc<RecordType>> {
        self.types.get(&TypeKey::new(name, version)).cloned()
    }

    /// Current version of `name`.
    pub fn current_version(&self, name: &str) -> Option<u32> {
        self.current.get(name).copied()
    }

    /// Descriptor for the current version of `name`.
    pub fn current(&self, name: &str) -> Option<Arc<RecordType>> {
        let version = self.current_version(name)?;
        self.get(name, version)
    }

    /// Whether `record_type` is the current version of its name.
    pub fn is_current(&self, record_type: &RecordType) -> bool {
        self.current_version(record_type.name()) == Some(record_type.version())
    }

    /// Upgrade step starting at `from`.
    pub fn upgrader(&self, name: &str, from: u32) -> Option<Upgrader> {
        self.upgraders.get(&(name.to_string(), from)).cloned()
    }

    /// Current descriptors of every registered name, ordered by name.
    pub fn current_types(&self) -> Vec<Arc<RecordType>> {
        let mut names: Vec<&String> = self.current.keys().collect();
        names.sort();
        names.into_iter().filter_map(|n| self.current(n)).collect()
    }

    /// Every registered descriptor, ordered by key.
    pub fn all_types(&self) -> Vec<Arc<RecordType>> {
        let mut all: Vec<_> = self.types.values().cloned().collect();
        all.sort_by(|a, b| a.key().cmp(b.key()));
        all
    }

    /// Reference fields of current types, i.e. every place a row id may be
    /// referred to from.
    pub(crate) fn reference_fields(&self) -> Vec<(Arc<RecordType>, FieldDescriptor)> {
        self.current_types()
            .into_iter()
            .flat_map(|t| {
                t.fields()
                    .iter()
                    .filter(|f| f.kind == FieldKind::Reference)
                    .cloned()
                    .map(|f| (t.clone(), f))
                    .collect::<Vec<_>>()
            })
            .collect()
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::record::DeletePolicy;
    use assert_matches::assert_matches;

    fn thing(version: u32, extra: bool) -> RecordType {
        let mut b = RecordType::builder("Thing", version).field(FieldDescriptor::integer("a"));
        if extra {
            b = b.field(FieldDescriptor::text("b"));
        }
        b.build().unwrap()
    }

    #[test]
    fn highest_version_is_current() {
        let mut registry = Registry::new();
        let _ = registry.register(thing(2, true)).unwrap();
        let _ = registry.register(thing(1, false)).unwrap();
        assert_eq!(registry.current_version("Thing"), Some(2));
        assert_eq!(registry.current("Thing").unwrap().version(), 2);
        assert!(registry.is_current(&thing(2, true)));
        assert!(!registry.is_current(&thing(1, false)));
    }

    #[test]
    fn identical_reregistration_is_idempotent() {
        let mut registry = Registry::new();
        let a = registry.register(thing(1, false)).unwrap();
        let b = registry.register(thing(1, false)).unwrap();
        assert!(Arc::ptr_eq(&a, &b));
    }

    #[test]
    fn divergent_reregistration_fails() {
        let mut registry = Registry::new();
        let _ = registry.register(thing(1, false)).unwrap();
        let err = registry.register(thing(1, true)).unwrap_err();
        assert_matches!(err, StoreError::SchemaConsistency { version: 1, .. });
    }

    #[test]
    fn case_colliding_names_rejected() {
        let mut registry = Registry::new();
        let _ = registry.register(thing(1, false)).unwrap();
        let other = RecordType::builder("THING", 1).build().unwrap();
        assert_matches!(registry.register(other), Err(StoreError::InvalidDefinition(_)));
    }

    #[test]
    fn duplicate_upgrader_rejected() {
        let mut registry = Registry::new();
        registry
            .register_upgrader("Thing", 1, |_| Ok(Values::new()))
            .unwrap();
        assert!(registry.upgrader("Thing", 1).is_some());
        assert!(registry.upgrader("Thing", 2).is_none());
        let err = registry
            .register_upgrader("Thing", 1, |_| Ok(Values::new()))
            .unwrap_err();
        assert_matches!(err, StoreError::InvalidDefinition(_));
    }

    #[test]
    fn reference_fields_of_current_types() {
        let mut registry = Registry::new();
        let _ = registry
            .register(
                RecordType::builder("Dependent", 1)
                    .field(FieldDescriptor::reference("target").on_delete(DeletePolicy::Cascade))
                    .field(FieldDescriptor::integer("n"))
                    .build()
                    .unwrap(),
            )
            .unwrap();
        let _ = registry.register(thing(1, false)).unwrap();
        let refs = registry.reference_fields();
        assert_eq!(refs.len(), 1);
        assert_eq!(refs[0].0.name(), "Dependent");
        assert_eq!(refs[0].1.on_delete, DeletePolicy::Cascade);
    }
}
