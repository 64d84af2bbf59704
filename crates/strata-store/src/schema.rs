//! Per-store view of the type and attribute catalogs.
//!
//! [`SchemaCatalog`] caches `(name, version) → type id` for one store. A cache
//! miss always re-reads the on-disk catalog before a type is treated as new,
//! because another handle on the same file may have created it. Data tables
//! and their indexes are created lazily, once per type version per database,
//! through the executor's schema-change protocol.

use std::collections::{BTreeMap, HashMap};

use rusqlite::types::Value as SqlValue;
use tracing::{debug, info, warn};

use crate::errors::{Result, StoreError};
use crate::record::{FieldDescriptor, RecordType, TypeKey};
use crate::registry::Registry;
use crate::sqlite::Executor;
use crate::sqlite::row_helpers::{int_at, parse_enum, text_at};
use crate::value::FieldKind;

/// On-disk description of one persisted field.
#[derive(Clone, Debug, PartialEq, Eq)]
pub(crate) struct CatalogAttribute {
    pub(crate) indexed: bool,
    pub(crate) kind: FieldKind,
    pub(crate) name: String,
    pub(crate) doc: String,
}

#[derive(Debug, Default)]
pub(crate) struct SchemaCatalog {
    type_ids: HashMap<TypeKey, i64>,
    keys: HashMap<i64, TypeKey>,
}

impl SchemaCatalog {
    /// Load the whole type catalog and validate it against the registry.
    ///
    /// Fails if any registered type disagrees with its on-disk description
    /// or if the file holds a newer version of a registered name.
    pub(crate) fn verify(&mut self, exec: &mut Executor, registry: &Registry) -> Result<()> {
        self.reload(exec)?;

        for (name, on_disk) in max_versions(exec)? {
            if let Some(in_memory) = registry.current_version(&name) {
                if on_disk > in_memory {
                    return Err(StoreError::UnsupportedDowngrade {
                        type_name: name,
                        on_disk,
                        in_memory,
                    });
                }
            }
        }

        for record_type in registry.all_types() {
            if let Some(&type_id) = self.type_ids.get(record_type.key()) {
                check_consistency(exec, &record_type, type_id)?;
            }
        }
        Ok(())
    }

    /// Type id of `key`, or `None` if no table exists for it yet.
    pub(crate) fn type_id(&mut self, exec: &mut Executor, registry: &Registry, key: &TypeKey) -> Result<Option<i64>> {
        if let Some(&id) = self.type_ids.get(key) {
            return Ok(Some(id));
        }
        let Some(id) = lookup_type_id(exec, key)? else {
            return Ok(None);
        };
        debug!(%key, type_id = id, "discovered type created by another handle");
        if let Some(in_memory) = registry.current_version(&key.name) {
            if key.version > in_memory {
                return Err(StoreError::UnsupportedDowngrade {
                    type_name: key.name.clone(),
                    on_disk: key.version,
                    in_memory,
                });
            }
        }
        if let Some(record_type) = registry.get(&key.name, key.version) {
            check_consistency(exec, &record_type, id)?;
        }
        self.remember(key.clone(), id);
        Ok(Some(id))
    }

    /// Key for a type id found in the objects catalog.
    pub(crate) fn key_for(&mut self, exec: &mut Executor, type_id: i64) -> Result<TypeKey> {
        if let Some(key) = self.keys.get(&type_id) {
            return Ok(key.clone());
        }
        self.reload(exec)?;
        self.keys.get(&type_id).cloned().ok_or_else(|| StoreError::CorruptRow {
            table: "strata_objects".to_string(),
            column: "type_id",
            detail: format!("unknown type id {type_id}"),
        })
    }

    /// Create the data table, indexes and catalog rows for `record_type`
    /// unless they already exist. Returns the type id.
    pub(crate) fn ensure_table(&mut self, exec: &mut Executor, registry: &Registry, record_type: &RecordType) -> Result<i64> {
        let key = record_type.key();
        if let Some(id) = self.type_id(exec, registry, key)? {
            return Ok(id);
        }

        match exec.with_schema_change(|exec| create_type(exec, record_type)) {
            Ok((id, created)) => {
                if !created {
                    check_consistency(exec, record_type, id)?;
                }
                self.remember(key.clone(), id);
                Ok(id)
            }
            Err(StoreError::TableAlreadyExists(message)) => {
                warn!(%key, detail = %message, "lost table creation race, using existing table");
                self.type_id(exec, registry, key)?
                    .ok_or_else(|| StoreError::TableAlreadyExists(message))
            }
            Err(e) => Err(e),
        }
    }

    /// Structural type for a version with no loaded definition, built from
    /// the attribute catalog.
    pub(crate) fn placeholder(&mut self, exec: &mut Executor, registry: &Registry, key: &TypeKey) -> Result<Option<RecordType>> {
        let Some(type_id) = self.type_id(exec, registry, key)? else {
            return Ok(None);
        };
        let fields = read_attributes(exec, type_id)?
            .into_iter()
            .map(|attr| {
                let field = FieldDescriptor::new(attr.name, attr.kind).doc(attr.doc);
                if attr.indexed { field.indexed() } else { field }
            })
            .collect();
        Ok(Some(RecordType::placeholder(key.clone(), fields)))
    }

    /// Versions of `name` present in the type catalog, ascending.
    pub(crate) fn versions_on_disk(&mut self, exec: &mut Executor, name: &str) -> Result<Vec<u32>> {
        self.reload(exec)?;
        let mut versions: Vec<u32> = self
            .type_ids
            .keys()
            .filter(|k| k.name == name)
            .map(|k| k.version)
            .collect();
        versions.sort_unstable();
        Ok(versions)
    }

    fn reload(&mut self, exec: &mut Executor) -> Result<()> {
        let rows = exec.execute("SELECT oid, typename, version FROM strata_types", &[])?;
        for row in rows {
            let id = int_at(&row, 0, "strata_types", "oid")?;
            let name = text_at(&row, 1, "strata_types", "typename")?;
            let version = int_at(&row, 2, "strata_types", "version")? as u32;
            self.remember(TypeKey::new(name, version), id);
        }
        Ok(())
    }

    fn remember(&mut self, key: TypeKey, id: i64) {
        let _ = self.keys.insert(id, key.clone());
        let _ = self.type_ids.insert(key, id);
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Catalog queries
// ─────────────────────────────────────────────────────────────────────────────

fn lookup_type_id(exec: &mut Executor, key: &TypeKey) -> Result<Option<i64>> {
    let rows = exec.execute(
        "SELECT oid FROM strata_types WHERE typename = ? AND version = ?",
        &[
            SqlValue::Text(key.name.clone()),
            SqlValue::Integer(i64::from(key.version)),
        ],
    )?;
    rows.first()
        .map(|row| int_at(row, 0, "strata_types", "oid"))
        .transpose()
}

fn max_versions(exec: &mut Executor) -> Result<Vec<(String, u32)>> {
    let rows = exec.execute(
        "SELECT typename, MAX(version) FROM strata_types GROUP BY typename",
        &[],
    )?;
    rows.iter()
        .map(|row| {
            Ok((
                text_at(row, 0, "strata_types", "typename")?,
                int_at(row, 1, "strata_types", "version")? as u32,
            ))
        })
        .collect()
}

pub(crate) fn read_attributes(exec: &mut Executor, type_id: i64) -> Result<Vec<CatalogAttribute>> {
    let rows = exec.execute(
        "SELECT row_offset, indexed, sqltype, kind, attribute, docstring
         FROM strata_attributes WHERE type_id = ? ORDER BY row_offset",
        &[SqlValue::Integer(type_id)],
    )?;
    rows.iter()
        .map(|row| {
            let kind: String = text_at(row, 3, "strata_attributes", "kind")?;
            Ok(CatalogAttribute {
                indexed: int_at(row, 1, "strata_attributes", "indexed")? != 0,
                kind: parse_enum(&kind, "strata_attributes", "kind")?,
                name: text_at(row, 4, "strata_attributes", "attribute")?,
                doc: text_at(row, 5, "strata_attributes", "docstring")?,
            })
        })
        .collect()
}

/// Compare the in-memory field list with the attribute catalog.
fn check_consistency(exec: &mut Executor, record_type: &RecordType, type_id: i64) -> Result<()> {
    let on_disk: BTreeMap<String, FieldKind> = read_attributes(exec, type_id)?
        .into_iter()
        .map(|a| (a.name, a.kind))
        .collect();
    let in_memory: BTreeMap<String, FieldKind> = record_type
        .persisted_fields()
        .map(|f| (f.name.clone(), f.kind))
        .collect();

    let mut problems = Vec::new();
    for (name, kind) in &in_memory {
        match on_disk.get(name) {
            None => problems.push(format!("field {name} missing on disk")),
            Some(disk_kind) if disk_kind != kind => {
                problems.push(format!("field {name} is {disk_kind} on disk, {kind} in memory"));
            }
            Some(_) => {}
        }
    }
    for name in on_disk.keys() {
        if !in_memory.contains_key(name) {
            problems.push(format!("field {name} missing in memory"));
        }
    }

    if problems.is_empty() {
        Ok(())
    } else {
        Err(StoreError::SchemaConsistency {
            type_name: record_type.name().to_string(),
            version: record_type.version(),
            detail: problems.join("; "),
        })
    }
}

/// Create table, indexes and catalog rows. Runs inside a backend
/// transaction, so the catalog is re-checked first; returns whether this
/// call created the type.
fn create_type(exec: &mut Executor, record_type: &RecordType) -> Result<(i64, bool)> {
    let key = record_type.key();
    if let Some(id) = lookup_type_id(exec, key)? {
        return Ok((id, false));
    }

    let table = key.table_name();
    exec.execute_ddl(&create_table_sql(record_type))?;
    for field in record_type.persisted_fields().filter(|f| f.indexed) {
        exec.execute_ddl(&format!(
            "CREATE INDEX {table}_{name} ON {table} (\"{name}\")",
            name = field.name
        ))?;
    }

    let type_id = exec.execute_for_inserted_id(
        "INSERT INTO strata_types (typename, version) VALUES (?, ?)",
        &[
            SqlValue::Text(key.name.clone()),
            SqlValue::Integer(i64::from(key.version)),
        ],
    )?;
    for (offset, field) in record_type.persisted_fields().enumerate() {
        let _ = exec.execute(
            "INSERT INTO strata_attributes
             (type_id, row_offset, indexed, sqltype, kind, attribute, docstring)
             VALUES (?, ?, ?, ?, ?, ?, ?)",
            &[
                SqlValue::Integer(type_id),
                SqlValue::Integer(offset as i64),
                SqlValue::Integer(i64::from(field.indexed)),
                SqlValue::Text(field.kind.sql_type().unwrap_or_default().to_string()),
                SqlValue::Text(field.kind.tag().to_string()),
                SqlValue::Text(field.name.clone()),
                SqlValue::Text(field.doc.clone()),
            ],
        )?;
    }

    info!(%key, table = table.as_str(), type_id, "created type table");
    Ok((type_id, true))
}

// ─────────────────────────────────────────────────────────────────────────────
// Data table statements
// ─────────────────────────────────────────────────────────────────────────────

pub(crate) fn create_table_sql(record_type: &RecordType) -> String {
    let mut columns = vec!["oid INTEGER PRIMARY KEY".to_string()];
    columns.extend(record_type.persisted_fields().map(|f| {
        format!("\"{}\" {}", f.name, f.kind.sql_type().unwrap_or_default())
    }));
    format!("CREATE TABLE {} ({})", record_type.table_name(), columns.join(", "))
}

/// `SELECT oid, <persisted columns> FROM <table> WHERE oid = ?`
pub(crate) fn select_row_sql(record_type: &RecordType) -> String {
    let table = record_type.table_name();
    let mut columns = vec![format!("{table}.oid")];
    columns.extend(record_type.persisted_fields().map(|f| format!("{table}.\"{}\"", f.name)));
    format!("SELECT {} FROM {table} WHERE oid = ?", columns.join(", "))
}

/// `INSERT INTO <table> (oid, <persisted columns>) VALUES (?, ...)`
pub(crate) fn insert_row_sql(record_type: &RecordType) -> String {
    let mut columns = vec!["oid".to_string()];
    columns.extend(record_type.persisted_fields().map(|f| format!("\"{}\"", f.name)));
    let marks = vec!["?"; columns.len()].join(", ");
    format!(
        "INSERT INTO {} ({}) VALUES ({marks})",
        record_type.table_name(),
        columns.join(", ")
    )
}

/// `UPDATE <table> SET <persisted columns> = ? WHERE oid = ?`, or `None`
/// for a type without persisted fields.
pub(crate) fn update_row_sql(record_type: &RecordType) -> Option<String> {
    let assignments: Vec<String> = record_type
        .persisted_fields()
        .map(|f| format!("\"{}\" = ?", f.name))
        .collect();
    if assignments.is_empty() {
        return None;
    }
    Some(format!(
        "UPDATE {} SET {} WHERE oid = ?",
        record_type.table_name(),
        assignments.join(", ")
    ))
}

pub(crate) fn delete_row_sql(record_type: &RecordType) -> String {
    format!("DELETE FROM {} WHERE oid = ?", record_type.table_name())
}

// ─────────────────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use assert_matches::assert_matches;
    use strata_settings::StoreSettings;

    use super::*;
    use crate::sqlite::migrations::run_migrations;
    use crate::stats::Counters;

    fn setup() -> (Executor, Arc<Counters>) {
        let counters = Arc::new(Counters::default());
        let mut exec = Executor::open_in_memory(&StoreSettings::default(), counters.clone()).unwrap();
        let _ = run_migrations(&mut exec).unwrap();
        (exec, counters)
    }

    fn thing(version: u32) -> RecordType {
        RecordType::builder("Thing", version)
            .field(FieldDescriptor::integer("a").default_value(3).indexed())
            .field(FieldDescriptor::text("b").doc("label"))
            .field(FieldDescriptor::transient("cache"))
            .build()
            .unwrap()
    }

    fn registry_with(types: Vec<RecordType>) -> Registry {
        let mut registry = Registry::new();
        for t in types {
            let _ = registry.register(t).unwrap();
        }
        registry
    }

    #[test]
    fn table_sql_shapes() {
        let t = thing(1);
        assert_eq!(
            create_table_sql(&t),
            "CREATE TABLE item_thing_v1 (oid INTEGER PRIMARY KEY, \"a\" INTEGER, \"b\" TEXT)"
        );
        assert_eq!(
            insert_row_sql(&t),
            "INSERT INTO item_thing_v1 (oid, \"a\", \"b\") VALUES (?, ?, ?)"
        );
        assert_eq!(
            update_row_sql(&t).unwrap(),
            "UPDATE item_thing_v1 SET \"a\" = ?, \"b\" = ? WHERE oid = ?"
        );
        assert_eq!(
            select_row_sql(&t),
            "SELECT item_thing_v1.oid, item_thing_v1.\"a\", item_thing_v1.\"b\" FROM item_thing_v1 WHERE oid = ?"
        );
    }

    #[test]
    fn ensure_table_runs_ddl_once() {
        let (mut exec, counters) = setup();
        let registry = registry_with(vec![thing(1)]);
        let mut schema = SchemaCatalog::default();

        let before = counters.snapshot().ddl_statements;
        let id = schema.ensure_table(&mut exec, &registry, &thing(1)).unwrap();
        let after_first = counters.snapshot().ddl_statements;
        assert_eq!(after_first - before, 2, "one table and one index");

        let again = schema.ensure_table(&mut exec, &registry, &thing(1)).unwrap();
        assert_eq!(id, again);
        assert_eq!(counters.snapshot().ddl_statements, after_first);

        let attrs = read_attributes(&mut exec, id).unwrap();
        assert_eq!(attrs.len(), 2);
        assert_eq!(attrs[0].name, "a");
        assert!(attrs[0].indexed);
        assert_eq!(attrs[1].doc, "label");
        assert_eq!(attrs[1].kind, FieldKind::Text);
    }

    #[test]
    fn fresh_cache_rereads_catalog() {
        let (mut exec, counters) = setup();
        let registry = registry_with(vec![thing(1)]);
        let id = SchemaCatalog::default()
            .ensure_table(&mut exec, &registry, &thing(1))
            .unwrap();

        let ddl = counters.snapshot().ddl_statements;
        let mut other = SchemaCatalog::default();
        assert_eq!(other.type_id(&mut exec, &registry, thing(1).key()).unwrap(), Some(id));
        assert_eq!(other.ensure_table(&mut exec, &registry, &thing(1)).unwrap(), id);
        assert_eq!(counters.snapshot().ddl_statements, ddl);
        assert_eq!(other.key_for(&mut exec, id).unwrap(), TypeKey::new("Thing", 1));
    }

    #[test]
    fn field_mismatch_is_fatal() {
        let (mut exec, _) = setup();
        let registry = registry_with(vec![thing(1)]);
        let _ = SchemaCatalog::default()
            .ensure_table(&mut exec, &registry, &thing(1))
            .unwrap();

        let changed = RecordType::builder("Thing", 1)
            .field(FieldDescriptor::text("a"))
            .field(FieldDescriptor::integer("c"))
            .build()
            .unwrap();
        let err = SchemaCatalog::default()
            .verify(&mut exec, &registry_with(vec![changed]))
            .unwrap_err();
        assert_matches!(err, StoreError::SchemaConsistency { detail, .. } => {
            assert!(detail.contains("field a is integer on disk, text in memory"));
            assert!(detail.contains("field c missing on disk"));
            assert!(detail.contains("field b missing in memory"));
        });
    }

    #[test]
    fn newer_on_disk_version_is_fatal() {
        let (mut exec, _) = setup();
        let registry = registry_with(vec![thing(2)]);
        let _ = SchemaCatalog::default()
            .ensure_table(&mut exec, &registry, &thing(2))
            .unwrap();

        let err = SchemaCatalog::default()
            .verify(&mut exec, &registry_with(vec![thing(1)]))
            .unwrap_err();
        assert_matches!(err, StoreError::UnsupportedDowngrade { on_disk: 2, in_memory: 1, .. });
    }

    #[test]
    fn placeholder_from_catalog() {
        let (mut exec, _) = setup();
        let registry = registry_with(vec![thing(1)]);
        let mut schema = SchemaCatalog::default();
        let _ = schema.ensure_table(&mut exec, &registry, &thing(1)).unwrap();

        let empty = Registry::new();
        let placeholder = schema
            .placeholder(&mut exec, &empty, thing(1).key())
            .unwrap()
            .unwrap();
        assert!(placeholder.is_placeholder());
        let kinds: Vec<_> = placeholder.fields().iter().map(|f| (f.name.as_str(), f.kind)).collect();
        assert_eq!(kinds, vec![("a", FieldKind::Integer), ("b", FieldKind::Text)]);

        assert!(schema
            .placeholder(&mut exec, &empty, &TypeKey::new("Thing", 9))
            .unwrap()
            .is_none());
    }

    #[test]
    fn versions_on_disk_sorted() {
        let (mut exec, _) = setup();
        let registry = registry_with(vec![thing(1), thing(2)]);
        let mut schema = SchemaCatalog::default();
        let _ = schema.ensure_table(&mut exec, &registry, &thing(2)).unwrap();
        let _ = schema.ensure_table(&mut exec, &registry, &thing(1)).unwrap();
        assert_eq!(schema.versions_on_disk(&mut exec, "Thing").unwrap(), vec![1, 2]);
    }

    #[test]
    fn ddl_inside_open_transaction_replays() {
        let (mut exec, _) = setup();
        let registry = registry_with(vec![thing(1), thing(2)]);
        let mut schema = SchemaCatalog::default();
        let existing = schema.ensure_table(&mut exec, &registry, &thing(2)).unwrap();

        exec.begin().unwrap();
        let before = exec
            .execute_for_inserted_id("INSERT INTO strata_objects (type_id) VALUES (?)", &[SqlValue::Integer(existing)])
            .unwrap();
        let _ = schema.ensure_table(&mut exec, &registry, &thing(1)).unwrap();
        assert!(exec.in_transaction());
        let after = exec
            .execute_for_inserted_id("INSERT INTO strata_objects (type_id) VALUES (?)", &[SqlValue::Integer(existing)])
            .unwrap();
        assert_eq!(after, before + 1);
        exec.rollback().unwrap();

        let rows = exec.execute("SELECT COUNT(*) FROM strata_objects", &[]).unwrap();
        assert_eq!(rows[0][0], SqlValue::Integer(0));
        let rows = exec.execute("SELECT COUNT(*) FROM strata_types", &[]).unwrap();
        assert_eq!(rows[0][0], SqlValue::Integer(2), "schema change survives the rollback");
    }

    #[test]
    fn catalog_rows_require_known_type() {
        let (mut exec, _) = setup();
        let err = exec
            .execute_for_inserted_id("INSERT INTO strata_objects (type_id) VALUES (?)", &[SqlValue::Integer(42)])
            .unwrap_err();
        assert_matches!(err, StoreError::Sqlite(_));
    }

    #[test]
    fn uncatalogued_table_is_reported_as_existing() {
        let (mut exec, _) = setup();
        let registry = registry_with(vec![thing(1)]);
        exec.execute_ddl(&create_table_sql(&thing(1))).unwrap();

        let (logs, _guard) = crate::logging::capture_logs();
        let err = SchemaCatalog::default()
            .ensure_table(&mut exec, &registry, &thing(1))
            .unwrap_err();
        assert_matches!(err, StoreError::TableAlreadyExists(_));
        assert!(logs.has_event(tracing::Level::WARN, "lost table creation race"));

        let rows = exec.execute("SELECT COUNT(*) FROM strata_types", &[]).unwrap();
        assert_eq!(rows[0][0], SqlValue::Integer(0), "catalog rows rolled back");
    }
}
