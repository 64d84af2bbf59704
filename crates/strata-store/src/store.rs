//! The store facade.
//!
//! A [`Store`] is a cheap, cloneable handle to one opened database: its
//! connection, schema view, identity cache and transaction state. Every
//! handle to the same store shares all of these. Several stores (on the same
//! file or not) may be open in one process; items never cross between them.

use std::collections::HashSet;
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use parking_lot::Mutex;
use rusqlite::types::Value as SqlValue;
use strata_settings::StoreSettings;
use tracing::{debug, info, instrument};

use crate::cache::IdentityCache;
use crate::errors::{Result, StoreError};
use crate::item::{Item, ItemInner, Origin};
use crate::query::{Column, Compiled, Mode, Predicate, Query, QueryShape, compile};
use crate::record::{DeletePolicy, FieldDescriptor, RecordType, TypeKey};
use crate::registry::Registry;
use crate::schema::{SchemaCatalog, delete_row_sql, insert_row_sql, select_row_sql};
use crate::sqlite::migrations;
use crate::sqlite::row_helpers::int_at;
use crate::sqlite::{Executor, Row};
use crate::stats::{Counters, StoreStats};
use crate::txn::TxnState;
use crate::value::{FieldKind, Reference, STORE_ID, StoreId, Value, Values};

static NEXT_STORE_ID: AtomicU64 = AtomicU64::new(1);

/// What an identifier resolves to.
#[derive(Clone, Debug)]
pub enum Referent {
    /// The reserved identifier [`STORE_ID`].
    Store(Store),
    /// A live item.
    Item(Item),
}

impl Referent {
    /// The item, if this is one.
    pub fn into_item(self) -> Option<Item> {
        match self {
            Self::Item(item) => Some(item),
            Self::Store(_) => None,
        }
    }
}

pub(crate) struct StoreInner {
    id: StoreId,
    directory: Option<PathBuf>,
    pub(crate) registry: Arc<Registry>,
    exec: Mutex<Option<Executor>>,
    schema: Mutex<SchemaCatalog>,
    pub(crate) cache: Mutex<IdentityCache>,
    pub(crate) txn: Mutex<TxnState>,
    pub(crate) counters: Arc<Counters>,
}

/// Handle to an opened object store.
#[derive(Clone)]
pub struct Store {
    pub(crate) inner: Arc<StoreInner>,
}

impl Store {
    /// Open (creating if needed) the store kept in `directory`.
    ///
    /// The catalog is migrated and every registered type present on disk is
    /// checked for consistency; any mismatch fails the open.
    #[instrument(skip_all, fields(directory = %directory.as_ref().display()))]
    pub fn open(directory: impl AsRef<Path>, registry: Arc<Registry>, settings: &StoreSettings) -> Result<Self> {
        settings.validate()?;
        let directory = directory.as_ref();
        std::fs::create_dir_all(directory)?;
        let counters = Arc::new(Counters::default());
        let exec = Executor::open_file(&directory.join(&settings.database_file_name), settings, counters.clone())?;
        Self::bootstrap(exec, registry, Some(directory.to_path_buf()), counters)
    }

    /// Open a private in-memory store.
    pub fn in_memory(registry: Arc<Registry>, settings: &StoreSettings) -> Result<Self> {
        settings.validate()?;
        let counters = Arc::new(Counters::default());
        let exec = Executor::open_in_memory(settings, counters.clone())?;
        Self::bootstrap(exec, registry, None, counters)
    }

    fn bootstrap(
        mut exec: Executor,
        registry: Arc<Registry>,
        directory: Option<PathBuf>,
        counters: Arc<Counters>,
    ) -> Result<Self> {
        let applied = migrations::run_migrations(&mut exec)?;
        let catalog = migrations::current_version(&mut exec)?;
        if catalog > migrations::latest_version() {
            return Err(StoreError::Migration {
                message: format!(
                    "catalog v{catalog} is newer than supported v{}",
                    migrations::latest_version()
                ),
            });
        }

        let mut schema = SchemaCatalog::default();
        schema.verify(&mut exec, &registry)?;

        let id = StoreId(NEXT_STORE_ID.fetch_add(1, Ordering::Relaxed));
        info!(store = id.0, applied, types = registry.current_types().len(), "store opened");
        Ok(Self {
            inner: Arc::new(StoreInner {
                id,
                directory,
                registry,
                exec: Mutex::new(Some(exec)),
                schema: Mutex::new(schema),
                cache: Mutex::new(IdentityCache::default()),
                txn: Mutex::new(TxnState::default()),
                counters,
            }),
        })
    }

    /// Process-unique identity of this store.
    pub fn id(&self) -> StoreId {
        self.inner.id
    }

    /// Directory holding the database file, `None` for in-memory stores.
    pub fn directory(&self) -> Option<&Path> {
        self.inner.directory.as_deref()
    }

    /// Registry this store was opened with.
    pub fn registry(&self) -> &Arc<Registry> {
        &self.inner.registry
    }

    /// Reference value naming the store itself.
    pub fn store_reference(&self) -> Reference {
        Reference {
            store: self.inner.id,
            id: STORE_ID,
        }
    }

    /// Snapshot of this store's counters.
    pub fn stats(&self) -> StoreStats {
        self.inner.counters.snapshot()
    }

    /// Number of live cached items.
    pub fn cached_items(&self) -> usize {
        self.inner.cache.lock().len()
    }

    /// Whether [`close`](Self::close) has run.
    pub fn is_closed(&self) -> bool {
        self.inner.exec.lock().is_none()
    }

    /// Release the connection. Later operations fail with
    /// [`StoreError::Closed`]; closing twice is a no-op.
    pub fn close(&self) -> Result<()> {
        if self.in_transaction() {
            return Err(StoreError::InvalidOperation(
                "cannot close a store inside a transaction".to_string(),
            ));
        }
        let Some(exec) = self.inner.exec.lock().take() else {
            return Ok(());
        };
        self.inner.cache.lock().clear();
        exec.close()?;
        info!(store = self.inner.id.0, "store closed");
        Ok(())
    }

    // ─────────────────────────────────────────────────────────────────────
    // Items
    // ─────────────────────────────────────────────────────────────────────

    /// Create and persist a new item of the current version of a type.
    ///
    /// Unspecified fields take their defaults. Inside a transaction the item
    /// becomes unreachable again if the transaction reverts.
    #[instrument(skip_all, fields(record_type = %record_type.key()))]
    pub fn create(&self, record_type: &RecordType, values: Values) -> Result<Item> {
        let record_type = self.current_type(record_type)?;
        let values = record_type.complete_values(values)?;
        for (field, value) in &values {
            self.check_reference(field, value)?;
        }
        let type_id = self.ensure_table(&record_type)?;

        self.transact(|| {
            let id = self.with_exec(|exec| {
                exec.execute_for_inserted_id(
                    "INSERT INTO strata_objects (type_id) VALUES (?)",
                    &[SqlValue::Integer(type_id)],
                )
            })?;
            let item = Item::new(self, record_type.clone(), id, values, false, Origin::Created);
            let mut params = vec![SqlValue::Integer(id)];
            params.extend(item.row_params());
            let sql = insert_row_sql(&record_type);
            self.with_exec(|exec| exec.execute(&sql, &params).map(drop))?;

            self.inner.cache.lock().insert(&item);
            self.touch(&item);
            debug!(id, "item created");
            Ok(item)
        })
    }

    /// First item of `record_type` whose persisted fields equal `values`,
    /// creating one when none matches.
    pub fn find_or_create(&self, record_type: &RecordType, values: Values) -> Result<Item> {
        self.transact(|| {
            let mut query = self.query(record_type)?;
            for (name, value) in &values {
                if record_type.field(name)?.kind.is_persisted() {
                    query = query.filter(record_type.column(name)?.eq(value.clone()));
                }
            }
            if let Some(found) = query.first()? {
                return Ok(found);
            }
            self.create(record_type, values.clone())
        })
    }

    /// Item with identifier `id`, upgrading it first when it was stored by
    /// an older version of its type.
    #[instrument(skip(self))]
    pub fn get_by_id(&self, id: i64) -> Result<Item> {
        if id == STORE_ID {
            return Err(StoreError::InvalidOperation(
                "identifier -1 names the store; use resolve".to_string(),
            ));
        }
        let cached = self.inner.cache.lock().get(id);
        if let Some(item) = cached {
            Counters::bump(&self.inner.counters.cache_hits);
            return Ok(item);
        }
        Counters::bump(&self.inner.counters.cache_misses);

        let rows = self.with_exec(|exec| {
            exec.execute(
                "SELECT type_id FROM strata_objects WHERE oid = ?",
                &[SqlValue::Integer(id)],
            )
        })?;
        let Some(row) = rows.first() else {
            return Err(StoreError::ItemNotFound(id));
        };
        let type_id = int_at(row, 0, "strata_objects", "type_id")?;
        let key = self.with_schema(|schema, exec| schema.key_for(exec, type_id))?;

        let current = self
            .inner
            .registry
            .current_version(&key.name)
            .ok_or_else(|| StoreError::UnknownType {
                name: key.name.clone(),
                version: key.version,
            })?;
        if key.version > current {
            return Err(StoreError::UnsupportedDowngrade {
                type_name: key.name,
                on_disk: key.version,
                in_memory: current,
            });
        }

        let record_type = self.type_for_key(&key, None)?;
        let sql = select_row_sql(&record_type);
        let rows = self.with_exec(|exec| exec.execute(&sql, &[SqlValue::Integer(id)]))?;
        let Some(row) = rows.into_iter().next() else {
            return Err(StoreError::ItemNotFound(id));
        };

        if key.version == current {
            return self.materialize(&record_type, row);
        }
        let values = self.decode(&record_type, row)?.1;
        let legacy = Item::new(self, record_type, id, values, true, Origin::Loaded);
        self.upgrade_legacy(legacy)
    }

    /// Resolve an identifier to the store itself or an item.
    pub fn resolve(&self, id: i64) -> Result<Referent> {
        if id == STORE_ID {
            Ok(Referent::Store(self.clone()))
        } else {
            self.get_by_id(id).map(Referent::Item)
        }
    }

    /// Query over the current version of `record_type`.
    pub fn query(&self, record_type: &RecordType) -> Result<Query> {
        Ok(Query::new(self.clone(), self.current_type(record_type)?))
    }

    /// Number of items of `record_type` matching `predicate` (all when
    /// `None`).
    pub fn count(&self, record_type: &RecordType, predicate: Option<Predicate>) -> Result<u64> {
        let mut query = self.query(record_type)?;
        if let Some(p) = predicate {
            query = query.filter(p);
        }
        query.count()
    }

    /// Sum of `column` over items of `record_type` matching `predicate`.
    pub fn sum(&self, record_type: &RecordType, column: &Column, predicate: Option<Predicate>) -> Result<Value> {
        let mut query = self.query(record_type)?;
        if let Some(p) = predicate {
            query = query.filter(p);
        }
        query.sum(column)
    }

    // ─────────────────────────────────────────────────────────────────────
    // Query execution
    // ─────────────────────────────────────────────────────────────────────

    pub(crate) fn query_items(&self, shape: &QueryShape) -> Result<Vec<Item>> {
        let Some(compiled) = self.prepare(shape, Mode::Items)? else {
            return Ok(Vec::new());
        };
        let rows = self.with_exec(|exec| exec.execute(&compiled.sql, &compiled.params))?;
        rows.into_iter()
            .map(|row| self.materialize(&shape.target, row))
            .collect()
    }

    pub(crate) fn query_count(&self, shape: &QueryShape) -> Result<u64> {
        let Some(compiled) = self.prepare(shape, Mode::Count)? else {
            return Ok(0);
        };
        let rows = self.with_exec(|exec| exec.execute(&compiled.sql, &compiled.params))?;
        let count = rows
            .first()
            .map(|row| int_at(row, 0, &shape.target.table_name(), "count"))
            .transpose()?
            .unwrap_or(0);
        Ok(u64::try_from(count).unwrap_or(0))
    }

    pub(crate) fn query_sum(&self, shape: &QueryShape, column: &Column) -> Result<Value> {
        let zero = if column.kind == FieldKind::Real {
            Value::Real(0.0)
        } else {
            Value::Integer(0)
        };
        let Some(compiled) = self.prepare(shape, Mode::Sum(column))? else {
            return Ok(zero);
        };
        let rows = self.with_exec(|exec| exec.execute(&compiled.sql, &compiled.params))?;
        Ok(match rows.into_iter().next().and_then(|r| r.into_iter().next()) {
            Some(SqlValue::Integer(n)) if column.kind == FieldKind::Real => Value::Real(n as f64),
            Some(SqlValue::Integer(n)) => Value::Integer(n),
            Some(SqlValue::Real(n)) => Value::Real(n),
            _ => zero,
        })
    }

    pub(crate) fn query_values(&self, shape: &QueryShape, column: &Column) -> Result<Vec<Value>> {
        let Some(compiled) = self.prepare(shape, Mode::Values(column))? else {
            return Ok(Vec::new());
        };
        let rows = self.with_exec(|exec| exec.execute(&compiled.sql, &compiled.params))?;
        let name = column.field.as_deref().unwrap_or("oid");
        let kind = if column.field.is_some() {
            column.kind
        } else {
            FieldKind::Integer
        };
        rows.into_iter()
            .map(|row| {
                let raw = row.into_iter().next().unwrap_or(SqlValue::Null);
                Value::from_sql(raw, kind, self.inner.id, name)
            })
            .collect()
    }

    /// Flush pending changes and compile. `None` when a queried table does
    /// not exist yet, meaning the result is empty.
    fn prepare(&self, shape: &QueryShape, mode: Mode<'_>) -> Result<Option<Compiled>> {
        let compiled = compile(shape, mode, self.inner.id)?;
        self.checkpoint()?;
        for key in &compiled.tables {
            let known = self.with_schema(|schema, exec| schema.type_id(exec, &self.inner.registry, key))?;
            if known.is_none() {
                debug!(%key, "queried type has no table yet");
                return Ok(None);
            }
        }
        Ok(Some(compiled))
    }

    /// Cached instance for `row`, or a new cached instance decoded from it.
    fn materialize(&self, record_type: &Arc<RecordType>, row: Row) -> Result<Item> {
        let (id, values) = self.decode(record_type, row)?;
        let cached = self.inner.cache.lock().get(id);
        if let Some(item) = cached {
            Counters::bump(&self.inner.counters.cache_hits);
            return Ok(item);
        }
        Counters::bump(&self.inner.counters.cache_misses);
        let item = Item::new(self, record_type.clone(), id, values, false, Origin::Loaded);
        self.inner.cache.lock().insert(&item);
        Ok(item)
    }

    /// Split an `oid, <persisted columns>` row into id and field values.
    pub(crate) fn decode(&self, record_type: &RecordType, row: Row) -> Result<(i64, Values)> {
        let table = record_type.table_name();
        let id = int_at(&row, 0, &table, "oid")?;
        let mut raw = row.into_iter().skip(1);
        let mut values = Values::new();
        for field in record_type.fields() {
            let value = if field.kind.is_persisted() {
                Value::from_sql(raw.next().unwrap_or(SqlValue::Null), field.kind, self.inner.id, &field.name)?
            } else {
                field.default.clone()
            };
            let _ = values.insert(field.name.clone(), value);
        }
        Ok((id, values))
    }

    // ─────────────────────────────────────────────────────────────────────
    // Deletion
    // ─────────────────────────────────────────────────────────────────────

    /// Delete `item` and apply the delete policies of every reference to it.
    ///
    /// All `Disallow` checks run before anything changes, over the full set
    /// of items the cascade would remove. Rows of referring types stored
    /// under older versions are upgraded first so their references are seen;
    /// a rejected delete reverts those upgrades with everything else.
    #[instrument(skip_all, fields(id = item.id()))]
    pub(crate) fn delete_item(&self, item: &Item) -> Result<()> {
        if item.is_legacy() {
            return Err(StoreError::InvalidOperation(format!(
                "legacy item {} cannot be deleted",
                item.id()
            )));
        }
        item.ensure_live()?;
        let references = self.inner.registry.reference_fields();

        self.transact(|| {
            let mut referring: Vec<&Arc<RecordType>> = references.iter().map(|(t, _)| t).collect();
            referring.dedup_by(|a, b| a.key() == b.key());
            for record_type in referring {
                let _ = self.upgrade_stored(record_type)?;
            }

            let mut doomed = vec![item.clone()];
            let mut ids: HashSet<i64> = HashSet::from([item.id()]);
            let mut next = 0;
            while next < doomed.len() {
                let target = doomed[next].clone();
                for (dependent_type, field) in references.iter().filter(|(_, f)| f.on_delete == DeletePolicy::Cascade) {
                    for dependent in self.dependents(dependent_type, field, &target)? {
                        if ids.insert(dependent.id()) {
                            doomed.push(dependent);
                        }
                    }
                }
                next += 1;
            }

            for target in &doomed {
                for (dependent_type, field) in references.iter().filter(|(_, f)| f.on_delete == DeletePolicy::Disallow) {
                    if let Some(blocker) = self
                        .dependents(dependent_type, field, target)?
                        .into_iter()
                        .find(|d| !ids.contains(&d.id()))
                    {
                        return Err(StoreError::DeletionDisallowed {
                            item_id: target.id(),
                            dependent_type: dependent_type.name().to_string(),
                            field: field.name.clone(),
                            dependent_id: blocker.id(),
                        });
                    }
                }
            }

            for target in &doomed {
                for (dependent_type, field) in references.iter().filter(|(_, f)| f.on_delete == DeletePolicy::Nullify) {
                    for dependent in self.dependents(dependent_type, field, target)? {
                        if !ids.contains(&dependent.id()) {
                            dependent.set(&field.name, Value::Null)?;
                        }
                    }
                }
            }

            for target in &doomed {
                self.remove_row(target)?;
            }
            debug!(removed = doomed.len(), "delete applied");
            Ok(())
        })
    }

    fn dependents(&self, dependent_type: &Arc<RecordType>, field: &FieldDescriptor, target: &Item) -> Result<Vec<Item>> {
        Query::new(self.clone(), dependent_type.clone())
            .filter(dependent_type.column(&field.name)?.eq(target))
            .items()
    }

    fn remove_row(&self, item: &Item) -> Result<()> {
        let id = [SqlValue::Integer(item.id())];
        let sql = delete_row_sql(item.record_type());
        self.with_exec(|exec| {
            let _ = exec.execute(&sql, &id)?;
            let _ = exec.execute("DELETE FROM strata_objects WHERE oid = ?", &id)?;
            Ok(())
        })?;
        item.mark_deleted();
        self.inner.cache.lock().evict(item);
        self.touch(item);
        Ok(())
    }

    // ─────────────────────────────────────────────────────────────────────
    // Internals
    // ─────────────────────────────────────────────────────────────────────

    /// Run `f` on the connection, failing once the store is closed.
    pub(crate) fn with_exec<T>(&self, f: impl FnOnce(&mut Executor) -> Result<T>) -> Result<T> {
        let mut exec = self.inner.exec.lock();
        let exec = exec.as_mut().ok_or(StoreError::Closed)?;
        f(exec)
    }

    /// Run `f` on the schema view and the connection (schema lock first).
    pub(crate) fn with_schema<T>(&self, f: impl FnOnce(&mut SchemaCatalog, &mut Executor) -> Result<T>) -> Result<T> {
        let mut guard = self.inner.schema.lock();
        let schema = &mut *guard;
        self.with_exec(|exec| f(schema, exec))
    }

    pub(crate) fn ensure_table(&self, record_type: &RecordType) -> Result<i64> {
        self.with_schema(|schema, exec| schema.ensure_table(exec, &self.inner.registry, record_type))
    }

    /// The registry's descriptor for `record_type`, which must be current.
    fn current_type(&self, record_type: &RecordType) -> Result<Arc<RecordType>> {
        let unknown = || StoreError::UnknownType {
            name: record_type.name().to_string(),
            version: record_type.version(),
        };
        let registered = self
            .inner
            .registry
            .get(record_type.name(), record_type.version())
            .filter(|t| t.same_shape(record_type))
            .ok_or_else(unknown)?;
        if !self.inner.registry.is_current(&registered) {
            return Err(StoreError::InvalidOperation(format!(
                "{} is not the current version of {}",
                registered.key(),
                registered.name()
            )));
        }
        Ok(registered)
    }

    /// Descriptor for any version: registered, else rebuilt from the
    /// attribute catalog, else inferred from `values`.
    pub(crate) fn type_for_key(&self, key: &TypeKey, values: Option<&Values>) -> Result<Arc<RecordType>> {
        if let Some(registered) = self.inner.registry.get(&key.name, key.version) {
            return Ok(registered);
        }
        if let Some(placeholder) = self.with_schema(|schema, exec| schema.placeholder(exec, &self.inner.registry, key))? {
            return Ok(Arc::new(placeholder));
        }
        let Some(values) = values else {
            return Err(StoreError::UnknownType {
                name: key.name.clone(),
                version: key.version,
            });
        };
        let fields = values
            .iter()
            .map(|(name, value)| FieldDescriptor::new(name.clone(), value.natural_kind().unwrap_or(FieldKind::Transient)))
            .collect();
        Ok(Arc::new(RecordType::placeholder(key.clone(), fields)))
    }

    /// Reject reference values owned by another store.
    pub(crate) fn check_reference(&self, field: &str, value: &Value) -> Result<()> {
        match value {
            Value::Reference(r) if r.store != self.inner.id => Err(StoreError::NoCrossStoreReference {
                field: field.to_string(),
            }),
            _ => Ok(()),
        }
    }

    /// Release hook for a dropped item.
    pub(crate) fn release_cached(&self, id: i64, ptr: *const ItemInner) -> bool {
        self.inner.cache.lock().release(id, ptr)
    }
}

impl fmt::Debug for Store {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Store")
            .field("id", &self.inner.id)
            .field("directory", &self.inner.directory)
            .finish_non_exhaustive()
    }
}
