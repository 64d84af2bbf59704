//! In-memory items.
//!
//! An [`Item`] is a shared handle to the single live instance of one row.
//! Clones share state; two handles obtained for the same id while one is
//! alive are the same instance ([`Item::ptr_eq`]). Field writes go through
//! the store's transaction manager: outside a transaction each write
//! commits on its own, inside one it marks the item dirty until the
//! outermost transaction checkpoints.

use std::fmt;
use std::sync::{Arc, Weak};

use parking_lot::Mutex;
use rusqlite::types::Value as SqlValue;

use crate::errors::{Result, StoreError};
use crate::record::RecordType;
use crate::store::{Referent, Store};
use crate::value::{FieldKind, Reference, Value, Values};

/// Lifecycle of an in-memory instance.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum Status {
    Live,
    Deleted,
    /// Created or upgraded by a transaction that reverted.
    Reverted,
}

/// How the instance came to exist inside the open transaction.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum Origin {
    Loaded,
    Created,
    Upgraded,
}

/// What a revert did to an instance.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum Reverted {
    /// Discarded; `created` when its identifier must be retired.
    Discarded { created: bool },
    /// Values restored from the last committed snapshot.
    Restored { undeleted: bool },
}

pub(crate) struct ItemState {
    values: Values,
    committed: Values,
    status: Status,
    origin: Origin,
    dirty: bool,
    deleted_in_txn: bool,
}

pub(crate) struct ItemInner {
    id: i64,
    store: Store,
    record_type: Arc<RecordType>,
    legacy: bool,
    state: Mutex<ItemState>,
}

/// Shared handle to a live item.
#[derive(Clone)]
pub struct Item(pub(crate) Arc<ItemInner>);

impl Item {
    pub(crate) fn new(
        store: &Store,
        record_type: Arc<RecordType>,
        id: i64,
        values: Values,
        legacy: bool,
        origin: Origin,
    ) -> Self {
        let committed = persisted(&record_type, &values);
        Self(Arc::new(ItemInner {
            id,
            store: store.clone(),
            record_type,
            legacy,
            state: Mutex::new(ItemState {
                values,
                committed,
                status: Status::Live,
                origin,
                dirty: false,
                deleted_in_txn: false,
            }),
        }))
    }

    /// Row identifier.
    pub fn id(&self) -> i64 {
        self.0.id
    }

    /// Owning store.
    pub fn store(&self) -> &Store {
        &self.0.store
    }

    /// Type descriptor of this instance.
    pub fn record_type(&self) -> &Arc<RecordType> {
        &self.0.record_type
    }

    /// Whether this is an uncached pre-upgrade instance handed to an upgrader.
    pub fn is_legacy(&self) -> bool {
        self.0.legacy
    }

    /// Whether both handles point at the same in-memory instance.
    pub fn ptr_eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.0, &other.0)
    }

    /// Whether the item is still part of its store.
    pub fn is_live(&self) -> bool {
        self.0.state.lock().status == Status::Live
    }

    /// Reference value pointing at this item.
    pub fn reference(&self) -> Reference {
        Reference {
            store: self.0.store.id(),
            id: self.0.id,
        }
    }

    /// Current value of `field`.
    pub fn get(&self, field: &str) -> Result<Value> {
        let _ = self.0.record_type.field(field)?;
        Ok(self
            .0
            .state
            .lock()
            .values
            .get(field)
            .cloned()
            .unwrap_or(Value::Null))
    }

    /// Snapshot of every field value.
    pub fn values(&self) -> Values {
        self.0.state.lock().values.clone()
    }

    /// Assign `field`.
    ///
    /// Persisted fields are written inside a transaction; outside one the
    /// write commits immediately. Transient fields only change memory.
    pub fn set(&self, field: &str, value: impl Into<Value>) -> Result<()> {
        let value = value.into();
        let descriptor = self.0.record_type.field(field)?;
        descriptor.check(&value)?;
        if self.0.legacy {
            return Err(StoreError::InvalidOperation(format!(
                "legacy item {} is read-only",
                self.0.id
            )));
        }
        self.0.store.check_reference(field, &value)?;

        if descriptor.kind == FieldKind::Transient {
            let mut state = self.0.state.lock();
            if state.status != Status::Live {
                return Err(StoreError::ItemGone(self.0.id));
            }
            let _ = state.values.insert(field.to_string(), value);
            return Ok(());
        }

        self.0.store.transact(|| {
            {
                let mut state = self.0.state.lock();
                if state.status != Status::Live {
                    return Err(StoreError::ItemGone(self.0.id));
                }
                let _ = state.values.insert(field.to_string(), value);
                state.dirty = true;
            }
            self.0.store.touch(self);
            Ok(())
        })
    }

    /// Resolve a reference field.
    ///
    /// Returns `None` for a null reference and
    /// [`StoreError::BrokenReference`] when the target row is gone.
    pub fn referent(&self, field: &str) -> Result<Option<Referent>> {
        let descriptor = self.0.record_type.field(field)?;
        if descriptor.kind != FieldKind::Reference {
            return Err(StoreError::InvalidOperation(format!(
                "{}.{field} is not a reference field",
                self.0.record_type.name()
            )));
        }
        let Some(target) = self.get(field)?.as_reference() else {
            return Ok(None);
        };
        match self.0.store.resolve(target.id) {
            Ok(referent) => Ok(Some(referent)),
            Err(StoreError::ItemNotFound(missing)) => Err(StoreError::BrokenReference {
                item_id: self.0.id,
                field: field.to_string(),
                target: missing,
            }),
            Err(e) => Err(e),
        }
    }

    /// Delete this item, applying the delete policies of every reference
    /// field that points at it.
    pub fn delete(&self) -> Result<()> {
        self.0.store.delete_item(self)
    }

    // ─────────────────────────────────────────────────────────────────────
    // Transaction bookkeeping
    // ─────────────────────────────────────────────────────────────────────

    pub(crate) fn downgrade(&self) -> Weak<ItemInner> {
        Arc::downgrade(&self.0)
    }

    pub(crate) fn as_ptr(&self) -> *const ItemInner {
        Arc::as_ptr(&self.0)
    }

    pub(crate) fn ensure_live(&self) -> Result<()> {
        if self.is_live() {
            Ok(())
        } else {
            Err(StoreError::ItemGone(self.0.id))
        }
    }

    /// Persisted values as statement parameters, in column order.
    pub(crate) fn row_params(&self) -> Vec<SqlValue> {
        let state = self.0.state.lock();
        self.0
            .record_type
            .persisted_fields()
            .map(|f| state.values.get(&f.name).map_or(SqlValue::Null, Value::to_sql))
            .collect()
    }

    /// Parameters for the pending `UPDATE`, clearing the dirty flag.
    /// `None` when nothing needs writing.
    pub(crate) fn take_checkpoint(&self) -> Option<Vec<SqlValue>> {
        {
            let mut state = self.0.state.lock();
            if !state.dirty || state.status != Status::Live {
                return None;
            }
            state.dirty = false;
        }
        let mut params = self.row_params();
        if params.is_empty() {
            return None;
        }
        params.push(SqlValue::Integer(self.0.id));
        Some(params)
    }

    pub(crate) fn mark_deleted(&self) {
        let mut state = self.0.state.lock();
        state.status = Status::Deleted;
        state.deleted_in_txn = true;
        state.dirty = false;
    }

    pub(crate) fn mark_committed(&self) {
        let mut state = self.0.state.lock();
        state.committed = persisted(&self.0.record_type, &state.values);
        state.origin = Origin::Loaded;
        state.dirty = false;
        state.deleted_in_txn = false;
    }

    /// Undo this transaction's effects on the instance.
    pub(crate) fn revert(&self) -> Reverted {
        let mut state = self.0.state.lock();
        state.dirty = false;
        if state.origin != Origin::Loaded {
            state.status = Status::Reverted;
            return Reverted::Discarded {
                created: state.origin == Origin::Created,
            };
        }
        let committed = state.committed.clone();
        state.values.extend(committed);
        let undeleted = std::mem::take(&mut state.deleted_in_txn);
        if undeleted {
            state.status = Status::Live;
        }
        Reverted::Restored { undeleted }
    }
}

impl fmt::Debug for Item {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.0.state.lock();
        f.debug_struct("Item")
            .field("id", &self.0.id)
            .field("type", self.0.record_type.key())
            .field("status", &state.status)
            .field("values", &state.values)
            .finish()
    }
}

impl From<&Item> for Value {
    fn from(item: &Item) -> Self {
        Self::Reference(item.reference())
    }
}

impl From<Item> for Value {
    fn from(item: Item) -> Self {
        Self::from(&item)
    }
}

impl Drop for ItemInner {
    fn drop(&mut self) {
        // Legacy instances are upgrade inputs, never cached or handed out.
        if self.legacy {
            return;
        }
        let _ = self.store.release_cached(self.id, std::ptr::from_ref(self));
        if let Some(hook) = self.record_type.on_release() {
            let state = self.state.get_mut();
            let transient: Values = self
                .record_type
                .fields()
                .iter()
                .filter(|f| !f.kind.is_persisted())
                .filter_map(|f| state.values.get(&f.name).map(|v| (f.name.clone(), v.clone())))
                .collect();
            hook(self.id, &transient);
        }
    }
}

fn persisted(record_type: &RecordType, values: &Values) -> Values {
    record_type
        .persisted_fields()
        .filter_map(|f| values.get(&f.name).map(|v| (f.name.clone(), v.clone())))
        .collect()
}
