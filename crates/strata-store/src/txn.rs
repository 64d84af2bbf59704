//! Transaction manager.
//!
//! One logical transaction per store, re-entrant: a nested
//! [`Store::transact`] joins the outer one. The outermost call owns the
//! backend transaction and the dirty set. On success every dirty item is
//! checkpointed, the backend commits, and committed hooks fire. On failure
//! (or a panic in the body) the backend rolls back and every touched item is
//! reverted; identifiers handed out to items created in the failed
//! transaction are retired so they never resolve again.

use std::collections::BTreeMap;

use rusqlite::types::Value as SqlValue;
use tracing::{debug, error, warn};

use crate::errors::{Result, StoreError};
use crate::item::{Item, Reverted};
use crate::schema::update_row_sql;
use crate::stats::Counters;
use crate::store::Store;

/// Table whose AUTOINCREMENT sequence hands out item identifiers.
const OBJECTS_TABLE: &str = "strata_objects";

#[derive(Debug, Default)]
pub(crate) struct TxnState {
    active: bool,
    dirty: BTreeMap<i64, Item>,
}

impl Store {
    /// Run `body` inside a transaction.
    ///
    /// Re-entrant: when a transaction is already open on this store, `body`
    /// runs as part of it and the outermost call decides the outcome. The
    /// error returned by `body` is returned unchanged after the revert.
    pub fn transact<T, E, F>(&self, body: F) -> std::result::Result<T, E>
    where
        F: FnOnce() -> std::result::Result<T, E>,
        E: From<StoreError>,
    {
        if self.in_transaction() {
            return body();
        }

        self.begin_transaction()?;
        let guard = TxnGuard {
            store: self,
            finished: false,
        };
        match body() {
            Ok(value) => {
                guard.commit()?;
                Ok(value)
            }
            Err(e) => {
                guard.revert();
                Err(e)
            }
        }
    }

    /// Whether a transaction is open on this store.
    pub fn in_transaction(&self) -> bool {
        self.inner.txn.lock().active
    }

    /// Add `item` to the dirty set of the open transaction.
    pub(crate) fn touch(&self, item: &Item) {
        let mut txn = self.inner.txn.lock();
        debug_assert!(txn.active, "touch outside a transaction");
        let _ = txn.dirty.entry(item.id()).or_insert_with(|| item.clone());
    }

    /// Write every dirty item's pending changes without committing.
    pub(crate) fn checkpoint(&self) -> Result<()> {
        let dirty: Vec<Item> = self.inner.txn.lock().dirty.values().cloned().collect();
        for item in dirty {
            let Some(params) = item.take_checkpoint() else {
                continue;
            };
            let Some(sql) = update_row_sql(item.record_type()) else {
                continue;
            };
            self.with_exec(|exec| exec.execute(&sql, &params).map(drop))?;
        }
        Ok(())
    }

    fn begin_transaction(&self) -> Result<()> {
        self.with_exec(|exec| exec.begin())?;
        self.inner.txn.lock().active = true;
        debug!(store = self.id().0, "transaction opened");
        Ok(())
    }

    fn commit_transaction(&self) -> Result<()> {
        self.checkpoint()?;
        self.with_exec(|exec| exec.commit())?;

        let dirty = {
            let mut txn = self.inner.txn.lock();
            txn.active = false;
            std::mem::take(&mut txn.dirty)
        };
        for item in dirty.values() {
            item.mark_committed();
        }
        Counters::bump(&self.inner.counters.commits);
        debug!(store = self.id().0, touched = dirty.len(), "transaction committed");

        for item in dirty.values() {
            if let Some(hook) = item.record_type().on_committed() {
                hook(item);
            }
        }
        Ok(())
    }

    fn revert_transaction(&self) {
        if let Err(e) = self.with_exec(|exec| exec.rollback()) {
            error!(store = self.id().0, error = %e, "rollback failed");
        }

        let dirty = {
            let mut txn = self.inner.txn.lock();
            txn.active = false;
            std::mem::take(&mut txn.dirty)
        };

        let mut highest_created = None;
        for item in dirty.values() {
            match item.revert() {
                Reverted::Discarded { created } => {
                    self.inner.cache.lock().evict(item);
                    if created {
                        highest_created = highest_created.max(Some(item.id()));
                    }
                }
                Reverted::Restored { undeleted: true } => self.inner.cache.lock().insert(item),
                Reverted::Restored { undeleted: false } => {}
            }
        }

        if let Some(id) = highest_created {
            if let Err(e) = self.retire_ids_through(id) {
                error!(store = self.id().0, id, error = %e, "failed to retire identifiers");
            }
        }
        Counters::bump(&self.inner.counters.reverts);
        debug!(store = self.id().0, touched = dirty.len(), "transaction reverted");
    }

    /// Advance the identifier sequence past `id` so a rolled-back insert's
    /// identifier is never assigned again.
    fn retire_ids_through(&self, id: i64) -> Result<()> {
        self.with_exec(|exec| {
            let _ = exec.execute(
                "INSERT INTO sqlite_sequence (name, seq) SELECT ?, ?
                 WHERE NOT EXISTS (SELECT 1 FROM sqlite_sequence WHERE name = ?)",
                &[
                    SqlValue::Text(OBJECTS_TABLE.to_string()),
                    SqlValue::Integer(id),
                    SqlValue::Text(OBJECTS_TABLE.to_string()),
                ],
            )?;
            let _ = exec.execute(
                "UPDATE sqlite_sequence SET seq = ? WHERE name = ? AND seq < ?",
                &[
                    SqlValue::Integer(id),
                    SqlValue::Text(OBJECTS_TABLE.to_string()),
                    SqlValue::Integer(id),
                ],
            )?;
            Ok(())
        })
    }
}

/// Reverts the open transaction if the body unwinds.
struct TxnGuard<'s> {
    store: &'s Store,
    finished: bool,
}

impl TxnGuard<'_> {
    fn commit(mut self) -> Result<()> {
        self.finished = true;
        match self.store.commit_transaction() {
            Ok(()) => Ok(()),
            Err(e) => {
                warn!(error = %e, "commit failed, reverting");
                self.store.revert_transaction();
                Err(e)
            }
        }
    }

    fn revert(mut self) {
        self.finished = true;
        self.store.revert_transaction();
    }
}

impl Drop for TxnGuard<'_> {
    fn drop(&mut self) {
        if !self.finished {
            warn!("transaction body panicked, reverting");
            self.store.revert_transaction();
        }
    }
}
