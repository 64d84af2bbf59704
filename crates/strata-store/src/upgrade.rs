//! Upgrade engine.
//!
//! A row stored by version `v` of a type whose current version is `V > v`
//! is loaded as an uncached legacy item and walked through the registered
//! single-step upgraders `v → v+1 → … → V`. Intermediate versions without a
//! loaded definition get a placeholder type. Only the final version is
//! persisted: the old row is removed, the new row keeps the identifier, and
//! the result replaces the legacy instance in the identity cache. The whole
//! walk runs in one transaction, so a failed step leaves the stored row
//! untouched.

use rusqlite::types::Value as SqlValue;
use tracing::{debug, info, instrument};

use crate::errors::{Result, StoreError};
use crate::item::{Item, Origin};
use crate::record::{RecordType, TypeKey};
use crate::schema::{delete_row_sql, insert_row_sql};
use crate::sqlite::row_helpers::int_at;
use crate::stats::Counters;
use crate::store::Store;

impl Store {
    /// Upgrade `legacy` to the current version of its type.
    #[instrument(skip_all, fields(id = legacy.id(), from = %legacy.record_type().key()))]
    pub(crate) fn upgrade_legacy(&self, legacy: Item) -> Result<Item> {
        let name = legacy.record_type().name().to_string();
        let target = self
            .inner
            .registry
            .current(&name)
            .ok_or_else(|| StoreError::UnknownType {
                name: name.clone(),
                version: legacy.record_type().version(),
            })?;
        let id = legacy.id();
        let origin_type = legacy.record_type().clone();
        let type_id = self.ensure_table(&target)?;

        self.transact(|| {
            let mut current = legacy;
            while current.record_type().version() < target.version() {
                let from = current.record_type().version();
                let upgrader = self
                    .inner
                    .registry
                    .upgrader(&name, from)
                    .ok_or_else(|| StoreError::UpgradeChainBroken {
                        type_name: name.clone(),
                        from,
                        to: target.version(),
                    })?;
                let values = upgrader(&current)?;

                let next_key = TypeKey::new(name.as_str(), from + 1);
                let next_type = if next_key == *target.key() {
                    target.clone()
                } else {
                    self.type_for_key(&next_key, Some(&values))?
                };
                let values = next_type.complete_values(values)?;
                for (field, value) in &values {
                    self.check_reference(field, value)?;
                }
                Counters::bump(&self.inner.counters.upgrade_steps);
                debug!(id, from, to = from + 1, "upgrade step applied");

                let last = next_type.version() == target.version();
                let origin = if last { Origin::Upgraded } else { Origin::Loaded };
                current = Item::new(self, next_type, id, values, !last, origin);
            }

            let key = [SqlValue::Integer(id)];
            let mut row = vec![SqlValue::Integer(id)];
            row.extend(current.row_params());
            let delete_old = delete_row_sql(&origin_type);
            let insert_new = insert_row_sql(&target);
            self.with_exec(|exec| {
                let _ = exec.execute(&delete_old, &key)?;
                let _ = exec.execute(&insert_new, &row)?;
                let _ = exec.execute(
                    "UPDATE strata_objects SET type_id = ? WHERE oid = ?",
                    &[SqlValue::Integer(type_id), SqlValue::Integer(id)],
                )?;
                Ok(())
            })?;

            self.inner.cache.lock().insert(&current);
            self.touch(&current);
            info!(id, to = %target.key(), "item upgraded");
            Ok(current)
        })
    }

    /// Upgrade every stored row of an older version of a registered type.
    /// Returns how many rows were upgraded.
    #[instrument(skip(self))]
    pub fn upgrade_all(&self) -> Result<usize> {
        let mut upgraded = 0;
        for current in self.inner.registry.current_types() {
            upgraded += self.upgrade_stored(&current)?;
        }
        info!(upgraded, "legacy rows upgraded");
        Ok(upgraded)
    }

    /// Upgrade every row stored under an older version of `current`.
    pub(crate) fn upgrade_stored(&self, current: &RecordType) -> Result<usize> {
        let versions = self.with_schema(|schema, exec| schema.versions_on_disk(exec, current.name()))?;
        let mut upgraded = 0;
        for version in versions.into_iter().filter(|v| *v < current.version()) {
            let table = TypeKey::new(current.name(), version).table_name();
            let ids = self.with_exec(|exec| {
                exec.execute(&format!("SELECT oid FROM {table} ORDER BY oid"), &[])?
                    .iter()
                    .map(|row| int_at(row, 0, &table, "oid"))
                    .collect::<Result<Vec<_>>>()
            })?;
            for id in ids {
                let _ = self.get_by_id(id)?;
                upgraded += 1;
            }
        }
        if upgraded > 0 {
            debug!(record_type = %current.key(), upgraded, "stored rows upgraded");
        }
        Ok(upgraded)
    }
}

