//! Error types for the object store.
//!
//! [`StoreError`] is returned by every store operation. Consistency and
//! bookkeeping failures are fatal; [`StoreError::LockTimeout`] is the only
//! transient condition and [`StoreError::TableAlreadyExists`] is benign
//! (the schema layer absorbs it internally).

use thiserror::Error;

/// Errors that can occur during object store operations.
#[derive(Debug, Error)]
pub enum StoreError {
    /// Opaque backend error.
    #[error("sqlite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    /// Filesystem error while opening a store directory.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Settings could not be loaded or were invalid.
    #[error("settings error: {0}")]
    Settings(#[from] strata_settings::SettingsError),

    /// In-memory and on-disk descriptions of the same type version disagree.
    #[error("schema consistency error for {type_name} v{version}: {detail}")]
    SchemaConsistency {
        /// Type name.
        type_name: String,
        /// Type version.
        version: u32,
        /// What differs.
        detail: String,
    },

    /// The database holds a newer version of a type than this process knows.
    #[error("unsupported downgrade of {type_name}: on-disk v{on_disk} > in-memory v{in_memory}")]
    UnsupportedDowngrade {
        /// Type name.
        type_name: String,
        /// Highest version found in the type catalog.
        on_disk: u32,
        /// Current version in the registry.
        in_memory: u32,
    },

    /// Lost a table creation race with another connection.
    #[error("table already exists: {0}")]
    TableAlreadyExists(String),

    /// The backend lock was not acquired within the configured timeout.
    #[error("database locked: gave up after {waited_ms}ms")]
    LockTimeout {
        /// Milliseconds spent retrying.
        waited_ms: u64,
    },

    /// Replaying a transaction after DDL produced a different row id.
    #[error("concurrent schema change detected: replay produced id {actual}, expected {expected}")]
    CreateConcurrency {
        /// Id assigned by the original statement.
        expected: i64,
        /// Id assigned by the replayed statement.
        actual: i64,
    },

    /// A reference field points at a row that no longer exists.
    #[error("broken reference: item {item_id} field {field} points at missing item {target}")]
    BrokenReference {
        /// Referencing item.
        item_id: i64,
        /// Reference field name.
        field: String,
        /// Missing target id.
        target: i64,
    },

    /// A dependent row under a `Disallow` policy blocks the delete.
    #[error("cannot delete item {item_id}: {dependent_type}.{field} of item {dependent_id} refers to it")]
    DeletionDisallowed {
        /// Item whose deletion was requested.
        item_id: i64,
        /// Type of the blocking dependent.
        dependent_type: String,
        /// Reference field on the dependent.
        field: String,
        /// Blocking dependent id.
        dependent_id: i64,
    },

    /// A reference value names an item of another store.
    #[error("field {field} cannot refer to an item in another store")]
    NoCrossStoreReference {
        /// Reference field name.
        field: String,
    },

    /// No upgrader is registered for a required version step.
    #[error("no upgrader for {type_name} v{from} -> v{} (current v{to})", .from + 1)]
    UpgradeChainBroken {
        /// Type name.
        type_name: String,
        /// Version the missing step starts from.
        from: u32,
        /// Current version the row must reach.
        to: u32,
    },

    /// No live row carries this identifier.
    #[error("item not found: {0}")]
    ItemNotFound(i64),

    /// The type is not registered (or not registered at that version).
    #[error("unknown type: {name} v{version}")]
    UnknownType {
        /// Type name.
        name: String,
        /// Requested version.
        version: u32,
    },

    /// The type has no field of that name.
    #[error("type {type_name} has no field {field}")]
    UnknownField {
        /// Type name.
        type_name: String,
        /// Field name.
        field: String,
    },

    /// A value does not fit the field it is assigned to.
    #[error("invalid value for {field}: {detail}")]
    InvalidValue {
        /// Field name.
        field: String,
        /// Why the value was rejected.
        detail: String,
    },

    /// A record type definition is malformed.
    #[error("invalid record type definition: {0}")]
    InvalidDefinition(String),

    /// The operation is not valid in the current state.
    #[error("invalid operation: {0}")]
    InvalidOperation(String),

    /// The item was deleted, or created by a transaction that reverted.
    #[error("item {0} is no longer part of its store")]
    ItemGone(i64),

    /// A statement template embedded a quoted literal.
    #[error("statement template contains a raw literal: {0}")]
    UnsafeStatement(String),

    /// Catalog migration failed.
    #[error("migration error: {message}")]
    Migration {
        /// Describes which migration failed and why.
        message: String,
    },

    /// A catalog or data row could not be decoded.
    #[error("corrupt row in {table}.{column}: {detail}")]
    CorruptRow {
        /// Table name.
        table: String,
        /// Column name.
        column: &'static str,
        /// Decoding failure.
        detail: String,
    },

    /// The store has been closed.
    #[error("store is closed")]
    Closed,
}

impl StoreError {
    /// Whether retrying the same operation later may succeed.
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::LockTimeout { .. })
    }
}

/// Convenience type alias for store results.
pub type Result<T> = std::result::Result<T, StoreError>;

// ─────────────────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sqlite_error_display() {
        let err = StoreError::Sqlite(rusqlite::Error::QueryReturnedNoRows);
        assert!(err.to_string().contains("sqlite error"));
    }

    #[test]
    fn upgrade_chain_display_names_missing_step() {
        let err = StoreError::UpgradeChainBroken {
            type_name: "Person".into(),
            from: 2,
            to: 4,
        };
        assert_eq!(
            err.to_string(),
            "no upgrader for Person v2 -> v3 (current v4)"
        );
    }

    #[test]
    fn downgrade_display() {
        let err = StoreError::UnsupportedDowngrade {
            type_name: "Person".into(),
            on_disk: 3,
            in_memory: 2,
        };
        assert_eq!(
            err.to_string(),
            "unsupported downgrade of Person: on-disk v3 > in-memory v2"
        );
    }

    #[test]
    fn only_lock_timeout_is_transient() {
        assert!(StoreError::LockTimeout { waited_ms: 10 }.is_transient());
        assert!(!StoreError::ItemNotFound(1).is_transient());
        assert!(!StoreError::Closed.is_transient());
    }

    #[test]
    fn from_rusqlite_error() {
        let err: StoreError = rusqlite::Error::QueryReturnedNoRows.into();
        assert!(matches!(err, StoreError::Sqlite(_)));
    }
}
