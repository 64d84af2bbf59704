use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::errors::{Result, SettingsError};

/// Backend journal mode applied when a store opens its database file.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JournalMode {
    /// Write-ahead log. Readers in other processes are not blocked by a writer.
    Wal,
    /// Rollback journal.
    Delete,
}

impl JournalMode {
    /// Value for `PRAGMA journal_mode`.
    pub fn as_pragma(self) -> &'static str {
        match self {
            Self::Wal => "WAL",
            Self::Delete => "DELETE",
        }
    }
}

/// Settings applied to every opened store.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct StoreSettings {
    /// How long a statement keeps retrying a locked database before failing.
    pub lock_timeout_ms: u64,
    /// Pause between two attempts on a locked database.
    pub lock_retry_interval_ms: u64,
    /// Capacity of the per-connection prepared statement cache.
    pub statement_cache_capacity: usize,
    /// Journal mode for file-backed stores.
    pub journal_mode: JournalMode,
    /// Name of the database file inside the store directory.
    pub database_file_name: String,
}

impl StoreSettings {
    /// Lock timeout as a [`Duration`].
    pub fn lock_timeout(&self) -> Duration {
        Duration::from_millis(self.lock_timeout_ms)
    }

    /// Retry interval as a [`Duration`].
    pub fn lock_retry_interval(&self) -> Duration {
        Duration::from_millis(self.lock_retry_interval_ms)
    }

    /// Check cross-field constraints that serde cannot express.
    pub fn validate(&self) -> Result<()> {
        if self.lock_retry_interval_ms == 0 {
            return Err(SettingsError::InvalidValue(
                "lockRetryIntervalMs must be positive".to_string(),
            ));
        }
        if self.lock_retry_interval_ms > self.lock_timeout_ms {
            return Err(SettingsError::InvalidValue(format!(
                "lockRetryIntervalMs ({}) exceeds lockTimeoutMs ({})",
                self.lock_retry_interval_ms, self.lock_timeout_ms
            )));
        }
        if self.database_file_name.is_empty() {
            return Err(SettingsError::InvalidValue(
                "databaseFileName must not be empty".to_string(),
            ));
        }
        Ok(())
    }
}

impl Default for StoreSettings {
    fn default() -> Self {
        Self {
            lock_timeout_ms: 10_000,
            lock_retry_interval_ms: 100,
            statement_cache_capacity: 64,
            journal_mode: JournalMode::Wal,
            database_file_name: "db.sqlite".to_string(),
        }
    }
}
