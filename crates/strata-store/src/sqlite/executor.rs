//! Statement execution over a single `rusqlite` connection.
//!
//! The executor owns the connection and is the only code that talks to the
//! backend. It provides:
//!
//! - positional-parameter execution returning owned rows,
//! - bounded retry of locked/busy attempts (fixed interval, caller timeout),
//! - translation of backend failures into [`StoreError`] shapes,
//! - a statement journal for the open logical transaction, so a schema
//!   change can roll the transaction back, run its DDL, and replay it.
//!
//! If the transaction cannot be reopened or replayed after a schema change,
//! the executor is poisoned: every statement fails until [`Executor::rollback`]
//! runs, so nothing can silently autocommit in place of the lost transaction.

use std::path::Path;
use std::sync::Arc;
use std::time::{Duration, Instant};

use rusqlite::types::Value as SqlValue;
use rusqlite::{Connection, ErrorCode, params_from_iter};
use strata_settings::StoreSettings;
use tracing::{debug, trace, warn};

use crate::errors::{Result, StoreError};
use crate::sqlite::row_helpers::check_template;
use crate::stats::Counters;

/// One result row, column values in select order.
pub(crate) type Row = Vec<SqlValue>;

/// Retry policy for locked databases.
#[derive(Clone, Copy, Debug)]
pub(crate) struct LockPolicy {
    pub(crate) timeout: Duration,
    pub(crate) interval: Duration,
}

impl From<&StoreSettings> for LockPolicy {
    fn from(settings: &StoreSettings) -> Self {
        Self {
            timeout: settings.lock_timeout(),
            interval: settings.lock_retry_interval(),
        }
    }
}

/// A statement executed inside the open logical transaction.
#[derive(Clone, Debug)]
struct JournalEntry {
    sql: String,
    params: Vec<SqlValue>,
    inserted_id: Option<i64>,
}

pub(crate) struct Executor {
    conn: Connection,
    lock: LockPolicy,
    journal: Option<Vec<JournalEntry>>,
    /// Set when a suspended transaction could not be restored.
    poisoned: bool,
    counters: Arc<Counters>,
}

impl Executor {
    /// Open (creating if needed) a database file.
    pub(crate) fn open_file(path: &Path, settings: &StoreSettings, counters: Arc<Counters>) -> Result<Self> {
        let conn = Connection::open(path)?;
        let executor = Self::configure(conn, settings, counters)?;
        let mode = settings.journal_mode.as_pragma();
        let _ = executor.with_retry(|c| c.query_row(&format!("PRAGMA journal_mode = {mode}"), [], |row| row.get::<_, String>(0)))?;
        Ok(executor)
    }

    /// Open a private in-memory database.
    pub(crate) fn open_in_memory(settings: &StoreSettings, counters: Arc<Counters>) -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        Self::configure(conn, settings, counters)
    }

    /// Close the connection, surfacing any error the backend reports.
    pub(crate) fn close(self) -> Result<()> {
        self.conn.close().map_err(|(_, e)| StoreError::Sqlite(e))
    }

    fn configure(conn: Connection, settings: &StoreSettings, counters: Arc<Counters>) -> Result<Self> {
        // Lock waits are handled by `with_retry`, not by the backend.
        conn.busy_timeout(Duration::ZERO)?;
        conn.execute_batch("PRAGMA foreign_keys = ON; PRAGMA synchronous = NORMAL;")?;
        conn.set_prepared_statement_cache_capacity(settings.statement_cache_capacity);
        Ok(Self {
            conn,
            lock: LockPolicy::from(settings),
            journal: None,
            poisoned: false,
            counters,
        })
    }

    // ─────────────────────────────────────────────────────────────────────
    // Statements
    // ─────────────────────────────────────────────────────────────────────

    /// Run a statement and collect every result row.
    pub(crate) fn execute(&mut self, sql: &str, params: &[SqlValue]) -> Result<Vec<Row>> {
        self.check_usable()?;
        check_template(sql)?;
        let rows = self.run(sql, params)?;
        self.record(sql, params, None);
        Ok(rows)
    }

    /// Run an `INSERT` and return the row id it assigned.
    pub(crate) fn execute_for_inserted_id(&mut self, sql: &str, params: &[SqlValue]) -> Result<i64> {
        self.check_usable()?;
        check_template(sql)?;
        let _ = self.run(sql, params)?;
        let id = self.conn.last_insert_rowid();
        self.record(sql, params, Some(id));
        Ok(id)
    }

    /// Run a schema statement (never journaled, never cached).
    pub(crate) fn execute_ddl(&mut self, sql: &str) -> Result<()> {
        self.check_usable()?;
        check_template(sql)?;
        trace!(sql, "ddl");
        self.with_retry(|c| c.execute_batch(sql))?;
        Counters::bump(&self.counters.statements);
        Counters::bump(&self.counters.ddl_statements);
        Ok(())
    }

    fn run(&self, sql: &str, params: &[SqlValue]) -> Result<Vec<Row>> {
        trace!(sql, params = params.len(), "execute");
        let rows = self.with_retry(|c| {
            let mut stmt = c.prepare_cached(sql)?;
            let width = stmt.column_count();
            let mut rows = stmt.query(params_from_iter(params.iter()))?;
            let mut out = Vec::new();
            while let Some(row) = rows.next()? {
                let mut values = Vec::with_capacity(width);
                for idx in 0..width {
                    values.push(row.get::<_, SqlValue>(idx)?);
                }
                out.push(values);
            }
            Ok(out)
        })?;
        Counters::bump(&self.counters.statements);
        Ok(rows)
    }

    fn check_usable(&self) -> Result<()> {
        if self.poisoned {
            return Err(StoreError::InvalidOperation(
                "transaction was lost during a schema change; revert it first".to_string(),
            ));
        }
        Ok(())
    }

    fn record(&mut self, sql: &str, params: &[SqlValue], inserted_id: Option<i64>) {
        if let Some(journal) = self.journal.as_mut() {
            journal.push(JournalEntry {
                sql: sql.to_string(),
                params: params.to_vec(),
                inserted_id,
            });
        }
    }

    /// Retry `op` while the database reports busy/locked, up to the timeout.
    fn with_retry<T>(&self, mut op: impl FnMut(&Connection) -> rusqlite::Result<T>) -> Result<T> {
        let started = Instant::now();
        loop {
            match op(&self.conn) {
                Ok(value) => return Ok(value),
                Err(e) if is_locked(&e) => {
                    let waited = started.elapsed();
                    if waited >= self.lock.timeout {
                        return Err(StoreError::LockTimeout {
                            waited_ms: waited.as_millis() as u64,
                        });
                    }
                    Counters::bump(&self.counters.lock_retries);
                    std::thread::sleep(self.lock.interval);
                }
                Err(e) => return Err(translate(e)),
            }
        }
    }

    // ─────────────────────────────────────────────────────────────────────
    // Transactions
    // ─────────────────────────────────────────────────────────────────────

    /// Whether a logical transaction is open.
    pub(crate) fn in_transaction(&self) -> bool {
        self.journal.is_some() || self.poisoned
    }

    /// Open a write transaction and start journaling.
    pub(crate) fn begin(&mut self) -> Result<()> {
        self.check_usable()?;
        self.with_retry(|c| c.execute_batch("BEGIN IMMEDIATE"))?;
        self.journal = Some(Vec::new());
        Ok(())
    }

    pub(crate) fn commit(&mut self) -> Result<()> {
        self.check_usable()?;
        self.with_retry(|c| c.execute_batch("COMMIT"))?;
        self.journal = None;
        Ok(())
    }

    /// Discard the open transaction, if any. Safe to call when none is open.
    /// Clears a poisoned state.
    pub(crate) fn rollback(&mut self) -> Result<()> {
        self.journal = None;
        self.poisoned = false;
        if !self.conn.is_autocommit() {
            self.conn.execute_batch("ROLLBACK")?;
        }
        Ok(())
    }

    /// Run a schema change outside of any logical transaction.
    ///
    /// With a transaction open, its statements are rolled back, `change` runs
    /// in its own backend transaction, and the journal is replayed. Every
    /// replayed insert must reproduce its original row id. When the
    /// transaction cannot be restored the executor is poisoned.
    pub(crate) fn with_schema_change<T>(&mut self, change: impl FnOnce(&mut Self) -> Result<T>) -> Result<T> {
        self.check_usable()?;
        let Some(journal) = self.journal.take() else {
            return self.atomically(change);
        };

        debug!(pending = journal.len(), "suspending transaction for schema change");
        if let Err(e) = self.conn.execute_batch("ROLLBACK") {
            self.poisoned = true;
            return Err(e.into());
        }
        let outcome = self.atomically(change);

        if let Err(e) = self.restore(journal) {
            warn!(error = %e, "could not restore transaction after schema change");
            self.poisoned = true;
            return Err(e);
        }
        outcome
    }

    /// Reopen the transaction and replay `journal` into it.
    fn restore(&mut self, journal: Vec<JournalEntry>) -> Result<()> {
        self.begin()?;
        for entry in journal {
            self.replay(entry)?;
        }
        Ok(())
    }

    fn atomically<T>(&mut self, f: impl FnOnce(&mut Self) -> Result<T>) -> Result<T> {
        self.with_retry(|c| c.execute_batch("BEGIN IMMEDIATE"))?;
        match f(self) {
            Ok(value) => {
                self.with_retry(|c| c.execute_batch("COMMIT"))?;
                Ok(value)
            }
            Err(e) => {
                if !self.conn.is_autocommit() {
                    self.conn.execute_batch("ROLLBACK")?;
                }
                Err(e)
            }
        }
    }

    fn replay(&mut self, entry: JournalEntry) -> Result<()> {
        match entry.inserted_id {
            Some(expected) => {
                let actual = self.execute_for_inserted_id(&entry.sql, &entry.params)?;
                if actual != expected {
                    return Err(StoreError::CreateConcurrency { expected, actual });
                }
            }
            None => {
                let _ = self.execute(&entry.sql, &entry.params)?;
            }
        }
        Ok(())
    }
}

fn is_locked(err: &rusqlite::Error) -> bool {
    matches!(
        err,
        rusqlite::Error::SqliteFailure(e, _)
            if matches!(e.code, ErrorCode::DatabaseBusy | ErrorCode::DatabaseLocked)
    )
}

fn translate(err: rusqlite::Error) -> StoreError {
    if let rusqlite::Error::SqliteFailure(_, Some(message)) = &err {
        if message.contains("already exists") {
            return StoreError::TableAlreadyExists(message.clone());
        }
    }
    StoreError::Sqlite(err)
}

// ─────────────────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────────────────
