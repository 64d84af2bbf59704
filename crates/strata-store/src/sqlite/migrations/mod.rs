//! Catalog bootstrap and evolution.
//!
//! The catalog tables are created by version-tracked migrations embedded at
//! compile time. Each pending migration runs in its own write transaction,
//! and the applied version is re-read inside that transaction so two
//! processes opening a fresh file at once apply it exactly once.

use rusqlite::types::Value as SqlValue;
use tracing::{debug, info};

use crate::errors::{Result, StoreError};
use crate::sqlite::executor::Executor;

/// A single migration with a version number and SQL to execute.
struct Migration {
    version: u32,
    description: &'static str,
    sql: &'static str,
}

/// All migrations in version order.
const MIGRATIONS: &[Migration] = &[Migration {
    version: 1,
    description: "type, attribute and object catalogs",
    sql: include_str!("v001_catalog.sql"),
}];

/// Apply every pending migration, returning how many ran.
pub(crate) fn run_migrations(exec: &mut Executor) -> Result<u32> {
    exec.execute_ddl(
        "CREATE TABLE IF NOT EXISTS strata_schema_version (
           version     INTEGER PRIMARY KEY,
           applied_at  TEXT    NOT NULL,
           description TEXT
         )",
    )?;
    let mut applied = 0;

    for migration in MIGRATIONS {
        let ran = exec.with_schema_change(|exec| {
            if current_version(exec)? >= migration.version {
                debug!(version = migration.version, "migration already applied, skipping");
                return Ok(false);
            }
            info!(
                version = migration.version,
                description = migration.description,
                "applying migration"
            );
            exec.execute_ddl(migration.sql)
                .map_err(|e| StoreError::Migration {
                    message: format!(
                        "migration v{} ({}) failed: {e}",
                        migration.version, migration.description
                    ),
                })?;
            let _ = exec.execute(
                "INSERT INTO strata_schema_version (version, applied_at, description) VALUES (?, ?, ?)",
                &[
                    SqlValue::Integer(i64::from(migration.version)),
                    SqlValue::Text(chrono::Utc::now().to_rfc3339()),
                    SqlValue::Text(migration.description.to_string()),
                ],
            )?;
            Ok(true)
        })?;
        if ran {
            applied += 1;
        }
    }

    Ok(applied)
}

/// Highest applied catalog version, or 0.
pub(crate) fn current_version(exec: &mut Executor) -> Result<u32> {
    let rows = exec.execute(
        "SELECT COALESCE(MAX(version), 0) FROM strata_schema_version",
        &[],
    )?;
    match rows.first().and_then(|r| r.first()) {
        Some(SqlValue::Integer(v)) => Ok(*v as u32),
        _ => Ok(0),
    }
}

/// Latest catalog version defined in code.
pub(crate) fn latest_version() -> u32 {
    MIGRATIONS.last().map_or(0, |m| m.version)
}

// ─────────────────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────────────────
