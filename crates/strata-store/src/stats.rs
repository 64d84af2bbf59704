//! Per-store operation counters.

use std::sync::atomic::{AtomicU64, Ordering};

use serde::Serialize;

/// Live counters shared by the store's components.
#[derive(Debug, Default)]
pub(crate) struct Counters {
    pub(crate) statements: AtomicU64,
    pub(crate) ddl_statements: AtomicU64,
    pub(crate) commits: AtomicU64,
    pub(crate) reverts: AtomicU64,
    pub(crate) upgrade_steps: AtomicU64,
    pub(crate) lock_retries: AtomicU64,
    pub(crate) cache_hits: AtomicU64,
    pub(crate) cache_misses: AtomicU64,
}

impl Counters {
    pub(crate) fn bump(counter: &AtomicU64) {
        let _ = counter.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn snapshot(&self) -> StoreStats {
        let load = |c: &AtomicU64| c.load(Ordering::Relaxed);
        StoreStats {
            statements: load(&self.statements),
            ddl_statements: load(&self.ddl_statements),
            commits: load(&self.commits),
            reverts: load(&self.reverts),
            upgrade_steps: load(&self.upgrade_steps),
            lock_retries: load(&self.lock_retries),
            cache_hits: load(&self.cache_hits),
            cache_misses: load(&self.cache_misses),
        }
    }
}

/// Point-in-time copy of a store's counters. All values only grow.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StoreStats {
    /// Statements executed, DDL included.
    pub statements: u64,
    /// Schema statements (tables and indexes).
    pub ddl_statements: u64,
    /// Committed logical transactions.
    pub commits: u64,
    /// Reverted logical transactions.
    pub reverts: u64,
    /// Single-version upgrade steps applied.
    pub upgrade_steps: u64,
    /// Attempts repeated because the database was locked.
    pub lock_retries: u64,
    /// Identity cache hits.
    pub cache_hits: u64,
    /// Identity cache misses.
    pub cache_misses: u64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn snapshot_reflects_bumps() {
        let counters = Counters::default();
        Counters::bump(&counters.commits);
        Counters::bump(&counters.commits);
        Counters::bump(&counters.ddl_statements);
        let stats = counters.snapshot();
        assert_eq!(stats.commits, 2);
        assert_eq!(stats.ddl_statements, 1);
        assert_eq!(stats.reverts, 0);
    }

    #[test]
    fn serializes_camel_case() {
        let json = serde_json::to_value(StoreStats::default()).unwrap();
        assert_eq!(json["ddlStatements"], 0);
        assert_eq!(json["upgradeSteps"], 0);
    }
}
