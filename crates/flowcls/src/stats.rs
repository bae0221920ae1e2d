//! Classifier statistics.
//!
//! Lock-free counters for monitoring the lookup path. All updates are
//! relaxed atomic adds; exact precision is not a goal.

use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};

/// Live counters (atomic, lock-free).
#[derive(Debug, Default)]
pub struct ClassifierStats {
    /// Lookup batches processed.
    pub batches: AtomicU64,
    /// Keys looked up.
    pub keys: AtomicU64,
    /// Keys that matched a rule.
    pub hits: AtomicU64,
    /// Keys that matched nothing.
    pub misses: AtomicU64,
    /// Subtables probed across all batches.
    pub subtable_probes: AtomicU64,
    /// Rules inserted.
    pub rule_inserts: AtomicU64,
    /// Rules removed.
    pub rule_removes: AtomicU64,
    /// Subtables created.
    pub subtables_created: AtomicU64,
    /// Subtables destroyed.
    pub subtables_destroyed: AtomicU64,
}

impl ClassifierStats {
    #[inline(always)]
    pub(crate) fn record_batch(&self, keys: u64) {
        self.batches.fetch_add(1, Ordering::Relaxed);
        self.keys.fetch_add(keys, Ordering::Relaxed);
    }

    #[inline(always)]
    pub(crate) fn record_hits(&self, n: u64) {
        self.hits.fetch_add(n, Ordering::Relaxed);
    }

    #[inline(always)]
    pub(crate) fn record_misses(&self, n: u64) {
        self.misses.fetch_add(n, Ordering::Relaxed);
    }

    #[inline(always)]
    pub(crate) fn record_subtable_probe(&self) {
        self.subtable_probes.fetch_add(1, Ordering::Relaxed);
    }

    #[inline(always)]
    pub(crate) fn record_insert(&self) {
        self.rule_inserts.fetch_add(1, Ordering::Relaxed);
    }

    #[inline(always)]
    pub(crate) fn record_remove(&self) {
        self.rule_removes.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_subtable_created(&self) {
        self.subtables_created.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_subtable_destroyed(&self) {
        self.subtables_destroyed.fetch_add(1, Ordering::Relaxed);
    }

    /// Consistent-enough point-in-time copy of the counters.
    pub fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            batches: self.batches.load(Ordering::Relaxed),
            keys: self.keys.load(Ordering::Relaxed),
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
            subtable_probes: self.subtable_probes.load(Ordering::Relaxed),
            rule_inserts: self.rule_inserts.load(Ordering::Relaxed),
            rule_removes: self.rule_removes.load(Ordering::Relaxed),
            subtables_created: self.subtables_created.load(Ordering::Relaxed),
            subtables_destroyed: self.subtables_destroyed.load(Ordering::Relaxed),
        }
    }
}

/// Plain-value snapshot of [`ClassifierStats`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatsSnapshot {
    /// Lookup batches processed.
    pub batches: u64,
    /// Keys looked up.
    pub keys: u64,
    /// Keys that matched a rule.
    pub hits: u64,
    /// Keys that matched nothing.
    pub misses: u64,
    /// Subtables probed across all batches.
    pub subtable_probes: u64,
    /// Rules inserted.
    pub rule_inserts: u64,
    /// Rules removed.
    pub rule_removes: u64,
    /// Subtables created.
    pub subtables_created: u64,
    /// Subtables destroyed.
    pub subtables_destroyed: u64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn snapshot_reflects_counters() {
        let stats = ClassifierStats::default();
        stats.record_batch(4);
        stats.record_batch(2);
        stats.record_hits(5);
        stats.record_misses(1);

        let snap = stats.snapshot();
        assert_eq!(snap.batches, 2);
        assert_eq!(snap.keys, 6);
        assert_eq!(snap.hits, 5);
        assert_eq!(snap.misses, 1);
    }
}
