//! Cache statistics

use std::sync::atomic::{AtomicU64, Ordering};

use serde::Serialize;

/// Cache statistics tracked atomically
#[derive(Debug, Default)]
pub(crate) struct CacheStats {
    hits: AtomicU64,
    misses: AtomicU64,
    joins: AtomicU64,
    fetches: AtomicU64,
    superseded: AtomicU64,
    failures: AtomicU64,
    invalidations: AtomicU64,
}

impl CacheStats {
    pub(crate) fn record_hit(&self) {
        self.hits.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_miss(&self) {
        self.misses.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_join(&self) {
        self.joins.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_fetch(&self) {
        self.fetches.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_superseded(&self) {
        self.superseded.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_failure(&self) {
        self.failures.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_invalidations(&self, count: u64) {
        self.invalidations.fetch_add(count, Ordering::Relaxed);
    }

    pub(crate) fn snapshot(&self, size: usize) -> CacheStatsSnapshot {
        let hits = self.hits.load(Ordering::Relaxed);
        let misses = self.misses.load(Ordering::Relaxed);
        let joins = self.joins.load(Ordering::Relaxed);
        CacheStatsSnapshot {
            hits,
            misses,
            joins,
            fetches: self.fetches.load(Ordering::Relaxed),
            superseded: self.superseded.load(Ordering::Relaxed),
            failures: self.failures.load(Ordering::Relaxed),
            invalidations: self.invalidations.load(Ordering::Relaxed),
            size,
            hit_rate: hit_rate(hits, misses + joins),
        }
    }
}

#[allow(clippy::cast_precision_loss)]
fn hit_rate(hits: u64, others: u64) -> f64 {
    let total = hits + others;
    if total == 0 {
        0.0
    } else {
        hits as f64 / total as f64
    }
}

/// Snapshot of cache statistics
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CacheStatsSnapshot {
    /// Requests answered from a fresh entry
    pub hits: u64,
    /// Requests that had to start a fetch
    pub misses: u64,
    /// Requests coalesced onto an in-flight fetch
    pub joins: u64,
    /// Fetches started, including forced refreshes
    pub fetches: u64,
    /// Completions discarded because a newer fetch superseded them
    pub superseded: u64,
    /// Fetches that failed
    pub failures: u64,
    /// Entries removed by invalidation or clearing
    pub invalidations: u64,
    /// Current number of entries
    pub size: usize,
    /// Fraction of requests served without waiting on a fetch (0.0-1.0)
    pub hit_rate: f64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_empty_snapshot() {
        let stats = CacheStats::default();
        let snap = stats.snapshot(0);
        assert_eq!(snap.hits, 0);
        assert_eq!(snap.hit_rate, 0.0);
    }

    #[test]
    fn test_hit_rate_counts_joins_as_waiting() {
        let stats = CacheStats::default();
        stats.record_hit();
        stats.record_hit();
        stats.record_miss();
        stats.record_join();

        let snap = stats.snapshot(1);
        assert_eq!(snap.hits, 2);
        assert_eq!(snap.misses, 1);
        assert_eq!(snap.joins, 1);
        assert!((snap.hit_rate - 0.5).abs() < f64::EPSILON);
    }
}
