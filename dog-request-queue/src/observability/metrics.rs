use std::sync::atomic::{AtomicU64, Ordering};

use serde::{Deserialize, Serialize};

/// Process-local counters of queue activity.
///
/// These count what this process observed; the authoritative queue counters
/// live in the metadata hash of the backing store.
#[derive(Debug, Default)]
pub struct LiveMetrics {
    requests_added: AtomicU64,
    requests_deduplicated: AtomicU64,
    requests_leased: AtomicU64,
    requests_handled: AtomicU64,
    requests_reclaimed: AtomicU64,
    lease_contention: AtomicU64,
    store_retries: AtomicU64,
}

impl LiveMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn increment_added(&self) {
        self.requests_added.fetch_add(1, Ordering::Relaxed);
    }

    pub fn increment_deduplicated(&self) {
        self.requests_deduplicated.fetch_add(1, Ordering::Relaxed);
    }

    pub fn add_leased(&self, count: u64) {
        self.requests_leased.fetch_add(count, Ordering::Relaxed);
    }

    pub fn increment_handled(&self) {
        self.requests_handled.fetch_add(1, Ordering::Relaxed);
    }

    pub fn increment_reclaimed(&self) {
        self.requests_reclaimed.fetch_add(1, Ordering::Relaxed);
    }

    /// Requests skipped or refused because another owner holds the lease
    pub fn add_contention(&self, count: u64) {
        self.lease_contention.fetch_add(count, Ordering::Relaxed);
    }

    pub fn increment_retries(&self) {
        self.store_retries.fetch_add(1, Ordering::Relaxed);
    }

    pub fn requests_added(&self) -> u64 {
        self.requests_added.load(Ordering::Relaxed)
    }

    pub fn requests_deduplicated(&self) -> u64 {
        self.requests_deduplicated.load(Ordering::Relaxed)
    }

    pub fn requests_leased(&self) -> u64 {
        self.requests_leased.load(Ordering::Relaxed)
    }

    pub fn requests_handled(&self) -> u64 {
        self.requests_handled.load(Ordering::Relaxed)
    }

    pub fn requests_reclaimed(&self) -> u64 {
        self.requests_reclaimed.load(Ordering::Relaxed)
    }

    pub fn lease_contention(&self) -> u64 {
        self.lease_contention.load(Ordering::Relaxed)
    }

    pub fn store_retries(&self) -> u64 {
        self.store_retries.load(Ordering::Relaxed)
    }

    /// Point-in-time copy of every counter
    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            requests_added: self.requests_added(),
            requests_deduplicated: self.requests_deduplicated(),
            requests_leased: self.requests_leased(),
            requests_handled: self.requests_handled(),
            requests_reclaimed: self.requests_reclaimed(),
            lease_contention: self.lease_contention(),
            store_retries: self.store_retries(),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MetricsSnapshot {
    pub requests_added: u64,
    pub requests_deduplicated: u64,
    pub requests_leased: u64,
    pub requests_handled: u64,
    pub requests_reclaimed: u64,
    pub lease_contention: u64,
    pub store_retries: u64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_snapshot_reflects_counters() {
        let metrics = LiveMetrics::new();
        metrics.increment_added();
        metrics.increment_added();
        metrics.increment_deduplicated();
        metrics.add_leased(3);
        metrics.add_contention(1);

        let snapshot = metrics.snapshot();
        assert_eq!(snapshot.requests_added, 2);
        assert_eq!(snapshot.requests_deduplicated, 1);
        assert_eq!(snapshot.requests_leased, 3);
        assert_eq!(snapshot.lease_contention, 1);
        assert_eq!(snapshot.requests_handled, 0);
    }
}
