//! Orchestrator counters.

use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};

/// Point-in-time copy of [`Metrics`]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MetricsSnapshot {
    /// Compute functions invoked
    pub computes: u64,
    /// Compute functions that failed
    pub compute_failures: u64,
    /// Results served from the cache
    pub cache_hits: u64,
    /// Requests that joined an execution already in flight
    pub dedup_hits: u64,
    /// Outputs written to the cache
    pub stores: u64,
    /// Best-effort cache writes that failed
    pub store_failures: u64,
}

impl MetricsSnapshot {
    /// Fraction of resolutions served from the cache (0.0 - 1.0)
    #[must_use]
    pub fn hit_rate(&self) -> f64 {
        let total = self.computes + self.cache_hits;
        if total == 0 {
            return 0.0;
        }
        self.cache_hits as f64 / total as f64
    }

    /// Fraction of compute calls that succeeded (0.0 - 1.0)
    #[must_use]
    pub fn success_rate(&self) -> f64 {
        if self.computes == 0 {
            return 1.0;
        }
        (self.computes - self.compute_failures) as f64 / self.computes as f64
    }
}

/// Counters shared by every invocation of an orchestrator
#[derive(Debug, Default)]
pub struct Metrics {
    computes: AtomicU64,
    compute_failures: AtomicU64,
    cache_hits: AtomicU64,
    dedup_hits: AtomicU64,
    stores: AtomicU64,
    store_failures: AtomicU64,
}

impl Metrics {
    /// Zeroed counters
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub(crate) fn record_compute(&self, ok: bool) {
        self.computes.fetch_add(1, Ordering::Relaxed);
        if !ok {
            self.compute_failures.fetch_add(1, Ordering::Relaxed);
        }
    }

    pub(crate) fn record_cache_hit(&self) {
        self.cache_hits.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_dedup(&self) {
        self.dedup_hits.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_store(&self, ok: bool) {
        if ok {
            self.stores.fetch_add(1, Ordering::Relaxed);
        } else {
            self.store_failures.fetch_add(1, Ordering::Relaxed);
        }
    }

    /// Current values
    #[must_use]
    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            computes: self.computes.load(Ordering::Relaxed),
            compute_failures: self.compute_failures.load(Ordering::Relaxed),
            cache_hits: self.cache_hits.load(Ordering::Relaxed),
            dedup_hits: self.dedup_hits.load(Ordering::Relaxed),
            stores: self.stores.load(Ordering::Relaxed),
            store_failures: self.store_failures.load(Ordering::Relaxed),
        }
    }
}
