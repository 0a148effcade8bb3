//! Runtime counters for the pipeline.
//!
//! Plain `AtomicU64` fields for the fixed counters, plus a per-pass
//! invocation map that only takes the write lock the first time a pass name
//! is seen.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{PoisonError, RwLock};

use rustc_hash::FxHashMap;
use serde::Serialize;

/// Counters shared by every component of one pipeline.
#[derive(Debug, Default)]
pub struct PipelineMetrics {
    /// `transform` calls.
    pub transforms: AtomicU64,
    /// Calls answered with the original bytes.
    pub passthroughs: AtomicU64,
    /// Inputs rejected by pre-validation.
    pub rejections: AtomicU64,
    pub l1_hits: AtomicU64,
    pub l2_hits: AtomicU64,
    pub l3_hits: AtomicU64,
    pub cache_misses: AtomicU64,
    /// Full pipeline runs.
    pub pipeline_runs: AtomicU64,
    /// Analyzer invocations from passes, the pipeline and verification.
    pub analyzer_invocations: AtomicU64,
    /// Individual pass failures (isolated).
    pub pass_failures: AtomicU64,
    pub verification_failures: AtomicU64,
    pub watchdog_timeouts: AtomicU64,
    /// Jobs refused because the transform queue was full.
    pub queue_full: AtomicU64,
    /// Cache entries stored to the cold tier.
    pub stores: AtomicU64,
    /// Entries purged by self-heal, dependency or source-change invalidation.
    pub invalidations: AtomicU64,
    /// Units promoted to the warm tier by prewarm.
    pub prewarmed: AtomicU64,
    pass_invocations: RwLock<FxHashMap<&'static str, AtomicU64>>,
}

/// Point-in-time copy of [`PipelineMetrics`].
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct MetricsSnapshot {
    pub transforms: u64,
    pub passthroughs: u64,
    pub rejections: u64,
    pub l1_hits: u64,
    pub l2_hits: u64,
    pub l3_hits: u64,
    pub cache_misses: u64,
    pub pipeline_runs: u64,
    pub analyzer_invocations: u64,
    pub pass_failures: u64,
    pub verification_failures: u64,
    pub watchdog_timeouts: u64,
    pub queue_full: u64,
    pub stores: u64,
    pub invalidations: u64,
    pub prewarmed: u64,
    pub pass_invocations: Vec<(String, u64)>,
}

impl PipelineMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn incr(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }

    pub fn add(counter: &AtomicU64, value: u64) {
        counter.fetch_add(value, Ordering::Relaxed);
    }

    /// Count one invocation of `pass`. Returns the new count.
    pub fn record_pass(&self, pass: &'static str) -> u64 {
        {
            let map = self
                .pass_invocations
                .read()
                .unwrap_or_else(PoisonError::into_inner);
            if let Some(counter) = map.get(pass) {
                return counter.fetch_add(1, Ordering::Relaxed).saturating_add(1);
            }
        }

        let mut map = self
            .pass_invocations
            .write()
            .unwrap_or_else(PoisonError::into_inner);
        // Another thread may have inserted between the two locks.
        if let Some(counter) = map.get(pass) {
            return counter.fetch_add(1, Ordering::Relaxed).saturating_add(1);
        }
        map.insert(pass, AtomicU64::new(1));
        1
    }

    pub fn pass_invocations(&self, pass: &str) -> u64 {
        self.pass_invocations
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(pass)
            .map(|c| c.load(Ordering::Relaxed))
            .unwrap_or(0)
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        let load = |c: &AtomicU64| c.load(Ordering::Relaxed);
        let mut pass_invocations: Vec<(String, u64)> = self
            .pass_invocations
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .map(|(name, c)| ((*name).to_string(), load(c)))
            .collect();
        pass_invocations.sort();
        MetricsSnapshot {
            transforms: load(&self.transforms),
            passthroughs: load(&self.passthroughs),
            rejections: load(&self.rejections),
            l1_hits: load(&self.l1_hits),
            l2_hits: load(&self.l2_hits),
            l3_hits: load(&self.l3_hits),
            cache_misses: load(&self.cache_misses),
            pipeline_runs: load(&self.pipeline_runs),
            analyzer_invocations: load(&self.analyzer_invocations),
            pass_failures: load(&self.pass_failures),
            verification_failures: load(&self.verification_failures),
            watchdog_timeouts: load(&self.watchdog_timeouts),
            queue_full: load(&self.queue_full),
            stores: load(&self.stores),
            invalidations: load(&self.invalidations),
            prewarmed: load(&self.prewarmed),
            pass_invocations,
        }
    }

    /// Reset all counters to zero.
    #[cfg(any(test, feature = "test-utils"))]
    pub fn reset(&self) {
        for counter in [
            &self.transforms,
            &self.passthroughs,
            &self.rejections,
            &self.l1_hits,
            &self.l2_hits,
            &self.l3_hits,
            &self.cache_misses,
            &self.pipeline_runs,
            &self.analyzer_invocations,
            &self.pass_failures,
            &self.verification_failures,
            &self.watchdog_timeouts,
            &self.queue_full,
            &self.stores,
            &self.invalidations,
            &self.prewarmed,
        ] {
            counter.store(0, Ordering::Relaxed);
        }
        self.pass_invocations
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .clear();
    }
}

const _: () = {
    fn assert_send_sync<T: Send + Sync>() {}
    fn check() {
        assert_send_sync::<PipelineMetrics>();
    }
    let _ = check;
};

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pass_invocation_counts() {
        let metrics = PipelineMetrics::new();
        assert_eq!(metrics.record_pass("dead_code"), 1);
        assert_eq!(metrics.record_pass("dead_code"), 2);
        assert_eq!(metrics.record_pass("inlining"), 1);
        assert_eq!(metrics.pass_invocations("dead_code"), 2);
        assert_eq!(metrics.pass_invocations("missing"), 0);
    }

    #[test]
    fn test_snapshot_and_reset() {
        let metrics = PipelineMetrics::new();
        PipelineMetrics::incr(&metrics.transforms);
        PipelineMetrics::add(&metrics.analyzer_invocations, 3);
        metrics.record_pass("constant_folding");

        let snap = metrics.snapshot();
        assert_eq!(snap.transforms, 1);
        assert_eq!(snap.analyzer_invocations, 3);
        assert_eq!(
            snap.pass_invocations,
            vec![("constant_folding".to_string(), 1)]
        );

        metrics.reset();
        assert_eq!(metrics.snapshot(), MetricsSnapshot::default());
    }

    #[test]
    fn test_concurrent_pass_counts() {
        let metrics = std::sync::Arc::new(PipelineMetrics::new());
        let handles: Vec<_> = (0..4)
            .map(|_| {
                let m = metrics.clone();
                std::thread::spawn(move || {
                    for _ in 0..100 {
                        m.record_pass("branch_simplification");
                    }
                })
            })
            .collect();
        for h in handles {
            h.join().unwrap();
        }
        assert_eq!(metrics.pass_invocations("branch_simplification"), 400);
    }
}
