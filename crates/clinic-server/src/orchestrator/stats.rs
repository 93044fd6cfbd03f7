//! Orchestrator counters.

use std::sync::atomic::{AtomicU64, Ordering};

use parking_lot::Mutex;
use serde::Serialize;

/// Weight of the newest sample in the processing-time average.
const EMA_ALPHA: f64 = 0.1;

/// Snapshot of query counters.
#[derive(Clone, Debug, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct QueryStats {
    /// Queries accepted.
    pub total: u64,
    /// Queries answered.
    pub completed: u64,
    /// Queries that ended in an error frame (timeouts included).
    pub failed: u64,
    /// Of the failures, how many were timeouts.
    pub timeouts: u64,
    /// Queries aborted by cancel, disconnect or shutdown.
    pub aborted: u64,
    /// Answers served from cache.
    pub cache_hits: u64,
    /// Cache lookups that missed.
    pub cache_misses: u64,
    /// Exponential moving average of processing time.
    pub avg_processing_time_ms: f64,
    /// Queries currently executing.
    pub in_flight: usize,
}

#[derive(Default)]
pub(crate) struct StatsRecorder {
    total: AtomicU64,
    completed: AtomicU64,
    failed: AtomicU64,
    timeouts: AtomicU64,
    aborted: AtomicU64,
    cache_hits: AtomicU64,
    cache_misses: AtomicU64,
    avg_processing_ms: Mutex<Option<f64>>,
}

impl StatsRecorder {
    pub(crate) fn started(&self) {
        let _ = self.total.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn completed(&self, processing_ms: u64) {
        let _ = self.completed.fetch_add(1, Ordering::Relaxed);
        #[allow(clippy::cast_precision_loss)]
        let sample = processing_ms as f64;
        let mut avg = self.avg_processing_ms.lock();
        *avg = Some(match *avg {
            Some(prev) => EMA_ALPHA.mul_add(sample, (1.0 - EMA_ALPHA) * prev),
            None => sample,
        });
    }

    pub(crate) fn failed(&self, timeout: bool) {
        let _ = self.failed.fetch_add(1, Ordering::Relaxed);
        if timeout {
            let _ = self.timeouts.fetch_add(1, Ordering::Relaxed);
        }
    }

    pub(crate) fn aborted(&self) {
        let _ = self.aborted.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn cache_hit(&self) {
        let _ = self.cache_hits.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn cache_miss(&self) {
        let _ = self.cache_misses.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn snapshot(&self, in_flight: usize) -> QueryStats {
        QueryStats {
            total: self.total.load(Ordering::Relaxed),
            completed: self.completed.load(Ordering::Relaxed),
            failed: self.failed.load(Ordering::Relaxed),
            timeouts: self.timeouts.load(Ordering::Relaxed),
            aborted: self.aborted.load(Ordering::Relaxed),
            cache_hits: self.cache_hits.load(Ordering::Relaxed),
            cache_misses: self.cache_misses.load(Ordering::Relaxed),
            avg_processing_time_ms: self.avg_processing_ms.lock().unwrap_or(0.0),
            in_flight,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn first_sample_seeds_average() {
        let s = StatsRecorder::default();
        s.completed(200);
        assert!((s.snapshot(0).avg_processing_time_ms - 200.0).abs() < f64::EPSILON);
    }

    #[test]
    fn average_moves_toward_new_samples() {
        let s = StatsRecorder::default();
        s.completed(100);
        s.completed(200);
        let avg = s.snapshot(0).avg_processing_time_ms;
        assert!((avg - 110.0).abs() < 1e-9, "avg = {avg}");
    }

    #[test]
    fn counters() {
        let s = StatsRecorder::default();
        s.started();
        s.started();
        s.failed(true);
        s.aborted();
        s.cache_hit();
        s.cache_miss();
        let snap = s.snapshot(1);
        assert_eq!(snap.total, 2);
        assert_eq!(snap.failed, 1);
        assert_eq!(snap.timeouts, 1);
        assert_eq!(snap.aborted, 1);
        assert_eq!(snap.cache_hits, 1);
        assert_eq!(snap.in_flight, 1);
    }
}
