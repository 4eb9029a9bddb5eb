use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Mutex, PoisonError};
use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Weight of the newest sample in the moving-average latency.
const LATENCY_ALPHA: f64 = 0.1;

/// Point-in-time view of the queue and its workers.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QueueStats {
    pub queue_length: usize,
    pub running: bool,
    pub total_processed: u64,
    pub total_failed: u64,
    pub total_retried: u64,
    pub total_dropped: u64,
    pub currently_processing: usize,
    pub average_latency_ms: f64,
    pub worker_count: usize,
}

#[derive(Debug, Default)]
pub(crate) struct Counters {
    pub running: AtomicBool,
    pub processed: AtomicU64,
    pub failed: AtomicU64,
    pub retried: AtomicU64,
    pub dropped: AtomicU64,
    pub processing: AtomicUsize,
    pub pending_retries: AtomicUsize,
    latency_ms: Mutex<Option<f64>>,
}

impl Counters {
    pub fn record_latency(&self, elapsed: Duration) {
        let sample = elapsed.as_secs_f64() * 1000.0;
        let mut avg = self.latency_ms.lock().unwrap_or_else(PoisonError::into_inner);
        *avg = Some(match *avg {
            Some(prev) => prev + LATENCY_ALPHA * (sample - prev),
            None => sample,
        });
    }

    pub fn average_latency_ms(&self) -> f64 {
        self.latency_ms
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .unwrap_or(0.0)
    }

    pub fn snapshot(&self, queue_length: usize, worker_count: usize) -> QueueStats {
        QueueStats {
            queue_length,
            running: self.running.load(Ordering::Relaxed),
            total_processed: self.processed.load(Ordering::Relaxed),
            total_failed: self.failed.load(Ordering::Relaxed),
            total_retried: self.retried.load(Ordering::Relaxed),
            total_dropped: self.dropped.load(Ordering::Relaxed),
            currently_processing: self.processing.load(Ordering::Relaxed),
            average_latency_ms: self.average_latency_ms(),
            worker_count,
        }
    }
}
