//! Process-wide counters, gauges, and duration histograms.
//!
//! Every component owns one of the stat trackers below; `/api/health` pulls
//! a snapshot from each through the accessors. All counters are lock-free
//! atomics so the hot paths (ingest, broadcast, batch flush) never contend.

use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

/// Log-scale bucket bounds in microseconds. The last bucket is unbounded.
const BUCKET_BOUNDS_MICROS: [u64; 9] = [
    100, 500, 1_000, 5_000, 10_000, 50_000, 100_000, 500_000, 1_000_000,
];

/// Fixed-bucket duration histogram. Recording is a single atomic add per
/// bucket plus sum/count updates.
pub struct Histogram {
    buckets: [AtomicU64; 10],
    sum_micros: AtomicU64,
    count: AtomicU64,
}

#[derive(Debug, Clone, Serialize)]
pub struct HistogramSnapshot {
    pub count: u64,
    pub sum_micros: u64,
    pub mean_micros: u64,
    /// (upper bound in µs, observations ≤ bound); the final entry has bound 0
    /// and holds the overflow count.
    pub buckets: Vec<(u64, u64)>,
}

impl Histogram {
    pub fn new() -> Self {
        Self {
            buckets: Default::default(),
            sum_micros: AtomicU64::new(0),
            count: AtomicU64::new(0),
        }
    }

    pub fn record(&self, duration: Duration) {
        let micros = duration.as_micros().min(u64::MAX as u128) as u64;
        let idx = BUCKET_BOUNDS_MICROS
            .iter()
            .position(|&bound| micros <= bound)
            .unwrap_or(BUCKET_BOUNDS_MICROS.len());
        self.buckets[idx].fetch_add(1, Ordering::Relaxed);
        self.sum_micros.fetch_add(micros, Ordering::Relaxed);
        self.count.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> HistogramSnapshot {
        let count = self.count.load(Ordering::Relaxed);
        let sum_micros = self.sum_micros.load(Ordering::Relaxed);
        let mut buckets = Vec::with_capacity(self.buckets.len());
        for (i, bucket) in self.buckets.iter().enumerate() {
            let bound = BUCKET_BOUNDS_MICROS.get(i).copied().unwrap_or(0);
            buckets.push((bound, bucket.load(Ordering::Relaxed)));
        }
        HistogramSnapshot {
            count,
            sum_micros,
            mean_micros: if count == 0 { 0 } else { sum_micros / count },
            buckets,
        }
    }
}

impl Default for Histogram {
    fn default() -> Self {
        Self::new()
    }
}

/// Counters owned by the log service (queue, batcher, fan-out).
#[derive(Clone)]
pub struct ServiceStats {
    inner: Arc<ServiceStatsInner>,
}

struct ServiceStatsInner {
    logs_processed: AtomicU64,
    failed_logs: AtomicU64,
    queue_depth: AtomicU64,
    active_subscribers: AtomicU64,
    dropped_broadcasts: AtomicU64,
}

#[derive(Debug, Clone, Serialize)]
pub struct ServiceStatsSnapshot {
    pub logs_processed: u64,
    pub failed_logs: u64,
    pub queue_depth: u64,
    pub active_subscribers: u64,
    pub dropped_broadcasts: u64,
}

impl ServiceStats {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(ServiceStatsInner {
                logs_processed: AtomicU64::new(0),
                failed_logs: AtomicU64::new(0),
                queue_depth: AtomicU64::new(0),
                active_subscribers: AtomicU64::new(0),
                dropped_broadcasts: AtomicU64::new(0),
            }),
        }
    }

    pub fn log_processed(&self) {
        self.inner.logs_processed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn log_failed(&self) {
        self.inner.failed_logs.fetch_add(1, Ordering::Relaxed);
    }

    pub fn failed_logs(&self) -> u64 {
        self.inner.failed_logs.load(Ordering::Relaxed)
    }

    pub fn queue_grew(&self) {
        self.inner.queue_depth.fetch_add(1, Ordering::Relaxed);
    }

    pub fn queue_shrank(&self) {
        decrement_saturating(&self.inner.queue_depth);
    }

    pub fn subscriber_added(&self) {
        self.inner.active_subscribers.fetch_add(1, Ordering::Relaxed);
    }

    pub fn subscriber_removed(&self) {
        decrement_saturating(&self.inner.active_subscribers);
    }

    pub fn active_subscribers(&self) -> u64 {
        self.inner.active_subscribers.load(Ordering::Relaxed)
    }

    pub fn broadcast_dropped(&self) {
        self.inner.dropped_broadcasts.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> ServiceStatsSnapshot {
        ServiceStatsSnapshot {
            logs_processed: self.inner.logs_processed.load(Ordering::Relaxed),
            failed_logs: self.inner.failed_logs.load(Ordering::Relaxed),
            queue_depth: self.inner.queue_depth.load(Ordering::Relaxed),
            active_subscribers: self.inner.active_subscribers.load(Ordering::Relaxed),
            dropped_broadcasts: self.inner.dropped_broadcasts.load(Ordering::Relaxed),
        }
    }
}

impl Default for ServiceStats {
    fn default() -> Self {
        Self::new()
    }
}

/// Counters owned by the storage batch writer.
#[derive(Clone)]
pub struct StorageStats {
    inner: Arc<StorageStatsInner>,
}

struct StorageStatsInner {
    writes_accepted: AtomicU64,
    writes_rejected: AtomicU64,
    batches_processed: AtomicU64,
    queue_depth: AtomicU64,
    flush_duration: Histogram,
    txn_duration: Histogram,
}

#[derive(Debug, Clone, Serialize)]
pub struct StorageStatsSnapshot {
    pub writes_accepted: u64,
    pub writes_rejected: u64,
    pub batches_processed: u64,
    pub queue_depth: u64,
    pub flush_duration: HistogramSnapshot,
    pub txn_duration: HistogramSnapshot,
}

impl StorageStats {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(StorageStatsInner {
                writes_accepted: AtomicU64::new(0),
                writes_rejected: AtomicU64::new(0),
                batches_processed: AtomicU64::new(0),
                queue_depth: AtomicU64::new(0),
                flush_duration: Histogram::new(),
                txn_duration: Histogram::new(),
            }),
        }
    }

    pub fn write_accepted(&self) {
        self.inner.writes_accepted.fetch_add(1, Ordering::Relaxed);
        self.inner.queue_depth.fetch_add(1, Ordering::Relaxed);
    }

    pub fn write_rejected(&self) {
        self.inner.writes_rejected.fetch_add(1, Ordering::Relaxed);
    }

    pub fn writes_rejected(&self) -> u64 {
        self.inner.writes_rejected.load(Ordering::Relaxed)
    }

    pub fn request_dequeued(&self) {
        decrement_saturating(&self.inner.queue_depth);
    }

    pub fn batch_processed(&self, flush: Duration, txn: Duration) {
        self.inner.batches_processed.fetch_add(1, Ordering::Relaxed);
        self.inner.flush_duration.record(flush);
        self.inner.txn_duration.record(txn);
    }

    pub fn batches_processed(&self) -> u64 {
        self.inner.batches_processed.load(Ordering::Relaxed)
    }

    pub fn snapshot(&self) -> StorageStatsSnapshot {
        StorageStatsSnapshot {
            writes_accepted: self.inner.writes_accepted.load(Ordering::Relaxed),
            writes_rejected: self.inner.writes_rejected.load(Ordering::Relaxed),
            batches_processed: self.inner.batches_processed.load(Ordering::Relaxed),
            queue_depth: self.inner.queue_depth.load(Ordering::Relaxed),
            flush_duration: self.inner.flush_duration.snapshot(),
            txn_duration: self.inner.txn_duration.snapshot(),
        }
    }
}

impl Default for StorageStats {
    fn default() -> Self {
        Self::new()
    }
}

/// Counters owned by the TCP ingestion server.
#[derive(Clone)]
pub struct ConnectionStats {
    inner: Arc<ConnectionStatsInner>,
}

struct ConnectionStatsInner {
    active_connections: AtomicU64,
    total_connections: AtomicU64,
    connection_errors: AtomicU64,
}

#[derive(Debug, Clone, Serialize)]
pub struct ConnectionStatsSnapshot {
    pub active_connections: u64,
    pub total_connections: u64,
    pub connection_errors: u64,
}

impl ConnectionStats {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(ConnectionStatsInner {
                active_connections: AtomicU64::new(0),
                total_connections: AtomicU64::new(0),
                connection_errors: AtomicU64::new(0),
            }),
        }
    }

    pub fn connection_opened(&self) {
        self.inner.active_connections.fetch_add(1, Ordering::Relaxed);
        self.inner.total_connections.fetch_add(1, Ordering::Relaxed);
    }

    pub fn connection_closed(&self) {
        decrement_saturating(&self.inner.active_connections);
    }

    pub fn connection_rejected(&self) {
        self.inner.connection_errors.fetch_add(1, Ordering::Relaxed);
    }

    pub fn connection_errors(&self) -> u64 {
        self.inner.connection_errors.load(Ordering::Relaxed)
    }

    pub fn active_connections(&self) -> u64 {
        self.inner.active_connections.load(Ordering::Relaxed)
    }

    pub fn snapshot(&self) -> ConnectionStatsSnapshot {
        ConnectionStatsSnapshot {
            active_connections: self.inner.active_connections.load(Ordering::Relaxed),
            total_connections: self.inner.total_connections.load(Ordering::Relaxed),
            connection_errors: self.inner.connection_errors.load(Ordering::Relaxed),
        }
    }
}

impl Default for ConnectionStats {
    fn default() -> Self {
        Self::new()
    }
}

// Atomic check-and-decrement so concurrent increments/decrements cannot
// wrap a gauge to u64::MAX.
fn decrement_saturating(gauge: &AtomicU64) {
    let _ = gauge.fetch_update(Ordering::Relaxed, Ordering::Relaxed, |current| {
        if current > 0 {
            Some(current - 1)
        } else {
            None
        }
    });
}
