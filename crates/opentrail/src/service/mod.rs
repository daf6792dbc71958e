//! The log service: bounded ingest queue, batch processor, and real-time
//! fan-out to subscribers.
//!
//! Producers (TCP connection handlers) push raw lines with `process_log`;
//! a single batch-processor task drains the queue, parses each line,
//! persists it, and broadcasts the stored entry to every live subscriber.
//! Broadcast is non-blocking: a subscriber whose buffer is full misses
//! that entry, nobody else is affected. Within the processor, enqueue
//! order is preserved end-to-end, so each subscriber observes an ordered
//! subsequence of the ingest stream.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::{Mutex, RwLock};
use tokio::sync::mpsc::{self, error::TrySendError};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info, trace, warn};

use crate::error::ServiceError;
use crate::metrics::ServiceStats;
use crate::model::LogEntry;
use crate::parser::LogParser;
use crate::storage::Storage;

#[derive(Debug, Clone)]
pub struct ServiceConfig {
    pub queue_size: usize,
    pub batch_size: usize,
    pub batch_timeout: Duration,
    pub max_subscribers: usize,
    pub subscriber_buffer: usize,
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self {
            queue_size: 10_000,
            batch_size: 100,
            batch_timeout: Duration::from_millis(100),
            max_subscribers: 100,
            subscriber_buffer: 100,
        }
    }
}

/// A live subscription handle. `id` 0 means the registry was at capacity
/// and the receiver is already closed.
pub struct Subscription {
    pub id: u64,
    pub receiver: mpsc::Receiver<LogEntry>,
}

impl Subscription {
    pub fn accepted(&self) -> bool {
        self.id != 0
    }
}

type SubscriberMap = Arc<RwLock<HashMap<u64, mpsc::Sender<LogEntry>>>>;

pub struct LogService {
    config: ServiceConfig,
    queue_tx: mpsc::Sender<String>,
    subscribers: SubscriberMap,
    next_subscriber_id: AtomicU64,
    shutting_down: AtomicBool,
    stats: ServiceStats,
    processor: Mutex<Option<JoinHandle<()>>>,
}

impl LogService {
    /// Build the service and spawn its batch processor. The processor
    /// exits once `shutdown` flips to true and the queue is drained.
    pub fn start(
        config: ServiceConfig,
        parser: Arc<dyn LogParser>,
        storage: Arc<Storage>,
        stats: ServiceStats,
        shutdown: watch::Receiver<bool>,
    ) -> Arc<Self> {
        let (queue_tx, queue_rx) = mpsc::channel(config.queue_size);
        let subscribers: SubscriberMap = Arc::new(RwLock::new(HashMap::new()));

        let processor = tokio::spawn(run_batch_processor(
            queue_rx,
            config.batch_size,
            config.batch_timeout,
            parser,
            storage,
            subscribers.clone(),
            stats.clone(),
            shutdown,
        ));

        Arc::new(Self {
            config,
            queue_tx,
            subscribers,
            next_subscriber_id: AtomicU64::new(0),
            shutting_down: AtomicBool::new(false),
            stats,
            processor: Mutex::new(Some(processor)),
        })
    }

    /// Enqueue a raw line for processing. Non-blocking: a full queue is an
    /// immediate `QueueFull` (counted in failed logs), not a stall.
    pub fn process_log(&self, raw: impl Into<String>) -> Result<(), ServiceError> {
        if self.shutting_down.load(Ordering::Acquire) {
            return Err(ServiceError::ShuttingDown);
        }
        match self.queue_tx.try_send(raw.into()) {
            Ok(()) => {
                self.stats.queue_grew();
                Ok(())
            }
            Err(TrySendError::Full(_)) => {
                self.stats.log_failed();
                Err(ServiceError::QueueFull)
            }
            Err(TrySendError::Closed(_)) => Err(ServiceError::ShuttingDown),
        }
    }

    /// Register a new subscriber. At the registry cap the returned
    /// receiver is pre-closed as the failure signal.
    pub fn subscribe(&self) -> Subscription {
        let (tx, rx) = mpsc::channel(self.config.subscriber_buffer);
        let mut subscribers = self.subscribers.write();
        if subscribers.len() >= self.config.max_subscribers {
            warn!(
                cap = self.config.max_subscribers,
                "subscriber registry full, rejecting subscription"
            );
            drop(tx);
            return Subscription { id: 0, receiver: rx };
        }
        let id = self.next_subscriber_id.fetch_add(1, Ordering::Relaxed) + 1;
        subscribers.insert(id, tx);
        self.stats.subscriber_added();
        debug!(subscriber = id, "subscriber added");
        Subscription { id, receiver: rx }
    }

    /// Remove a subscriber; its channel closes when the sender drops.
    pub fn unsubscribe(&self, id: u64) {
        if self.subscribers.write().remove(&id).is_some() {
            self.stats.subscriber_removed();
            debug!(subscriber = id, "subscriber removed");
        }
    }

    /// Refuse new work and wait for the processor to drain. The shutdown
    /// watch channel passed to `start` must already be signaled.
    pub async fn shutdown(&self) {
        self.shutting_down.store(true, Ordering::Release);
        let handle = self.processor.lock().take();
        if let Some(handle) = handle {
            if handle.await.is_err() {
                warn!("batch processor panicked during shutdown");
            }
        }
        info!("log service stopped");
    }

    pub fn stats(&self) -> &ServiceStats {
        &self.stats
    }

    pub fn is_running(&self) -> bool {
        !self.shutting_down.load(Ordering::Acquire)
    }
}

#[allow(clippy::too_many_arguments)]
async fn run_batch_processor(
    mut queue_rx: mpsc::Receiver<String>,
    batch_size: usize,
    batch_timeout: Duration,
    parser: Arc<dyn LogParser>,
    storage: Arc<Storage>,
    subscribers: SubscriberMap,
    stats: ServiceStats,
    mut shutdown: watch::Receiver<bool>,
) {
    let mut buffer: Vec<String> = Vec::with_capacity(batch_size);

    loop {
        // Wait for the first line of the next batch. A dropped shutdown
        // sender counts as a shutdown signal.
        let first = tokio::select! {
            item = queue_rx.recv() => item,
            changed = shutdown.changed() => {
                if changed.is_err() || *shutdown.borrow() {
                    break;
                }
                continue;
            }
        };
        let Some(first) = first else { break };
        stats.queue_shrank();
        buffer.push(first);

        // Fill until the batch is full or the timeout since the first
        // buffered line elapses.
        let deadline = tokio::time::sleep(batch_timeout);
        tokio::pin!(deadline);
        while buffer.len() < batch_size {
            tokio::select! {
                _ = &mut deadline => break,
                item = queue_rx.recv() => match item {
                    Some(raw) => {
                        stats.queue_shrank();
                        buffer.push(raw);
                    }
                    None => break,
                }
            }
        }

        process_batch(&mut buffer, &parser, &storage, &subscribers, &stats).await;
    }

    // Shutdown: drain whatever is still queued so accepted lines are not lost.
    while let Ok(raw) = queue_rx.try_recv() {
        stats.queue_shrank();
        buffer.push(raw);
    }
    process_batch(&mut buffer, &parser, &storage, &subscribers, &stats).await;
    debug!("batch processor drained and stopped");
}

async fn process_batch(
    buffer: &mut Vec<String>,
    parser: &Arc<dyn LogParser>,
    storage: &Arc<Storage>,
    subscribers: &SubscriberMap,
    stats: &ServiceStats,
) {
    for raw in buffer.drain(..) {
        let mut entry = match parser.parse(&raw) {
            Ok(entry) => entry,
            Err(e) => {
                stats.log_failed();
                debug!("dropping unparseable line: {}", e);
                continue;
            }
        };
        match storage.store(&mut entry).await {
            Ok(()) => {
                stats.log_processed();
                broadcast(subscribers, stats, entry);
            }
            Err(e) => {
                stats.log_failed();
                warn!("failed to store entry: {}", e);
            }
        }
    }
}

/// Non-blocking fan-out: each live subscriber gets the entry at most once;
/// a full buffer drops the entry for that subscriber only.
fn broadcast(subscribers: &SubscriberMap, stats: &ServiceStats, entry: LogEntry) {
    let subscribers = subscribers.read();
    for (id, tx) in subscribers.iter() {
        match tx.try_send(entry.clone()) {
            Ok(()) => {}
            Err(TrySendError::Full(_)) => {
                stats.broadcast_dropped();
                trace!(subscriber = id, "subscriber buffer full, entry dropped");
            }
            // Receiver already gone; unsubscribe will reap it.
            Err(TrySendError::Closed(_)) => {}
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::metrics::StorageStats;
    use crate::model::SearchQuery;
    use crate::parser::{PipelineParser, TemplateParser};
    use crate::storage::StorageConfig;
    use tempfile::TempDir;

    struct Fixture {
        service: Arc<LogService>,
        storage: Arc<Storage>,
        shutdown_tx: watch::Sender<bool>,
        _dir: TempDir,
    }

    fn start_service(configure: impl FnOnce(&mut ServiceConfig)) -> Fixture {
        let dir = TempDir::new().unwrap();
        let mut storage_config = StorageConfig::new(dir.path().join("logs.db"));
        storage_config.reset_on_startup = true;
        storage_config.batch_size = 1;
        let storage = Arc::new(Storage::open(storage_config, StorageStats::new()).unwrap());

        let parser = Arc::new(PipelineParser::new(
            TemplateParser::new("{{timestamp}}|{{level}}|{{tracking_id}}|{{message}}").unwrap(),
        ));

        let mut config = ServiceConfig {
            batch_size: 1,
            batch_timeout: Duration::from_millis(20),
            ..ServiceConfig::default()
        };
        configure(&mut config);

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let service = LogService::start(
            config,
            parser,
            storage.clone(),
            ServiceStats::new(),
            shutdown_rx,
        );
        Fixture {
            service,
            storage,
            shutdown_tx,
            _dir: dir,
        }
    }

    async fn wait_for_stored(storage: &Storage, count: usize) {
        for _ in 0..100 {
            if storage.get_recent(count + 10).unwrap().len() >= count {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("expected {} stored entries", count);
    }

    #[tokio::test]
    async fn lines_flow_from_queue_to_storage() {
        let fixture = start_service(|_| {});
        fixture
            .service
            .process_log("2024-01-01T10:00:00Z|INFO|u1|User logged in")
            .unwrap();

        wait_for_stored(&fixture.storage, 1).await;
        let query = SearchQuery {
            msg_id: Some("u1".to_string()),
            ..SearchQuery::default()
        };
        let found = fixture.storage.search(&query).unwrap();
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].message, "User logged in");
    }

    #[tokio::test]
    async fn full_queue_returns_queue_full_and_counts_failure() {
        // Current-thread runtime: the processor cannot run between the two
        // synchronous process_log calls, so the single-slot queue stays full.
        let fixture = start_service(|c| c.queue_size = 1);

        fixture.service.process_log("first line").unwrap();
        let failed_before = fixture.service.stats().failed_logs();
        assert!(matches!(
            fixture.service.process_log("second line"),
            Err(ServiceError::QueueFull)
        ));
        assert_eq!(fixture.service.stats().failed_logs(), failed_before + 1);
    }

    #[tokio::test]
    async fn subscribers_receive_each_entry_exactly_once() {
        let fixture = start_service(|_| {});
        let mut a = fixture.service.subscribe();
        let mut b = fixture.service.subscribe();

        fixture
            .service
            .process_log("2024-01-01T10:00:00Z|INFO|s5|broadcast me")
            .unwrap();

        let to_a = tokio::time::timeout(Duration::from_secs(1), a.receiver.recv())
            .await
            .unwrap()
            .unwrap();
        let to_b = tokio::time::timeout(Duration::from_secs(1), b.receiver.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(to_a.message, "broadcast me");
        assert_eq!(to_b.message, "broadcast me");

        // No duplicate delivery afterwards.
        assert!(
            tokio::time::timeout(Duration::from_millis(100), a.receiver.recv())
                .await
                .is_err()
        );
    }

    #[tokio::test]
    async fn stalled_subscriber_does_not_block_others() {
        let fixture = start_service(|c| c.subscriber_buffer = 1);
        let stalled = fixture.service.subscribe();
        let mut live = fixture.service.subscribe();

        // Three entries: the stalled subscriber's single-slot buffer holds
        // only the first, the live one sees all three in order.
        for i in 0..3 {
            fixture
                .service
                .process_log(format!("2024-01-01T10:00:0{}Z|INFO|t{}|entry {}", i, i, i))
                .unwrap();
        }

        for i in 0..3 {
            let entry = tokio::time::timeout(Duration::from_secs(1), live.receiver.recv())
                .await
                .unwrap()
                .unwrap();
            assert_eq!(entry.message, format!("entry {}", i));
        }

        drop(stalled);
    }

    #[tokio::test]
    async fn subscriber_cap_returns_closed_channel() {
        let fixture = start_service(|c| c.max_subscribers = 2);
        let first = fixture.service.subscribe();
        let second = fixture.service.subscribe();
        assert!(first.accepted() && second.accepted());

        let mut third = fixture.service.subscribe();
        assert!(!third.accepted());
        assert!(third.receiver.recv().await.is_none());

        fixture.service.unsubscribe(first.id);
        let fourth = fixture.service.subscribe();
        assert!(fourth.accepted());
    }

    #[tokio::test]
    async fn entries_preserve_enqueue_order() {
        let fixture = start_service(|c| {
            c.batch_size = 10;
            c.batch_timeout = Duration::from_millis(20);
        });
        let mut sub = fixture.service.subscribe();

        for i in 0..5 {
            fixture
                .service
                .process_log(format!("2024-01-01T10:00:00Z|INFO|o{}|ordered {}", i, i))
                .unwrap();
        }

        for i in 0..5 {
            let entry = tokio::time::timeout(Duration::from_secs(1), sub.receiver.recv())
                .await
                .unwrap()
                .unwrap();
            assert_eq!(entry.message, format!("ordered {}", i));
        }
    }

    #[tokio::test]
    async fn shutdown_drains_queue_then_refuses_work() {
        let fixture = start_service(|c| {
            c.batch_size = 100;
            c.batch_timeout = Duration::from_secs(1);
        });

        for i in 0..4 {
            fixture
                .service
                .process_log(format!("2024-01-01T10:00:00Z|INFO|d{}|drain {}", i, i))
                .unwrap();
        }

        fixture.shutdown_tx.send(true).unwrap();
        fixture.service.shutdown().await;

        assert!(matches!(
            fixture.service.process_log("late line"),
            Err(ServiceError::ShuttingDown)
        ));

        // Every accepted line was persisted during the drain.
        assert_eq!(fixture.storage.get_recent(10).unwrap().len(), 4);
    }
}
