//! Embedded storage engine: SQLite (WAL) with an FTS5 message index,
//! asynchronous batched inserts, filtered search, and retention cleanup.
//!
//! Writes flow through a bounded queue into a single batch-writer thread
//! that owns the write connection; reads go through a separate connection
//! guarded by a mutex. Lifecycle: Running → Draining (on close, queue
//! refuses new writers while the thread drains) → Closed.

pub mod query;
pub mod schema;
mod writer;

use std::path::PathBuf;
use std::sync::atomic::{AtomicU8, Ordering};
use std::thread::JoinHandle;
use std::time::Duration;

use chrono::Utc;
use crossbeam_channel::{bounded, Sender, TrySendError};
use parking_lot::Mutex;
use rusqlite::Connection;
use tokio::sync::oneshot;
use tracing::{info, warn};

use crate::error::StorageError;
use crate::metrics::StorageStats;
use crate::model::{LogEntry, SearchQuery};
use writer::WriteRequest;

const STATE_RUNNING: u8 = 0;
const STATE_DRAINING: u8 = 1;
const STATE_CLOSED: u8 = 2;

#[derive(Debug, Clone)]
pub struct StorageConfig {
    pub path: PathBuf,
    /// WAL journal mode (synchronous=NORMAL); `false` selects
    /// journal_mode=DELETE with synchronous=FULL.
    pub wal: bool,
    /// Drop and recreate the schema on open. Off by default so data
    /// survives restarts; tests and throwaway deployments turn it on.
    pub reset_on_startup: bool,
    pub queue_size: usize,
    pub batch_size: usize,
    pub batch_timeout: Duration,
    /// Extra grace on top of `batch_timeout` that `store` waits for its ack.
    pub ack_slack: Duration,
}

impl StorageConfig {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            wal: true,
            reset_on_startup: false,
            queue_size: 10_000,
            batch_size: 100,
            batch_timeout: Duration::from_millis(100),
            ack_slack: Duration::from_millis(20),
        }
    }
}

pub struct Storage {
    config: StorageConfig,
    sender: Mutex<Option<Sender<WriteRequest>>>,
    reader: Mutex<Connection>,
    writer_handle: Mutex<Option<JoinHandle<()>>>,
    state: AtomicU8,
    stats: StorageStats,
}

impl Storage {
    /// Open (or create) the database, apply pragmas, initialize the
    /// schema, and start the batch-writer thread.
    pub fn open(config: StorageConfig, stats: StorageStats) -> Result<Self, StorageError> {
        let writer_conn = Connection::open(&config.path)?;
        schema::apply_pragmas(&writer_conn, config.wal)?;
        schema::initialize(&writer_conn, config.reset_on_startup)?;

        let reader_conn = Connection::open(&config.path)?;
        schema::apply_pragmas(&reader_conn, config.wal)?;

        let (sender, receiver) = bounded(config.queue_size);
        let batch_size = config.batch_size;
        let batch_timeout = config.batch_timeout;
        let writer_stats = stats.clone();
        let handle = std::thread::Builder::new()
            .name("storage-writer".to_string())
            .spawn(move || writer::run(writer_conn, receiver, batch_size, batch_timeout, writer_stats))
            .map_err(|e| StorageError::Io(e.to_string()))?;

        info!(path = %config.path.display(), wal = config.wal, "storage opened");

        Ok(Self {
            config,
            sender: Mutex::new(Some(sender)),
            reader: Mutex::new(reader_conn),
            writer_handle: Mutex::new(Some(handle)),
            state: AtomicU8::new(STATE_RUNNING),
            stats,
        })
    }

    /// Enqueue `entry` for batched persistence and wait for its ack up to
    /// `batch_timeout + ack_slack`.
    ///
    /// On success within the window, `entry.id` is the database-assigned
    /// rowid. When the window expires the call still returns `Ok` with
    /// `entry.id == 0`: the write stays queued and completes
    /// asynchronously, and callers that need the id must re-query.
    pub async fn store(&self, entry: &mut LogEntry) -> Result<(), StorageError> {
        self.ensure_running()?;

        let (ack_tx, ack_rx) = oneshot::channel();
        let request = WriteRequest {
            entry: entry.clone(),
            ack: ack_tx,
        };
        let sender = match self.sender.lock().as_ref() {
            Some(sender) => sender.clone(),
            None => return Err(StorageError::NotRunning),
        };
        match sender.try_send(request) {
            Ok(()) => self.stats.write_accepted(),
            Err(TrySendError::Full(_)) => {
                self.stats.write_rejected();
                return Err(StorageError::QueueFull);
            }
            Err(TrySendError::Disconnected(_)) => return Err(StorageError::NotRunning),
        }

        let wait = self.config.batch_timeout + self.config.ack_slack;
        match tokio::time::timeout(wait, ack_rx).await {
            Ok(Ok(Ok(id))) => {
                entry.id = id;
                Ok(())
            }
            Ok(Ok(Err(e))) => Err(e),
            // Writer dropped the ack without answering: shutdown raced us.
            Ok(Err(_)) => Err(StorageError::NotRunning),
            // Ack window expired; the write is still pending.
            Err(_) => {
                entry.id = 0;
                Ok(())
            }
        }
    }

    /// Synchronous filtered search, newest-first.
    pub fn search(&self, search: &SearchQuery) -> Result<Vec<LogEntry>, StorageError> {
        self.ensure_running()?;
        let conn = self.reader.lock();
        query::search(&conn, search)
    }

    /// The `limit` most recent entries.
    pub fn get_recent(&self, limit: usize) -> Result<Vec<LogEntry>, StorageError> {
        self.search(&SearchQuery::recent(limit))
    }

    /// Delete entries older than `retention_days`. When anything was
    /// deleted, checkpoint the WAL (shrinks the subsequent VACUUM) and
    /// reclaim file space.
    pub fn cleanup(&self, retention_days: u32) -> Result<usize, StorageError> {
        self.ensure_running()?;
        let cutoff = Utc::now() - chrono::Duration::days(i64::from(retention_days));
        let conn = self.reader.lock();
        let deleted = conn.execute(
            "DELETE FROM logs WHERE timestamp < ?1",
            [query::to_db_time(&cutoff)],
        )?;
        if deleted > 0 {
            if self.config.wal {
                conn.query_row("PRAGMA wal_checkpoint(TRUNCATE)", [], |_row| Ok(()))?;
            }
            conn.execute_batch("VACUUM")?;
            info!(deleted, retention_days, "retention cleanup reclaimed space");
        }
        Ok(deleted)
    }

    /// Drain pending writes and shut the engine down. Idempotent; later
    /// calls on any operation return `NotRunning`.
    pub fn close(&self) -> Result<(), StorageError> {
        if self
            .state
            .compare_exchange(
                STATE_RUNNING,
                STATE_DRAINING,
                Ordering::AcqRel,
                Ordering::Acquire,
            )
            .is_err()
        {
            return Ok(());
        }

        // Dropping the only sender disconnects the queue; the writer
        // thread flushes what is buffered, drains the channel, and exits.
        self.sender.lock().take();
        if let Some(handle) = self.writer_handle.lock().take() {
            if handle.join().is_err() {
                warn!("storage writer thread panicked during drain");
            }
        }

        if self.config.wal {
            let conn = self.reader.lock();
            conn.query_row("PRAGMA wal_checkpoint(RESTART)", [], |_row| Ok(()))?;
        }

        self.state.store(STATE_CLOSED, Ordering::Release);
        info!("storage closed");
        Ok(())
    }

    pub fn stats(&self) -> &StorageStats {
        &self.stats
    }

    pub fn is_running(&self) -> bool {
        self.state.load(Ordering::Acquire) == STATE_RUNNING
    }

    fn ensure_running(&self) -> Result<(), StorageError> {
        if self.is_running() {
            Ok(())
        } else {
            Err(StorageError::NotRunning)
        }
    }
}

impl Drop for Storage {
    fn drop(&mut self) {
        if let Err(e) = self.close() {
            warn!("storage close during drop failed: {}", e);
        }
    }
}
