//! The batch writer: a single blocking thread that owns the write
//! connection, drains the bounded request queue, and flushes batches in
//! one transaction each.
//!
//! Failure policy: when any row fails inside the transaction the whole
//! batch rolls back and every request is retried individually, so one
//! poison record cannot block the others. Each request's ack is a oneshot
//! sender, consumed on send, so a result is reported exactly once.

use std::time::{Duration, Instant};

use chrono::Utc;
use crossbeam_channel::{Receiver, RecvTimeoutError};
use rusqlite::Connection;
use tokio::sync::oneshot;
use tracing::{debug, warn};

use crate::error::StorageError;
use crate::metrics::StorageStats;
use crate::model::LogEntry;
use crate::storage::query::to_db_time;

pub struct WriteRequest {
    pub entry: LogEntry,
    pub ack: oneshot::Sender<Result<i64, StorageError>>,
}

const INSERT_SQL: &str = "\
INSERT INTO logs (priority, facility, severity, version, timestamp, hostname,
                  app_name, proc_id, msg_id, structured_data, message, created_at)
VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12)";

/// Consume the queue until every sender is gone and the channel is empty,
/// flushing on batch size, batch timeout (measured from the first request
/// in the buffer), or shutdown.
pub fn run(
    mut conn: Connection,
    rx: Receiver<WriteRequest>,
    batch_size: usize,
    batch_timeout: Duration,
    stats: StorageStats,
) {
    let mut buffer: Vec<WriteRequest> = Vec::with_capacity(batch_size);

    loop {
        // Block until the batch has a first request; disconnect with an
        // empty queue means drain is complete.
        match rx.recv() {
            Ok(request) => {
                stats.request_dequeued();
                buffer.push(request);
            }
            Err(_) => break,
        }

        let deadline = Instant::now() + batch_timeout;
        let mut disconnected = false;
        while buffer.len() < batch_size {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                break;
            }
            match rx.recv_timeout(remaining) {
                Ok(request) => {
                    stats.request_dequeued();
                    buffer.push(request);
                }
                Err(RecvTimeoutError::Timeout) => break,
                Err(RecvTimeoutError::Disconnected) => {
                    disconnected = true;
                    break;
                }
            }
        }

        flush(&mut conn, &mut buffer, &stats);

        if disconnected {
            // Later recv calls drain whatever is still queued, then error.
            continue;
        }
    }

    debug!("batch writer drained and stopped");
}

fn flush(conn: &mut Connection, buffer: &mut Vec<WriteRequest>, stats: &StorageStats) {
    if buffer.is_empty() {
        return;
    }
    let flush_start = Instant::now();

    // Serialize structured data up front; a conversion failure answers that
    // request alone and keeps it out of the transaction.
    let mut rows: Vec<(WriteRequest, String)> = Vec::with_capacity(buffer.len());
    for request in buffer.drain(..) {
        match serde_json::to_string(&request.entry.structured_data) {
            Ok(serialized) => rows.push((request, serialized)),
            Err(e) => {
                let _ = request
                    .ack
                    .send(Err(StorageError::Conversion(e.to_string())));
            }
        }
    }
    if rows.is_empty() {
        return;
    }

    let txn_start = Instant::now();
    let txn_result = insert_batch(conn, &rows);
    let txn_elapsed = txn_start.elapsed();

    match txn_result {
        Ok(ids) => {
            for ((request, _), id) in rows.into_iter().zip(ids) {
                let _ = request.ack.send(Ok(id));
            }
        }
        Err(e) => {
            warn!("batch insert rolled back, retrying rows individually: {}", e);
            for (request, serialized) in rows {
                let result = insert_single(conn, &request.entry, &serialized);
                let _ = request.ack.send(result);
            }
        }
    }

    stats.batch_processed(flush_start.elapsed(), txn_elapsed);
}

/// One transaction for the whole batch. Any row error propagates, the
/// transaction drops uncommitted, and the caller falls back to individual
/// retries.
fn insert_batch(
    conn: &mut Connection,
    rows: &[(WriteRequest, String)],
) -> Result<Vec<i64>, StorageError> {
    let tx = conn.transaction()?;
    let mut ids = Vec::with_capacity(rows.len());
    {
        let mut stmt = tx.prepare_cached(INSERT_SQL)?;
        for (request, serialized) in rows {
            ids.push(stmt.insert(insert_params(&request.entry, serialized))?);
        }
    }
    tx.commit()?;
    Ok(ids)
}

fn insert_single(
    conn: &Connection,
    entry: &LogEntry,
    serialized: &str,
) -> Result<i64, StorageError> {
    let mut stmt = conn.prepare_cached(INSERT_SQL)?;
    Ok(stmt.insert(insert_params(entry, serialized))?)
}

type InsertParams<'a> = (
    u8,
    u8,
    u8,
    u8,
    String,
    &'a str,
    &'a str,
    &'a str,
    &'a str,
    &'a str,
    &'a str,
    String,
);

fn insert_params<'a>(entry: &'a LogEntry, serialized: &'a str) -> InsertParams<'a> {
    (
        entry.priority,
        entry.facility,
        entry.severity,
        entry.version,
        to_db_time(&entry.timestamp),
        entry.hostname.as_str(),
        entry.app_name.as_str(),
        entry.proc_id.as_str(),
        entry.msg_id.as_str(),
        serialized,
        entry.message.as_str(),
        to_db_time(&Utc::now()),
    )
}
