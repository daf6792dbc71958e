//! Canonical log record and search query types shared by every layer.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Structured data as parsed from RFC5424: SD-ID → (param name → value).
pub type StructuredData = HashMap<String, HashMap<String, String>>;

/// A single stored log entry.
///
/// `priority = facility * 8 + severity` always holds for parsed entries;
/// `id` is 0 until the storage layer assigns the database rowid.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LogEntry {
    #[serde(default)]
    pub id: i64,
    pub priority: u8,
    pub facility: u8,
    pub severity: u8,
    pub version: u8,
    pub timestamp: DateTime<Utc>,
    pub hostname: String,
    pub app_name: String,
    pub proc_id: String,
    pub msg_id: String,
    #[serde(default)]
    pub structured_data: StructuredData,
    pub message: String,
    pub created_at: DateTime<Utc>,
}

impl LogEntry {
    /// Build an entry from a syslog priority value, deriving facility and
    /// severity from it. All string fields start empty.
    pub fn from_priority(priority: u8, timestamp: DateTime<Utc>) -> Self {
        Self {
            id: 0,
            priority,
            facility: priority >> 3,
            severity: priority & 0x07,
            version: 1,
            timestamp,
            hostname: String::new(),
            app_name: String::new(),
            proc_id: String::new(),
            msg_id: String::new(),
            structured_data: StructuredData::new(),
            message: String::new(),
            created_at: Utc::now(),
        }
    }
}

/// Filterable search over stored entries. Every filter is optional; empty
/// string filters behave as wildcards. Results are newest-first.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SearchQuery {
    /// FTS expression matched against `message`.
    pub text: Option<String>,
    pub facility: Option<u8>,
    pub severity: Option<u8>,
    /// Matches entries with numeric severity <= threshold (equal or more severe).
    pub min_severity: Option<u8>,
    pub hostname: Option<String>,
    pub app_name: Option<String>,
    pub proc_id: Option<String>,
    pub msg_id: Option<String>,
    /// Substring match over the serialized structured data column.
    pub structured_data_query: Option<String>,
    /// Inclusive bounds.
    pub start_time: Option<DateTime<Utc>>,
    pub end_time: Option<DateTime<Utc>>,
    pub limit: usize,
    pub offset: usize,
}

/// Upper bound the query layer enforces on `limit`.
pub const MAX_SEARCH_LIMIT: usize = 1000;
/// Applied when a caller leaves `limit` at 0.
pub const DEFAULT_SEARCH_LIMIT: usize = 100;

impl Default for SearchQuery {
    fn default() -> Self {
        Self {
            text: None,
            facility: None,
            severity: None,
            min_severity: None,
            hostname: None,
            app_name: None,
            proc_id: None,
            msg_id: None,
            structured_data_query: None,
            start_time: None,
            end_time: None,
            limit: DEFAULT_SEARCH_LIMIT,
            offset: 0,
        }
    }
}

impl SearchQuery {
    /// Most-recent-N convenience query.
    pub fn recent(limit: usize) -> Self {
        Self {
            limit,
            ..Self::default()
        }
    }

    /// `limit` clamped into [1, MAX_SEARCH_LIMIT]; 0 means "use the default".
    pub fn normalized_limit(&self) -> usize {
        match self.limit {
            0 => DEFAULT_SEARCH_LIMIT,
            n => n.min(MAX_SEARCH_LIMIT),
        }
    }
}
