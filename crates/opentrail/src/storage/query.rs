//! SearchQuery → SQL construction and row mapping.

use chrono::{DateTime, SecondsFormat, Utc};
use rusqlite::types::Value;
use rusqlite::{params_from_iter, Connection, Row};

use crate::error::StorageError;
use crate::model::{LogEntry, SearchQuery};

const SELECT_COLUMNS: &str = "logs.id, logs.priority, logs.facility, logs.severity, \
     logs.version, logs.timestamp, logs.hostname, logs.app_name, logs.proc_id, \
     logs.msg_id, logs.structured_data, logs.message, logs.created_at";

/// Timestamps are stored as fixed-width RFC3339 text (microsecond
/// precision, `Z` suffix) so that lexicographic comparison matches
/// chronological order.
pub fn to_db_time(time: &DateTime<Utc>) -> String {
    time.to_rfc3339_opts(SecondsFormat::Micros, true)
}

pub fn from_db_time(raw: &str) -> Result<DateTime<Utc>, StorageError> {
    DateTime::parse_from_rfc3339(raw)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| StorageError::Conversion(format!("timestamp {:?}: {}", raw, e)))
}

/// Run a search. Results are newest-first (`timestamp DESC`, id as the
/// tiebreak), paged by the normalized limit and offset.
pub fn search(conn: &Connection, query: &SearchQuery) -> Result<Vec<LogEntry>, StorageError> {
    let mut predicates: Vec<String> = Vec::new();
    let mut params: Vec<Value> = Vec::new();

    let text_filter = query
        .text
        .as_deref()
        .filter(|t| !t.is_empty());

    let mut sql = if text_filter.is_some() {
        format!(
            "SELECT {} FROM logs JOIN logs_fts ON logs.id = logs_fts.rowid",
            SELECT_COLUMNS
        )
    } else {
        format!("SELECT {} FROM logs", SELECT_COLUMNS)
    };

    if let Some(text) = text_filter {
        predicates.push("logs_fts MATCH ?".to_string());
        params.push(Value::Text(text.to_string()));
    }
    if let Some(facility) = query.facility {
        predicates.push("logs.facility = ?".to_string());
        params.push(Value::Integer(i64::from(facility)));
    }
    if let Some(severity) = query.severity {
        predicates.push("logs.severity = ?".to_string());
        params.push(Value::Integer(i64::from(severity)));
    }
    if let Some(min_severity) = query.min_severity {
        // Lower numeric severity is more severe; the filter keeps entries
        // at least as severe as the threshold.
        predicates.push("logs.severity <= ?".to_string());
        params.push(Value::Integer(i64::from(min_severity)));
    }
    for (column, value) in [
        ("logs.hostname", &query.hostname),
        ("logs.app_name", &query.app_name),
        ("logs.proc_id", &query.proc_id),
        ("logs.msg_id", &query.msg_id),
    ] {
        if let Some(value) = value.as_deref().filter(|v| !v.is_empty()) {
            predicates.push(format!("{} = ?", column));
            params.push(Value::Text(value.to_string()));
        }
    }
    if let Some(sd_query) = query
        .structured_data_query
        .as_deref()
        .filter(|q| !q.is_empty())
    {
        predicates.push("logs.structured_data LIKE ?".to_string());
        params.push(Value::Text(format!("%{}%", sd_query)));
    }
    if let Some(start) = &query.start_time {
        predicates.push("logs.timestamp >= ?".to_string());
        params.push(Value::Text(to_db_time(start)));
    }
    if let Some(end) = &query.end_time {
        predicates.push("logs.timestamp <= ?".to_string());
        params.push(Value::Text(to_db_time(end)));
    }

    if !predicates.is_empty() {
        sql.push_str(" WHERE ");
        sql.push_str(&predicates.join(" AND "));
    }
    sql.push_str(" ORDER BY logs.timestamp DESC, logs.id DESC LIMIT ? OFFSET ?");
    params.push(Value::Integer(query.normalized_limit() as i64));
    params.push(Value::Integer(query.offset as i64));

    let mut stmt = conn.prepare_cached(&sql)?;
    let rows = stmt.query_map(params_from_iter(params), map_row)?;

    let mut entries = Vec::new();
    for row in rows {
        entries.push(row??);
    }
    Ok(entries)
}

/// Map a result row to a LogEntry. The inner Result keeps rusqlite's row
/// error distinct from our own conversion failures.
fn map_row(row: &Row<'_>) -> rusqlite::Result<Result<LogEntry, StorageError>> {
    let timestamp_raw: String = row.get(5)?;
    let structured_raw: String = row.get(10)?;
    let created_raw: String = row.get(12)?;

    Ok((|| {
        Ok(LogEntry {
            id: row_get(row, 0)?,
            priority: row_get(row, 1)?,
            facility: row_get(row, 2)?,
            severity: row_get(row, 3)?,
            version: row_get(row, 4)?,
            timestamp: from_db_time(&timestamp_raw)?,
            hostname: row_get(row, 6)?,
            app_name: row_get(row, 7)?,
            proc_id: row_get(row, 8)?,
            msg_id: row_get(row, 9)?,
            structured_data: serde_json::from_str(&structured_raw)
                .map_err(|e| StorageError::Conversion(format!("structured data: {}", e)))?,
            message: row_get(row, 11)?,
            created_at: from_db_time(&created_raw)?,
        })
    })())
}

fn row_get<T: rusqlite::types::FromSql>(row: &Row<'_>, idx: usize) -> Result<T, StorageError> {
    row.get(idx).map_err(StorageError::from)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::schema;
    use chrono::TimeZone;

    fn seeded_conn() -> Connection {
        let conn = Connection::open_in_memory().unwrap();
        schema::initialize(&conn, true).unwrap();
        for (i, (severity, hostname, message)) in [
            (6u8, "web01", "user alice logged in"),
            (4u8, "web01", "disk usage above threshold"),
            (3u8, "db01", "replication lag detected"),
        ]
        .iter()
        .enumerate()
        {
            let ts = Utc.with_ymd_and_hms(2024, 1, 1, 10, i as u32, 0).unwrap();
            conn.execute(
                "INSERT INTO logs (priority, facility, severity, timestamp, hostname,
                                   app_name, proc_id, msg_id, structured_data, message, created_at)
                 VALUES (?1, 16, ?2, ?3, ?4, 'app', '', '', '{}', ?5, ?6)",
                rusqlite::params![
                    128 + severity,
                    severity,
                    to_db_time(&ts),
                    hostname,
                    message,
                    to_db_time(&Utc::now()),
                ],
            )
            .unwrap();
        }
        conn
    }

    #[test]
    fn returns_newest_first() {
        let conn = seeded_conn();
        let entries = search(&conn, &SearchQuery::default()).unwrap();
        assert_eq!(entries.len(), 3);
        assert!(entries[0].timestamp > entries[1].timestamp);
        assert!(entries[1].timestamp > entries[2].timestamp);
    }

    #[test]
    fn text_filter_uses_fts() {
        let conn = seeded_conn();
        let query = SearchQuery {
            text: Some("replication".to_string()),
            ..SearchQuery::default()
        };
        let entries = search(&conn, &query).unwrap();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].hostname, "db01");
    }

    #[test]
    fn min_severity_keeps_more_severe_entries() {
        let conn = seeded_conn();
        let query = SearchQuery {
            min_severity: Some(4),
            ..SearchQuery::default()
        };
        let entries = search(&conn, &query).unwrap();
        assert_eq!(entries.len(), 2);
        assert!(entries.iter().all(|e| e.severity <= 4));
    }

    #[test]
    fn exact_filters_and_paging() {
        let conn = seeded_conn();
        let query = SearchQuery {
            hostname: Some("web01".to_string()),
            limit: 1,
            offset: 1,
            ..SearchQuery::default()
        };
        let entries = search(&conn, &query).unwrap();
        assert_eq!(entries.len(), 1);
        // Two web01 entries, newest first; offset 1 lands on the older one.
        assert_eq!(entries[0].message, "user alice logged in");
    }

    #[test]
    fn time_bounds_are_inclusive() {
        let conn = seeded_conn();
        let at = Utc.with_ymd_and_hms(2024, 1, 1, 10, 1, 0).unwrap();
        let query = SearchQuery {
            start_time: Some(at),
            end_time: Some(at),
            ..SearchQuery::default()
        };
        let entries = search(&conn, &query).unwrap();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].timestamp, at);
    }

    #[test]
    fn empty_string_filters_are_wildcards() {
        let conn = seeded_conn();
        let query = SearchQuery {
            hostname: Some(String::new()),
            text: Some(String::new()),
            ..SearchQuery::default()
        };
        assert_eq!(search(&conn, &query).unwrap().len(), 3);
    }

    #[test]
    fn db_time_round_trip_preserves_order_and_instant() {
        let t1 = Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap();
        let t2 = t1 + chrono::Duration::microseconds(1);
        assert!(to_db_time(&t1) < to_db_time(&t2));
        assert_eq!(from_db_time(&to_db_time(&t2)).unwrap(), t2);
    }
}
