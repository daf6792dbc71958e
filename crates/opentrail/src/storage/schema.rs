//! Schema DDL and connection pragmas.
//!
//! `logs` is the physical table; `logs_fts` is an external-content FTS5
//! index over `message` whose rowid shadows `logs.id`, kept in sync by
//! INSERT/DELETE/UPDATE triggers. One index per filter column plus the
//! composites the query planner needs for the common filter pairs.

use rusqlite::Connection;

const CREATE_SCHEMA_SQL: &str = "\
CREATE TABLE IF NOT EXISTS logs (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    priority INTEGER NOT NULL,
    facility INTEGER NOT NULL,
    severity INTEGER NOT NULL,
    version INTEGER NOT NULL DEFAULT 1,
    timestamp DATETIME NOT NULL,
    hostname TEXT NOT NULL DEFAULT '',
    app_name TEXT NOT NULL DEFAULT '',
    proc_id TEXT NOT NULL DEFAULT '',
    msg_id TEXT NOT NULL DEFAULT '',
    structured_data TEXT NOT NULL DEFAULT '{}',
    message TEXT NOT NULL DEFAULT '',
    created_at DATETIME NOT NULL
);

CREATE VIRTUAL TABLE IF NOT EXISTS logs_fts USING fts5(
    message,
    content='logs',
    content_rowid='id'
);

CREATE TRIGGER IF NOT EXISTS logs_fts_after_insert AFTER INSERT ON logs BEGIN
    INSERT INTO logs_fts(rowid, message) VALUES (new.id, new.message);
END;

CREATE TRIGGER IF NOT EXISTS logs_fts_after_delete AFTER DELETE ON logs BEGIN
    INSERT INTO logs_fts(logs_fts, rowid, message) VALUES ('delete', old.id, old.message);
END;

CREATE TRIGGER IF NOT EXISTS logs_fts_after_update AFTER UPDATE ON logs BEGIN
    INSERT INTO logs_fts(logs_fts, rowid, message) VALUES ('delete', old.id, old.message);
    INSERT INTO logs_fts(rowid, message) VALUES (new.id, new.message);
END;

CREATE INDEX IF NOT EXISTS idx_logs_timestamp ON logs(timestamp);
CREATE INDEX IF NOT EXISTS idx_logs_facility ON logs(facility);
CREATE INDEX IF NOT EXISTS idx_logs_severity ON logs(severity);
CREATE INDEX IF NOT EXISTS idx_logs_hostname ON logs(hostname);
CREATE INDEX IF NOT EXISTS idx_logs_app_name ON logs(app_name);
CREATE INDEX IF NOT EXISTS idx_logs_proc_id ON logs(proc_id);
CREATE INDEX IF NOT EXISTS idx_logs_msg_id ON logs(msg_id);
CREATE INDEX IF NOT EXISTS idx_logs_priority ON logs(priority);
CREATE INDEX IF NOT EXISTS idx_logs_created_at ON logs(created_at);
CREATE INDEX IF NOT EXISTS idx_logs_facility_severity ON logs(facility, severity);
CREATE INDEX IF NOT EXISTS idx_logs_hostname_app_name ON logs(hostname, app_name);
CREATE INDEX IF NOT EXISTS idx_logs_timestamp_severity ON logs(timestamp, severity);
";

const DROP_SCHEMA_SQL: &str = "\
DROP TABLE IF EXISTS logs_fts;
DROP TABLE IF EXISTS logs;
";

/// Create the schema, optionally dropping any existing tables first.
/// `reset` reproduces the original development behavior; the default is to
/// preserve data across restarts.
pub fn initialize(conn: &Connection, reset: bool) -> rusqlite::Result<()> {
    if reset {
        conn.execute_batch(DROP_SCHEMA_SQL)?;
    }
    conn.execute_batch(CREATE_SCHEMA_SQL)
}

/// Apply the durability/concurrency pragmas. WAL mode allows concurrent
/// readers with the single batch writer; the non-WAL variant trades that
/// for synchronous=FULL durability. Value-returning pragmas go through
/// `query_row`; the silent ones through `pragma_update`.
pub fn apply_pragmas(conn: &Connection, wal: bool) -> rusqlite::Result<()> {
    conn.busy_timeout(std::time::Duration::from_millis(5000))?;
    conn.pragma_update(None, "foreign_keys", true)?;

    if wal {
        // The journal_mode pragma returns the resulting mode, so query it
        // to confirm the switch took effect. Memory databases report
        // "memory" and have no WAL.
        let mode: String = conn.query_row("PRAGMA journal_mode = WAL", [], |row| row.get(0))?;
        if mode != "wal" && mode != "memory" {
            return Err(rusqlite::Error::InvalidQuery);
        }
        conn.pragma_update(None, "synchronous", "NORMAL")?;
        conn.query_row("PRAGMA wal_autocheckpoint = 1000", [], |_row| Ok(()))?;
    } else {
        let _: String = conn.query_row("PRAGMA journal_mode = DELETE", [], |row| row.get(0))?;
        conn.pragma_update(None, "synchronous", "FULL")?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn schema_creates_and_is_idempotent() {
        let conn = Connection::open_in_memory().unwrap();
        apply_pragmas(&conn, true).unwrap();
        initialize(&conn, false).unwrap();
        initialize(&conn, false).unwrap();

        let count: i64 = conn
            .query_row(
                "SELECT COUNT(*) FROM sqlite_master WHERE type = 'table' AND name = 'logs'",
                [],
                |row| row.get(0),
            )
            .unwrap();
        assert_eq!(count, 1);
    }

    #[test]
    fn fts_triggers_track_inserts_and_deletes() {
        let conn = Connection::open_in_memory().unwrap();
        initialize(&conn, true).unwrap();

        conn.execute(
            "INSERT INTO logs (priority, facility, severity, timestamp, message, created_at)
             VALUES (134, 16, 6, '2024-01-01T00:00:00.000000Z', 'alpha beta', '2024-01-01T00:00:00.000000Z')",
            [],
        )
        .unwrap();

        let hits: i64 = conn
            .query_row(
                "SELECT COUNT(*) FROM logs_fts WHERE logs_fts MATCH 'beta'",
                [],
                |row| row.get(0),
            )
            .unwrap();
        assert_eq!(hits, 1);

        conn.execute("DELETE FROM logs", []).unwrap();
        let hits: i64 = conn
            .query_row(
                "SELECT COUNT(*) FROM logs_fts WHERE logs_fts MATCH 'beta'",
                [],
                |row| row.get(0),
            )
            .unwrap();
        assert_eq!(hits, 0);
    }
}
