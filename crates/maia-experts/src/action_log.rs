//! Append-only log of every expert tool execution, for audit and learning.
//!
//! `log()` never blocks the turn: entries land in a bounded per-user ring and
//! a background flusher drains them to SQLite. When a ring is full the oldest
//! entry is dropped and a counter incremented.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use chrono::Utc;
use rusqlite::Connection;
use serde_json::Value;
use tokio::sync::watch;
use tracing::{debug, error, info};
use uuid::Uuid;

/// Per-user buffer capacity; beyond this the oldest entries are dropped.
const BUFFER_CAPACITY: usize = 1024;
/// Flush cadence for the background drain task.
const FLUSH_INTERVAL_MS: u64 = 250;

#[derive(Debug, Clone)]
pub struct ActionLogEntry {
    pub id: String,
    pub user_id: String,
    pub tool_name: String,
    pub tool_params: Value,
    pub success: bool,
    pub timestamp: String,
    pub context: Value,
    pub session_id: Option<String>,
}

pub struct ActionLogger {
    db: Mutex<Connection>,
    /// Pending rows per user. Lock ordering: any episode advisory lock is
    /// acquired before this one, never after.
    buffer: Mutex<HashMap<String, VecDeque<ActionLogEntry>>>,
    dropped: AtomicU64,
}

impl ActionLogger {
    /// Wrap an already-open connection; initialises the schema.
    pub fn new(conn: Connection) -> Result<Self, rusqlite::Error> {
        conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS action_log (
                id          TEXT PRIMARY KEY,
                user_id     TEXT NOT NULL,
                tool_name   TEXT NOT NULL,
                tool_params TEXT NOT NULL DEFAULT '{}',
                success     INTEGER NOT NULL,
                timestamp   TEXT NOT NULL,
                context     TEXT NOT NULL DEFAULT '{}',
                session_id  TEXT
            );
            CREATE INDEX IF NOT EXISTS idx_action_log_user
                ON action_log(user_id, timestamp DESC);
            CREATE INDEX IF NOT EXISTS idx_action_log_tool
                ON action_log(tool_name, timestamp DESC);",
        )?;
        Ok(Self {
            db: Mutex::new(conn),
            buffer: Mutex::new(HashMap::new()),
            dropped: AtomicU64::new(0),
        })
    }

    /// Enqueue one entry. Constant-time; never touches the database.
    pub fn log(
        &self,
        user_id: &str,
        tool_name: &str,
        tool_params: Value,
        success: bool,
        context: Value,
        session_id: Option<&str>,
    ) {
        let entry = ActionLogEntry {
            id: Uuid::now_v7().to_string(),
            user_id: user_id.to_string(),
            tool_name: tool_name.to_string(),
            tool_params,
            success,
            timestamp: Utc::now().to_rfc3339(),
            context,
            session_id: session_id.map(String::from),
        };

        let mut buffer = self.buffer.lock().unwrap();
        let ring = buffer.entry(user_id.to_string()).or_default();
        if ring.len() >= BUFFER_CAPACITY {
            ring.pop_front();
            self.dropped.fetch_add(1, Ordering::Relaxed);
        }
        ring.push_back(entry);
    }

    /// Number of entries lost to buffer overflow since start.
    pub fn dropped_count(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }

    /// Drain every pending entry to SQLite. Returns the row count written.
    pub fn flush(&self) -> Result<usize, rusqlite::Error> {
        let pending: Vec<ActionLogEntry> = {
            let mut buffer = self.buffer.lock().unwrap();
            buffer.drain().flat_map(|(_, ring)| ring).collect()
        };
        if pending.is_empty() {
            return Ok(0);
        }

        let db = self.db.lock().unwrap();
        let written = pending.len();
        for entry in pending {
            db.execute(
                "INSERT INTO action_log
                 (id, user_id, tool_name, tool_params, success, timestamp,
                  context, session_id)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
                rusqlite::params![
                    entry.id,
                    entry.user_id,
                    entry.tool_name,
                    entry.tool_params.to_string(),
                    entry.success as i64,
                    entry.timestamp,
                    entry.context.to_string(),
                    entry.session_id,
                ],
            )?;
        }
        debug!(written, "action log flushed");
        Ok(written)
    }

    /// Recent entries for a user, newest first, optionally bounded by a
    /// RFC3339 `since` timestamp. Flushes pending entries first so callers
    /// see a consistent view.
    pub fn recent(
        &self,
        user_id: &str,
        since: Option<&str>,
        limit: usize,
    ) -> Result<Vec<ActionLogEntry>, rusqlite::Error> {
        self.flush()?;

        let db = self.db.lock().unwrap();
        let mut stmt = db.prepare(
            "SELECT id, user_id, tool_name, tool_params, success, timestamp,
                    context, session_id
             FROM action_log
             WHERE user_id = ?1 AND timestamp >= ?2
             ORDER BY timestamp DESC
             LIMIT ?3",
        )?;
        let rows = stmt.query_map(
            rusqlite::params![user_id, since.unwrap_or(""), limit],
            |row| {
                let params_str: String = row.get(3)?;
                let context_str: String = row.get(6)?;
                Ok(ActionLogEntry {
                    id: row.get(0)?,
                    user_id: row.get(1)?,
                    tool_name: row.get(2)?,
                    tool_params: serde_json::from_str(&params_str).unwrap_or(Value::Null),
                    success: row.get::<_, i64>(4)? != 0,
                    timestamp: row.get(5)?,
                    context: serde_json::from_str(&context_str).unwrap_or(Value::Null),
                    session_id: row.get(7)?,
                })
            },
        )?;
        Ok(rows.filter_map(|r| r.ok()).collect())
    }
}

/// Background drain loop. Runs until `shutdown` broadcasts `true`, with one
/// final flush on the way out.
pub async fn run_flusher(logger: Arc<ActionLogger>, mut shutdown: watch::Receiver<bool>) {
    info!("action log flusher started");
    let mut interval =
        tokio::time::interval(std::time::Duration::from_millis(FLUSH_INTERVAL_MS));
    loop {
        tokio::select! {
            _ = interval.tick() => {
                if let Err(e) = logger.flush() {
                    error!("action log flush failed: {e}");
                }
            }
            _ = shutdown.changed() => {
                if *shutdown.borrow() {
                    let _ = logger.flush();
                    info!("action log flusher shutting down");
                    break;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn logger() -> ActionLogger {
        ActionLogger::new(Connection::open_in_memory().unwrap()).unwrap()
    }

    #[test]
    fn log_then_recent_round_trips() {
        let l = logger();
        l.log(
            "alice",
            "list.add",
            serde_json::json!({"text": "milk"}),
            true,
            serde_json::json!({}),
            Some("sess-1"),
        );
        l.log(
            "alice",
            "list.add",
            serde_json::json!({"text": "eggs"}),
            true,
            serde_json::json!({}),
            Some("sess-1"),
        );

        let rows = l.recent("alice", None, 10).unwrap();
        assert_eq!(rows.len(), 2);
        assert!(rows.iter().all(|r| r.tool_name == "list.add" && r.success));
    }

    #[test]
    fn recent_is_isolated_by_user() {
        let l = logger();
        l.log(
            "alice",
            "list.add",
            serde_json::json!({}),
            true,
            serde_json::json!({}),
            None,
        );
        assert!(l.recent("bob", None, 10).unwrap().is_empty());
    }

    #[test]
    fn overflow_drops_oldest_and_counts() {
        let l = logger();
        for i in 0..(BUFFER_CAPACITY + 5) {
            l.log(
                "alice",
                "list.add",
                serde_json::json!({"i": i}),
                true,
                serde_json::json!({}),
                None,
            );
        }
        assert_eq!(l.dropped_count(), 5);
        assert_eq!(l.flush().unwrap(), BUFFER_CAPACITY);
    }

    #[test]
    fn failed_executions_are_recorded_with_success_false() {
        let l = logger();
        l.log(
            "alice",
            "calendar.create",
            serde_json::json!({"title": "meeting"}),
            false,
            serde_json::json!({"error": "circuit_open"}),
            None,
        );
        let rows = l.recent("alice", None, 10).unwrap();
        assert_eq!(rows.len(), 1);
        assert!(!rows[0].success);
    }
}
