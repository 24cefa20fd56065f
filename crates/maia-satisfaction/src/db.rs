use rusqlite::{Connection, Result};

/// Create the interaction and feedback schema. Idempotent, so it runs at
/// every start.
pub fn init_db(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        "CREATE TABLE IF NOT EXISTS interactions (
            id                     TEXT PRIMARY KEY,
            user_id                TEXT NOT NULL,
            request_text           TEXT NOT NULL,
            response_text          TEXT NOT NULL,
            response_time_ms       INTEGER NOT NULL,
            task_completed         INTEGER NOT NULL,
            engagement_duration_ms INTEGER,
            follow_up_in_60s       INTEGER,
            context                TEXT NOT NULL DEFAULT '{}',
            created_at             TEXT NOT NULL
        );
        CREATE INDEX IF NOT EXISTS idx_interactions_user
            ON interactions(user_id, created_at DESC);

        CREATE TABLE IF NOT EXISTS feedback (
            id             TEXT PRIMARY KEY,
            user_id        TEXT NOT NULL,
            interaction_id TEXT NOT NULL REFERENCES interactions(id),
            kind           TEXT NOT NULL,
            value          REAL,
            text           TEXT,
            created_at     TEXT NOT NULL
        );
        CREATE INDEX IF NOT EXISTS idx_feedback_interaction
            ON feedback(interaction_id);
        CREATE INDEX IF NOT EXISTS idx_feedback_user
            ON feedback(user_id, created_at DESC);",
    )
}
