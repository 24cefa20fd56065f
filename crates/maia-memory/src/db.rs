use rusqlite::{Connection, Result};

/// Create the episodic memory schema. Idempotent, so it runs at every start.
pub fn init_db(conn: &Connection) -> Result<()> {
    create_episodes_table(conn)?;
    create_turns_table(conn)?;
    create_facts_table(conn)?;
    create_facts_fts(conn)?;
    Ok(())
}

fn create_episodes_table(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        "CREATE TABLE IF NOT EXISTS episodes (
            id               TEXT PRIMARY KEY,
            user_id          TEXT NOT NULL,
            context_type     TEXT NOT NULL,
            started_at       TEXT NOT NULL,
            last_activity_at TEXT NOT NULL,
            status           TEXT NOT NULL DEFAULT 'active',
            timeout_minutes  INTEGER NOT NULL,
            message_count    INTEGER NOT NULL DEFAULT 0,
            summary          TEXT
        );
        CREATE INDEX IF NOT EXISTS idx_episodes_user
            ON episodes(user_id, context_type, status);
        CREATE INDEX IF NOT EXISTS idx_episodes_sweep
            ON episodes(status, last_activity_at);
        CREATE UNIQUE INDEX IF NOT EXISTS idx_episodes_single_active
            ON episodes(user_id, context_type) WHERE status = 'active';",
    )
}

fn create_turns_table(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        "CREATE TABLE IF NOT EXISTS turns (
            id             TEXT PRIMARY KEY,
            episode_id     TEXT NOT NULL REFERENCES episodes(id) ON DELETE CASCADE,
            user_text      TEXT NOT NULL,
            assistant_text TEXT NOT NULL,
            created_at     TEXT NOT NULL
        );
        CREATE INDEX IF NOT EXISTS idx_turns_episode
            ON turns(episode_id, created_at);",
    )
}

fn create_facts_table(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        "CREATE TABLE IF NOT EXISTS memory_facts (
            id               INTEGER PRIMARY KEY AUTOINCREMENT,
            user_id          TEXT NOT NULL,
            subject_kind     TEXT NOT NULL DEFAULT 'general',
            subject_id       TEXT,
            text             TEXT NOT NULL,
            importance       REAL NOT NULL DEFAULT 5.0,
            embedding        BLOB,
            created_at       TEXT NOT NULL,
            last_accessed_at TEXT NOT NULL,
            access_count     INTEGER NOT NULL DEFAULT 0
        );
        CREATE INDEX IF NOT EXISTS idx_facts_user
            ON memory_facts(user_id);",
    )
}

/// FTS5 virtual table for full-text search over fact text.
/// External-content table; synced manually on every write.
fn create_facts_fts(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        "CREATE VIRTUAL TABLE IF NOT EXISTS memory_facts_fts
            USING fts5(text, content='memory_facts', content_rowid='id');",
    )
}
