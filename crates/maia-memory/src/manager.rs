use std::sync::{Arc, Mutex};

use chrono::{DateTime, Duration, Utc};
use dashmap::DashMap;
use rusqlite::Connection;
use tracing::{debug, info};
use uuid::Uuid;

use maia_core::config::EpisodeConfig;
use maia_core::types::ContextType;

use crate::error::{MemoryError, Result};
use crate::types::*;

/// Decay halflife for fact retrieval scoring, in days.
const DECAY_HALFLIFE_DAYS: f64 = 30.0;
/// How many FTS candidates to pull before decay re-ranking.
const SEARCH_CANDIDATES: usize = 50;
/// An episode is summarized once its turn count crosses this threshold.
pub const SUMMARY_THRESHOLD: u32 = 20;

/// Manages episodes, turns, and long-term memory facts for all users.
///
/// SQLite sits behind a `Mutex<Connection>`; writes to any one episode
/// additionally serialize on a per-`(user_id, context_type)` advisory lock so
/// `get_or_open` can re-check staleness atomically. Reads skip the advisory
/// lock and may observe a stale `last_activity_at`.
pub struct MemoryManager {
    db: Mutex<Connection>,
    episode_locks: DashMap<String, Arc<tokio::sync::Mutex<()>>>,
    timeouts: EpisodeConfig,
}

impl MemoryManager {
    /// Wrap an already-open connection; initialises the schema.
    pub fn new(conn: Connection, timeouts: EpisodeConfig) -> Result<Self> {
        conn.pragma_update(None, "foreign_keys", "ON")?;
        crate::db::init_db(&conn)?;
        Ok(Self {
            db: Mutex::new(conn),
            episode_locks: DashMap::new(),
            timeouts,
        })
    }

    fn advisory_lock(&self, user_id: &str, context: ContextType) -> Arc<tokio::sync::Mutex<()>> {
        let key = format!("{user_id}:{context}");
        self.episode_locks
            .entry(key)
            .or_insert_with(|| Arc::new(tokio::sync::Mutex::new(())))
            .clone()
    }

    // ── episodes ─────────────────────────────────────────────────────────────

    /// Find the active episode for `(user_id, context)`, rotating it if it has
    /// idled past its timeout. Creates one lazily on the first turn.
    pub async fn get_or_open(&self, user_id: &str, context: ContextType) -> Result<Episode> {
        self.get_or_open_at(user_id, context, Utc::now()).await
    }

    /// Clock-injected variant of [`get_or_open`](Self::get_or_open).
    pub async fn get_or_open_at(
        &self,
        user_id: &str,
        context: ContextType,
        now: DateTime<Utc>,
    ) -> Result<Episode> {
        let lock = self.advisory_lock(user_id, context);
        let _guard = lock.lock().await;

        let existing = self.active_episode(user_id, context)?;
        if let Some(episode) = existing {
            let stale = parse_ts(&episode.last_activity_at)
                .map(|last| now - last > Duration::minutes(episode.timeout_minutes))
                .unwrap_or(true);
            if !stale {
                return Ok(episode);
            }
            self.close_inner(&episode.id, &now.to_rfc3339())?;
            info!(
                user_id,
                context = %context,
                episode_id = %episode.id,
                "episode timed out, rotating"
            );
        }

        self.open_episode(user_id, context, now)
    }

    fn open_episode(
        &self,
        user_id: &str,
        context: ContextType,
        now: DateTime<Utc>,
    ) -> Result<Episode> {
        // UUID v7 keeps episode ids opaque but roughly time-ordered.
        let id = Uuid::now_v7().to_string();
        let now_str = now.to_rfc3339();
        let timeout = self.timeouts.timeout_minutes(context);

        let db = self.db.lock().unwrap();
        db.execute(
            "INSERT INTO episodes
             (id, user_id, context_type, started_at, last_activity_at, status,
              timeout_minutes, message_count)
             VALUES (?1, ?2, ?3, ?4, ?4, 'active', ?5, 0)",
            rusqlite::params![id, user_id, context.as_str(), now_str, timeout],
        )?;
        debug!(user_id, context = %context, episode_id = %id, "episode opened");

        Ok(Episode {
            id,
            user_id: user_id.to_string(),
            context_type: context,
            started_at: now_str.clone(),
            last_activity_at: now_str,
            status: EpisodeStatus::Active,
            timeout_minutes: timeout,
            message_count: 0,
            summary: None,
        })
    }

    /// The unique active episode for `(user_id, context)`, if any.
    pub fn active_episode(&self, user_id: &str, context: ContextType) -> Result<Option<Episode>> {
        let db = self.db.lock().unwrap();
        match db.query_row(
            "SELECT id, user_id, context_type, started_at, last_activity_at,
                    status, timeout_minutes, message_count, summary
             FROM episodes
             WHERE user_id = ?1 AND context_type = ?2 AND status = 'active'",
            rusqlite::params![user_id, context.as_str()],
            row_to_episode,
        ) {
            Ok(e) => Ok(Some(e)),
            Err(rusqlite::Error::QueryReturnedNoRows) => Ok(None),
            Err(e) => Err(MemoryError::Database(e)),
        }
    }

    pub fn get_episode(&self, episode_id: &str) -> Result<Episode> {
        let db = self.db.lock().unwrap();
        db.query_row(
            "SELECT id, user_id, context_type, started_at, last_activity_at,
                    status, timeout_minutes, message_count, summary
             FROM episodes WHERE id = ?1",
            rusqlite::params![episode_id],
            row_to_episode,
        )
        .map_err(|e| match e {
            rusqlite::Error::QueryReturnedNoRows => {
                MemoryError::EpisodeNotFound(episode_id.to_string())
            }
            other => MemoryError::Database(other),
        })
    }

    /// Append a turn, bump `message_count`, refresh `last_activity_at`.
    /// Returns the updated episode so callers can check the summary threshold.
    pub async fn append_turn(
        &self,
        episode_id: &str,
        user_text: &str,
        assistant_text: &str,
    ) -> Result<Episode> {
        let episode = self.get_episode(episode_id)?;
        let lock = self.advisory_lock(&episode.user_id, episode.context_type);
        let _guard = lock.lock().await;

        // Re-read under the lock; the episode may have been closed meanwhile.
        let episode = self.get_episode(episode_id)?;
        if episode.status == EpisodeStatus::Closed {
            return Err(MemoryError::EpisodeClosed(episode_id.to_string()));
        }

        let now = Utc::now().to_rfc3339();
        let turn_id = Uuid::now_v7().to_string();
        {
            let db = self.db.lock().unwrap();
            db.execute(
                "INSERT INTO turns (id, episode_id, user_text, assistant_text, created_at)
                 VALUES (?1, ?2, ?3, ?4, ?5)",
                rusqlite::params![turn_id, episode_id, user_text, assistant_text, now],
            )?;
            db.execute(
                "UPDATE episodes
                 SET message_count = message_count + 1, last_activity_at = ?2
                 WHERE id = ?1",
                rusqlite::params![episode_id, now],
            )?;
        }

        self.get_episode(episode_id)
    }

    /// Most recent turns, newest first, capped at `k`.
    pub fn recent_turns(&self, episode_id: &str, k: usize) -> Result<Vec<Turn>> {
        let db = self.db.lock().unwrap();
        let mut stmt = db.prepare(
            "SELECT id, episode_id, user_text, assistant_text, created_at
             FROM turns
             WHERE episode_id = ?1
             ORDER BY created_at DESC, rowid DESC
             LIMIT ?2",
        )?;
        let rows = stmt.query_map(rusqlite::params![episode_id, k], |row| {
            Ok(Turn {
                id: row.get(0)?,
                episode_id: row.get(1)?,
                user_text: row.get(2)?,
                assistant_text: row.get(3)?,
                created_at: row.get(4)?,
            })
        })?;
        Ok(rows.filter_map(|r| r.ok()).collect())
    }

    /// Explicitly close an episode.
    pub async fn close(&self, episode_id: &str) -> Result<Episode> {
        let episode = self.get_episode(episode_id)?;
        let lock = self.advisory_lock(&episode.user_id, episode.context_type);
        let _guard = lock.lock().await;
        self.close_inner(episode_id, &Utc::now().to_rfc3339())?;
        self.get_episode(episode_id)
    }

    fn close_inner(&self, episode_id: &str, now: &str) -> Result<()> {
        let db = self.db.lock().unwrap();
        let n = db.execute(
            "UPDATE episodes SET status = 'closed', last_activity_at = ?2
             WHERE id = ?1 AND status = 'active'",
            rusqlite::params![episode_id, now],
        )?;
        if n == 0 {
            return Err(MemoryError::EpisodeNotFound(episode_id.to_string()));
        }
        Ok(())
    }

    /// Close every active episode idle past its own timeout. Returns the
    /// episodes that were closed so the caller can trigger summarization.
    pub fn sweep_expired(&self, now: DateTime<Utc>) -> Result<Vec<Episode>> {
        let expired: Vec<Episode> = {
            let db = self.db.lock().unwrap();
            let mut stmt = db.prepare(
                "SELECT id, user_id, context_type, started_at, last_activity_at,
                        status, timeout_minutes, message_count, summary
                 FROM episodes WHERE status = 'active'",
            )?;
            let rows: Vec<Episode> = stmt
                .query_map([], row_to_episode)?
                .filter_map(|r| r.ok())
                .filter(|e| {
                    parse_ts(&e.last_activity_at)
                        .map(|last| now - last > Duration::minutes(e.timeout_minutes))
                        .unwrap_or(true)
                })
                .collect();
            rows
        };

        let now_str = now.to_rfc3339();
        for episode in &expired {
            self.close_inner(&episode.id, &now_str)?;
            info!(episode_id = %episode.id, user_id = %episode.user_id, "episode swept");
        }
        Ok(expired)
    }

    /// Full transcript of an episode, oldest first, for summarization.
    pub fn episode_transcript(&self, episode_id: &str) -> Result<String> {
        let db = self.db.lock().unwrap();
        let mut stmt = db.prepare(
            "SELECT user_text, assistant_text FROM turns
             WHERE episode_id = ?1 ORDER BY created_at, rowid",
        )?;
        let rows = stmt.query_map(rusqlite::params![episode_id], |row| {
            Ok((row.get::<_, String>(0)?, row.get::<_, String>(1)?))
        })?;

        let mut out = String::new();
        for row in rows.filter_map(|r| r.ok()) {
            out.push_str("User: ");
            out.push_str(&row.0);
            out.push_str("\nAssistant: ");
            out.push_str(&row.1);
            out.push('\n');
        }
        Ok(out)
    }

    pub fn store_summary(&self, episode_id: &str, summary: &str) -> Result<()> {
        let db = self.db.lock().unwrap();
        let n = db.execute(
            "UPDATE episodes SET summary = ?2 WHERE id = ?1",
            rusqlite::params![episode_id, summary],
        )?;
        if n == 0 {
            return Err(MemoryError::EpisodeNotFound(episode_id.to_string()));
        }
        Ok(())
    }

    /// Delete an episode and (via cascade) its turns.
    pub fn delete_episode(&self, episode_id: &str) -> Result<()> {
        let db = self.db.lock().unwrap();
        let n = db.execute(
            "DELETE FROM episodes WHERE id = ?1",
            rusqlite::params![episode_id],
        )?;
        if n == 0 {
            return Err(MemoryError::EpisodeNotFound(episode_id.to_string()));
        }
        Ok(())
    }

    // ── memory facts ─────────────────────────────────────────────────────────

    /// Store a fact, idempotent by `(user_id, text, subject_id)`: repeating
    /// the same fact refreshes importance instead of duplicating the row.
    pub fn remember_fact(
        &self,
        user_id: &str,
        subject_kind: SubjectKind,
        subject_id: Option<&str>,
        text: &str,
        importance: f64,
    ) -> Result<i64> {
        let db = self.db.lock().unwrap();
        let now = Utc::now().to_rfc3339();

        let existing: Option<i64> = db
            .query_row(
                "SELECT id FROM memory_facts
                 WHERE user_id = ?1 AND text = ?2
                   AND IFNULL(subject_id, '') = IFNULL(?3, '')",
                rusqlite::params![user_id, text, subject_id],
                |row| row.get(0),
            )
            .ok();

        if let Some(id) = existing {
            db.execute(
                "UPDATE memory_facts SET importance = MAX(importance, ?2)
                 WHERE id = ?1",
                rusqlite::params![id, importance],
            )?;
            return Ok(id);
        }

        db.execute(
            "INSERT INTO memory_facts
             (user_id, subject_kind, subject_id, text, importance,
              created_at, last_accessed_at, access_count)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?6, 0)",
            rusqlite::params![
                user_id,
                subject_kind.as_str(),
                subject_id,
                text,
                importance,
                now
            ],
        )?;
        let id = db.last_insert_rowid();
        db.execute(
            "INSERT INTO memory_facts_fts(rowid, text) VALUES (?1, ?2)",
            rusqlite::params![id, text],
        )?;
        debug!(user_id, fact_id = id, "fact stored");
        Ok(id)
    }

    /// Full-text candidates re-ranked by decay-weighted score, best first.
    /// Bumps `access_count` and `last_accessed_at` on every returned fact.
    pub fn search_facts(&self, user_id: &str, query: &str, k: usize) -> Result<Vec<ScoredFact>> {
        self.search_facts_at(user_id, query, k, Utc::now())
    }

    /// Clock-injected variant of [`search_facts`](Self::search_facts).
    pub fn search_facts_at(
        &self,
        user_id: &str,
        query: &str,
        k: usize,
        now: DateTime<Utc>,
    ) -> Result<Vec<ScoredFact>> {
        let match_expr = fts_query(query);
        if match_expr.is_empty() {
            return Ok(Vec::new());
        }

        let mut scored: Vec<ScoredFact> = {
            let db = self.db.lock().unwrap();
            let mut stmt = db.prepare(
                "SELECT m.id, m.user_id, m.subject_kind, m.subject_id, m.text,
                        m.importance, m.created_at, m.last_accessed_at,
                        m.access_count, f.rank
                 FROM memory_facts m
                 JOIN memory_facts_fts f ON m.id = f.rowid
                 WHERE m.user_id = ?1 AND memory_facts_fts MATCH ?2
                 ORDER BY rank
                 LIMIT ?3",
            )?;
            let rows = stmt.query_map(
                rusqlite::params![user_id, match_expr, SEARCH_CANDIDATES],
                |row| {
                    let fact = row_to_fact(row)?;
                    let rank: f64 = row.get(9)?;
                    Ok((fact, rank))
                },
            )?;

            rows.filter_map(|r| r.ok())
                .map(|(fact, rank)| {
                    let score = decay_score(&fact, rank, now);
                    ScoredFact { fact, score }
                })
                .collect()
        };

        scored.sort_by(|a, b| b.score.total_cmp(&a.score));
        scored.truncate(k);

        // Retrieval feeds back into ranking: touched facts resist decay.
        let now_str = now.to_rfc3339();
        let db = self.db.lock().unwrap();
        for s in &scored {
            db.execute(
                "UPDATE memory_facts
                 SET access_count = access_count + 1, last_accessed_at = ?2
                 WHERE id = ?1",
                rusqlite::params![s.fact.id, now_str],
            )?;
        }

        Ok(scored)
    }
}

/// `base_relevance · exp(−age_days / H) · (1 + ln(1 + access_count))`,
/// where base relevance is the (negated) FTS5 bm25 rank.
fn decay_score(fact: &MemoryFact, rank: f64, now: DateTime<Utc>) -> f64 {
    let base = (-rank).max(0.001);
    let age_days = parse_ts(&fact.created_at)
        .map(|created| (now - created).num_seconds() as f64 / 86_400.0)
        .unwrap_or(0.0)
        .max(0.0);
    let decay = (-age_days / DECAY_HALFLIFE_DAYS).exp();
    let access_boost = 1.0 + (1.0 + fact.access_count as f64).ln();
    base * decay * access_boost
}

/// Build a safe FTS5 match expression: each token quoted, joined with OR.
fn fts_query(query: &str) -> String {
    query
        .split_whitespace()
        .map(|token| {
            token
                .chars()
                .filter(|c| c.is_alphanumeric())
                .collect::<String>()
        })
        .filter(|t| !t.is_empty())
        .map(|t| format!("\"{t}\""))
        .collect::<Vec<_>>()
        .join(" OR ")
}

fn parse_ts(s: &str) -> Option<DateTime<Utc>> {
    chrono::DateTime::parse_from_rfc3339(s)
        .ok()
        .map(|dt| dt.with_timezone(&Utc))
}

fn row_to_episode(row: &rusqlite::Row<'_>) -> rusqlite::Result<Episode> {
    let context: String = row.get(2)?;
    let status: String = row.get(5)?;
    Ok(Episode {
        id: row.get(0)?,
        user_id: row.get(1)?,
        context_type: context.parse().unwrap_or(maia_core::types::ContextType::Chat),
        started_at: row.get(3)?,
        last_activity_at: row.get(4)?,
        status: status.parse().unwrap_or(EpisodeStatus::Closed),
        timeout_minutes: row.get(6)?,
        message_count: row.get::<_, i64>(7)? as u32,
        summary: row.get(8)?,
    })
}

fn row_to_fact(row: &rusqlite::Row<'_>) -> rusqlite::Result<MemoryFact> {
    let kind: String = row.get(2)?;
    Ok(MemoryFact {
        id: row.get(0)?,
        user_id: row.get(1)?,
        subject_kind: kind.parse().unwrap_or(SubjectKind::General),
        subject_id: row.get(3)?,
        text: row.get(4)?,
        importance: row.get(5)?,
        created_at: row.get(6)?,
        last_accessed_at: row.get(7)?,
        access_count: row.get::<_, i64>(8)? as u32,
    })
}
