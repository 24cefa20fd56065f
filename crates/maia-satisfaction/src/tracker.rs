use std::sync::Mutex;

use chrono::Utc;
use rusqlite::Connection;
use tracing::debug;
use uuid::Uuid;

use crate::types::*;
use crate::{Result, SatisfactionError};

/// How many recent feedback scores make up each half of the trend window.
const TREND_WINDOW: usize = 10;
/// Score delta below which the trend reads as flat.
const TREND_EPSILON: f64 = 0.05;

/// Thread-safe store for interactions and feedback.
pub struct SatisfactionTracker {
    db: Mutex<Connection>,
}

impl SatisfactionTracker {
    /// Wrap an already-open connection; initialises the schema.
    pub fn new(conn: Connection) -> Result<Self> {
        crate::db::init_db(&conn)?;
        Ok(Self {
            db: Mutex::new(conn),
        })
    }

    /// Write exactly one interaction row for a completed turn.
    pub fn record_interaction(&self, new: NewInteraction) -> Result<String> {
        let id = Uuid::now_v7().to_string();
        let now = Utc::now().to_rfc3339();
        let db = self.db.lock().unwrap();
        db.execute(
            "INSERT INTO interactions
             (id, user_id, request_text, response_text, response_time_ms,
              task_completed, engagement_duration_ms, follow_up_in_60s,
              context, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)",
            rusqlite::params![
                id,
                new.user_id,
                new.request_text,
                new.response_text,
                new.response_time_ms as i64,
                new.task_completed as i64,
                new.engagement_duration_ms.map(|v| v as i64),
                new.follow_up_in_60s.map(|v| v as i64),
                new.context.to_string(),
                now,
            ],
        )?;
        debug!(user_id = %new.user_id, interaction_id = %id, "interaction recorded");
        Ok(id)
    }

    pub fn get_interaction(&self, user_id: &str, interaction_id: &str) -> Result<Interaction> {
        let db = self.db.lock().unwrap();
        db.query_row(
            "SELECT id, user_id, request_text, response_text, response_time_ms,
                    task_completed, engagement_duration_ms, follow_up_in_60s,
                    context, created_at
             FROM interactions WHERE id = ?1 AND user_id = ?2",
            rusqlite::params![interaction_id, user_id],
            row_to_interaction,
        )
        .map_err(|e| match e {
            rusqlite::Error::QueryReturnedNoRows => {
                SatisfactionError::InteractionNotFound(interaction_id.to_string())
            }
            other => SatisfactionError::Database(other),
        })
    }

    /// Record feedback against an interaction and return the stored row.
    /// The interaction must exist and belong to the same user.
    pub fn record_feedback(
        &self,
        user_id: &str,
        interaction_id: &str,
        kind: FeedbackKind,
        value: Option<f64>,
        text: Option<&str>,
    ) -> Result<Feedback> {
        // Ownership check keeps cross-user feedback out.
        self.get_interaction(user_id, interaction_id)?;

        let feedback = Feedback {
            id: Uuid::now_v7().to_string(),
            user_id: user_id.to_string(),
            interaction_id: interaction_id.to_string(),
            kind,
            value,
            text: text.map(String::from),
            created_at: Utc::now().to_rfc3339(),
        };
        let db = self.db.lock().unwrap();
        db.execute(
            "INSERT INTO feedback
             (id, user_id, interaction_id, kind, value, text, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
            rusqlite::params![
                feedback.id,
                feedback.user_id,
                feedback.interaction_id,
                feedback.kind.as_str(),
                feedback.value,
                feedback.text,
                feedback.created_at,
            ],
        )?;
        debug!(user_id, interaction_id, kind = kind.as_str(), "feedback recorded");
        Ok(feedback)
    }

    /// All feedback rows for one interaction, oldest first.
    pub fn feedback_for(&self, user_id: &str, interaction_id: &str) -> Result<Vec<Feedback>> {
        let db = self.db.lock().unwrap();
        let mut stmt = db.prepare(
            "SELECT id, user_id, interaction_id, kind, value, text, created_at
             FROM feedback
             WHERE user_id = ?1 AND interaction_id = ?2
             ORDER BY created_at, rowid",
        )?;
        let rows = stmt.query_map(rusqlite::params![user_id, interaction_id], row_to_feedback)?;
        Ok(rows.filter_map(|r| r.ok()).collect())
    }

    pub fn recent_interactions(&self, user_id: &str, limit: usize) -> Result<Vec<Interaction>> {
        let db = self.db.lock().unwrap();
        let mut stmt = db.prepare(
            "SELECT id, user_id, request_text, response_text, response_time_ms,
                    task_completed, engagement_duration_ms, follow_up_in_60s,
                    context, created_at
             FROM interactions
             WHERE user_id = ?1
             ORDER BY created_at DESC
             LIMIT ?2",
        )?;
        let rows = stmt.query_map(rusqlite::params![user_id, limit], row_to_interaction)?;
        Ok(rows.filter_map(|r| r.ok()).collect())
    }

    /// Recompute aggregates from the raw rows. No caching: the row counts
    /// involved are per-user and small.
    pub fn stats(&self, user_id: &str) -> Result<SatisfactionStats> {
        let db = self.db.lock().unwrap();

        let (interaction_count, completed_count, avg_response_ms): (u64, u64, f64) = db
            .query_row(
                "SELECT COUNT(*),
                        COALESCE(SUM(task_completed), 0),
                        COALESCE(AVG(response_time_ms), 0.0)
                 FROM interactions WHERE user_id = ?1",
                rusqlite::params![user_id],
                |row| {
                    Ok((
                        row.get::<_, i64>(0)? as u64,
                        row.get::<_, i64>(1)? as u64,
                        row.get(2)?,
                    ))
                },
            )?;

        // Scoreable feedback, newest first, for the average and the trend.
        let mut stmt = db.prepare(
            "SELECT kind, value FROM feedback
             WHERE user_id = ?1 AND kind IN ('rating', 'thumbs')
             ORDER BY created_at DESC",
        )?;
        let scores: Vec<f64> = stmt
            .query_map(rusqlite::params![user_id], |row| {
                Ok((row.get::<_, String>(0)?, row.get::<_, Option<f64>>(1)?))
            })?
            .filter_map(|r| r.ok())
            .filter_map(|(kind, value)| normalize_score(&kind, value))
            .collect();

        let feedback_count: u64 = db.query_row(
            "SELECT COUNT(*) FROM feedback WHERE user_id = ?1",
            rusqlite::params![user_id],
            |row| row.get::<_, i64>(0).map(|n| n as u64),
        )?;

        let avg_satisfaction = if scores.is_empty() {
            None
        } else {
            Some(scores.iter().sum::<f64>() / scores.len() as f64)
        };

        Ok(SatisfactionStats {
            interaction_count,
            completed_count,
            completion_rate: if interaction_count == 0 {
                0.0
            } else {
                completed_count as f64 / interaction_count as f64
            },
            avg_response_ms,
            avg_satisfaction,
            feedback_count,
            trend: compute_trend(&scores),
        })
    }
}

/// Map rating 1–5 to [0,1] and thumbs to 1.0/0.0. Anything else is unscored.
fn normalize_score(kind: &str, value: Option<f64>) -> Option<f64> {
    let value = value?;
    match kind {
        "rating" => Some(((value.clamp(1.0, 5.0)) - 1.0) / 4.0),
        "thumbs" => Some(if value > 0.0 { 1.0 } else { 0.0 }),
        _ => None,
    }
}

/// Compare the latest scores against the window before them.
/// `scores` is newest-first.
fn compute_trend(scores: &[f64]) -> Trend {
    if scores.len() < 4 {
        return Trend::Flat;
    }
    let recent: Vec<f64> = scores.iter().take(TREND_WINDOW).copied().collect();
    let prior: Vec<f64> = scores
        .iter()
        .skip(TREND_WINDOW)
        .take(TREND_WINDOW)
        .copied()
        .collect();
    if prior.is_empty() {
        // Not enough history for two windows: split what we have in half.
        let mid = scores.len() / 2;
        let newer = avg(&scores[..mid]);
        let older = avg(&scores[mid..]);
        return delta_trend(newer - older);
    }
    delta_trend(avg(&recent) - avg(&prior))
}

fn avg(xs: &[f64]) -> f64 {
    xs.iter().sum::<f64>() / xs.len() as f64
}

fn delta_trend(delta: f64) -> Trend {
    if delta > TREND_EPSILON {
        Trend::Improving
    } else if delta < -TREND_EPSILON {
        Trend::Declining
    } else {
        Trend::Flat
    }
}

fn row_to_feedback(row: &rusqlite::Row<'_>) -> rusqlite::Result<Feedback> {
    let kind_str: String = row.get(3)?;
    Ok(Feedback {
        id: row.get(0)?,
        user_id: row.get(1)?,
        interaction_id: row.get(2)?,
        kind: kind_str.parse().unwrap_or(FeedbackKind::Implicit),
        value: row.get(4)?,
        text: row.get(5)?,
        created_at: row.get(6)?,
    })
}

fn row_to_interaction(row: &rusqlite::Row<'_>) -> rusqlite::Result<Interaction> {
    let context_str: String = row.get(8)?;
    Ok(Interaction {
        id: row.get(0)?,
        user_id: row.get(1)?,
        request_text: row.get(2)?,
        response_text: row.get(3)?,
        response_time_ms: row.get::<_, i64>(4)? as u64,
        task_completed: row.get::<_, i64>(5)? != 0,
        engagement_duration_ms: row.get::<_, Option<i64>>(6)?.map(|v| v as u64),
        follow_up_in_60s: row.get::<_, Option<i64>>(7)?.map(|v| v != 0),
        context: serde_json::from_str(&context_str).unwrap_or(serde_json::Value::Null),
        created_at: row.get(9)?,
    })
}
