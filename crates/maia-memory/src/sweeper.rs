use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::watch;
use tracing::{error, info, warn};

use maia_core::error::ErrorKind;

use crate::manager::MemoryManager;

/// Produces a short episode summary. Implemented in the gateway on top of the
/// LLM gateway; defined here so this crate stays free of the LLM dependency.
#[async_trait]
pub trait Summarizer: Send + Sync {
    async fn summarize(&self, transcript: &str) -> Result<String, ErrorKind>;
}

/// Sweep interval. Episode timeouts are measured in minutes, so a one-minute
/// cadence bounds rotation lag without loading the database.
const SWEEP_INTERVAL_SECS: u64 = 60;

/// Background loop closing episodes idle past their timeout and summarizing
/// the ones that carried a real conversation. Runs until `shutdown`
/// broadcasts `true`.
pub async fn run_sweeper(
    memory: Arc<MemoryManager>,
    summarizer: Option<Arc<dyn Summarizer>>,
    mut shutdown: watch::Receiver<bool>,
) {
    info!("episode sweeper started");
    let mut interval =
        tokio::time::interval(std::time::Duration::from_secs(SWEEP_INTERVAL_SECS));

    loop {
        tokio::select! {
            _ = interval.tick() => {
                sweep_once_at(&memory, summarizer.as_deref(), Utc::now()).await;
            }
            _ = shutdown.changed() => {
                if *shutdown.borrow() {
                    info!("episode sweeper shutting down");
                    break;
                }
            }
        }
    }
}

async fn sweep_once_at(
    memory: &MemoryManager,
    summarizer: Option<&dyn Summarizer>,
    now: DateTime<Utc>,
) {
    let swept = match memory.sweep_expired(now) {
        Ok(s) => s,
        Err(e) => {
            error!("episode sweep failed: {e}");
            return;
        }
    };

    for episode in swept {
        if episode.message_count == 0 || episode.summary.is_some() {
            continue;
        }
        let Some(summarizer) = summarizer else { continue };
        let transcript = match memory.episode_transcript(&episode.id) {
            Ok(t) if !t.is_empty() => t,
            Ok(_) => continue,
            Err(e) => {
                error!(episode_id = %episode.id, "transcript read failed: {e}");
                continue;
            }
        };
        // Summaries are best-effort: a failed LLM call is logged and dropped.
        match summarizer.summarize(&transcript).await {
            Ok(summary) => {
                if let Err(e) = memory.store_summary(&episode.id, &summary) {
                    error!(episode_id = %episode.id, "summary store failed: {e}");
                }
            }
            Err(e) => warn!(episode_id = %episode.id, err = %e, "summarization failed"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;
    use maia_core::config::EpisodeConfig;
    use maia_core::types::ContextType;
    use rusqlite::Connection;

    struct FixedSummarizer;

    #[async_trait]
    impl Summarizer for FixedSummarizer {
        async fn summarize(&self, _transcript: &str) -> Result<String, ErrorKind> {
            Ok("talked about groceries".to_string())
        }
    }

    fn zero_timeout_config() -> EpisodeConfig {
        EpisodeConfig {
            timeout_minutes_chat: 0,
            timeout_minutes_development: 0,
            timeout_minutes_planning: 0,
            timeout_minutes_general: 0,
        }
    }

    #[tokio::test]
    async fn sweep_closes_and_summarizes_idle_episodes() {
        let conn = Connection::open_in_memory().unwrap();
        let memory = Arc::new(MemoryManager::new(conn, zero_timeout_config()).unwrap());

        let ep = memory.get_or_open("alice", ContextType::Chat).await.unwrap();
        memory.append_turn(&ep.id, "add milk", "done").await.unwrap();

        // Zero-minute timeout: one second of idleness expires the episode.
        sweep_once_at(
            &memory,
            Some(&FixedSummarizer),
            Utc::now() + Duration::seconds(2),
        )
        .await;

        let closed = memory.get_episode(&ep.id).unwrap();
        assert_eq!(closed.status, crate::types::EpisodeStatus::Closed);
        assert_eq!(closed.summary.as_deref(), Some("talked about groceries"));
    }

    #[tokio::test]
    async fn empty_episodes_are_closed_but_not_summarized() {
        let conn = Connection::open_in_memory().unwrap();
        let memory = Arc::new(MemoryManager::new(conn, zero_timeout_config()).unwrap());
        let ep = memory.get_or_open("alice", ContextType::Chat).await.unwrap();

        sweep_once_at(
            &memory,
            Some(&FixedSummarizer),
            Utc::now() + Duration::seconds(2),
        )
        .await;

        let closed = memory.get_episode(&ep.id).unwrap();
        assert_eq!(closed.status, crate::types::EpisodeStatus::Closed);
        assert!(closed.summary.is_none());
    }

    #[tokio::test]
    async fn fresh_episodes_survive_the_sweep() {
        let conn = Connection::open_in_memory().unwrap();
        let memory =
            Arc::new(MemoryManager::new(conn, EpisodeConfig::default()).unwrap());
        let ep = memory.get_or_open("alice", ContextType::Chat).await.unwrap();

        sweep_once_at(&memory, Some(&FixedSummarizer), Utc::now()).await;
        assert_eq!(
            memory.get_episode(&ep.id).unwrap().status,
            crate::types::EpisodeStatus::Active
        );
    }
}
