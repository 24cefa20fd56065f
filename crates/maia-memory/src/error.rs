use thiserror::Error;

use maia_core::error::ErrorKind;

#[derive(Debug, Error)]
pub enum MemoryError {
    #[error("database error: {0}")]
    Database(#[from] rusqlite::Error),

    #[error("episode not found: {0}")]
    EpisodeNotFound(String),

    #[error("episode is closed: {0}")]
    EpisodeClosed(String),
}

impl From<MemoryError> for ErrorKind {
    fn from(e: MemoryError) -> Self {
        match e {
            MemoryError::Database(err) => ErrorKind::Internal(format!("memory: {err}")),
            MemoryError::EpisodeNotFound(id) => ErrorKind::NotFound(format!("episode {id}")),
            MemoryError::EpisodeClosed(id) => ErrorKind::Conflict(format!("episode {id} is closed")),
        }
    }
}

pub type Result<T> = std::result::Result<T, MemoryError>;
