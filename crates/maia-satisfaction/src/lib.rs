//! Interaction and feedback bookkeeping: one interaction per completed turn,
//! zero or more feedback rows per interaction, aggregates recomputed lazily
//! on read.

pub mod db;
pub mod tracker;
pub mod types;

pub use tracker::SatisfactionTracker;
pub use types::{
    Feedback, FeedbackKind, Interaction, NewInteraction, SatisfactionStats, Trend,
};

use thiserror::Error;

use maia_core::error::ErrorKind;

#[derive(Debug, Error)]
pub enum SatisfactionError {
    #[error("database error: {0}")]
    Database(#[from] rusqlite::Error),

    #[error("interaction not found: {0}")]
    InteractionNotFound(String),
}

impl From<SatisfactionError> for ErrorKind {
    fn from(e: SatisfactionError) -> Self {
        match e {
            SatisfactionError::Database(err) => {
                ErrorKind::Internal(format!("satisfaction: {err}"))
            }
            SatisfactionError::InteractionNotFound(id) => {
                ErrorKind::NotFound(format!("interaction {id}"))
            }
        }
    }
}

pub type Result<T> = std::result::Result<T, SatisfactionError>;
