//! Inbox ledger errors.

use thiserror::Error;

pub type IdempotencyResult<T> = Result<T, IdempotencyError>;

#[derive(Error, Debug)]
pub enum IdempotencyError {
    /// The `processed_events.event_id` column cannot hold this identifier.
    #[error("event id rejected by the inbox ledger: {0}")]
    InvalidEventId(String),

    #[error("dedup window out of range: {0}")]
    InvalidRetention(String),

    #[error("processed_events query failed: {0}")]
    Database(#[from] sqlx::Error),

    /// A ledger step failed; the chain names the step.
    #[error("{0:#}")]
    Ledger(#[from] anyhow::Error),
}
