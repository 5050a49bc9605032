use thiserror::Error;
use uuid::Uuid;

pub type OutboxResult<T> = Result<T, OutboxError>;

#[derive(Error, Debug)]
pub enum OutboxError {
    #[error("outbox database error: {0}")]
    Database(#[from] sqlx::Error),

    /// `mark_published`/`mark_failed` on an id that is not in the table.
    #[error("outbox event {0} not found")]
    EventNotFound(Uuid),

    /// Broker rejected or timed out the record. The row stays pending.
    #[error("publish failed: {0}")]
    PublishFailed(String),

    #[error("payload encoding failed: {0}")]
    Serialization(#[from] serde_json::Error),

    /// A repository step, with the step named in the context chain.
    #[error("{0:#}")]
    Other(#[from] anyhow::Error),
}
