//! # Idempotent Consumer
//!
//! Inbox-side deduplication for at-least-once event streams.
//!
//! Every consumed event carries a stable identifier (the envelope `event_id`).
//! Before applying an event, the consumer *claims* the identifier in the
//! `processed_events` table **inside the same transaction** as the state
//! change. If the claim finds an existing row the event was already applied and
//! the transaction is abandoned; if the business write later fails the claim
//! rolls back with it and the redelivered event is applied normally.
//!
//! ```text
//! Kafka -> consumer -> BEGIN
//!                        claim(event_id)  --duplicate-->  ROLLBACK, skip
//!                        apply changes
//!                      COMMIT
//! ```
//!
//! Claimed identifiers are kept for the duplicate-detection window and then
//! removed by [`IdempotencyGuard::cleanup_old_events`].
//!
//! ```ignore
//! use idempotent_consumer::IdempotencyGuard;
//!
//! # async fn example(pool: sqlx::PgPool) -> Result<(), Box<dyn std::error::Error>> {
//! let guard = IdempotencyGuard::new(pool.clone(), idempotent_consumer::DEFAULT_RETENTION);
//! let mut tx = pool.begin().await?;
//! if !IdempotencyGuard::claim(&mut tx, "3f1c...", None).await? {
//!     return Ok(()); // duplicate, tx dropped -> rollback
//! }
//! // ... apply the event through `tx` ...
//! tx.commit().await?;
//! # Ok(())
//! # }
//! ```

use anyhow::Context;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::{PgConnection, PgPool, Row};
use std::time::Duration;
use tracing::{debug, info};

mod error;

pub use error::{IdempotencyError, IdempotencyResult};

/// Duplicate-detection window: two days.
pub const DEFAULT_RETENTION: Duration = Duration::from_secs(2 * 24 * 60 * 60);

/// Upper bound on identifier length, matches the column definition.
pub const MAX_EVENT_ID_LEN: usize = 255;

/// A claimed event identifier.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProcessedEvent {
    pub event_id: String,
    pub processed_at: DateTime<Utc>,
    pub metadata: Option<serde_json::Value>,
}

/// Outcome of a claim attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClaimOutcome {
    /// First time this identifier is seen; proceed with the event.
    Claimed,
    /// Identifier already claimed within the window; skip the event.
    Duplicate,
}

impl ClaimOutcome {
    pub fn is_claimed(self) -> bool {
        matches!(self, ClaimOutcome::Claimed)
    }
}

/// Owner of the `processed_events` ledger.
///
/// Claims go through the caller's transaction ([`IdempotencyGuard::claim`]);
/// the pool held here is only used for lookups and housekeeping.
#[derive(Clone)]
pub struct IdempotencyGuard {
    pool: PgPool,
    retention_duration: Duration,
}

impl IdempotencyGuard {
    pub fn new(pool: PgPool, retention_duration: Duration) -> Self {
        Self {
            pool,
            retention_duration,
        }
    }

    pub fn retention(&self) -> Duration {
        self.retention_duration
    }

    /// Claim `event_id` on the given connection.
    ///
    /// Uses `INSERT ... ON CONFLICT DO NOTHING`, so concurrent claimers of the
    /// same identifier serialize on the unique index and exactly one of them
    /// observes [`ClaimOutcome::Claimed`] once its transaction commits.
    pub async fn claim(
        conn: &mut PgConnection,
        event_id: &str,
        metadata: Option<serde_json::Value>,
    ) -> IdempotencyResult<ClaimOutcome> {
        validate_event_id(event_id)?;

        let result = sqlx::query(
            r#"
            INSERT INTO processed_events (event_id, metadata, processed_at)
            VALUES ($1, $2, NOW())
            ON CONFLICT (event_id) DO NOTHING
            "#,
        )
        .bind(event_id)
        .bind(&metadata)
        .execute(conn)
        .await
        .context("Failed to claim event")?;

        if result.rows_affected() > 0 {
            debug!(event_id = %event_id, "Event claimed");
            Ok(ClaimOutcome::Claimed)
        } else {
            debug!(event_id = %event_id, "Event already claimed (duplicate)");
            Ok(ClaimOutcome::Duplicate)
        }
    }

    /// Whether `event_id` is currently in the ledger.
    pub async fn is_processed(&self, event_id: &str) -> IdempotencyResult<bool> {
        validate_event_id(event_id)?;

        let row = sqlx::query(
            r#"
            SELECT EXISTS(
                SELECT 1 FROM processed_events WHERE event_id = $1
            ) AS exists
            "#,
        )
        .bind(event_id)
        .fetch_one(&self.pool)
        .await
        .context("Failed to check if event is processed")?;

        Ok(row.try_get("exists")?)
    }

    /// Delete identifiers older than the retention window.
    pub async fn cleanup_old_events(&self) -> IdempotencyResult<u64> {
        let cutoff_time = Utc::now()
            - chrono::Duration::from_std(self.retention_duration)
                .map_err(|e| IdempotencyError::InvalidRetention(e.to_string()))?;

        let result = sqlx::query("DELETE FROM processed_events WHERE processed_at < $1")
            .bind(cutoff_time)
            .execute(&self.pool)
            .await
            .context("Failed to cleanup old events")?;

        let deleted_count = result.rows_affected();
        if deleted_count > 0 {
            info!(
                deleted_count = deleted_count,
                cutoff_time = %cutoff_time,
                "Cleaned up old processed events"
            );
        }

        Ok(deleted_count)
    }
}

/// Reject identifiers the ledger cannot store.
pub fn validate_event_id(event_id: &str) -> IdempotencyResult<()> {
    if event_id.is_empty() {
        return Err(IdempotencyError::InvalidEventId(
            "Event ID cannot be empty".to_string(),
        ));
    }

    if event_id.len() > MAX_EVENT_ID_LEN {
        return Err(IdempotencyError::InvalidEventId(format!(
            "Event ID too long: {} characters (max {})",
            event_id.len(),
            MAX_EVENT_ID_LEN
        )));
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_validate_event_id() {
        assert!(validate_event_id("event-123").is_ok());
        assert!(validate_event_id(&"x".repeat(255)).is_ok());

        let err = validate_event_id("").unwrap_err();
        assert!(matches!(err, IdempotencyError::InvalidEventId(_)));

        let err = validate_event_id(&"x".repeat(256)).unwrap_err();
        assert!(matches!(err, IdempotencyError::InvalidEventId(_)));
    }

    #[test]
    fn test_claim_outcome() {
        assert!(ClaimOutcome::Claimed.is_claimed());
        assert!(!ClaimOutcome::Duplicate.is_claimed());
    }

    #[test]
    fn test_default_retention_is_two_days() {
        assert_eq!(DEFAULT_RETENTION.as_secs(), 172_800);
    }
}
