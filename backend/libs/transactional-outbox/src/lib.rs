//! # Transactional Outbox
//!
//! Integration events are written to an `outbox_events` table in the same
//! transaction as the state change they describe. A background
//! [`OutboxProcessor`] later drains unpublished rows to the broker and marks
//! them published once the broker acknowledged them.
//!
//! Guarantees:
//! - a crash between commit and publish never loses an event, the row is still
//!   pending when the processor restarts (**at-least-once delivery**);
//! - a crash between publish and `mark_published` re-sends the row, so
//!   consumers must deduplicate on the envelope `event_id` within the
//!   duplicate-detection window ([`DEFAULT_DEDUP_WINDOW`]);
//! - broker outages only delay delivery, they never block the writer.
//!
//! ## Writing an event
//!
//! ```rust,no_run
//! use transactional_outbox::{OutboxEvent, SqlxOutboxRepository};
//! use sqlx::PgPool;
//! use uuid::Uuid;
//!
//! async fn create_room(pool: &PgPool, room_id: Uuid) -> Result<(), Box<dyn std::error::Error>> {
//!     let mut tx = pool.begin().await?;
//!
//!     sqlx::query("INSERT INTO rooms (id) VALUES ($1)")
//!         .bind(room_id)
//!         .execute(&mut *tx)
//!         .await?;
//!
//!     let event = OutboxEvent::new(
//!         "room",
//!         room_id,
//!         "room.created",
//!         serde_json::json!({ "room_id": room_id }),
//!     );
//!     SqlxOutboxRepository::insert(&mut tx, &event).await?;
//!
//!     tx.commit().await?;
//!     Ok(())
//! }
//! ```
//!
//! ## Draining
//!
//! ```rust,no_run
//! use transactional_outbox::{KafkaOutboxPublisher, OutboxProcessor, SqlxOutboxRepository};
//! use rdkafka::ClientConfig;
//! use sqlx::PgPool;
//! use std::sync::Arc;
//!
//! # async fn run(pool: PgPool) -> Result<(), Box<dyn std::error::Error>> {
//! let producer = ClientConfig::new()
//!     .set("bootstrap.servers", "localhost:9092")
//!     .set("enable.idempotence", "true")
//!     .set("acks", "all")
//!     .create()?;
//!
//! let processor = OutboxProcessor::new(
//!     Arc::new(SqlxOutboxRepository::new(pool)),
//!     Arc::new(KafkaOutboxPublisher::new(producer, "nova".to_string())),
//! );
//! processor.start().await?;
//! # Ok(())
//! # }
//! ```

use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rdkafka::message::{Header, OwnedHeaders};
use rdkafka::producer::{FutureProducer, FutureRecord};
use serde::{Deserialize, Serialize};
use sqlx::{PgConnection, PgPool, Row};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

mod error;
pub mod metrics;

pub use error::{OutboxError, OutboxResult};

/// How often the processor polls for pending rows.
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(5);

/// How long published rows (and consumer-side dedup records) are retained.
pub const DEFAULT_DEDUP_WINDOW: Duration = Duration::from_secs(2 * 24 * 60 * 60);

/// Rows fetched per poll.
pub const DEFAULT_BATCH_SIZE: i32 = 100;

/// Represents an event stored in the outbox table.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OutboxEvent {
    /// Unique identifier, also used as the envelope idempotency key
    pub id: Uuid,

    /// Type of aggregate this event relates to (e.g. "room")
    pub aggregate_type: String,

    /// ID of the entity this event relates to, used as partition key
    pub aggregate_id: Uuid,

    /// Fully qualified event type (e.g. "room.viewer_joined")
    pub event_type: String,

    /// Event payload as JSON
    pub payload: serde_json::Value,

    /// Optional metadata (correlation_id, initiator, ...)
    pub metadata: Option<serde_json::Value>,

    pub created_at: DateTime<Utc>,

    /// None while the event is pending
    pub published_at: Option<DateTime<Utc>>,

    /// Number of failed publish attempts
    pub retry_count: i32,

    pub last_error: Option<String>,

    /// Time of the last failed attempt, drives the backoff schedule
    pub last_attempt_at: Option<DateTime<Utc>>,
}

impl OutboxEvent {
    pub fn new(
        aggregate_type: impl Into<String>,
        aggregate_id: Uuid,
        event_type: impl Into<String>,
        payload: serde_json::Value,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            aggregate_type: aggregate_type.into(),
            aggregate_id,
            event_type: event_type.into(),
            payload,
            metadata: None,
            created_at: Utc::now(),
            published_at: None,
            retry_count: 0,
            last_error: None,
            last_attempt_at: None,
        }
    }

    pub fn with_metadata(mut self, metadata: serde_json::Value) -> Self {
        self.metadata = Some(metadata);
        self
    }

    /// Whether the backoff after the last failure has elapsed.
    pub fn is_due(&self, now: DateTime<Utc>) -> bool {
        match self.last_attempt_at {
            None => true,
            Some(at) => {
                let backoff = backoff_for(self.retry_count);
                let backoff = chrono::Duration::from_std(backoff)
                    .unwrap_or_else(|_| chrono::Duration::seconds(MAX_BACKOFF_SECS as i64));
                at + backoff <= now
            }
        }
    }
}

const MAX_BACKOFF_SECS: u64 = 300;

/// Exponential backoff: 2^retry_count seconds, capped at 5 minutes.
pub fn backoff_for(retry_count: i32) -> Duration {
    let exp = retry_count.clamp(0, 16) as u32;
    Duration::from_secs(2u64.pow(exp).min(MAX_BACKOFF_SECS))
}

/// Dispatch-side access to the outbox.
///
/// Inserting is deliberately not part of this trait: rows are written by the
/// owner of the business transaction, through whichever connection type the
/// backend uses.
#[async_trait]
pub trait OutboxRepository: Send + Sync {
    /// Unpublished events, oldest first.
    async fn get_unpublished(&self, limit: i32) -> OutboxResult<Vec<OutboxEvent>>;

    /// Stamp `published_at` after the broker acknowledged the event.
    async fn mark_published(&self, event_id: Uuid) -> OutboxResult<()>;

    /// Increment the retry count and keep the error for operators.
    async fn mark_failed(&self, event_id: Uuid, error: &str) -> OutboxResult<()>;

    /// Pending count and age in seconds of the oldest pending row (0 when none).
    async fn pending_stats(&self) -> OutboxResult<(i64, i64)>;

    /// Delete published rows older than `before`. Returns the number removed.
    async fn purge_published(&self, before: DateTime<Utc>) -> OutboxResult<u64>;
}

/// PostgreSQL outbox backed by the `outbox_events` table.
#[derive(Clone)]
pub struct SqlxOutboxRepository {
    pool: PgPool,
}

impl SqlxOutboxRepository {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Insert an event using the caller's connection.
    ///
    /// Pass the business transaction (`&mut tx`) so that the row commits or
    /// rolls back together with the state change.
    pub async fn insert(conn: &mut PgConnection, event: &OutboxEvent) -> OutboxResult<()> {
        sqlx::query(
            r#"
            INSERT INTO outbox_events (
                id,
                aggregate_type,
                aggregate_id,
                event_type,
                payload,
                metadata,
                created_at,
                published_at,
                retry_count,
                last_error,
                last_attempt_at
            ) VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11)
            "#,
        )
        .bind(event.id)
        .bind(&event.aggregate_type)
        .bind(event.aggregate_id)
        .bind(&event.event_type)
        .bind(&event.payload)
        .bind(&event.metadata)
        .bind(event.created_at)
        .bind(event.published_at)
        .bind(event.retry_count)
        .bind(&event.last_error)
        .bind(event.last_attempt_at)
        .execute(conn)
        .await
        .context("Failed to insert event into outbox")?;

        debug!(
            event_id = %event.id,
            event_type = %event.event_type,
            aggregate_id = %event.aggregate_id,
            "Event inserted into outbox"
        );

        Ok(())
    }
}

#[async_trait]
impl OutboxRepository for SqlxOutboxRepository {
    async fn get_unpublished(&self, limit: i32) -> OutboxResult<Vec<OutboxEvent>> {
        let rows = sqlx::query(
            r#"
            SELECT
                id,
                aggregate_type,
                aggregate_id,
                event_type,
                payload,
                metadata,
                created_at,
                published_at,
                retry_count,
                last_error,
                last_attempt_at
            FROM outbox_events
            WHERE published_at IS NULL
            ORDER BY created_at ASC
            LIMIT $1
            "#,
        )
        .bind(limit)
        .fetch_all(&self.pool)
        .await
        .context("Failed to fetch unpublished events")?;

        let events = rows
            .into_iter()
            .map(|row| {
                Ok(OutboxEvent {
                    id: row.try_get("id")?,
                    aggregate_type: row.try_get("aggregate_type")?,
                    aggregate_id: row.try_get("aggregate_id")?,
                    event_type: row.try_get("event_type")?,
                    payload: row.try_get("payload")?,
                    metadata: row.try_get("metadata")?,
                    created_at: row.try_get("created_at")?,
                    published_at: row.try_get("published_at")?,
                    retry_count: row.try_get("retry_count")?,
                    last_error: row.try_get("last_error")?,
                    last_attempt_at: row.try_get("last_attempt_at")?,
                })
            })
            .collect::<Result<Vec<_>, sqlx::Error>>()
            .context("Failed to parse events")?;

        debug!(count = events.len(), "Fetched unpublished events");

        Ok(events)
    }

    async fn mark_published(&self, event_id: Uuid) -> OutboxResult<()> {
        let result = sqlx::query("UPDATE outbox_events SET published_at = NOW() WHERE id = $1")
            .bind(event_id)
            .execute(&self.pool)
            .await
            .context("Failed to mark event as published")?;

        if result.rows_affected() == 0 {
            warn!(event_id = %event_id, "Event not found when marking as published");
            return Err(OutboxError::EventNotFound(event_id));
        }

        Ok(())
    }

    async fn mark_failed(&self, event_id: Uuid, error: &str) -> OutboxResult<()> {
        let result = sqlx::query(
            r#"
            UPDATE outbox_events
            SET
                retry_count = retry_count + 1,
                last_error = $2,
                last_attempt_at = NOW()
            WHERE id = $1
            "#,
        )
        .bind(event_id)
        .bind(error)
        .execute(&self.pool)
        .await
        .context("Failed to mark event as failed")?;

        if result.rows_affected() == 0 {
            warn!(event_id = %event_id, "Event not found when marking as failed");
            return Err(OutboxError::EventNotFound(event_id));
        }

        Ok(())
    }

    async fn pending_stats(&self) -> OutboxResult<(i64, i64)> {
        let rec = sqlx::query(
            r#"
            SELECT
                COUNT(*)::BIGINT AS pending,
                COALESCE(EXTRACT(EPOCH FROM (NOW() - MIN(created_at)))::BIGINT, 0) AS age_seconds
            FROM outbox_events
            WHERE published_at IS NULL
            "#,
        )
        .fetch_one(&self.pool)
        .await
        .context("Failed to compute pending stats")?;

        let pending: i64 = rec.try_get("pending").unwrap_or(0);
        let age: i64 = rec.try_get("age_seconds").unwrap_or(0);
        Ok((pending, age))
    }

    async fn purge_published(&self, before: DateTime<Utc>) -> OutboxResult<u64> {
        let res = sqlx::query(
            "DELETE FROM outbox_events WHERE published_at IS NOT NULL AND published_at < $1",
        )
        .bind(before)
        .execute(&self.pool)
        .await
        .context("Failed to purge published events")?;

        Ok(res.rows_affected())
    }
}

/// Sends one outbox row to the broker. Must be safe to call again for the
/// same row.
#[async_trait]
pub trait OutboxPublisher: Send + Sync {
    async fn publish(&self, event: &OutboxEvent) -> OutboxResult<()>;
}

/// Kafka publisher.
///
/// The producer MUST be created with `enable.idempotence=true` and `acks=all`.
/// The aggregate id is used as the record key so events of one room stay
/// ordered within a partition.
pub struct KafkaOutboxPublisher {
    producer: FutureProducer,
    topic_prefix: String,
    delivery_timeout: Duration,
}

impl KafkaOutboxPublisher {
    pub fn new(producer: FutureProducer, topic_prefix: String) -> Self {
        Self {
            producer,
            topic_prefix,
            delivery_timeout: Duration::from_secs(30),
        }
    }

    /// "room.viewer_joined" -> "<prefix>.room.events"
    fn get_topic(&self, event_type: &str) -> String {
        let aggregate = event_type.split('.').next().unwrap_or("unknown");
        format!("{}.{}.events", self.topic_prefix, aggregate)
    }
}

#[async_trait]
impl OutboxPublisher for KafkaOutboxPublisher {
    async fn publish(&self, event: &OutboxEvent) -> OutboxResult<()> {
        let topic = self.get_topic(&event.event_type);
        let payload = serde_json::to_string(&event.payload)?;

        let event_id = event.id.to_string();
        let aggregate_id = event.aggregate_id.to_string();
        let created_at = event.created_at.to_rfc3339();
        let correlation_id = event
            .metadata
            .as_ref()
            .and_then(|m| m.get("correlation_id"))
            .and_then(|v| v.as_str());

        let mut headers = OwnedHeaders::new();
        for (key, value) in [
            ("event_type", event.event_type.as_str()),
            ("event_id", event_id.as_str()),
            ("aggregate_type", event.aggregate_type.as_str()),
            ("aggregate_id", aggregate_id.as_str()),
            ("created_at", created_at.as_str()),
        ] {
            headers = headers.insert(Header {
                key,
                value: Some(value.as_bytes()),
            });
        }
        if let Some(cid) = correlation_id {
            headers = headers.insert(Header {
                key: "correlation_id",
                value: Some(cid.as_bytes()),
            });
        }

        let record = FutureRecord::to(&topic)
            .key(&aggregate_id)
            .payload(&payload)
            .headers(headers);

        self.producer
            .send(record, self.delivery_timeout)
            .await
            .map_err(|(err, _)| OutboxError::PublishFailed(format!("Kafka publish failed: {}", err)))?;

        info!(
            event_id = %event.id,
            event_type = %event.event_type,
            topic = %topic,
            "Event published to Kafka"
        );

        Ok(())
    }
}

/// Publisher that acknowledges everything. Used when no broker is configured
/// so pending rows do not pile up.
pub struct NoopPublisher;

#[async_trait]
impl OutboxPublisher for NoopPublisher {
    async fn publish(&self, event: &OutboxEvent) -> OutboxResult<()> {
        debug!(event_id = %event.id, event_type = %event.event_type, "Noop publish");
        Ok(())
    }
}

/// Background loop that drains the outbox.
///
/// Rows are retried with exponential backoff until the broker acknowledges
/// them. With `max_retries` set, rows past the limit are left for manual
/// intervention instead.
pub struct OutboxProcessor<R: OutboxRepository + ?Sized, P: OutboxPublisher + ?Sized> {
    repository: Arc<R>,
    publisher: Arc<P>,
    batch_size: i32,
    poll_interval: Duration,
    max_retries: Option<i32>,
    metrics: Option<crate::metrics::OutboxMetrics>,
}

impl<R: OutboxRepository + ?Sized, P: OutboxPublisher + ?Sized> OutboxProcessor<R, P> {
    pub fn new(repository: Arc<R>, publisher: Arc<P>) -> Self {
        Self {
            repository,
            publisher,
            batch_size: DEFAULT_BATCH_SIZE,
            poll_interval: DEFAULT_POLL_INTERVAL,
            max_retries: None,
            metrics: None,
        }
    }

    pub fn with_batch_size(mut self, batch_size: i32) -> Self {
        self.batch_size = batch_size;
        self
    }

    pub fn with_poll_interval(mut self, poll_interval: Duration) -> Self {
        self.poll_interval = poll_interval;
        self
    }

    pub fn with_max_retries(mut self, max_retries: Option<i32>) -> Self {
        self.max_retries = max_retries;
        self
    }

    pub fn with_metrics(mut self, metrics: crate::metrics::OutboxMetrics) -> Self {
        self.metrics = Some(metrics);
        self
    }

    /// Run forever. Spawn it as a background task.
    pub async fn start(&self) -> Result<()> {
        info!(
            batch_size = self.batch_size,
            poll_interval_secs = self.poll_interval.as_secs(),
            max_retries = ?self.max_retries,
            "Outbox processor starting"
        );

        loop {
            match self.drain_once().await {
                Ok(count) if count > 0 => {
                    info!(published_count = count, "Published events from outbox");
                }
                Ok(_) => debug!("No events to publish"),
                Err(e) => error!(error = ?e, "Outbox processor error"),
            }

            if let Some(metrics) = &self.metrics {
                if let Ok((pending, age)) = self.repository.pending_stats().await {
                    metrics.pending.set(pending);
                    metrics.oldest_pending_age_seconds.set(age);
                }
            }

            tokio::time::sleep(self.poll_interval).await;
        }
    }

    /// Publish one batch of due events. Returns how many were acknowledged.
    pub async fn drain_once(&self) -> OutboxResult<usize> {
        let events = self.repository.get_unpublished(self.batch_size).await?;
        let now = Utc::now();
        let mut published_count = 0;

        for event in events {
            if let Some(max) = self.max_retries {
                if event.retry_count >= max {
                    warn!(
                        event_id = %event.id,
                        event_type = %event.event_type,
                        retry_count = event.retry_count,
                        last_error = ?event.last_error,
                        "Event exceeded max retries, skipping (requires manual intervention)"
                    );
                    continue;
                }
            }

            if !event.is_due(now) {
                debug!(
                    event_id = %event.id,
                    retry_count = event.retry_count,
                    "Event still backing off"
                );
                continue;
            }

            match self.publisher.publish(&event).await {
                Ok(()) => {
                    if let Err(e) = self.repository.mark_published(event.id).await {
                        // Delivered but not stamped: the row is sent again next
                        // poll and consumers drop it as a duplicate.
                        error!(
                            event_id = %event.id,
                            error = ?e,
                            "Failed to mark event as published (event was delivered)"
                        );
                    } else {
                        published_count += 1;
                        if let Some(metrics) = &self.metrics {
                            metrics.published.inc();
                        }
                    }
                }
                Err(e) => {
                    error!(
                        event_id = %event.id,
                        event_type = %event.event_type,
                        retry_count = event.retry_count,
                        error = ?e,
                        "Failed to publish event"
                    );
                    if let Some(metrics) = &self.metrics {
                        metrics.failed.inc();
                    }

                    if let Err(mark_err) =
                        self.repository.mark_failed(event.id, &e.to_string()).await
                    {
                        error!(
                            event_id = %event.id,
                            error = ?mark_err,
                            "Failed to mark event as failed"
                        );
                    }
                }
            }
        }

        Ok(published_count)
    }
}
