//! Kafka consumer for identity-service facts.
//!
//! Each message is applied through an inbox session keyed by the envelope's
//! `event_id`, so redeliveries are skipped.

use anyhow::Context;
use event_schema::{is_supported_version, IdentityEvent, SCHEMA_VERSION};
use rdkafka::config::ClientConfig;
use rdkafka::consumer::{CommitMode, Consumer, StreamConsumer};
use rdkafka::message::{BorrowedMessage, Headers, Message};
use std::time::Duration;
use tokio::time::sleep;
use tracing::{debug, error, info, warn};
use transactional_outbox::backoff_for;

use crate::commands::RoomService;
use crate::config::KafkaConfig;
use crate::error::AppError;

/// Failures after which retries are logged as errors.
const NOISY_AFTER: u32 = 5;

#[derive(Debug, Clone, PartialEq)]
pub struct InboundIdentityEvent {
    pub event_id: String,
    pub event: IdentityEvent,
}

/// Decode an enveloped (or bare, with an `event_id` header) identity event.
///
/// Unknown event types and incompatible schema versions yield `Ok(None)`.
pub fn decode_message(
    payload: &[u8],
    header_event_type: Option<&str>,
    header_event_id: Option<&str>,
) -> Result<Option<InboundIdentityEvent>, AppError> {
    let value: serde_json::Value = serde_json::from_slice(payload)
        .map_err(|e| AppError::BadRequest(format!("invalid JSON in identity event: {}", e)))?;

    let enveloped = value.get("data").is_some() && value.get("event_id").is_some();
    let (event_id, data) = if enveloped {
        let version = value
            .get("schema_version")
            .and_then(|v| v.as_u64())
            .unwrap_or(u64::from(SCHEMA_VERSION));
        if !is_supported_version(version) {
            warn!(schema_version = version, "Skipping identity event with incompatible schema");
            return Ok(None);
        }
        let event_id = value["event_id"].as_str().map(str::to_string);
        (event_id, value["data"].clone())
    } else {
        (header_event_id.map(str::to_string), value.clone())
    };

    let event_type = header_event_type
        .map(str::to_string)
        .or_else(|| value.get("event_type").and_then(|v| v.as_str()).map(str::to_string));
    let Some(event_type) = event_type else {
        debug!("Identity event without event_type, skipping");
        return Ok(None);
    };

    let event = IdentityEvent::decode(&event_type, data)
        .map_err(|e| AppError::BadRequest(format!("malformed {}: {}", event_type, e)))?;
    let Some(event) = event else {
        return Ok(None);
    };

    let event_id = event_id
        .ok_or_else(|| AppError::BadRequest(format!("{} has no event_id", event_type)))?;
    Ok(Some(InboundIdentityEvent { event_id, event }))
}

fn header_value<'a>(message: &'a BorrowedMessage<'a>, key: &str) -> Option<&'a str> {
    message
        .headers()
        .and_then(|headers| {
            headers
                .iter()
                .find(|header| header.key == key)
                .and_then(|header| header.value)
        })
        .and_then(|value| std::str::from_utf8(value).ok())
}

pub struct IdentityEventConsumer {
    consumer: StreamConsumer,
    service: RoomService,
    topic: String,
}

impl IdentityEventConsumer {
    pub fn new(config: &KafkaConfig, service: RoomService) -> Result<Self, AppError> {
        info!(
            brokers = %config.brokers,
            group_id = %config.group_id,
            topic = %config.identity_topic,
            "Initializing IdentityEventConsumer"
        );

        let consumer: StreamConsumer = ClientConfig::new()
            .set("bootstrap.servers", &config.brokers)
            .set("group.id", &config.group_id)
            .set("enable.auto.commit", "false")
            .set("auto.offset.reset", "earliest")
            .set("session.timeout.ms", "30000")
            .set("enable.partition.eof", "false")
            .create()
            .map_err(|e| AppError::StartServer(format!("Failed to create Kafka consumer: {}", e)))?;

        consumer
            .subscribe(&[&config.identity_topic])
            .map_err(|e| AppError::StartServer(format!("Failed to subscribe to topic: {}", e)))?;

        Ok(Self {
            consumer,
            service,
            topic: config.identity_topic.clone(),
        })
    }

    /// Consume forever. Meant to be spawned.
    pub async fn run(self) {
        info!(topic = %self.topic, "Starting identity event consumer");
        loop {
            match self.consumer.recv().await {
                Ok(message) => {
                    self.handle_message(&message).await;
                    if let Err(e) = self.consumer.commit_message(&message, CommitMode::Async) {
                        warn!(error = %e, "Failed to commit Kafka offset");
                    }
                }
                Err(e) => {
                    error!(error = %e, "Kafka recv error, retrying in 1s");
                    sleep(Duration::from_secs(1)).await;
                }
            }
        }
    }

    /// Returns once the message is applied or known to be poison. Transient
    /// failures are retried here, so the offset is never committed past them.
    async fn handle_message(&self, message: &BorrowedMessage<'_>) {
        let Some(payload) = message.payload() else {
            debug!("Received Kafka message with no payload, skipping");
            return;
        };

        let inbound = match decode_message(
            payload,
            header_value(message, "event_type"),
            header_value(message, "event_id"),
        ) {
            Ok(Some(inbound)) => inbound,
            Ok(None) => return,
            Err(e) => {
                // Poison message: retrying cannot help.
                error!(offset = message.offset(), error = %e, "Dropping undecodable identity event");
                return;
            }
        };

        apply_with_retry(&self.service, &inbound, |failures| {
            backoff_for(i32::try_from(failures).unwrap_or(i32::MAX))
        })
        .await;
    }
}

/// Apply `inbound` until it succeeds, sleeping `backoff(failures so far)`
/// between attempts. Returns the number of failed attempts.
pub async fn apply_with_retry<B>(service: &RoomService, inbound: &InboundIdentityEvent, backoff: B) -> u32
where
    B: Fn(u32) -> Duration,
{
    let mut failures: u32 = 0;
    loop {
        let result = service
            .apply_identity_event(&inbound.event_id, &inbound.event)
            .await
            .with_context(|| format!("applying identity event {}", inbound.event_id));
        match result {
            Ok(applied) => {
                if !applied {
                    debug!(event_id = %inbound.event_id, "Identity event already consumed");
                }
                return failures;
            }
            Err(e) => {
                let delay = backoff(failures);
                failures = failures.saturating_add(1);
                if failures >= NOISY_AFTER {
                    error!(
                        event_id = %inbound.event_id,
                        failures,
                        retry_in_ms = delay.as_millis() as u64,
                        error = ?e,
                        "Identity event still failing"
                    );
                } else {
                    warn!(
                        event_id = %inbound.event_id,
                        failures,
                        retry_in_ms = delay.as_millis() as u64,
                        error = %e,
                        "Identity event failed, retrying"
                    );
                }
                sleep(delay).await;
            }
        }
    }
}
