use rdkafka::config::ClientConfig;
use rdkafka::producer::FutureProducer;
use std::sync::Arc;
use tokio::task::JoinHandle;
use tracing::{error, info, warn};
use transactional_outbox::metrics::OutboxMetrics;
use transactional_outbox::{
    KafkaOutboxPublisher, NoopPublisher, OutboxProcessor, OutboxPublisher, OutboxRepository,
};

use crate::config::{KafkaConfig, OutboxConfig};
use crate::error::AppError;

pub const SERVICE_NAME: &str = "watch_room_service";

/// Kafka publisher when brokers are configured, otherwise a no-op that only
/// logs and acknowledges.
pub fn build_publisher(kafka: Option<&KafkaConfig>) -> Result<Arc<dyn OutboxPublisher>, AppError> {
    let Some(kafka) = kafka else {
        warn!("KAFKA_BROKERS not set, outbox events will not leave this process");
        return Ok(Arc::new(NoopPublisher));
    };

    let producer: FutureProducer = ClientConfig::new()
        .set("bootstrap.servers", &kafka.brokers)
        .set("message.timeout.ms", "30000")
        .set("acks", "all")
        .set("enable.idempotence", "true")
        .set("max.in.flight.requests.per.connection", "5")
        .set("compression.type", "lz4")
        .set("linger.ms", "10")
        .create()
        .map_err(|e| {
            error!("Failed to create Kafka producer: {}", e);
            AppError::StartServer(format!("Kafka producer creation failed: {}", e))
        })?;

    info!(brokers = %kafka.brokers, topic_prefix = %kafka.topic_prefix, "Kafka outbox publisher ready");
    Ok(Arc::new(KafkaOutboxPublisher::new(
        producer,
        kafka.topic_prefix.clone(),
    )))
}

pub fn spawn_outbox_processor(
    repository: Arc<dyn OutboxRepository>,
    publisher: Arc<dyn OutboxPublisher>,
    config: &OutboxConfig,
) -> JoinHandle<()> {
    let processor = OutboxProcessor::new(repository, publisher)
        .with_batch_size(config.batch_size)
        .with_poll_interval(config.poll_interval)
        .with_max_retries(config.max_retries)
        .with_metrics(OutboxMetrics::new(SERVICE_NAME));

    tokio::spawn(async move {
        if let Err(e) = processor.start().await {
            error!(error = ?e, "Outbox processor stopped");
        }
    })
}
