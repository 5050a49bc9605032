use dotenvy::dotenv;
use event_schema::{identity, topic_for};
use std::env;
use std::str::FromStr;
use std::time::Duration;

use crate::commands::CommandSettings;
use crate::error::AppError;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LogFormat {
    Text,
    Json,
}

#[derive(Debug, Clone)]
pub struct KafkaConfig {
    pub brokers: String,
    pub topic_prefix: String,
    pub identity_topic: String,
    pub group_id: String,
}

#[derive(Debug, Clone)]
pub struct OutboxConfig {
    pub poll_interval: Duration,
    pub batch_size: i32,
    pub max_retries: Option<i32>,
}

#[derive(Debug, Clone)]
pub struct Config {
    pub port: u16,
    /// Unset means the in-memory store.
    pub database_url: Option<String>,
    pub database_max_connections: u32,
    /// Unset means a no-op outbox publisher and no identity consumer.
    pub kafka: Option<KafkaConfig>,
    pub outbox: OutboxConfig,
    pub dedup_window: Duration,
    pub commands: CommandSettings,
    pub log_format: LogFormat,
}

fn var(name: &str) -> Option<String> {
    env::var(name).ok().filter(|v| !v.trim().is_empty())
}

fn parsed<T: FromStr>(name: &str, default: T) -> Result<T, AppError> {
    match var(name) {
        Some(raw) => raw
            .trim()
            .parse()
            .map_err(|_| AppError::Config(format!("{} has an invalid value: {}", name, raw))),
        None => Ok(default),
    }
}

impl Config {
    pub fn from_env() -> Result<Self, AppError> {
        let _ = dotenv();

        let topic_prefix = var("KAFKA_TOPIC_PREFIX").unwrap_or_else(|| "nova".into());
        let kafka = var("KAFKA_BROKERS").map(|brokers| KafkaConfig {
            brokers,
            identity_topic: var("IDENTITY_EVENTS_TOPIC")
                .unwrap_or_else(|| topic_for(&topic_prefix, identity::AGGREGATE_TYPE)),
            topic_prefix,
            group_id: var("KAFKA_GROUP_ID").unwrap_or_else(|| "watch-room-service".into()),
        });

        let max_retries = match var("OUTBOX_MAX_RETRIES") {
            Some(raw) => Some(raw.trim().parse::<i32>().map_err(|_| {
                AppError::Config(format!("OUTBOX_MAX_RETRIES has an invalid value: {}", raw))
            })?),
            None => None,
        };

        let batch_size: i32 = parsed("OUTBOX_BATCH_SIZE", 100)?;
        if batch_size <= 0 {
            return Err(AppError::Config("OUTBOX_BATCH_SIZE must be positive".into()));
        }

        let log_format = match var("LOG_FORMAT").as_deref() {
            Some(f) if f.eq_ignore_ascii_case("json") => LogFormat::Json,
            _ => LogFormat::Text,
        };

        Ok(Self {
            port: parsed("PORT", 8080)?,
            database_url: var("DATABASE_URL"),
            database_max_connections: parsed("DATABASE_MAX_CONNECTIONS", 20)?,
            kafka,
            outbox: OutboxConfig {
                poll_interval: Duration::from_secs(parsed("OUTBOX_POLL_INTERVAL_SECS", 5)?),
                batch_size,
                max_retries,
            },
            dedup_window: Duration::from_secs(parsed("DEDUP_WINDOW_SECS", 172_800)?),
            commands: CommandSettings {
                beep_cooldown: Duration::from_secs(parsed("BEEP_COOLDOWN_SECS", 10)?),
                scream_cooldown: Duration::from_secs(parsed("SCREAM_COOLDOWN_SECS", 30)?),
            },
            log_format,
        })
    }
}

/// Built-in defaults without reading the environment.
impl Default for Config {
    fn default() -> Self {
        Self {
            port: 8080,
            database_url: None,
            database_max_connections: 20,
            kafka: None,
            outbox: OutboxConfig {
                poll_interval: Duration::from_secs(5),
                batch_size: 100,
                max_retries: None,
            },
            dedup_window: Duration::from_secs(172_800),
            commands: CommandSettings::default(),
            log_format: LogFormat::Text,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    // One test touches the environment so parallel tests never race on it.
    #[test]
    fn test_from_env_defaults_and_overrides() {
        for name in [
            "PORT",
            "DATABASE_URL",
            "KAFKA_BROKERS",
            "OUTBOX_MAX_RETRIES",
            "BEEP_COOLDOWN_SECS",
            "LOG_FORMAT",
        ] {
            env::remove_var(name);
        }

        let cfg = Config::from_env().unwrap();
        assert_eq!(cfg.port, 8080);
        assert!(cfg.database_url.is_none());
        assert!(cfg.kafka.is_none());
        assert_eq!(cfg.outbox.poll_interval, Duration::from_secs(5));
        assert_eq!(cfg.outbox.max_retries, None);
        assert_eq!(cfg.dedup_window, Duration::from_secs(2 * 24 * 3600));
        assert_eq!(cfg.commands.beep_cooldown, Duration::from_secs(10));
        assert_eq!(cfg.log_format, LogFormat::Text);

        env::set_var("KAFKA_BROKERS", "kafka:9092");
        env::set_var("OUTBOX_MAX_RETRIES", "7");
        env::set_var("LOG_FORMAT", "JSON");
        let cfg = Config::from_env().unwrap();
        let kafka = cfg.kafka.unwrap();
        assert_eq!(kafka.topic_prefix, "nova");
        assert_eq!(kafka.identity_topic, "nova.identity.events");
        assert_eq!(cfg.outbox.max_retries, Some(7));
        assert_eq!(cfg.log_format, LogFormat::Json);

        env::set_var("PORT", "not-a-port");
        assert!(matches!(Config::from_env(), Err(AppError::Config(_))));

        for name in ["PORT", "KAFKA_BROKERS", "OUTBOX_MAX_RETRIES", "LOG_FORMAT"] {
            env::remove_var(name);
        }
    }
}
