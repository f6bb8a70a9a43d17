//! Configuration for the order orchestration service.
//!
//! Everything loads from environment variables, with a `.env` file honoured
//! in development builds. Defaults follow the platform-wide budgets: 5 s
//! outbox polling, batches of 100, five retries/attempts, 30 s step
//! timeout, 2 min stuck threshold, 60 s recovery scans.

use anyhow::{Context, Result};
use std::env;
use std::time::Duration;
use tracing::info;

#[derive(Debug, Clone)]
pub struct Settings {
    pub service_name: String,
    pub database: DatabaseSettings,
    pub kafka: KafkaSettings,
    pub outbox: OutboxSettings,
    pub inbox: InboxSettings,
    pub saga: SagaSettings,
    pub dlq: DlqSettings,
}

impl Settings {
    pub fn load() -> Result<Self> {
        if cfg!(debug_assertions) {
            dotenvy::dotenv().ok();
            info!("Loaded .env file for development");
        }

        Ok(Settings {
            service_name: env::var("SERVICE_NAME").unwrap_or_else(|_| "order-service".to_string()),
            database: DatabaseSettings::from_env()?,
            kafka: KafkaSettings::from_env()?,
            outbox: OutboxSettings::from_env()?,
            inbox: InboxSettings::from_env()?,
            saga: SagaSettings::from_env()?,
            dlq: DlqSettings::from_env()?,
        })
    }
}

fn env_or<T: std::str::FromStr>(name: &str, default: T) -> Result<T>
where
    T::Err: std::error::Error + Send + Sync + 'static,
{
    match env::var(name) {
        Ok(raw) => raw
            .trim()
            .parse::<T>()
            .with_context(|| format!("Invalid {name}")),
        Err(_) => Ok(default),
    }
}

#[derive(Debug, Clone)]
pub struct DatabaseSettings {
    pub url: String,
    pub max_connections: u32,
    pub acquire_timeout: Duration,
}

impl DatabaseSettings {
    fn from_env() -> Result<Self> {
        Ok(Self {
            url: env::var("DATABASE_URL").context("DATABASE_URL must be set")?,
            max_connections: env_or("DATABASE_MAX_CONNECTIONS", 20)?,
            acquire_timeout: Duration::from_secs(env_or("DATABASE_ACQUIRE_TIMEOUT", 10)?),
        })
    }
}

#[derive(Debug, Clone)]
pub struct KafkaSettings {
    pub brokers: String,
    pub topic_prefix: String,
    pub consumer_group: String,
}

impl KafkaSettings {
    fn from_env() -> Result<Self> {
        Ok(Self {
            brokers: env::var("KAFKA_BROKERS").context("KAFKA_BROKERS must be set")?,
            topic_prefix: env::var("KAFKA_TOPIC_PREFIX").unwrap_or_else(|_| "mercato".to_string()),
            consumer_group: env::var("KAFKA_CONSUMER_GROUP")
                .unwrap_or_else(|_| "order-orchestrator".to_string()),
        })
    }
}

#[derive(Debug, Clone)]
pub struct OutboxSettings {
    pub poll_interval: Duration,
    pub batch_size: i64,
    pub max_retries: i32,
}

impl OutboxSettings {
    fn from_env() -> Result<Self> {
        Ok(Self {
            poll_interval: Duration::from_millis(env_or("OUTBOX_POLL_INTERVAL_MS", 5000)?),
            batch_size: env_or("OUTBOX_BATCH_SIZE", 100)?,
            max_retries: env_or("OUTBOX_MAX_RETRIES", 5)?,
        })
    }
}

#[derive(Debug, Clone)]
pub struct InboxSettings {
    pub max_attempts: i32,
    pub retention: Duration,
    pub cleanup_interval: Duration,
}

impl InboxSettings {
    fn from_env() -> Result<Self> {
        Ok(Self {
            max_attempts: env_or("INBOX_MAX_ATTEMPTS", 5)?,
            retention: Duration::from_secs(env_or("INBOX_RETENTION_SECS", 7 * 86400)?),
            cleanup_interval: Duration::from_secs(env_or("INBOX_CLEANUP_INTERVAL_SECS", 3600)?),
        })
    }
}

#[derive(Debug, Clone)]
pub struct SagaSettings {
    pub step_timeout: Duration,
    pub stuck_threshold: Duration,
    pub recovery_interval: Duration,
}

impl SagaSettings {
    fn from_env() -> Result<Self> {
        Ok(Self {
            step_timeout: Duration::from_millis(env_or("SAGA_STEP_TIMEOUT_MS", 30_000)?),
            stuck_threshold: Duration::from_millis(env_or("SAGA_STUCK_THRESHOLD_MS", 120_000)?),
            recovery_interval: Duration::from_millis(env_or("SAGA_RECOVERY_INTERVAL_MS", 60_000)?),
        })
    }
}

#[derive(Debug, Clone)]
pub struct DlqSettings {
    pub enabled: bool,
}

impl DlqSettings {
    fn from_env() -> Result<Self> {
        Ok(Self {
            enabled: env_or("DLQ_ENABLED", true)?,
        })
    }
}
