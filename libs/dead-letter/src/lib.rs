//! Dead-letter quarantine for messages that exhausted their retry budget.
//!
//! Entries are written once and stay immutable except for the reprocessing
//! marker and operator notes. Operators triage through `list` (backed by the
//! `(service_name, reprocessed, moved_to_dlq_at)` index) and replay entries
//! through the normal outbox path, which flips `reprocessed`.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::{PgPool, Row};
use thiserror::Error;
use tracing::{debug, info};
use uuid::Uuid;

use event_schema::EventEnvelope;

pub mod metrics;

pub type DeadLetterResult<T> = Result<T, DeadLetterError>;

#[derive(Error, Debug)]
pub enum DeadLetterError {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("dead-letter entry not found: {0}")]
    NotFound(Uuid),

    #[error("dead-letter entry already reprocessed: {0}")]
    AlreadyReprocessed(Uuid),
}

/// Failure reasons recorded on quarantined entries. These are the error
/// taxonomy kinds, not free-form text; details go in `error_details`.
pub mod reason {
    /// Missing/invalid headers or undecodable payload. Never retried.
    pub const MALFORMED: &str = "malformed";
    /// Outbox relay exhausted its publish retry budget.
    pub const MAX_RETRIES_EXCEEDED: &str = "max_retries_exceeded";
    /// Inbox handler exhausted its attempt budget.
    pub const MAX_ATTEMPTS_EXCEEDED: &str = "max_attempts_exceeded";
    /// Handler failed in a way known to be non-retriable.
    pub const HANDLER_ERROR: &str = "handler_error";
}

/// A quarantined message. Immutable audit record; only `reprocessed`,
/// `reprocessed_at`, and `operator_notes` ever change.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeadLetterEntry {
    pub id: Uuid,
    pub event_type: String,
    pub payload: serde_json::Value,
    pub original_timestamp: DateTime<Utc>,
    pub moved_to_dlq_at: DateTime<Utc>,
    pub failure_reason: String,
    pub error_details: Option<String>,
    pub total_attempts: i32,
    pub service_name: String,
    pub correlation_id: Option<Uuid>,
    pub original_event_id: Option<Uuid>,
    pub reprocessed: bool,
    pub reprocessed_at: Option<DateTime<Utc>>,
    pub operator_notes: Option<String>,
}

/// What gets captured at quarantine time.
#[derive(Debug, Clone)]
pub struct NewDeadLetter {
    pub event_type: String,
    pub payload: serde_json::Value,
    pub original_timestamp: DateTime<Utc>,
    pub failure_reason: String,
    pub error_details: Option<String>,
    pub total_attempts: i32,
    pub service_name: String,
    pub correlation_id: Option<Uuid>,
    pub original_event_id: Option<Uuid>,
}

impl NewDeadLetter {
    /// Capture a decoded envelope that permanently failed.
    pub fn from_envelope(
        envelope: &EventEnvelope,
        failure_reason: &str,
        error_details: Option<String>,
        total_attempts: i32,
        service_name: &str,
    ) -> Self {
        Self {
            event_type: envelope.event_type.clone(),
            payload: envelope.payload.clone(),
            original_timestamp: envelope.occurred_at,
            failure_reason: failure_reason.to_string(),
            error_details,
            total_attempts,
            service_name: service_name.to_string(),
            correlation_id: Some(envelope.correlation_id),
            original_event_id: Some(envelope.event_id),
        }
    }

    /// Capture raw bytes that never decoded. The payload is preserved as
    /// JSON when it parses, otherwise wrapped so the original text survives.
    pub fn from_raw(
        value: &[u8],
        error_details: Option<String>,
        service_name: &str,
    ) -> Self {
        let payload = serde_json::from_slice(value).unwrap_or_else(|_| {
            serde_json::json!({ "raw": String::from_utf8_lossy(value) })
        });

        Self {
            event_type: "unknown".to_string(),
            payload,
            original_timestamp: Utc::now(),
            failure_reason: reason::MALFORMED.to_string(),
            error_details,
            total_attempts: 0,
            service_name: service_name.to_string(),
            correlation_id: None,
            original_event_id: None,
        }
    }
}

/// Operator triage filter.
#[derive(Debug, Clone, Default)]
pub struct DeadLetterFilter {
    pub service_name: Option<String>,
    pub include_reprocessed: bool,
    pub moved_after: Option<DateTime<Utc>>,
    pub limit: Option<i64>,
}

#[async_trait]
pub trait DeadLetterStore: Send + Sync {
    /// Quarantine a message. Write-once.
    async fn enqueue(&self, entry: NewDeadLetter) -> DeadLetterResult<Uuid>;

    /// Newest-first triage listing.
    async fn list(&self, filter: DeadLetterFilter) -> DeadLetterResult<Vec<DeadLetterEntry>>;

    async fn load(&self, id: Uuid) -> DeadLetterResult<DeadLetterEntry>;

    /// Flip the reprocessing marker. Fails if the entry was already
    /// reprocessed, so double replay is caught at the source.
    async fn mark_reprocessed(
        &self,
        id: Uuid,
        operator_notes: Option<String>,
    ) -> DeadLetterResult<()>;

    /// Unreprocessed entry count for a service, for the depth gauge.
    async fn depth(&self, service_name: &str) -> DeadLetterResult<i64>;
}

/// PostgreSQL-backed store over `dead_letter_messages`.
pub struct SqlxDeadLetterStore {
    pool: PgPool,
}

impl SqlxDeadLetterStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

fn row_to_entry(row: &sqlx::postgres::PgRow) -> Result<DeadLetterEntry, sqlx::Error> {
    Ok(DeadLetterEntry {
        id: row.try_get("id")?,
        event_type: row.try_get("event_type")?,
        payload: row.try_get("payload")?,
        original_timestamp: row.try_get("original_timestamp")?,
        moved_to_dlq_at: row.try_get("moved_to_dlq_at")?,
        failure_reason: row.try_get("failure_reason")?,
        error_details: row.try_get("error_details")?,
        total_attempts: row.try_get("total_attempts")?,
        service_name: row.try_get("service_name")?,
        correlation_id: row.try_get("correlation_id")?,
        original_event_id: row.try_get("original_event_id")?,
        reprocessed: row.try_get("reprocessed")?,
        reprocessed_at: row.try_get("reprocessed_at")?,
        operator_notes: row.try_get("operator_notes")?,
    })
}

#[async_trait]
impl DeadLetterStore for SqlxDeadLetterStore {
    async fn enqueue(&self, entry: NewDeadLetter) -> DeadLetterResult<Uuid> {
        let id = Uuid::new_v4();

        sqlx::query(
            r#"
            INSERT INTO dead_letter_messages (
                id,
                event_type,
                payload,
                original_timestamp,
                moved_to_dlq_at,
                failure_reason,
                error_details,
                total_attempts,
                service_name,
                correlation_id,
                original_event_id
            ) VALUES ($1, $2, $3, $4, NOW(), $5, $6, $7, $8, $9, $10)
            "#,
        )
        .bind(id)
        .bind(&entry.event_type)
        .bind(&entry.payload)
        .bind(entry.original_timestamp)
        .bind(&entry.failure_reason)
        .bind(&entry.error_details)
        .bind(entry.total_attempts)
        .bind(&entry.service_name)
        .bind(entry.correlation_id)
        .bind(entry.original_event_id)
        .execute(&self.pool)
        .await?;

        info!(
            dlq_id = %id,
            event_type = %entry.event_type,
            failure_reason = %entry.failure_reason,
            total_attempts = entry.total_attempts,
            service = %entry.service_name,
            "Message moved to dead-letter queue"
        );

        Ok(id)
    }

    async fn list(&self, filter: DeadLetterFilter) -> DeadLetterResult<Vec<DeadLetterEntry>> {
        let rows = sqlx::query(
            r#"
            SELECT *
            FROM dead_letter_messages
            WHERE ($1::TEXT IS NULL OR service_name = $1)
              AND (reprocessed = FALSE OR $2)
              AND ($3::TIMESTAMPTZ IS NULL OR moved_to_dlq_at > $3)
            ORDER BY moved_to_dlq_at DESC
            LIMIT $4
            "#,
        )
        .bind(&filter.service_name)
        .bind(filter.include_reprocessed)
        .bind(filter.moved_after)
        .bind(filter.limit.unwrap_or(100))
        .fetch_all(&self.pool)
        .await?;

        let entries = rows
            .iter()
            .map(row_to_entry)
            .collect::<Result<Vec<_>, _>>()?;

        debug!(count = entries.len(), "Listed dead-letter entries");

        Ok(entries)
    }

    async fn load(&self, id: Uuid) -> DeadLetterResult<DeadLetterEntry> {
        let row = sqlx::query("SELECT * FROM dead_letter_messages WHERE id = $1")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?
            .ok_or(DeadLetterError::NotFound(id))?;

        Ok(row_to_entry(&row)?)
    }

    async fn mark_reprocessed(
        &self,
        id: Uuid,
        operator_notes: Option<String>,
    ) -> DeadLetterResult<()> {
        let result = sqlx::query(
            r#"
            UPDATE dead_letter_messages
            SET reprocessed = TRUE,
                reprocessed_at = NOW(),
                operator_notes = COALESCE($2, operator_notes)
            WHERE id = $1
              AND reprocessed = FALSE
            "#,
        )
        .bind(id)
        .bind(operator_notes)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            // Either missing or already flipped; disambiguate for the operator.
            return match self.load(id).await {
                Ok(_) => Err(DeadLetterError::AlreadyReprocessed(id)),
                Err(e) => Err(e),
            };
        }

        info!(dlq_id = %id, "Dead-letter entry marked reprocessed");

        Ok(())
    }

    async fn depth(&self, service_name: &str) -> DeadLetterResult<i64> {
        let row = sqlx::query(
            r#"
            SELECT COUNT(*)::BIGINT AS depth
            FROM dead_letter_messages
            WHERE service_name = $1
              AND reprocessed = FALSE
            "#,
        )
        .bind(service_name)
        .fetch_one(&self.pool)
        .await?;

        Ok(row.try_get("depth").unwrap_or(0))
    }
}
