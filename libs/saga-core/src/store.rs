//! Saga state persistence.
//!
//! The `saga_states` table stores scalar columns for everything the
//! recovery scans filter on (status, timestamps, version) and folds the
//! saga author's payload plus the progress lists into one `state_json`
//! document. Updates are optimistic: `WHERE version = expected` and a miss
//! is a [`SagaError::Concurrency`], which the orchestrator answers by
//! reloading and retrying from the persisted point.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use sqlx::{PgPool, Row};
use std::str::FromStr;
use std::time::Duration;
use tracing::debug;
use uuid::Uuid;

use crate::{SagaError, SagaResult, SagaState, SagaStatus};

#[async_trait]
pub trait SagaStateStore: Send + Sync {
    /// Persist a new instance. The correlation id must be unused.
    async fn create(&self, state: &SagaState) -> SagaResult<()>;

    /// Look up by the business key.
    async fn load(&self, correlation_id: Uuid) -> SagaResult<SagaState>;

    /// Optimistically persist a mutation. On success the state's `version`
    /// and `updated_at` advance in place; on a version miss nothing is
    /// written and [`SagaError::Concurrency`] is returned.
    async fn update(&self, state: &mut SagaState) -> SagaResult<()>;

    async fn find_by_status(&self, status: SagaStatus) -> SagaResult<Vec<SagaState>>;

    /// Instances sitting in `status` with no update for `older_than`.
    async fn find_stuck(
        &self,
        status: SagaStatus,
        older_than: Duration,
    ) -> SagaResult<Vec<SagaState>>;

    /// Version-bump lease for recovery: advance `version`/`updated_at` iff
    /// the version still matches, and return the refreshed state. `None`
    /// means another worker claimed the instance first. The bump also
    /// removes the instance from the stuck scan for one threshold window.
    async fn claim_for_recovery(
        &self,
        correlation_id: Uuid,
        expected_version: i64,
    ) -> SagaResult<Option<SagaState>>;
}

/// The jsonb document behind `state_json`.
#[derive(Debug, Serialize, Deserialize)]
struct StateDocument {
    data: serde_json::Value,
    completed_steps: Vec<String>,
    compensated_steps: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    error: Option<String>,
}

impl StateDocument {
    fn from_state(state: &SagaState) -> Self {
        Self {
            data: state.state_data.clone(),
            completed_steps: state.completed_steps.clone(),
            compensated_steps: state.compensated_steps.clone(),
            error: state.error.clone(),
        }
    }
}

pub struct SqlxSagaStateStore {
    pool: PgPool,
}

impl SqlxSagaStateStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

fn row_to_state(row: &sqlx::postgres::PgRow) -> SagaResult<SagaState> {
    let status_raw: String = row.try_get("status")?;
    let status = SagaStatus::from_str(&status_raw)
        .map_err(|e| SagaError::Serialization(serde::de::Error::custom(e)))?;

    let document: StateDocument = serde_json::from_value(row.try_get("state_json")?)?;
    let current_step: i32 = row.try_get("current_step")?;

    Ok(SagaState {
        id: row.try_get("id")?,
        correlation_id: row.try_get("correlation_id")?,
        saga_type: row.try_get("saga_type")?,
        status,
        current_step: current_step.max(0) as usize,
        completed_steps: document.completed_steps,
        compensated_steps: document.compensated_steps,
        state_data: document.data,
        error: document.error,
        created_at: row.try_get("created_at")?,
        updated_at: row.try_get("updated_at")?,
        version: row.try_get("version")?,
    })
}

#[async_trait]
impl SagaStateStore for SqlxSagaStateStore {
    async fn create(&self, state: &SagaState) -> SagaResult<()> {
        let document = serde_json::to_value(StateDocument::from_state(state))?;

        let result = sqlx::query(
            r#"
            INSERT INTO saga_states (
                id, correlation_id, saga_type, status, current_step,
                state_json, created_at, updated_at, version
            ) VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)
            "#,
        )
        .bind(state.id)
        .bind(state.correlation_id)
        .bind(&state.saga_type)
        .bind(state.status.to_string())
        .bind(state.current_step as i32)
        .bind(document)
        .bind(state.created_at)
        .bind(state.updated_at)
        .bind(state.version)
        .execute(&self.pool)
        .await;

        match result {
            Ok(_) => {
                debug!(
                    correlation_id = %state.correlation_id,
                    saga_type = %state.saga_type,
                    "Saga instance created"
                );
                Ok(())
            }
            Err(sqlx::Error::Database(db)) if db.is_unique_violation() => {
                Err(SagaError::DuplicateCorrelation(state.correlation_id))
            }
            Err(e) => Err(e.into()),
        }
    }

    async fn load(&self, correlation_id: Uuid) -> SagaResult<SagaState> {
        let row = sqlx::query("SELECT * FROM saga_states WHERE correlation_id = $1")
            .bind(correlation_id)
            .fetch_optional(&self.pool)
            .await?
            .ok_or(SagaError::NotFound(correlation_id))?;

        row_to_state(&row)
    }

    async fn update(&self, state: &mut SagaState) -> SagaResult<()> {
        let document = serde_json::to_value(StateDocument::from_state(state))?;

        let row = sqlx::query(
            r#"
            UPDATE saga_states
            SET status = $3,
                current_step = $4,
                state_json = $5,
                updated_at = NOW(),
                version = version + 1
            WHERE correlation_id = $1
              AND version = $2
            RETURNING updated_at, version
            "#,
        )
        .bind(state.correlation_id)
        .bind(state.version)
        .bind(state.status.to_string())
        .bind(state.current_step as i32)
        .bind(document)
        .fetch_optional(&self.pool)
        .await?;

        let Some(row) = row else {
            return Err(SagaError::Concurrency {
                correlation_id: state.correlation_id,
                expected_version: state.version,
            });
        };

        state.updated_at = row.try_get("updated_at")?;
        state.version = row.try_get("version")?;

        Ok(())
    }

    async fn find_by_status(&self, status: SagaStatus) -> SagaResult<Vec<SagaState>> {
        let rows = sqlx::query(
            "SELECT * FROM saga_states WHERE status = $1 ORDER BY updated_at ASC",
        )
        .bind(status.to_string())
        .fetch_all(&self.pool)
        .await?;

        rows.iter().map(row_to_state).collect()
    }

    async fn find_stuck(
        &self,
        status: SagaStatus,
        older_than: Duration,
    ) -> SagaResult<Vec<SagaState>> {
        let rows = sqlx::query(
            r#"
            SELECT *
            FROM saga_states
            WHERE status = $1
              AND updated_at < NOW() - make_interval(secs => $2::double precision)
            ORDER BY updated_at ASC
            "#,
        )
        .bind(status.to_string())
        .bind(older_than.as_secs_f64())
        .fetch_all(&self.pool)
        .await?;

        rows.iter().map(row_to_state).collect()
    }

    async fn claim_for_recovery(
        &self,
        correlation_id: Uuid,
        expected_version: i64,
    ) -> SagaResult<Option<SagaState>> {
        let row = sqlx::query(
            r#"
            UPDATE saga_states
            SET updated_at = NOW(),
                version = version + 1
            WHERE correlation_id = $1
              AND version = $2
            RETURNING *
            "#,
        )
        .bind(correlation_id)
        .bind(expected_version)
        .fetch_optional(&self.pool)
        .await?;

        row.as_ref().map(row_to_state).transpose()
    }
}
