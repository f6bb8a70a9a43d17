//! In-memory saga state store.
//!
//! Same contract as the SQL store, including optimistic versioning and the
//! recovery claim, keyed by correlation id. Used by tests and by hosts that
//! drive sagas without durable state (demos, simulations).

use async_trait::async_trait;
use chrono::Utc;
use std::collections::HashMap;
use std::sync::Mutex;
use std::time::Duration;
use uuid::Uuid;

use crate::{SagaError, SagaResult, SagaState, SagaStateStore, SagaStatus};

#[derive(Default)]
pub struct InMemorySagaStore {
    items: Mutex<HashMap<Uuid, SagaState>>,
}

impl InMemorySagaStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl SagaStateStore for InMemorySagaStore {
    async fn create(&self, state: &SagaState) -> SagaResult<()> {
        let mut items = self.items.lock().expect("saga store poisoned");
        if items.contains_key(&state.correlation_id) {
            return Err(SagaError::DuplicateCorrelation(state.correlation_id));
        }
        items.insert(state.correlation_id, state.clone());
        Ok(())
    }

    async fn load(&self, correlation_id: Uuid) -> SagaResult<SagaState> {
        self.items
            .lock()
            .expect("saga store poisoned")
            .get(&correlation_id)
            .cloned()
            .ok_or(SagaError::NotFound(correlation_id))
    }

    async fn update(&self, state: &mut SagaState) -> SagaResult<()> {
        let mut items = self.items.lock().expect("saga store poisoned");
        let stored = items
            .get_mut(&state.correlation_id)
            .ok_or(SagaError::NotFound(state.correlation_id))?;

        if stored.version != state.version {
            return Err(SagaError::Concurrency {
                correlation_id: state.correlation_id,
                expected_version: state.version,
            });
        }

        state.version += 1;
        state.updated_at = Utc::now();
        *stored = state.clone();
        Ok(())
    }

    async fn find_by_status(&self, status: SagaStatus) -> SagaResult<Vec<SagaState>> {
        let items = self.items.lock().expect("saga store poisoned");
        let mut found: Vec<SagaState> = items
            .values()
            .filter(|state| state.status == status)
            .cloned()
            .collect();
        found.sort_by_key(|state| state.updated_at);
        Ok(found)
    }

    async fn find_stuck(
        &self,
        status: SagaStatus,
        older_than: Duration,
    ) -> SagaResult<Vec<SagaState>> {
        let cutoff = Utc::now()
            - chrono::Duration::from_std(older_than).unwrap_or(chrono::Duration::zero());
        let items = self.items.lock().expect("saga store poisoned");
        let mut found: Vec<SagaState> = items
            .values()
            .filter(|state| state.status == status && state.updated_at < cutoff)
            .cloned()
            .collect();
        found.sort_by_key(|state| state.updated_at);
        Ok(found)
    }

    async fn claim_for_recovery(
        &self,
        correlation_id: Uuid,
        expected_version: i64,
    ) -> SagaResult<Option<SagaState>> {
        let mut items = self.items.lock().expect("saga store poisoned");
        let Some(stored) = items.get_mut(&correlation_id) else {
            return Ok(None);
        };
        if stored.version != expected_version {
            return Ok(None);
        }
        stored.version += 1;
        stored.updated_at = Utc::now();
        Ok(Some(stored.clone()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn version_advances_on_every_update() {
        let store = InMemorySagaStore::new();
        let mut state = SagaState::new("order", Uuid::new_v4(), json!({}));
        store.create(&state).await.unwrap();

        let mut versions = vec![state.version];
        for _ in 0..3 {
            state.status = SagaStatus::InProgress;
            store.update(&mut state).await.unwrap();
            versions.push(state.version);
        }

        // Strictly increasing across persisted mutations.
        assert!(versions.windows(2).all(|w| w[0] < w[1]));
    }

    #[tokio::test]
    async fn stale_update_is_rejected() {
        let store = InMemorySagaStore::new();
        let state = SagaState::new("order", Uuid::new_v4(), json!({}));
        store.create(&state).await.unwrap();

        let mut writer_a = store.load(state.correlation_id).await.unwrap();
        let mut writer_b = store.load(state.correlation_id).await.unwrap();

        writer_a.status = SagaStatus::InProgress;
        store.update(&mut writer_a).await.unwrap();

        writer_b.status = SagaStatus::Compensating;
        let err = store.update(&mut writer_b).await.unwrap_err();
        assert!(matches!(err, SagaError::Concurrency { .. }));

        // The winner's write stands.
        let current = store.load(state.correlation_id).await.unwrap();
        assert_eq!(current.status, SagaStatus::InProgress);
    }

    #[tokio::test]
    async fn duplicate_correlation_is_rejected() {
        let store = InMemorySagaStore::new();
        let state = SagaState::new("order", Uuid::new_v4(), json!({}));
        store.create(&state).await.unwrap();

        let again = SagaState::new("order", state.correlation_id, json!({}));
        let err = store.create(&again).await.unwrap_err();
        assert!(matches!(err, SagaError::DuplicateCorrelation(_)));
    }

    #[tokio::test]
    async fn recovery_claim_goes_to_one_winner() {
        let store = InMemorySagaStore::new();
        let state = SagaState::new("order", Uuid::new_v4(), json!({}));
        store.create(&state).await.unwrap();

        let first = store
            .claim_for_recovery(state.correlation_id, state.version)
            .await
            .unwrap();
        assert!(first.is_some());

        // Same expected version again: the bump already happened.
        let second = store
            .claim_for_recovery(state.correlation_id, state.version)
            .await
            .unwrap();
        assert!(second.is_none());
    }
}
