//! Step contract: the shape a saga author implements.

use async_trait::async_trait;
use std::sync::Arc;
use thiserror::Error;
use uuid::Uuid;

/// Read view a step gets of its saga instance.
#[derive(Debug, Clone, Copy)]
pub struct StepContext<'a> {
    pub correlation_id: Uuid,
    pub state: &'a serde_json::Value,
    /// The recorded failure detail, present once the saga is compensating.
    pub error: Option<&'a str>,
}

/// Business outcome of a forward step. Failures are values, not errors;
/// anything a step cannot do (including its own I/O faults) comes back as
/// `Failure` and triggers compensation.
#[derive(Debug, Clone)]
pub enum StepResult {
    /// The step succeeded, optionally contributing a delta merged into the
    /// saga's state payload.
    Success(Option<serde_json::Value>),
    Failure {
        reason: String,
        cause: Option<String>,
    },
}

impl StepResult {
    pub fn success() -> Self {
        StepResult::Success(None)
    }

    pub fn success_with(delta: serde_json::Value) -> Self {
        StepResult::Success(Some(delta))
    }

    pub fn failure(reason: impl Into<String>) -> Self {
        StepResult::Failure {
            reason: reason.into(),
            cause: None,
        }
    }

    pub fn failure_with_cause(reason: impl Into<String>, cause: impl Into<String>) -> Self {
        StepResult::Failure {
            reason: reason.into(),
            cause: Some(cause.into()),
        }
    }
}

#[derive(Error, Debug)]
#[error("compensation failed: {0}")]
pub struct CompensationError(pub String);

/// One step of a linear saga.
///
/// `execute` must be safe to re-run after crash recovery: remote steps send
/// commands whose event id derives from `(correlation_id, step_name)`, so
/// the participant's inbox drops the re-send. `compensate` must be
/// idempotent and a safe no-op when the forward effect never landed.
#[async_trait]
pub trait SagaStep: Send + Sync {
    fn name(&self) -> &str;

    async fn execute(&self, ctx: StepContext<'_>) -> StepResult;

    async fn compensate(&self, ctx: StepContext<'_>) -> Result<(), CompensationError>;
}

/// Ordered step list for one saga type.
pub struct SagaDefinition {
    pub saga_type: String,
    steps: Vec<Arc<dyn SagaStep>>,
}

impl SagaDefinition {
    pub fn new(saga_type: impl Into<String>) -> Self {
        Self {
            saga_type: saga_type.into(),
            steps: Vec::new(),
        }
    }

    pub fn step(mut self, step: Arc<dyn SagaStep>) -> Self {
        self.steps.push(step);
        self
    }

    pub fn steps(&self) -> &[Arc<dyn SagaStep>] {
        &self.steps
    }

    pub fn step_named(&self, name: &str) -> Option<&Arc<dyn SagaStep>> {
        self.steps.iter().find(|step| step.name() == name)
    }

    pub fn len(&self) -> usize {
        self.steps.len()
    }

    pub fn is_empty(&self) -> bool {
        self.steps.is_empty()
    }
}

/// Merge a step's delta into the saga state payload: objects merge
/// recursively, everything else (arrays included) is replaced.
pub fn merge_state(state: &mut serde_json::Value, delta: &serde_json::Value) {
    match (state, delta) {
        (serde_json::Value::Object(base), serde_json::Value::Object(patch)) => {
            for (key, value) in patch {
                match base.get_mut(key) {
                    Some(existing) => merge_state(existing, value),
                    None => {
                        base.insert(key.clone(), value.clone());
                    }
                }
            }
        }
        (state, delta) => {
            *state = delta.clone();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn merge_adds_and_overwrites_keys() {
        let mut state = json!({"order_id": "o-1", "total_cents": 25});
        merge_state(
            &mut state,
            &json!({"reservation_id": "r-9", "total_cents": 30}),
        );

        assert_eq!(
            state,
            json!({"order_id": "o-1", "total_cents": 30, "reservation_id": "r-9"})
        );
    }

    #[test]
    fn merge_recurses_into_objects() {
        let mut state = json!({"payment": {"status": "pending", "amount_cents": 25}});
        merge_state(&mut state, &json!({"payment": {"status": "charged"}}));

        assert_eq!(
            state,
            json!({"payment": {"status": "charged", "amount_cents": 25}})
        );
    }

    #[test]
    fn merge_replaces_arrays_wholesale() {
        let mut state = json!({"items": [1, 2, 3]});
        merge_state(&mut state, &json!({"items": [4]}));
        assert_eq!(state, json!({"items": [4]}));
    }

    #[test]
    fn definition_resolves_steps_by_name() {
        struct Named(&'static str);

        #[async_trait]
        impl SagaStep for Named {
            fn name(&self) -> &str {
                self.0
            }

            async fn execute(&self, _ctx: StepContext<'_>) -> StepResult {
                StepResult::success()
            }

            async fn compensate(&self, _ctx: StepContext<'_>) -> Result<(), CompensationError> {
                Ok(())
            }
        }

        let definition = SagaDefinition::new("order")
            .step(Arc::new(Named("reserve-inventory")))
            .step(Arc::new(Named("charge-payment")));

        assert_eq!(definition.len(), 2);
        assert!(definition.step_named("charge-payment").is_some());
        assert!(definition.step_named("create-shipment").is_none());
    }
}
