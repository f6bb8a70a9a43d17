//! Step execution, compensation, and the persistence discipline between them.

use std::sync::Arc;
use std::time::Duration;
use tokio::time::timeout;
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::metrics::SagaMetrics;
use crate::{
    merge_state, SagaDefinition, SagaError, SagaResult, SagaState, SagaStateStore, SagaStatus,
    StepContext, StepResult,
};

#[derive(Debug, Clone)]
pub struct OrchestratorConfig {
    /// Budget per forward step; exceeding it is a business failure
    /// ("timeout") and triggers compensation.
    pub step_timeout: Duration,
    /// Budget per compensation call. A timed-out compensation is recorded
    /// as failed and the reverse walk continues.
    pub compensation_timeout: Duration,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            step_timeout: Duration::from_secs(30),
            compensation_timeout: Duration::from_secs(30),
        }
    }
}

/// Drives instances of one saga type.
///
/// State persists between every step and every compensation, so a crash at
/// any point is recoverable. Two orchestrators racing on one instance are
/// safe: the optimistic version check rejects the stale writer, who reloads
/// and continues from the persisted point.
pub struct SagaOrchestrator {
    store: Arc<dyn SagaStateStore>,
    definition: Arc<SagaDefinition>,
    config: OrchestratorConfig,
    metrics: Option<SagaMetrics>,
}

impl SagaOrchestrator {
    pub fn new(
        store: Arc<dyn SagaStateStore>,
        definition: Arc<SagaDefinition>,
        config: OrchestratorConfig,
    ) -> Self {
        Self {
            store,
            definition,
            config,
            metrics: None,
        }
    }

    pub fn with_metrics(mut self, metrics: SagaMetrics) -> Self {
        self.metrics = Some(metrics);
        self
    }

    pub fn saga_type(&self) -> &str {
        &self.definition.saga_type
    }

    /// Create the instance and drive it to a terminal status.
    ///
    /// The instance is observable (status `InProgress`) as soon as the
    /// second persist lands; callers that must not block on the outcome
    /// spawn this future and answer after the first await point.
    pub async fn start(
        &self,
        correlation_id: Uuid,
        initial_data: serde_json::Value,
    ) -> SagaResult<SagaState> {
        let mut state = SagaState::new(&self.definition.saga_type, correlation_id, initial_data);
        self.store.create(&state).await?;

        state.status = SagaStatus::InProgress;
        self.store.update(&mut state).await?;

        info!(
            correlation_id = %correlation_id,
            saga_type = %self.definition.saga_type,
            "Saga started"
        );
        if let Some(metrics) = &self.metrics {
            metrics.started.inc();
        }

        self.drive(state).await
    }

    /// Continue a persisted instance from wherever it stopped.
    pub async fn resume(&self, correlation_id: Uuid) -> SagaResult<SagaState> {
        let mut state = self.store.load(correlation_id).await?;

        match state.status {
            SagaStatus::NotStarted => {
                state.status = SagaStatus::InProgress;
                self.persist(&mut state).await?;
                self.drive(state).await
            }
            SagaStatus::InProgress => self.drive(state).await,
            SagaStatus::Compensating => self.run_compensation(state).await,
            _ => Ok(state),
        }
    }

    /// Persist, or reload on a version conflict. Returns `false` when the
    /// state was reloaded and the caller must re-derive its position.
    async fn persist(&self, state: &mut SagaState) -> SagaResult<bool> {
        match self.store.update(state).await {
            Ok(()) => Ok(true),
            Err(SagaError::Concurrency {
                correlation_id,
                expected_version,
            }) => {
                warn!(
                    correlation_id = %correlation_id,
                    expected_version,
                    "Stale saga state; reloading"
                );
                *state = self.store.load(correlation_id).await?;
                Ok(false)
            }
            Err(e) => Err(e),
        }
    }

    async fn drive(&self, mut state: SagaState) -> SagaResult<SagaState> {
        let steps = self.definition.steps();

        while state.status == SagaStatus::InProgress {
            if state.current_step >= steps.len() {
                state.status = SagaStatus::Completed;
                self.persist(&mut state).await?;
                continue;
            }

            let step = &steps[state.current_step];
            let ctx = StepContext {
                correlation_id: state.correlation_id,
                state: &state.state_data,
                error: None,
            };

            let result = match timeout(self.config.step_timeout, step.execute(ctx)).await {
                Ok(result) => result,
                Err(_) => StepResult::failure("timeout"),
            };

            match result {
                StepResult::Success(delta) => {
                    if let Some(delta) = &delta {
                        merge_state(&mut state.state_data, delta);
                    }
                    state.completed_steps.push(step.name().to_string());
                    state.current_step += 1;
                    // A reload here re-executes the current step, which is
                    // safe: its command event id is derived, so the
                    // participant inbox drops the duplicate.
                    self.persist(&mut state).await?;
                }
                StepResult::Failure { reason, cause } => {
                    error!(
                        correlation_id = %state.correlation_id,
                        step = %step.name(),
                        reason = %reason,
                        cause = ?cause,
                        "Saga step failed; compensating"
                    );
                    match cause {
                        Some(cause) => state.push_error(format!("{reason}: {cause}")),
                        None => state.push_error(&reason),
                    }
                    state.status = SagaStatus::Compensating;
                    self.persist(&mut state).await?;
                }
            }
        }

        match state.status {
            SagaStatus::Compensating => self.run_compensation(state).await,
            SagaStatus::Completed => {
                info!(
                    correlation_id = %state.correlation_id,
                    saga_type = %state.saga_type,
                    steps = state.completed_steps.len(),
                    "Saga completed"
                );
                if let Some(metrics) = &self.metrics {
                    metrics.completed.inc();
                }
                Ok(state)
            }
            _ => Ok(state),
        }
    }

    /// Walk the completed steps in reverse, undoing each. A compensation
    /// failure is recorded and the walk continues; the remaining steps
    /// still get their chance to undo.
    async fn run_compensation(&self, mut state: SagaState) -> SagaResult<SagaState> {
        // Failed compensations this pass; skipped on the next iteration so
        // the walk always moves toward the front.
        let mut failed: Vec<String> = Vec::new();

        loop {
            let next = state
                .completed_steps
                .iter()
                .rev()
                .map(String::as_str)
                .find(|name| {
                    !state.compensated_steps.iter().any(|done| done == name)
                        && !failed.iter().any(|skip| skip == name)
                })
                .map(str::to_string);

            let Some(name) = next else {
                break;
            };

            let Some(step) = self.definition.step_named(&name) else {
                // Definition drift: a persisted step the current code no
                // longer declares. Nothing can undo it.
                error!(
                    correlation_id = %state.correlation_id,
                    step = %name,
                    "Completed step missing from saga definition"
                );
                state.push_error(format!("compensation '{name}' failed: unknown step"));
                failed.push(name);
                self.persist(&mut state).await?;
                continue;
            };

            let ctx = StepContext {
                correlation_id: state.correlation_id,
                state: &state.state_data,
                error: state.error.as_deref(),
            };

            let outcome = match timeout(self.config.compensation_timeout, step.compensate(ctx)).await
            {
                Ok(outcome) => outcome,
                Err(_) => Err(crate::CompensationError("timeout".to_string())),
            };

            match outcome {
                Ok(()) => {
                    state.compensated_steps.push(name.clone());
                    info!(
                        correlation_id = %state.correlation_id,
                        step = %name,
                        "Step compensated"
                    );
                }
                Err(e) => {
                    error!(
                        correlation_id = %state.correlation_id,
                        step = %name,
                        error = %e,
                        "Compensation failed; continuing reverse walk"
                    );
                    state.push_error(format!("compensation '{name}' failed: {e}"));
                    failed.push(name);
                }
            }

            self.persist(&mut state).await?;
        }

        loop {
            if state.status.is_terminal() {
                // Another worker landed the terminal transition first.
                break;
            }
            let fully_undone = state
                .completed_steps
                .iter()
                .all(|name| state.compensated_steps.iter().any(|done| done == name));

            state.status = if fully_undone {
                SagaStatus::Compensated
            } else {
                SagaStatus::Failed
            };
            if self.persist(&mut state).await? {
                break;
            }
        }

        info!(
            correlation_id = %state.correlation_id,
            saga_type = %state.saga_type,
            status = %state.status,
            compensated = state.compensated_steps.len(),
            "Saga compensation finished"
        );
        if let Some(metrics) = &self.metrics {
            match state.status {
                SagaStatus::Compensated => metrics.compensated.inc(),
                SagaStatus::Failed => metrics.failed.inc(),
                _ => {}
            }
        }

        Ok(state)
    }
}
