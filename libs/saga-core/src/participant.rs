//! Participant contract: the request/reply shape every remote step uses.
//!
//! A forward step publishes a command event through the outbox and waits for
//! the participant's reply. Command event ids are derived from
//! `(correlation_id, step_name)` with UUIDv5, so a re-sent command after
//! crash recovery carries the same identity and the participant's inbox
//! drops it. Replies are matched back to the waiting step in process by
//! `(correlation_id, step_name)`.

use dashmap::DashMap;
use sqlx::PgPool;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::oneshot;
use tracing::{debug, warn};
use uuid::Uuid;

use async_trait::async_trait;
use event_schema::EventEnvelope;
use transactional_outbox::{outbox_event, OutboxStore};

use crate::{CompensationError, SagaStep, StepContext, StepResult};

/// Event id of a step's forward command. Stable across re-execution.
pub fn step_command_id(correlation_id: Uuid, step_name: &str) -> Uuid {
    Uuid::new_v5(&correlation_id, step_name.as_bytes())
}

/// Event id of a step's compensation command.
pub fn compensation_command_id(correlation_id: Uuid, step_name: &str) -> Uuid {
    Uuid::new_v5(&correlation_id, format!("{step_name}:compensate").as_bytes())
}

/// Event id a participant uses for its forward reply. Stable, so a replayed
/// reply is deduplicated downstream too.
pub fn step_reply_id(correlation_id: Uuid, step_name: &str) -> Uuid {
    Uuid::new_v5(&correlation_id, format!("{step_name}:reply").as_bytes())
}

/// Event id a participant uses for its compensation reply.
pub fn compensation_reply_id(correlation_id: Uuid, step_name: &str) -> Uuid {
    Uuid::new_v5(
        &correlation_id,
        format!("{step_name}:compensate:reply").as_bytes(),
    )
}

/// A participant's answer to one command.
#[derive(Debug, Clone)]
pub enum ReplyOutcome {
    /// The participant did the work; the payload is merged into saga state.
    Ok(serde_json::Value),
    /// The participant refused (business failure). Not retried.
    Fail(String),
}

/// In-process rendezvous between the reply consumer and waiting steps.
///
/// The reply consumer (fed by the inbox) delivers outcomes keyed by
/// `(correlation_id, waiter_key)`; a step registers before publishing its
/// command so an early reply cannot be missed.
#[derive(Default)]
pub struct ReplyRouter {
    pending: DashMap<(Uuid, String), oneshot::Sender<ReplyOutcome>>,
}

impl ReplyRouter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a waiter. A second registration for the same key replaces
    /// the first (stale waiters from abandoned executions).
    pub fn register(&self, correlation_id: Uuid, key: &str) -> oneshot::Receiver<ReplyOutcome> {
        let (tx, rx) = oneshot::channel();
        self.pending.insert((correlation_id, key.to_string()), tx);
        rx
    }

    /// Hand an outcome to the waiter, if one is still there. Replies with no
    /// waiter (orchestrator restarted, step already timed out) are dropped;
    /// the recovery path re-drives the saga instead.
    pub fn deliver(&self, correlation_id: Uuid, key: &str, outcome: ReplyOutcome) -> bool {
        match self.pending.remove(&(correlation_id, key.to_string())) {
            Some((_, tx)) => tx.send(outcome).is_ok(),
            None => {
                debug!(
                    correlation_id = %correlation_id,
                    key = %key,
                    "Reply arrived with no waiter"
                );
                false
            }
        }
    }

    pub fn cancel(&self, correlation_id: Uuid, key: &str) {
        self.pending.remove(&(correlation_id, key.to_string()));
    }

    pub fn pending_count(&self) -> usize {
        self.pending.len()
    }
}

/// What a command builder produces: the event to publish for this step.
#[derive(Debug, Clone)]
pub struct CommandSpec {
    pub event_type: String,
    pub aggregate_key: String,
    pub payload: serde_json::Value,
}

type CommandBuilder =
    dyn Fn(Uuid, &serde_json::Value) -> Result<CommandSpec, String> + Send + Sync;

/// A saga step whose work happens in a remote participant.
///
/// `execute` queues the forward command through the outbox (its own
/// transaction; re-sends are deduplicated by the derived event id) and waits
/// for the reply. The orchestrator's step timeout bounds the wait.
pub struct EventStep {
    name: String,
    pool: PgPool,
    outbox: Arc<dyn OutboxStore>,
    router: Arc<ReplyRouter>,
    command: Box<CommandBuilder>,
    compensation: Option<Box<CommandBuilder>>,
    compensation_wait: Duration,
}

impl EventStep {
    pub fn new(
        name: impl Into<String>,
        pool: PgPool,
        outbox: Arc<dyn OutboxStore>,
        router: Arc<ReplyRouter>,
        command: Box<CommandBuilder>,
    ) -> Self {
        Self {
            name: name.into(),
            pool,
            outbox,
            router,
            command,
            compensation: None,
            compensation_wait: Duration::from_secs(30),
        }
    }

    pub fn with_compensation(mut self, compensation: Box<CommandBuilder>) -> Self {
        self.compensation = Some(compensation);
        self
    }

    pub fn with_compensation_wait(mut self, wait: Duration) -> Self {
        self.compensation_wait = wait;
        self
    }

    async fn queue_command(&self, envelope: &EventEnvelope) -> Result<(), String> {
        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|e| format!("begin failed: {e}"))?;
        outbox_event!(&mut tx, self.outbox, envelope)
            .map_err(|e| format!("outbox append failed: {e}"))?;
        tx.commit().await.map_err(|e| format!("commit failed: {e}"))
    }
}

#[async_trait]
impl SagaStep for EventStep {
    fn name(&self) -> &str {
        &self.name
    }

    async fn execute(&self, ctx: StepContext<'_>) -> StepResult {
        let spec = match (self.command)(ctx.correlation_id, ctx.state) {
            Ok(spec) => spec,
            Err(reason) => return StepResult::failure(reason),
        };

        let envelope = EventEnvelope::new(
            spec.event_type,
            spec.aggregate_key,
            ctx.correlation_id,
            spec.payload,
        )
        .with_event_id(step_command_id(ctx.correlation_id, &self.name));

        // Register before publishing; a fast participant must not win the
        // race against our own waiter.
        let receiver = self.router.register(ctx.correlation_id, &self.name);

        if let Err(detail) = self.queue_command(&envelope).await {
            self.router.cancel(ctx.correlation_id, &self.name);
            return StepResult::failure_with_cause("command not queued", detail);
        }

        match receiver.await {
            Ok(ReplyOutcome::Ok(data)) => StepResult::success_with(data),
            Ok(ReplyOutcome::Fail(reason)) => StepResult::failure(reason),
            Err(_) => StepResult::failure("reply channel closed"),
        }
    }

    async fn compensate(&self, ctx: StepContext<'_>) -> Result<(), CompensationError> {
        let Some(compensation) = &self.compensation else {
            // Steps without an undo (e.g., the final confirmation) are a
            // no-op to compensate.
            return Ok(());
        };

        let spec = (compensation)(ctx.correlation_id, ctx.state)
            .map_err(CompensationError)?;

        let key = format!("{}:compensate", self.name);
        let envelope = EventEnvelope::new(
            spec.event_type,
            spec.aggregate_key,
            ctx.correlation_id,
            spec.payload,
        )
        .with_event_id(compensation_command_id(ctx.correlation_id, &self.name));

        let receiver = self.router.register(ctx.correlation_id, &key);

        if let Err(detail) = self.queue_command(&envelope).await {
            self.router.cancel(ctx.correlation_id, &key);
            return Err(CompensationError(detail));
        }

        match tokio::time::timeout(self.compensation_wait, receiver).await {
            Ok(Ok(ReplyOutcome::Ok(_))) => Ok(()),
            Ok(Ok(ReplyOutcome::Fail(reason))) => Err(CompensationError(reason)),
            Ok(Err(_)) => Err(CompensationError("reply channel closed".to_string())),
            Err(_) => {
                self.router.cancel(ctx.correlation_id, &key);
                warn!(
                    correlation_id = %ctx.correlation_id,
                    step = %self.name,
                    "Compensation reply timed out"
                );
                Err(CompensationError("timeout".to_string()))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn command_ids_are_stable_and_distinct() {
        let correlation_id = Uuid::new_v4();

        assert_eq!(
            step_command_id(correlation_id, "charge-payment"),
            step_command_id(correlation_id, "charge-payment")
        );
        assert_ne!(
            step_command_id(correlation_id, "charge-payment"),
            step_command_id(correlation_id, "reserve-inventory")
        );
        assert_ne!(
            step_command_id(correlation_id, "charge-payment"),
            compensation_command_id(correlation_id, "charge-payment")
        );
        assert_ne!(
            step_reply_id(correlation_id, "charge-payment"),
            compensation_reply_id(correlation_id, "charge-payment")
        );

        let other = Uuid::new_v4();
        assert_ne!(
            step_command_id(correlation_id, "charge-payment"),
            step_command_id(other, "charge-payment")
        );
    }

    #[tokio::test]
    async fn router_delivers_to_registered_waiter() {
        let router = ReplyRouter::new();
        let correlation_id = Uuid::new_v4();

        let rx = router.register(correlation_id, "charge-payment");
        assert!(router.deliver(
            correlation_id,
            "charge-payment",
            ReplyOutcome::Ok(serde_json::json!({"charge_id": "c-1"})),
        ));

        match rx.await.unwrap() {
            ReplyOutcome::Ok(data) => assert_eq!(data["charge_id"], "c-1"),
            other => panic!("unexpected outcome: {other:?}"),
        }

        assert_eq!(router.pending_count(), 0);
    }

    #[tokio::test]
    async fn reply_without_waiter_is_dropped() {
        let router = ReplyRouter::new();
        assert!(!router.deliver(
            Uuid::new_v4(),
            "charge-payment",
            ReplyOutcome::Fail("card_declined".to_string()),
        ));
    }

    #[tokio::test]
    async fn reregistration_replaces_stale_waiter() {
        let router = ReplyRouter::new();
        let correlation_id = Uuid::new_v4();

        let stale = router.register(correlation_id, "charge-payment");
        let fresh = router.register(correlation_id, "charge-payment");
        assert_eq!(router.pending_count(), 1);

        router.deliver(
            correlation_id,
            "charge-payment",
            ReplyOutcome::Fail("card_declined".to_string()),
        );

        assert!(stale.await.is_err());
        assert!(matches!(fresh.await.unwrap(), ReplyOutcome::Fail(_)));
    }
}
