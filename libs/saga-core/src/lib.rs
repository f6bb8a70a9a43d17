//! # Saga Core
//!
//! Orchestrated sagas over event-driven participants: a linear sequence of
//! remote steps with forward progress persisted between every step and
//! reverse-order compensation when a step fails. Business failures are
//! values ([`StepResult`]), never panics or error returns; only storage and
//! transport I/O surfaces errors, and those stay inside the worker loops.
//!
//! State is durable and optimistically versioned, so a crashed orchestrator
//! loses nothing: the recovery worker finds instances that stopped moving
//! and resumes them from the persisted step. Step commands carry event ids
//! derived from `(correlation_id, step_name)`, so a resumed step that
//! re-sends its command is deduplicated by the participant's inbox.

mod error;
pub mod memory;
pub mod metrics;
pub mod orchestrator;
pub mod participant;
pub mod recovery;
pub mod state;
pub mod step;
pub mod store;

pub use error::{SagaError, SagaResult};
pub use memory::InMemorySagaStore;
pub use orchestrator::{OrchestratorConfig, SagaOrchestrator};
pub use participant::{
    compensation_command_id, compensation_reply_id, step_command_id, step_reply_id, CommandSpec,
    EventStep, ReplyOutcome, ReplyRouter,
};
pub use recovery::{RecoverySweep, RecoveryWorker, RecoveryWorkerConfig};
pub use state::{SagaState, SagaStatus};
pub use step::{
    merge_state, CompensationError, SagaDefinition, SagaStep, StepContext, StepResult,
};
pub use store::{SagaStateStore, SqlxSagaStateStore};
