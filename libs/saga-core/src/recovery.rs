//! Recovery worker: the periodic scan that makes crashes survivable.
//!
//! Every interval it looks for saga instances that stopped moving (still
//! `InProgress` or `Compensating` past the stuck threshold), claims each
//! with a version-bump lease, and resumes it through the orchestrator
//! registered for its type. Losing the claim means another worker got
//! there first; the loser backs off.
//!
//! Hosts also register sweeps for the adjacent backlogs (expired outbox
//! leases, stalled inbox rows); they run after the saga scan each cycle.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::time::sleep;
use tracing::{debug, error, info, warn};

use crate::{SagaOrchestrator, SagaStateStore, SagaStatus};

/// A host-provided backlog sweep run each scan cycle. Returns how many
/// items it resolved.
#[async_trait::async_trait]
pub trait RecoverySweep: Send + Sync {
    fn name(&self) -> &str;

    async fn sweep(&self) -> anyhow::Result<u64>;
}

#[derive(Debug, Clone)]
pub struct RecoveryWorkerConfig {
    pub scan_interval: Duration,
    /// How long an instance may sit unchanged in a non-terminal status
    /// before it counts as stuck.
    pub stuck_threshold: Duration,
}

impl Default for RecoveryWorkerConfig {
    fn default() -> Self {
        Self {
            scan_interval: Duration::from_secs(60),
            stuck_threshold: Duration::from_secs(120),
        }
    }
}

#[derive(Debug, Default, Clone, Copy)]
pub struct RecoveryReport {
    pub resumed: u64,
    pub swept: u64,
}

pub struct RecoveryWorker {
    store: Arc<dyn SagaStateStore>,
    orchestrators: HashMap<String, Arc<SagaOrchestrator>>,
    sweeps: Vec<Arc<dyn RecoverySweep>>,
    config: RecoveryWorkerConfig,
}

impl RecoveryWorker {
    pub fn new(store: Arc<dyn SagaStateStore>, config: RecoveryWorkerConfig) -> Self {
        Self {
            store,
            orchestrators: HashMap::new(),
            sweeps: Vec::new(),
            config,
        }
    }

    pub fn register_orchestrator(mut self, orchestrator: Arc<SagaOrchestrator>) -> Self {
        self.orchestrators
            .insert(orchestrator.saga_type().to_string(), orchestrator);
        self
    }

    pub fn register_sweep(mut self, sweep: Arc<dyn RecoverySweep>) -> Self {
        self.sweeps.push(sweep);
        self
    }

    /// Scan loop. Runs until the shutdown channel flips.
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) {
        info!(
            scan_interval_ms = %self.config.scan_interval.as_millis(),
            stuck_threshold_ms = %self.config.stuck_threshold.as_millis(),
            "Recovery worker starting"
        );

        loop {
            match self.scan().await {
                Ok(report) if report.resumed > 0 || report.swept > 0 => {
                    info!(
                        resumed = report.resumed,
                        swept = report.swept,
                        "Recovery scan resolved work"
                    );
                }
                Ok(_) => debug!("Recovery scan found nothing stuck"),
                Err(e) => error!(error = %e, "Recovery scan failed"),
            }

            tokio::select! {
                _ = sleep(self.config.scan_interval) => {}
                _ = shutdown.changed() => {
                    info!("Recovery worker shutting down");
                    break;
                }
            }
        }
    }

    /// One scan pass over stuck sagas and registered sweeps.
    pub async fn scan(&self) -> anyhow::Result<RecoveryReport> {
        let mut report = RecoveryReport::default();

        for status in [SagaStatus::InProgress, SagaStatus::Compensating] {
            let stuck = self
                .store
                .find_stuck(status, self.config.stuck_threshold)
                .await?;

            for state in stuck {
                let Some(orchestrator) = self.orchestrators.get(&state.saga_type) else {
                    warn!(
                        correlation_id = %state.correlation_id,
                        saga_type = %state.saga_type,
                        "Stuck saga of unregistered type"
                    );
                    continue;
                };

                match self
                    .store
                    .claim_for_recovery(state.correlation_id, state.version)
                    .await?
                {
                    Some(claimed) => {
                        info!(
                            correlation_id = %claimed.correlation_id,
                            saga_type = %claimed.saga_type,
                            status = %claimed.status,
                            current_step = claimed.current_step,
                            "Resuming stuck saga"
                        );
                        match orchestrator.resume(claimed.correlation_id).await {
                            Ok(final_state) => {
                                report.resumed += 1;
                                info!(
                                    correlation_id = %final_state.correlation_id,
                                    status = %final_state.status,
                                    "Stuck saga resumed"
                                );
                            }
                            Err(e) => {
                                // Left for the next scan; the lease bump
                                // keeps other workers off it meanwhile.
                                error!(
                                    correlation_id = %state.correlation_id,
                                    error = %e,
                                    "Failed to resume stuck saga"
                                );
                            }
                        }
                    }
                    None => {
                        debug!(
                            correlation_id = %state.correlation_id,
                            "Lost recovery claim to another worker"
                        );
                    }
                }
            }
        }

        for sweep in &self.sweeps {
            match sweep.sweep().await {
                Ok(resolved) => {
                    report.swept += resolved;
                    if resolved > 0 {
                        debug!(sweep = %sweep.name(), resolved, "Sweep resolved entries");
                    }
                }
                Err(e) => error!(sweep = %sweep.name(), error = %e, "Sweep failed"),
            }
        }

        Ok(report)
    }
}
