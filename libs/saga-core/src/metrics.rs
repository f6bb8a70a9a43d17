use prometheus::{IntCounter, Opts};
use tracing::warn;

#[derive(Clone)]
pub struct SagaMetrics {
    pub started: IntCounter,
    pub completed: IntCounter,
    pub compensated: IntCounter,
    pub failed: IntCounter,
}

impl SagaMetrics {
    pub fn new(service: &str, saga_type: &str) -> Self {
        let registry = prometheus::default_registry();

        let counter = |name: &str, help: &str| {
            IntCounter::with_opts(
                Opts::new(name, help)
                    .const_label("service", service.to_string())
                    .const_label("saga_type", saga_type.to_string()),
            )
            .expect("valid saga metric opts")
        };

        let started = counter("saga_started_total", "Total saga instances started");
        let completed = counter(
            "saga_completed_total",
            "Total saga instances reaching Completed",
        );
        let compensated = counter(
            "saga_compensated_total",
            "Total saga instances fully undone after a step failure",
        );
        let failed = counter(
            "saga_failed_total",
            "Total saga instances ending Failed (compensation incomplete)",
        );

        for metric in [
            Box::new(started.clone()) as Box<dyn prometheus::core::Collector>,
            Box::new(completed.clone()),
            Box::new(compensated.clone()),
            Box::new(failed.clone()),
        ] {
            if let Err(e) = registry.register(metric) {
                warn!("Failed to register saga metric: {}", e);
            }
        }

        Self {
            started,
            completed,
            compensated,
            failed,
        }
    }
}
