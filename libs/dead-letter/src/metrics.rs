use prometheus::{IntCounter, IntGauge, Opts};
use tracing::warn;

#[derive(Clone)]
pub struct DeadLetterMetrics {
    pub depth: IntGauge,
    pub enqueued: IntCounter,
    pub reprocessed: IntCounter,
}

impl DeadLetterMetrics {
    pub fn new(service: &str) -> Self {
        let registry = prometheus::default_registry();

        let depth = IntGauge::with_opts(
            Opts::new(
                "dlq_depth",
                "Number of unreprocessed dead-letter entries for this service",
            )
            .const_label("service", service.to_string()),
        )
        .expect("valid metric opts for dlq_depth");

        let enqueued = IntCounter::with_opts(
            Opts::new("dlq_enqueued_total", "Total messages moved to the DLQ")
                .const_label("service", service.to_string()),
        )
        .expect("valid metric opts for dlq_enqueued_total");

        let reprocessed = IntCounter::with_opts(
            Opts::new(
                "dlq_reprocessed_total",
                "Total dead-letter entries replayed by operators",
            )
            .const_label("service", service.to_string()),
        )
        .expect("valid metric opts for dlq_reprocessed_total");

        for metric in [
            Box::new(depth.clone()) as Box<dyn prometheus::core::Collector>,
            Box::new(enqueued.clone()),
            Box::new(reprocessed.clone()),
        ] {
            if let Err(e) = registry.register(metric) {
                warn!("Failed to register DLQ metric: {}", e);
            }
        }

        Self {
            depth,
            enqueued,
            reprocessed,
        }
    }
}
