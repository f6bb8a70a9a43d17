use prometheus::{IntCounter, Opts};
use tracing::warn;

#[derive(Clone)]
pub struct InboxMetrics {
    pub processed: IntCounter,
    pub duplicates: IntCounter,
    pub dead_lettered: IntCounter,
}

impl InboxMetrics {
    pub fn new(service: &str) -> Self {
        let registry = prometheus::default_registry();

        let processed = IntCounter::with_opts(
            Opts::new(
                "inbox_processed_total",
                "Total events whose handler transaction committed",
            )
            .const_label("service", service.to_string()),
        )
        .expect("valid metric opts for inbox_processed_total");

        let duplicates = IntCounter::with_opts(
            Opts::new(
                "inbox_duplicates_total",
                "Total redeliveries dropped by event-id deduplication",
            )
            .const_label("service", service.to_string()),
        )
        .expect("valid metric opts for inbox_duplicates_total");

        let dead_lettered = IntCounter::with_opts(
            Opts::new(
                "inbox_dead_lettered_total",
                "Total events quarantined after exhausting the attempt budget",
            )
            .const_label("service", service.to_string()),
        )
        .expect("valid metric opts for inbox_dead_lettered_total");

        for metric in [
            Box::new(processed.clone()) as Box<dyn prometheus::core::Collector>,
            Box::new(duplicates.clone()),
            Box::new(dead_lettered.clone()),
        ] {
            if let Err(e) = registry.register(metric) {
                warn!("Failed to register inbox metric: {}", e);
            }
        }

        Self {
            processed,
            duplicates,
            dead_lettered,
        }
    }
}
