/// Order Service Main Entry Point
///
/// Starts the order orchestration host:
/// - PostgreSQL connection pool
/// - Kafka transport (producer + manual-commit consumer)
/// - Outbox relay (background task)
/// - Inbox consumer for the submit command and participant replies
/// - Recovery worker (stuck sagas, expired leases, stalled inbox rows)
/// - Inbox compaction job
use anyhow::{Context, Result};
use order_service::{
    config::Settings,
    consumers::ConsumerLoop,
    handlers::build_registry,
    saga::{build_order_saga, ORDER_SAGA_TYPE},
    workers::{run_inbox_compaction, InboxRedispatchSweep, OutboxLeaseSweep},
};
use sqlx::postgres::PgPoolOptions;
use std::sync::Arc;
use tokio::signal;
use tokio::sync::watch;
use tracing::info;

use dead_letter::SqlxDeadLetterStore;
use event_schema::topics;
use idempotent_inbox::{metrics::InboxMetrics, InboxConfig, InboxFilter};
use message_transport::{KafkaSubscription, KafkaTransport};
use saga_core::{
    metrics::SagaMetrics, OrchestratorConfig, RecoveryWorker, RecoveryWorkerConfig, ReplyRouter,
    SagaOrchestrator, SqlxSagaStateStore,
};
use transactional_outbox::{
    metrics::OutboxMetrics, OutboxRelay, OutboxRelayConfig, SqlxOutboxStore,
};

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize tracing
    tracing_subscriber::fmt()
        .with_env_filter(
            std::env::var("RUST_LOG").unwrap_or_else(|_| "order_service=info,info".into()),
        )
        .with_target(false)
        .json()
        .init();

    info!("Starting Order Service");

    let settings = Settings::load().context("Failed to load configuration")?;
    info!("Configuration loaded successfully");

    // Database pool
    let db_pool = PgPoolOptions::new()
        .max_connections(settings.database.max_connections)
        .acquire_timeout(settings.database.acquire_timeout)
        .connect(&settings.database.url)
        .await
        .context("Failed to connect to PostgreSQL")?;
    info!(
        "Database pool initialized with {} max connections",
        settings.database.max_connections
    );

    // Stores
    let outbox = Arc::new(SqlxOutboxStore::new(db_pool.clone()));
    let dlq = Arc::new(SqlxDeadLetterStore::new(db_pool.clone()));
    let saga_store = Arc::new(SqlxSagaStateStore::new(db_pool.clone()));

    // Transport
    let transport = Arc::new(
        KafkaTransport::connect(&settings.kafka.brokers, &settings.service_name)
            .context("Failed to create Kafka producer")?,
    );

    // Saga wiring
    let router = Arc::new(ReplyRouter::new());
    let definition = build_order_saga(
        db_pool.clone(),
        outbox.clone(),
        router.clone(),
        settings.saga.step_timeout,
    );
    let orchestrator = Arc::new(
        SagaOrchestrator::new(
            saga_store.clone(),
            Arc::new(definition),
            OrchestratorConfig {
                step_timeout: settings.saga.step_timeout,
                compensation_timeout: settings.saga.step_timeout,
            },
        )
        .with_metrics(SagaMetrics::new(&settings.service_name, ORDER_SAGA_TYPE)),
    );

    // Inbox
    let registry = Arc::new(build_registry(orchestrator.clone(), router));
    let inbox = Arc::new(
        InboxFilter::new(
            db_pool.clone(),
            registry,
            dlq.clone(),
            InboxConfig {
                service_name: settings.service_name.clone(),
                max_attempts: settings.inbox.max_attempts,
                retention: settings.inbox.retention,
            },
        )
        .with_metrics(InboxMetrics::new(&settings.service_name)),
    );

    // Subscription: the submit command topic plus the participant reply
    // topics this orchestrator waits on.
    let prefix = settings.kafka.topic_prefix.as_str();
    let subscribe_topics = [
        topics::commands_topic(prefix, "order"),
        topics::events_topic(prefix, "inventory"),
        topics::events_topic(prefix, "payment"),
        topics::events_topic(prefix, "shipping"),
    ];
    let topic_refs: Vec<&str> = subscribe_topics.iter().map(String::as_str).collect();
    let subscription = Arc::new(
        KafkaSubscription::connect(
            &settings.kafka.brokers,
            &settings.kafka.consumer_group,
            &settings.service_name,
            &topic_refs,
        )
        .context("Failed to create Kafka consumer")?,
    );

    // Workers
    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let relay = OutboxRelay::new(
        outbox.clone(),
        transport,
        dlq.clone(),
        OutboxRelayConfig {
            poll_interval: settings.outbox.poll_interval,
            batch_size: settings.outbox.batch_size,
            max_retries: settings.outbox.max_retries,
            topic_prefix: settings.kafka.topic_prefix.clone(),
            service_name: settings.service_name.clone(),
            dlq_enabled: settings.dlq.enabled,
            ..Default::default()
        },
    )
    .with_metrics(OutboxMetrics::new(&settings.service_name));

    let consumer = ConsumerLoop::new(
        subscription,
        inbox.clone(),
        dlq,
        settings.dlq.enabled,
        settings.service_name.clone(),
    );

    let recovery = RecoveryWorker::new(
        saga_store,
        RecoveryWorkerConfig {
            scan_interval: settings.saga.recovery_interval,
            stuck_threshold: settings.saga.stuck_threshold,
        },
    )
    .register_orchestrator(orchestrator)
    .register_sweep(Arc::new(OutboxLeaseSweep::new(outbox)))
    .register_sweep(Arc::new(InboxRedispatchSweep::new(
        inbox.clone(),
        settings.outbox.batch_size,
    )));

    let relay_handle = tokio::spawn({
        let shutdown = shutdown_rx.clone();
        async move { relay.run(shutdown).await }
    });
    let consumer_handle = tokio::spawn({
        let shutdown = shutdown_rx.clone();
        async move { consumer.run(shutdown).await }
    });
    let recovery_handle = tokio::spawn({
        let shutdown = shutdown_rx.clone();
        async move { recovery.run(shutdown).await }
    });
    let compaction_handle = tokio::spawn({
        let shutdown = shutdown_rx.clone();
        let interval = settings.inbox.cleanup_interval;
        async move { run_inbox_compaction(inbox, interval, shutdown).await }
    });

    info!("Order service running; press ctrl-c to stop");

    signal::ctrl_c()
        .await
        .context("Failed to listen for shutdown signal")?;
    info!("Shutdown signal received");

    shutdown_tx
        .send(true)
        .context("Failed to propagate shutdown")?;

    for handle in [
        relay_handle,
        consumer_handle,
        recovery_handle,
        compaction_handle,
    ] {
        let _ = handle.await;
    }

    info!("Order service stopped");

    Ok(())
}
