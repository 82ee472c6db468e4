use std::sync::Arc;

use anyhow::{Context, Result};
use drip::config::DripConfig;
use drip::crm::{CrmApi, HttpCrmClient};
use drip::persistence::{PostgresQueueStore, QueueStore};
use drip::reliability::{
    AlertSink, FailureBurstConfig, FailureBurstTracker, TracingAlertSink, WebhookAlertSink,
};
use drip::stream::{RedisStreamTransport, StreamTransport};
use drip::telemetry::{init_telemetry, TelemetryConfig};
use drip::worker::{Deliverer, WorkerPool, WorkerPoolConfig};
use sqlx::postgres::PgPoolOptions;

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();

    // Configure via environment variables:
    // - DRIP_SERVICE_NAME: Service name (default: "drip-worker")
    // - RUST_LOG or LOG_LEVEL: Log filter (default: "drip=info")
    // - LOG_FORMAT: "json" or "pretty"
    let mut telemetry_config = TelemetryConfig::from_env();
    if telemetry_config.service_name == "drip" {
        telemetry_config.service_name = "drip-worker".to_string();
    }
    if telemetry_config.log_filter.is_none() {
        telemetry_config.log_filter = Some("drip=info".to_string());
    }
    init_telemetry(telemetry_config);

    tracing::info!("drip-worker starting...");

    let config = DripConfig::from_env().context("Invalid configuration")?;

    // Queue reads and subject removal only; migrations belong to the scheduler
    let pool = PgPoolOptions::new()
        .max_connections(config.database_max_connections)
        .connect(&config.database_url)
        .await
        .context("Failed to connect to database")?;
    let store: Arc<dyn QueueStore> = Arc::new(PostgresQueueStore::new(pool));

    let transport: Arc<dyn StreamTransport> = Arc::new(
        RedisStreamTransport::connect(&config.redis_url)
            .await
            .context("Failed to connect to Redis")?,
    );

    let crm: Arc<dyn CrmApi> =
        Arc::new(HttpCrmClient::new(&config.crm_base_url).context("Failed to build CRM client")?);

    let sink: Arc<dyn AlertSink> = match &config.alert_webhook_url {
        Some(url) => Arc::new(WebhookAlertSink::new(url).context("Failed to build alert sink")?),
        None => Arc::new(TracingAlertSink),
    };
    let failures = Arc::new(FailureBurstTracker::new(FailureBurstConfig::default(), sink));

    let mut pool_config = WorkerPoolConfig::default().with_consumer_group(&config.consumer_group);
    if let Some(worker_id) = &config.worker_id {
        pool_config = pool_config.with_worker_id(worker_id);
    }

    let deliverer = Arc::new(Deliverer::new(
        store.clone(),
        crm,
        transport.clone(),
        failures,
        pool_config.consumer_group.clone(),
        pool_config.delivery,
    ));

    let worker_pool = WorkerPool::new(store, transport, deliverer, pool_config);

    tracing::info!(
        worker_id = %worker_pool.worker_id(),
        consumer_group = %config.consumer_group,
        "Starting worker pool"
    );

    worker_pool.start().context("Failed to start worker pool")?;

    tokio::signal::ctrl_c()
        .await
        .context("Failed to listen for shutdown signal")?;
    tracing::info!("Received shutdown signal");

    worker_pool.shutdown().await;

    tracing::info!("Worker shutdown complete");
    Ok(())
}
