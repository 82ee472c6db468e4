use std::sync::Arc;

use anyhow::{Context, Result};
use drip::config::DripConfig;
use drip::crm::{CrmApi, HttpCrmClient};
use drip::persistence::{PostgresQueueStore, QueueStore};
use drip::scheduler::{PromotionScheduler, SchedulerConfig};
use drip::stream::{RedisStreamTransport, StreamTransport};
use drip::telemetry::{init_telemetry, TelemetryConfig};
use drip::TenantCache;
use sqlx::postgres::PgPoolOptions;
use tokio::sync::watch;

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();

    // Configure via environment variables:
    // - DRIP_SERVICE_NAME: Service name (default: "drip-scheduler")
    // - RUST_LOG or LOG_LEVEL: Log filter (default: "drip=info")
    // - LOG_FORMAT: "json" or "pretty"
    let mut telemetry_config = TelemetryConfig::from_env();
    if telemetry_config.service_name == "drip" {
        telemetry_config.service_name = "drip-scheduler".to_string();
    }
    if telemetry_config.log_filter.is_none() {
        telemetry_config.log_filter = Some("drip=info".to_string());
    }
    init_telemetry(telemetry_config);

    tracing::info!("drip-scheduler starting...");

    let config = DripConfig::from_env().context("Invalid configuration")?;

    let pool = PgPoolOptions::new()
        .max_connections(config.database_max_connections)
        .connect(&config.database_url)
        .await
        .context("Failed to connect to database")?;
    let store = PostgresQueueStore::new(pool);
    store.migrate().await.context("Failed to run migrations")?;
    let store: Arc<dyn QueueStore> = Arc::new(store);

    let transport: Arc<dyn StreamTransport> = Arc::new(
        RedisStreamTransport::connect(&config.redis_url)
            .await
            .context("Failed to connect to Redis")?,
    );

    let crm: Arc<dyn CrmApi> =
        Arc::new(HttpCrmClient::new(&config.crm_base_url).context("Failed to build CRM client")?);
    let cache = TenantCache::new(store.clone(), crm, config.default_timezone());

    let scheduler = PromotionScheduler::new(
        store,
        transport,
        cache,
        config.business_hours(),
        SchedulerConfig::default(),
    );

    tracing::info!(
        business_start = config.business_hours().start_hour(),
        business_end = config.business_hours().end_hour(),
        default_timezone = %config.default_timezone(),
        "Starting promotion scheduler"
    );

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    tokio::spawn(async move {
        match tokio::signal::ctrl_c().await {
            Ok(()) => tracing::info!("Received shutdown signal"),
            Err(e) => tracing::error!(error = %e, "Failed to listen for shutdown signal"),
        }
        let _ = shutdown_tx.send(true);
    });

    // Returns once the shutdown signal flips the watch channel
    scheduler.run(shutdown_rx).await;

    tracing::info!("Scheduler shutdown complete");
    Ok(())
}
