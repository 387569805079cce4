use std::net::SocketAddr;
use std::sync::Arc;

use axum::routing::get;
use axum_prometheus::PrometheusMetricLayer;
use pve_billing_bridge::billing::{spawn_billing_flush, BillingBridge, BillingStore, BillingWriter, PgBillingStore};
use pve_billing_bridge::config::AppConfig;
use pve_billing_bridge::dispatch::ActionContext;
use pve_billing_bridge::extractor::JwtSecret;
use pve_billing_bridge::hypervisor::{HypervisorClient, ProxmoxClient};
use pve_billing_bridge::ledger::{PgLedger, ResourceLedger};
use pve_billing_bridge::orchestrator::{spawn_health_check, spawn_reconciler, spawn_usage_poller, Orchestrator};
use pve_billing_bridge::routes::{router, AppState};
use sqlx::postgres::PgPoolOptions;
use tracing_subscriber::{fmt, EnvFilter};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .json()
        .init();

    dotenvy::dotenv().ok();
    // Fail fast on missing or malformed settings
    let config = AppConfig::from_env()?;
    let pool = PgPoolOptions::new()
        .max_connections(config.database_max_connections)
        .connect(&config.database_url)
        .await?;

    if let Err(error) = sqlx::migrate!().run(&pool).await {
        if config.allow_migration_failure {
            tracing::warn!(
                ?error,
                "Database migrations failed but continuing due to ALLOW_MIGRATION_FAILURE"
            );
        } else {
            return Err(Box::new(error) as Box<dyn std::error::Error>);
        }
    }

    let ledger: Arc<dyn ResourceLedger> = Arc::new(PgLedger::new(pool.clone()));
    let cluster = ledger.upsert_cluster(&config.cluster_settings()).await?;
    tracing::info!(cluster = cluster.id, hostname = %cluster.hostname, "cluster connection registered");

    let hypervisor: Arc<dyn HypervisorClient> = Arc::new(ProxmoxClient::new(config.proxmox.clone())?);
    let store: Arc<dyn BillingStore> = Arc::new(PgBillingStore::new(pool.clone()));
    let writer = Arc::new(BillingWriter::new(
        store,
        config.billing_write_timeout,
        config.retry.clone(),
    ));
    let orchestrator = Arc::new(Orchestrator::new(
        ledger,
        hypervisor,
        writer.clone(),
        config.orchestrator_config(cluster.id),
    ));
    let bridge = Arc::new(BillingBridge::new(
        orchestrator.clone(),
        config.managed_note.clone(),
    ));

    spawn_reconciler(orchestrator.clone(), config.reconcile_interval);
    spawn_usage_poller(
        orchestrator.clone(),
        config.usage_poll_interval,
        config.usage_poll_concurrency,
    );
    spawn_health_check(orchestrator.clone(), config.health_check_interval);
    spawn_billing_flush(writer, config.billing_flush_interval);

    let state = Arc::new(AppState::new(ActionContext {
        bridge,
        usage_max_age: config.usage_max_age(),
    }));
    let (prometheus_layer, metrics_handle) = PrometheusMetricLayer::pair();
    let app = router(state, JwtSecret::new(config.shared_secret.clone()))
        .route(
            "/metrics",
            get(move || async move { metrics_handle.render() }),
        )
        .layer(prometheus_layer);

    let addr: SocketAddr = config.bind_addr()?;
    tracing::info!(%addr, "Listening for incoming connections");
    axum::Server::bind(&addr)
        .serve(app.into_make_service())
        .await?;

    Ok(())
}
