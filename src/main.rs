use axum::routing::{get, post};
use axum::Router;
use payments_reconciler::config::AppConfig;
use payments_reconciler::gateway::http::HttpGatewayClient;
use payments_reconciler::gateway::GatewayClient;
use payments_reconciler::http::handlers::webhook;
use payments_reconciler::lock::redis::RedisLock;
use payments_reconciler::service::events::ReconciliationHandlers;
use payments_reconciler::service::gate::IngestionGate;
use payments_reconciler::service::sweeper::QueueSweeper;
use payments_reconciler::store::postgres::{PgObligationStore, PgWebhookQueueStore};
use payments_reconciler::store::{NamedLock, ObligationStore, WebhookQueueStore};
use payments_reconciler::AppState;
use sqlx::postgres::PgPoolOptions;
use std::sync::Arc;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    let cfg = AppConfig::from_env();

    let pool = PgPoolOptions::new()
        .max_connections(10)
        .connect(&cfg.database_url)
        .await?;

    sqlx::migrate!("./migrations").run(&pool).await?;

    let redis_client = redis::Client::open(cfg.redis_url.clone())?;

    let queue: Arc<dyn WebhookQueueStore> = Arc::new(PgWebhookQueueStore { pool: pool.clone() });
    let store: Arc<dyn ObligationStore> = Arc::new(PgObligationStore { pool: pool.clone() });
    let lock: Arc<dyn NamedLock> = Arc::new(RedisLock::new(redis_client));
    let gateway: Arc<dyn GatewayClient> = Arc::new(HttpGatewayClient::new(
        cfg.gateway_base_url.clone(),
        cfg.gateway_secret_key.clone(),
    ));

    let handlers = Arc::new(ReconciliationHandlers::new(
        cfg.processor_id.clone(),
        store.clone(),
        queue.clone(),
        lock,
        gateway.clone(),
        &cfg.gate,
    ));
    let gate = Arc::new(IngestionGate {
        config: cfg.gate.clone(),
        processor_id: cfg.processor_id.clone(),
        queue,
        store,
        gateway,
        handlers,
    });

    tokio::spawn(QueueSweeper::new(gate.clone(), cfg.sweep_interval_ms).run());

    let state = AppState { gate };
    let app = Router::new()
        .route("/health", get(webhook::health))
        .route("/webhook", post(webhook::receive))
        .route("/webhooks", get(webhook::list))
        .with_state(state);

    let listener = tokio::net::TcpListener::bind(&cfg.bind_addr).await?;
    tracing::info!("listening on {}", cfg.bind_addr);
    axum::serve(listener, app).await?;
    Ok(())
}
