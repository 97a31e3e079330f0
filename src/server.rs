//! # Server Configuration
//!
//! Router assembly, shared state, and the serve loop for the commerce connectors API.

use std::sync::Arc;

use axum::{
    Router,
    extract::{DefaultBodyLimit, Request},
    http::HeaderValue,
    middleware::{self, Next},
    response::Response,
    routing::{get, post},
};
use sea_orm::DatabaseConnection;
use tokio_util::sync::CancellationToken;
use tower_http::trace::TraceLayer;
use tokio::task::JoinHandle;
use tracing::{error, info};
use utoipa::OpenApi;
use utoipa_swagger_ui::SwaggerUi;

use crate::config::AppConfig;
use crate::connectors::Registry;
use crate::crypto::CryptoKey;
use crate::handlers;
use crate::request_queue::{QueueRegistry, ReqwestTransport};
use crate::scheduler::SyncScheduler;
use crate::sync_orchestrator::SyncOrchestrator;
use crate::telemetry::{REQUEST_ID_HEADER, TraceContext, with_trace_context};

/// Application state containing shared resources
#[derive(Clone)]
pub struct AppState {
    pub config: Arc<AppConfig>,
    pub db: Arc<DatabaseConnection>,
    pub orchestrator: Arc<SyncOrchestrator>,
}

impl AppState {
    /// Wire the orchestrator and its collaborators over an open database.
    pub fn build(config: AppConfig, db: DatabaseConnection) -> anyhow::Result<Self> {
        let crypto_key = match &config.crypto_key {
            Some(bytes) => CryptoKey::new(bytes.clone())?,
            None => {
                tracing::warn!(
                    profile = %config.profile,
                    "CONNECTORS_CRYPTO_KEY not set; using an ephemeral key, stored credentials will not survive a restart"
                );
                CryptoKey::ephemeral()
            }
        };

        let transport = ReqwestTransport::new(config.queue.request_timeout())?;
        let queues = Arc::new(QueueRegistry::new(
            Arc::new(transport),
            config.queue.clone(),
            config.rate_limit_policy.clone(),
        ));
        Ok(Self::with_parts(config, db, crypto_key, Registry::from_config, queues))
    }

    /// Assemble state from explicit parts; tests inject their own registry and transport.
    pub fn with_parts(
        config: AppConfig,
        db: DatabaseConnection,
        crypto_key: CryptoKey,
        registry: impl FnOnce(&AppConfig) -> Registry,
        queues: Arc<QueueRegistry>,
    ) -> Self {
        let db = Arc::new(db);
        let registry = Arc::new(registry(&config));
        let orchestrator = Arc::new(SyncOrchestrator::new(
            db.clone(),
            crypto_key,
            registry,
            queues,
            &config,
        ));
        Self {
            config: Arc::new(config),
            db,
            orchestrator,
        }
    }
}

/// Runs every request inside a trace context keyed by `x-request-id` and echoes the id back.
async fn trace_context_middleware(request: Request, next: Next) -> Response {
    let context = TraceContext::from_request_id(
        request
            .headers()
            .get(REQUEST_ID_HEADER)
            .and_then(|value| value.to_str().ok()),
    );
    let trace_id = context.trace_id.clone();

    let mut response = with_trace_context(context, next.run(request)).await;
    if let Ok(value) = HeaderValue::from_str(&trace_id) {
        response.headers_mut().insert(REQUEST_ID_HEADER, value);
    }
    response
}

/// Creates and configures the Axum application router
pub fn create_app(state: AppState) -> Router {
    let webhook_limit = DefaultBodyLimit::max(state.config.webhooks.max_body_bytes());

    let webhooks = Router::new()
        .route(
            "/webhooks/{provider}",
            post(handlers::webhooks::receive_webhook).get(handlers::webhooks::webhook_challenge),
        )
        .route(
            "/webhooks/{provider}/{connection_id}",
            post(handlers::webhooks::receive_connection_webhook)
                .get(handlers::webhooks::connection_webhook_challenge),
        )
        .layer(webhook_limit);

    Router::new()
        .route("/", get(handlers::root))
        .route("/healthz", get(handlers::healthz))
        .route("/connections", post(handlers::connections::create_connection))
        .route("/connections/{id}", get(handlers::connections::get_connection))
        .route(
            "/connections/{id}/test",
            post(handlers::connections::test_connection),
        )
        .route(
            "/connections/{id}/disconnect",
            post(handlers::connections::disconnect_connection),
        )
        .route(
            "/connections/{id}/metrics",
            get(handlers::connections::list_metrics),
        )
        .route("/connections/{id}/sync", post(handlers::sync::trigger_sync))
        .route(
            "/connections/{id}/sync/cancel",
            post(handlers::sync::cancel_sync),
        )
        .route("/sync-tasks/{task_id}", get(handlers::sync::get_sync_task))
        .merge(webhooks)
        .with_state(state)
        .merge(SwaggerUi::new("/docs").url("/openapi.json", ApiDoc::openapi()))
        .layer(TraceLayer::new_for_http())
        .layer(middleware::from_fn(trace_context_middleware))
}

/// Starts the server and, when enabled, the sync scheduler. Both stop on ctrl-c.
pub async fn run_server(config: AppConfig, db: DatabaseConnection) -> anyhow::Result<()> {
    let addr = config.bind_addr()?;
    let scheduler_config = config.scheduler.clone();
    let state = AppState::build(config, db)?;
    let orchestrator = state.orchestrator.clone();

    let shutdown = CancellationToken::new();
    let scheduler = scheduler_config.enabled.then(|| {
        let scheduler = SyncScheduler::new(orchestrator.clone(), scheduler_config);
        tokio::spawn(scheduler.run(shutdown.child_token()))
    });

    let app = create_app(state);
    let listener = tokio::net::TcpListener::bind(addr).await?;
    info!(%addr, "server listening");

    let signal = shutdown.clone();
    axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            if let Err(err) = tokio::signal::ctrl_c().await {
                // Without a signal handler the server runs until the process is killed.
                error!(error = %err, "failed to listen for shutdown signal");
                std::future::pending::<()>().await;
            }
            info!("shutdown signal received");
            signal.cancel();
        })
        .await?;

    shutdown.cancel();
    orchestrator.shutdown();
    if let Some(handle) = scheduler {
        join_scheduler(handle).await;
    }
    Ok(())
}

/// Waits for the scheduler task, logging a panic instead of dropping it. Returns whether
/// it exited cleanly.
async fn join_scheduler(handle: JoinHandle<()>) -> bool {
    match handle.await {
        Ok(()) => true,
        Err(err) => {
            error!(error = %err, "scheduler task failed");
            false
        }
    }
}

/// OpenAPI documentation
#[derive(OpenApi)]
#[openapi(
    paths(
        crate::handlers::root,
        crate::handlers::healthz,
        crate::handlers::webhooks::receive_webhook,
        crate::handlers::webhooks::receive_connection_webhook,
        crate::handlers::webhooks::webhook_challenge,
        crate::handlers::webhooks::connection_webhook_challenge,
        crate::handlers::connections::create_connection,
        crate::handlers::connections::get_connection,
        crate::handlers::connections::test_connection,
        crate::handlers::connections::disconnect_connection,
        crate::handlers::connections::list_metrics,
        crate::handlers::sync::trigger_sync,
        crate::handlers::sync::cancel_sync,
        crate::handlers::sync::get_sync_task,
    ),
    components(
        schemas(
            crate::models::ServiceInfo,
            crate::error::ApiError,
            crate::connectors::Provider,
            crate::handlers::HealthResponse,
            crate::handlers::webhooks::WebhookLiveness,
            crate::handlers::connections::CreateConnectionRequest,
            crate::handlers::connections::ConnectionInfo,
            crate::handlers::connections::MetricRecordInfo,
            crate::handlers::connections::MetricsPage,
            crate::handlers::sync::CancelSyncResponse,
            crate::sync_orchestrator::SyncPhase,
            crate::sync_orchestrator::SyncOutcome,
            crate::sync_orchestrator::SyncReport,
            crate::sync_orchestrator::EntitySyncResult,
            crate::sync_orchestrator::EntitySyncError,
            crate::sync_orchestrator::ConnectionTestReport,
            crate::sync_orchestrator::WebhookOutcome,
            crate::sync_orchestrator::WebhookStatus,
            crate::sync_tasks::SyncTask,
            crate::sync_tasks::TaskStatus,
            crate::sync_tasks::SyncTrigger,
        )
    ),
    tags(
        (name = "root", description = "Service information and health"),
        (name = "webhooks", description = "Inbound provider webhooks"),
        (name = "connections", description = "Connection lifecycle and metric reads"),
        (name = "sync", description = "Backfill triggers and task status"),
    ),
    info(
        title = "Commerce Connectors API",
        description = "Shopify and Stripe ingestion into canonical metric records",
        version = env!("CARGO_PKG_VERSION"),
    )
)]
pub struct ApiDoc;
