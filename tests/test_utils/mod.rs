//! Shared fixtures for the integration tests: an in-memory database, an app state wired
//! to a real HTTP transport, and webhook signing helpers.

#![allow(dead_code)]

use std::sync::Arc;

use anyhow::Result;
use axum::{
    Router,
    body::{Body, to_bytes},
    http::{Request, StatusCode},
};
use commerce_connectors::{
    config::AppConfig,
    connectors::{Provider, Registry},
    crypto::CryptoKey,
    db,
    models::connection,
    repositories::NewConnection,
    request_queue::{QueueRegistry, ReqwestTransport},
    server::{AppState, create_app},
    webhook_verification::{SHOPIFY_SIGNATURE_HEADER, STRIPE_SIGNATURE_HEADER, sign_shopify, sign_stripe},
};
use sea_orm::DatabaseConnection;
use serde_json::Value;
use tower::ServiceExt;
use uuid::Uuid;

pub const SHOPIFY_SECRET: &str = "shpss_integration";
pub const STRIPE_SECRET: &str = "whsec_integration";
pub const TEST_KEY: [u8; 32] = [42u8; 32];

/// Test profile config with webhook secrets set and retries that never sleep.
pub fn test_config() -> AppConfig {
    let mut config = AppConfig {
        profile: "test".to_string(),
        database_url: "sqlite::memory:".to_string(),
        db_max_connections: 1,
        ..AppConfig::default()
    };
    config.webhooks.shopify_secret = Some(SHOPIFY_SECRET.to_string());
    config.webhooks.stripe_secret = Some(STRIPE_SECRET.to_string());
    config.rate_limit_policy.base_seconds = 0;
    config.rate_limit_policy.max_seconds = 0;
    config.rate_limit_policy.jitter_factor = 0.0;
    config.rate_limit_policy.max_attempts = 2;
    config.scheduler.enabled = false;
    config
}

/// Sets up an in-memory SQLite database with all migrations applied.
pub async fn setup_test_db(config: &AppConfig) -> Result<DatabaseConnection> {
    let db = db::init_pool(config).await?;
    db::run_migrations(&db).await?;
    Ok(db)
}

/// App state over a fresh database; outbound calls go through reqwest.
pub async fn test_state(config: AppConfig) -> Result<AppState> {
    let db = setup_test_db(&config).await?;
    let transport = Arc::new(ReqwestTransport::new(config.queue.request_timeout())?);
    let queues = Arc::new(QueueRegistry::new(
        transport,
        config.queue.clone(),
        config.rate_limit_policy.clone(),
    ));
    Ok(AppState::with_parts(
        config,
        db,
        CryptoKey::new(TEST_KEY.to_vec())?,
        Registry::from_config,
        queues,
    ))
}

pub async fn test_app(config: AppConfig) -> Result<(AppState, Router)> {
    let state = test_state(config).await?;
    let app = create_app(state.clone());
    Ok((state, app))
}

pub async fn create_connection(
    state: &AppState,
    provider: Provider,
    account: &str,
) -> Result<connection::Model> {
    Ok(state
        .orchestrator
        .connections()
        .create(NewConnection {
            organization_id: Uuid::new_v4(),
            provider,
            provider_account_id: account,
            credential: "test-credential",
            settings: None,
        })
        .await?)
}

pub fn stripe_request(uri: &str, body: &str, timestamp: i64) -> Request<Body> {
    let signature = sign_stripe(body.as_bytes(), STRIPE_SECRET, timestamp).unwrap();
    Request::builder()
        .method("POST")
        .uri(uri)
        .header("content-type", "application/json")
        .header(STRIPE_SIGNATURE_HEADER, signature)
        .body(Body::from(body.to_string()))
        .unwrap()
}

pub fn shopify_request(uri: &str, topic: &str, shop: &str, webhook_id: &str, body: &str) -> Request<Body> {
    let signature = sign_shopify(body.as_bytes(), SHOPIFY_SECRET).unwrap();
    Request::builder()
        .method("POST")
        .uri(uri)
        .header("content-type", "application/json")
        .header(SHOPIFY_SIGNATURE_HEADER, signature)
        .header("x-shopify-topic", topic)
        .header("x-shopify-shop-domain", shop)
        .header("x-shopify-webhook-id", webhook_id)
        .body(Body::from(body.to_string()))
        .unwrap()
}

pub async fn send(app: &Router, request: Request<Body>) -> (StatusCode, Value) {
    let response = app.clone().oneshot(request).await.unwrap();
    let status = response.status();
    let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
    let body = serde_json::from_slice(&bytes).unwrap_or(Value::Null);
    (status, body)
}
