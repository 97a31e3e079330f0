//! Backfills against mocked Shopify and Stripe APIs over real HTTP.

mod test_utils;

use axum::http::StatusCode;
use commerce_connectors::{
    connectors::{Provider, SyncErrorKind},
    sync_orchestrator::SyncOutcome,
};
use serde_json::{Value, json};
use test_utils::*;
use wiremock::{
    Mock, MockServer, ResponseTemplate,
    matchers::{header, method, path, query_param, query_param_is_missing},
};

fn shopify_orders(ids: std::ops::RangeInclusive<u64>) -> Value {
    let orders: Vec<Value> = ids
        .map(|id| {
            json!({
                "id": id,
                "created_at": "2026-10-01T12:00:00Z",
                "currency": "USD",
                "total_price": "10.00",
                "financial_status": "pending"
            })
        })
        .collect();
    json!({ "orders": orders })
}

async fn mount_shopify_shop(server: &MockServer) {
    Mock::given(method("GET"))
        .and(path("/admin/api/2024-10/shop.json"))
        .and(header("x-shopify-access-token", "test-credential"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({"shop": {"id": 1}})))
        .mount(server)
        .await;
}

async fn mount_order_pages(server: &MockServer) {
    let orders = "/admin/api/2024-10/orders.json";
    Mock::given(method("GET"))
        .and(path(orders))
        .and(query_param("limit", "50"))
        .and(query_param_is_missing("since_id"))
        .respond_with(ResponseTemplate::new(200).set_body_json(shopify_orders(1..=50)))
        .mount(server)
        .await;
    Mock::given(method("GET"))
        .and(path(orders))
        .and(query_param("since_id", "50"))
        .respond_with(ResponseTemplate::new(200).set_body_json(shopify_orders(51..=100)))
        .mount(server)
        .await;
    Mock::given(method("GET"))
        .and(path(orders))
        .and(query_param("since_id", "100"))
        .respond_with(ResponseTemplate::new(200).set_body_json(shopify_orders(101..=112)))
        .mount(server)
        .await;
}

#[tokio::test]
async fn shopify_backfill_pages_through_all_orders_and_reports_failed_entity() {
    let server = MockServer::start().await;
    mount_shopify_shop(&server).await;
    mount_order_pages(&server).await;
    Mock::given(method("GET"))
        .and(path("/admin/api/2024-10/customers.json"))
        .respond_with(ResponseTemplate::new(500))
        .mount(&server)
        .await;

    let mut config = test_config();
    config.providers.shopify_api_base = Some(server.uri());
    let state = test_state(config).await.unwrap();
    let connection = create_connection(&state, Provider::Shopify, "acme.myshopify.com").await.unwrap();

    let report = state.orchestrator.sync_connection(connection.id).await.unwrap();
    assert_eq!(report.outcome, SyncOutcome::PartiallySucceeded);
    assert_eq!(report.records_written, 112);

    let orders = report.entities.iter().find(|e| e.entity_type == "orders").unwrap();
    assert!(orders.completed);
    assert_eq!(orders.pages, 3);
    assert_eq!(orders.records_written, 112);

    assert_eq!(report.errors.len(), 1);
    assert_eq!(report.errors[0].entity_type, "customers");
    assert_eq!(report.errors[0].error.kind, SyncErrorKind::Transient);

    let stored = state
        .orchestrator
        .writer()
        .count_for_connection(connection.id)
        .await
        .unwrap();
    assert_eq!(stored, 112);

    // Partial runs still stamp the connection as synced.
    let reloaded = state
        .orchestrator
        .connections()
        .get_by_id(connection.id)
        .await
        .unwrap()
        .unwrap();
    assert!(reloaded.last_synced_at.is_some());
}

#[tokio::test]
async fn repeated_backfill_writes_nothing_new() {
    let server = MockServer::start().await;
    mount_shopify_shop(&server).await;
    mount_order_pages(&server).await;
    Mock::given(method("GET"))
        .and(path("/admin/api/2024-10/customers.json"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({"customers": [
            {"id": 9, "created_at": "2026-10-02T08:00:00Z", "email": "c@example.com"}
        ]})))
        .mount(&server)
        .await;

    let mut config = test_config();
    config.providers.shopify_api_base = Some(server.uri());
    let state = test_state(config).await.unwrap();
    let connection = create_connection(&state, Provider::Shopify, "acme.myshopify.com").await.unwrap();

    let first = state.orchestrator.sync_connection(connection.id).await.unwrap();
    assert_eq!(first.outcome, SyncOutcome::Succeeded);
    assert_eq!(first.records_written, 113);

    let second = state.orchestrator.sync_connection(connection.id).await.unwrap();
    assert_eq!(second.outcome, SyncOutcome::Succeeded);
    assert_eq!(second.records_written, 0);
    assert_eq!(second.records_skipped, 113);
}

#[tokio::test]
async fn stripe_backfill_follows_starting_after() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/v1/balance"))
        .and(header("authorization", "Bearer test-credential"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({"object": "balance"})))
        .mount(&server)
        .await;

    let charge = |id: &str, amount: i64| {
        json!({
            "id": id,
            "amount": amount,
            "currency": "usd",
            "created": 1_790_000_000,
            "status": "succeeded",
            "paid": true
        })
    };
    Mock::given(method("GET"))
        .and(path("/v1/charges"))
        .and(query_param_is_missing("starting_after"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "object": "list",
            "has_more": true,
            "data": [charge("ch_1", 12345), charge("ch_2", 100)]
        })))
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/v1/charges"))
        .and(query_param("starting_after", "ch_2"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "object": "list",
            "has_more": false,
            "data": [charge("ch_3", 999)]
        })))
        .mount(&server)
        .await;
    for entity in ["refunds", "invoices", "customers"] {
        Mock::given(method("GET"))
            .and(path(format!("/v1/{entity}")))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "object": "list",
                "has_more": false,
                "data": []
            })))
            .mount(&server)
            .await;
    }

    let mut config = test_config();
    config.providers.stripe_api_base = server.uri();
    let state = test_state(config).await.unwrap();
    let connection = create_connection(&state, Provider::Stripe, "acct_backfill").await.unwrap();

    let report = state.orchestrator.sync_connection(connection.id).await.unwrap();
    assert_eq!(report.outcome, SyncOutcome::Succeeded);
    assert_eq!(report.records_written, 3);

    let rows = state
        .orchestrator
        .writer()
        .list(connection.id, None, None, 10)
        .await
        .unwrap();
    let first = rows.iter().find(|r| r.source_event_id == "stripe:charge:ch_1").unwrap();
    assert!((first.value - 123.45).abs() < f64::EPSILON);
}

#[tokio::test]
async fn rejected_credential_marks_the_connection_in_error() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/v1/balance"))
        .respond_with(ResponseTemplate::new(401).set_body_json(json!({"error": {"message": "bad key"}})))
        .mount(&server)
        .await;

    let mut config = test_config();
    config.providers.stripe_api_base = server.uri();
    let (state, app) = test_app(config).await.unwrap();
    let connection = create_connection(&state, Provider::Stripe, "acct_revoked").await.unwrap();

    let (status, report) = send(
        &app,
        axum::http::Request::builder()
            .method("POST")
            .uri(format!("/connections/{}/test", connection.id))
            .body(axum::body::Body::empty())
            .unwrap(),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(report["success"], false);
    assert_eq!(report["status"], "error");
    assert_eq!(report["requires_intervention"], true);

    let report = state.orchestrator.sync_connection(connection.id).await.unwrap();
    assert_eq!(report.outcome, SyncOutcome::Failed);
    assert_eq!(report.errors[0].entity_type, "connection_test");
}
