use std::sync::Arc;
use std::time::Duration;

use axum::body::Body;
use axum::http::{Request, StatusCode};
use axum::Router;
use serde_json::{json, Value};
use tower::ServiceExt;

use ft_batcher::api::{create_app, AppState};
use ft_batcher::event_log::EventLog;
use ft_batcher::transfer::adapters::{MemoryTransferStore, MockChain};
use ft_batcher::transfer::{BatchScheduler, EngineConfig, SlotKey, TransferService};

async fn service() -> Arc<TransferService> {
    let config = EngineConfig {
        account_id: "sender.testnet".to_string(),
        contract_id: "ft.testnet".to_string(),
        keys: vec![SlotKey::new("ed25519:key0", "")],
        slot_count: 2,
        batch_interval: Duration::from_secs(30),
        ..EngineConfig::default()
    };
    let scheduler = BatchScheduler::new(config.batch_interval);
    let service = TransferService::initialize(
        config,
        Arc::new(MockChain::new("mock")),
        Arc::new(MemoryTransferStore::new()),
        scheduler,
        Arc::new(EventLog::default()),
    )
    .await
    .unwrap();
    Arc::new(service)
}

async fn app() -> (Router, Arc<TransferService>) {
    let service = service().await;
    (create_app(Arc::new(AppState::new(service.clone()))), service)
}

async fn send(app: &Router, request: Request<Body>) -> (StatusCode, Value) {
    let response = app.clone().oneshot(request).await.unwrap();
    let status = response.status();
    let bytes = axum::body::to_bytes(response.into_body(), usize::MAX).await.unwrap();
    let body = if bytes.is_empty() {
        Value::Null
    } else {
        serde_json::from_slice(&bytes).unwrap()
    };
    (status, body)
}

fn get(uri: &str) -> Request<Body> {
    Request::builder().uri(uri).body(Body::empty()).unwrap()
}

fn post(uri: &str, body: Value) -> Request<Body> {
    Request::builder()
        .method("POST")
        .uri(uri)
        .header("content-type", "application/json")
        .body(Body::from(body.to_string()))
        .unwrap()
}

#[tokio::test]
async fn test_health() {
    let (app, service) = app().await;

    let (status, body) = send(&app, get("/health")).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["status"], "ok");
    assert_eq!(body["version"], env!("CARGO_PKG_VERSION"));
    assert_eq!(body["persistence"]["store"], "memory");
    assert_eq!(body["persistence"]["healthy"], true);
    assert!(body["uptime"].is_u64());
    assert!(body["timestamp"].is_string());

    service.shutdown().await;
}

#[tokio::test]
async fn test_transfer_roundtrip() {
    let (app, service) = app().await;

    let (status, body) = send(
        &app,
        post(
            "/transfer",
            json!({ "receiver_id": "alice.testnet", "amount": "1000", "memo": "hi" }),
        ),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["status"], "queued");
    assert_eq!(body["receiver_id"], "alice.testnet");
    assert_eq!(body["amount"], "1000");
    assert_eq!(body["memo"], "hi");
    assert_eq!(body["retries"], 0);
    let id = body["transfer_id"].as_str().unwrap().to_string();
    assert!(id.starts_with("tx_"));

    let (status, body) = send(&app, get(&format!("/transfer/{}", id))).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["transfer_id"], id.as_str());
    assert_eq!(body["status"], "queued");

    service.shutdown().await;
}

#[tokio::test]
async fn test_transfer_validation() {
    let (app, service) = app().await;

    let (status, body) = send(&app, post("/transfer", json!({ "amount": "1" }))).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["error"], "receiver_id is required");

    let (status, body) = send(&app, post("/transfer", json!({ "receiver_id": "a.testnet" }))).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["error"], "amount is required");

    let (status, body) = send(
        &app,
        post("/transfer", json!({ "receiver_id": "a.testnet", "amount": "1e5" })),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["error"], "amount must be a valid number string");

    assert_eq!(service.queue_len(), 0);
    service.shutdown().await;
}

#[tokio::test]
async fn test_unknown_transfer_is_404() {
    let (app, service) = app().await;

    let (status, body) = send(&app, get("/transfer/tx_0_missing")).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    assert_eq!(body["error"], "Transfer not found");

    service.shutdown().await;
}

#[tokio::test]
async fn test_batch_endpoint() {
    let (app, service) = app().await;

    let (status, body) = send(
        &app,
        post(
            "/transfer/batch",
            json!({ "transfers": [
                { "receiver_id": "a.testnet", "amount": "1" },
                { "receiver_id": "b.testnet", "amount": "2" }
            ] }),
        ),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["count"], 2);
    assert_eq!(body["transfers"][0]["receiver_id"], "a.testnet");
    assert_eq!(body["transfers"][1]["receiver_id"], "b.testnet");
    assert_eq!(service.queue_len(), 2);

    let (status, body) = send(&app, post("/transfer/batch", json!({ "transfers": "nope" }))).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["error"], "transfers must be an array");

    // One bad item rejects the whole batch
    let (status, _) = send(
        &app,
        post(
            "/transfer/batch",
            json!({ "transfers": [
                { "receiver_id": "c.testnet", "amount": "1" },
                { "receiver_id": "", "amount": "2" }
            ] }),
        ),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(service.queue_len(), 2);

    service.shutdown().await;
}

#[tokio::test]
async fn test_stats_shape() {
    let (app, service) = app().await;
    send(&app, post("/transfer", json!({ "receiver_id": "a.testnet", "amount": "1" }))).await;

    let (status, body) = send(&app, get("/stats")).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["stats"]["totalTransfers"], 1);
    assert_eq!(body["stats"]["pendingTransfers"], 1);
    assert_eq!(body["stats"]["queueSize"], 1);
    assert_eq!(body["slotPool"]["total"], 2);
    assert_eq!(body["benchmark"]["targetTransfers"], 60_000);
    assert!(body["timestamp"].is_string());

    service.shutdown().await;
}

#[tokio::test]
async fn test_events_record_api_calls() {
    let (app, service) = app().await;
    send(&app, get("/health")).await;
    send(&app, get("/transfer/tx_0_missing")).await;

    let (status, body) = send(&app, get("/events")).await;
    assert_eq!(status, StatusCode::OK);
    let events = body["events"].as_array().unwrap();
    let api: Vec<&Value> = events.iter().filter(|e| e["category"] == "api").collect();
    assert_eq!(api.len(), 2);
    assert_eq!(api[0]["path"], "/health");
    assert_eq!(api[0]["status"], 200);
    assert_eq!(api[1]["path"], "/transfer/:id");
    assert_eq!(api[1]["status"], 404);
    assert!(events.iter().any(|e| e["category"] == "service"));

    service.shutdown().await;
}

#[tokio::test]
async fn test_shutting_down_is_503() {
    let (app, service) = app().await;
    service.shutdown().await;

    let (status, body) = send(&app, post("/transfer", json!({ "receiver_id": "a.testnet", "amount": "1" }))).await;
    assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
    assert_eq!(body["error"], "service is shutting down");
}

#[tokio::test]
async fn test_malformed_body_is_json_error() {
    let (app, service) = app().await;

    let not_json = Request::builder()
        .method("POST")
        .uri("/transfer")
        .header("content-type", "application/json")
        .body(Body::from("not json"))
        .unwrap();
    let (status, body) = send(&app, not_json).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert!(body["error"].as_str().unwrap().starts_with("invalid JSON body"));

    let no_content_type = Request::builder()
        .method("POST")
        .uri("/transfer/batch")
        .body(Body::from(r#"{"transfers":[]}"#))
        .unwrap();
    let (status, body) = send(&app, no_content_type).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert!(body["error"].is_string());

    let (_, body) = send(&app, get("/events")).await;
    let api: Vec<&Value> = body["events"]
        .as_array()
        .unwrap()
        .iter()
        .filter(|e| e["category"] == "api")
        .collect();
    assert_eq!(api.len(), 2);
    assert_eq!(api[0]["path"], "/transfer");
    assert_eq!(api[0]["status"], 400);
    assert_eq!(api[1]["path"], "/transfer/batch");
    assert_eq!(api[1]["status"], 400);
    assert_eq!(service.queue_len(), 0);

    service.shutdown().await;
}
