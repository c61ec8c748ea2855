use std::sync::Arc;

use axum::{
    extract::{rejection::JsonRejection, Extension, Json, Path},
    http::StatusCode,
    response::{IntoResponse, Response},
};
use serde::Serialize;
use serde_json::{json, Value};

use crate::api::validator::{parse_batch_request, parse_transfer_request, ValidationError};
use crate::api::AppState;
use crate::common_utils::get_current_iso_timestamp;
use crate::transfer::{ServiceError, TransferStatus};

/// Failure of an API call, rendered as `{ "error": text }`
#[derive(Debug)]
pub enum ApiError {
    Validation(ValidationError),
    NotFound(String),
    Unavailable(String),
    Internal(String),
}

impl ApiError {
    pub fn status(&self) -> StatusCode {
        match self {
            ApiError::Validation(_) => StatusCode::BAD_REQUEST,
            ApiError::NotFound(_) => StatusCode::NOT_FOUND,
            ApiError::Unavailable(_) => StatusCode::SERVICE_UNAVAILABLE,
            ApiError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    pub fn message(&self) -> String {
        match self {
            ApiError::Validation(e) => e.to_string(),
            ApiError::NotFound(m) | ApiError::Unavailable(m) | ApiError::Internal(m) => m.clone(),
        }
    }
}

impl From<ValidationError> for ApiError {
    fn from(e: ValidationError) -> Self {
        ApiError::Validation(e)
    }
}

impl From<ServiceError> for ApiError {
    fn from(e: ServiceError) -> Self {
        match e {
            ServiceError::ShuttingDown => ApiError::Unavailable(e.to_string()),
            other => ApiError::Internal(other.to_string()),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        (self.status(), Json(json!({ "error": self.message() }))).into_response()
    }
}

fn ok<T: Serialize>(
    state: &AppState,
    method: &str,
    path: &str,
    message: &str,
    metadata: Option<Value>,
    body: T,
) -> Response {
    state.events().api(method, path, StatusCode::OK.as_u16(), message, metadata);
    (StatusCode::OK, Json(body)).into_response()
}

fn fail(state: &AppState, method: &str, path: &str, error: ApiError, metadata: Option<Value>) -> Response {
    let status = error.status();
    if status.is_server_error() {
        log::error!("[API] {} {} failed: {}", method, path, error.message());
    } else {
        log::warn!("[API] {} {} rejected: {}", method, path, error.message());
    }
    state.events().api(method, path, status.as_u16(), error.message(), metadata);
    error.into_response()
}

/// Body that is not JSON, or sent without a JSON content type
fn malformed(rejection: JsonRejection) -> ApiError {
    ValidationError::MalformedBody(rejection.body_text()).into()
}

#[derive(Debug, Serialize)]
struct HealthPayload {
    status: &'static str,
    timestamp: String,
    uptime: u64,
    version: &'static str,
    persistence: PersistenceHealth,
}

#[derive(Debug, Serialize)]
struct PersistenceHealth {
    store: String,
    healthy: bool,
}

pub async fn health(Extension(state): Extension<Arc<AppState>>) -> Response {
    let healthy = state.service.health().await;
    let payload = HealthPayload {
        status: if healthy { "ok" } else { "degraded" },
        timestamp: get_current_iso_timestamp(),
        uptime: state.started_at.elapsed().as_secs(),
        version: state.version,
        persistence: PersistenceHealth {
            store: state.service.store_name().to_string(),
            healthy,
        },
    };
    let metadata = serde_json::to_value(&payload).ok();
    ok(&state, "GET", "/health", "Health check", metadata, payload)
}

pub async fn stats(Extension(state): Extension<Arc<AppState>>) -> Response {
    let stats = state.service.stats();
    let metadata = json!({
        "totalTransfers": stats.stats.total_transfers,
        "throughput": stats.stats.throughput,
        "queueSize": stats.stats.queue_size,
    });
    ok(&state, "GET", "/stats", "Service statistics fetched", Some(metadata), stats)
}

pub async fn create_transfer(
    Extension(state): Extension<Arc<AppState>>,
    payload: Result<Json<Value>, JsonRejection>,
) -> Response {
    const PATH: &str = "/transfer";

    let body = match payload {
        Ok(Json(body)) => body,
        Err(rejection) => return fail(&state, "POST", PATH, malformed(rejection), None),
    };

    let request = match parse_transfer_request(&body) {
        Ok(request) => request,
        Err(e) => return fail(&state, "POST", PATH, e.into(), Some(body)),
    };
    log::debug!(
        "[API] Transfer request received: receiver={} amount={}",
        request.receiver_id,
        request.amount
    );

    let metadata = json!({
        "receiver": request.receiver_id,
        "amount": request.amount,
    });
    match state.service.enqueue(request).await {
        Ok(status) => {
            let metadata = json!({
                "transferId": status.transfer_id,
                "receiver": status.receiver_id,
                "amount": status.amount,
            });
            ok(&state, "POST", PATH, "Transfer queued", Some(metadata), status)
        }
        Err(e) => fail(&state, "POST", PATH, e.into(), Some(metadata)),
    }
}

#[derive(Debug, Serialize)]
pub struct BatchResponse {
    pub count: usize,
    pub transfers: Vec<TransferStatus>,
}

pub async fn create_batch(
    Extension(state): Extension<Arc<AppState>>,
    payload: Result<Json<Value>, JsonRejection>,
) -> Response {
    const PATH: &str = "/transfer/batch";

    let body = match payload {
        Ok(Json(body)) => body,
        Err(rejection) => return fail(&state, "POST", PATH, malformed(rejection), None),
    };

    let requests = match parse_batch_request(&body) {
        Ok(requests) => requests,
        Err(e) => return fail(&state, "POST", PATH, e.into(), None),
    };
    let count = requests.len();

    match state.service.enqueue_many(requests).await {
        Ok(transfers) => {
            let response = BatchResponse {
                count: transfers.len(),
                transfers,
            };
            ok(
                &state,
                "POST",
                PATH,
                "Batch transfer queued",
                Some(json!({ "count": response.count })),
                response,
            )
        }
        Err(e) => fail(&state, "POST", PATH, e.into(), Some(json!({ "count": count }))),
    }
}

pub async fn get_transfer(
    Extension(state): Extension<Arc<AppState>>,
    Path(transfer_id): Path<String>,
) -> Response {
    const PATH: &str = "/transfer/:id";

    match state.service.status(&transfer_id) {
        Some(status) => {
            let metadata = json!({ "transferId": transfer_id, "status": status.state });
            ok(&state, "GET", PATH, "Transfer status fetched", Some(metadata), status)
        }
        None => fail(
            &state,
            "GET",
            PATH,
            ApiError::NotFound("Transfer not found".to_string()),
            Some(json!({ "transferId": transfer_id })),
        ),
    }
}

pub async fn events(Extension(state): Extension<Arc<AppState>>) -> Response {
    let events = state.events().all();
    let metadata = json!({ "count": events.len() });
    ok(&state, "GET", "/events", "Event log fetched", Some(metadata), json!({ "events": events }))
}
