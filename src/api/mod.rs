//! Inbound HTTP surface

pub mod handlers;
pub mod validator;

use std::sync::Arc;
use std::time::Instant;

use axum::{
    extract::Extension,
    routing::{get, post},
    Router,
};
use tower_http::cors::CorsLayer;

use crate::event_log::EventLog;
use crate::transfer::TransferService;

pub use handlers::ApiError;
pub use validator::{parse_batch_request, parse_transfer_request, validate_amount, ValidationError};

pub struct AppState {
    pub service: Arc<TransferService>,
    pub started_at: Instant,
    pub version: &'static str,
}

impl AppState {
    pub fn new(service: Arc<TransferService>) -> Self {
        Self {
            service,
            started_at: Instant::now(),
            version: env!("CARGO_PKG_VERSION"),
        }
    }

    pub fn events(&self) -> &EventLog {
        self.service.events()
    }
}

pub fn create_app(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/health", get(handlers::health))
        .route("/stats", get(handlers::stats))
        .route("/events", get(handlers::events))
        .route("/transfer", post(handlers::create_transfer))
        .route("/transfer/batch", post(handlers::create_batch))
        .route("/transfer/:id", get(handlers::get_transfer))
        .layer(Extension(state))
        .layer(CorsLayer::permissive())
}
