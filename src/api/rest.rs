use axum::extract::State;
use axum::http::{header, StatusCode};
use axum::response::IntoResponse;
use axum::routing::get;
use axum::{Json, Router};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Instant;

use crate::metrics::PrometheusSink;

/// Shared application state for all API handlers.
#[derive(Clone)]
pub struct AppState {
    pub sink: Arc<PrometheusSink>,
    pub started_at: Instant,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExporterHealth {
    pub version: String,
    pub uptime_secs: u64,
}

pub fn router(state: AppState, metrics_path: &str) -> Router {
    Router::new()
        .route("/health", get(health))
        .route(metrics_path, get(metrics))
        .with_state(state)
}

async fn health(State(state): State<AppState>) -> Json<ExporterHealth> {
    Json(ExporterHealth {
        version: env!("CARGO_PKG_VERSION").to_string(),
        uptime_secs: state.started_at.elapsed().as_secs(),
    })
}

/// Render the current gauge snapshot. Never triggers a PuppetDB poll.
async fn metrics(State(state): State<AppState>) -> Result<impl IntoResponse, (StatusCode, String)> {
    state
        .sink
        .encode()
        .map(|body| ([(header::CONTENT_TYPE, prometheus::TEXT_FORMAT)], body))
        .map_err(|e| (StatusCode::INTERNAL_SERVER_ERROR, e.to_string()))
}
