//! HTTP trigger surface: health check and on-demand forwarding run.

use std::sync::Arc;

use axum::{
    Json, Router,
    extract::State,
    http::StatusCode,
    response::IntoResponse,
    routing::{get, post},
};
use tower_http::cors::CorsLayer;
use tracing::{error, info};

use crate::pipeline::Forwarder;

/// Application state shared across handlers.
#[derive(Clone)]
pub struct AppState {
    pub forwarder: Arc<Forwarder>,
}

/// Build the Axum router.
pub fn routes(forwarder: Arc<Forwarder>) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/api/process", post(process_now))
        .layer(CorsLayer::permissive())
        .with_state(AppState { forwarder })
}

async fn health() -> impl IntoResponse {
    Json(serde_json::json!({
        "status": "ok",
        "service": "mail-relay"
    }))
}

/// Run the pipeline now. Queues behind any run already in progress.
async fn process_now(State(state): State<AppState>) -> impl IntoResponse {
    info!("Manual forwarding run requested");
    match state.forwarder.run_now().await {
        Ok(summary) => (
            StatusCode::OK,
            Json(serde_json::json!({
                "success": true,
                "message": "Mailbox processed",
                "summary": summary,
            })),
        ),
        Err(e) => {
            error!(error = %e, "Manual forwarding run failed");
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(serde_json::json!({
                    "success": false,
                    "message": "Failed to process mailbox",
                    "error": e.to_string(),
                })),
            )
        }
    }
}
