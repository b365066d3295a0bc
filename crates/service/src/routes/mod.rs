//! HTTP and WebSocket surface.

pub mod api;
pub mod hooks;
pub mod ws;

use crate::state::AppState;
use axum::routing::{get, post};
use axum::{Json, Router};
use tower_http::cors::CorsLayer;

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/ws/session/{id}", get(ws::client_ws))
        .route("/ws/runner/{id}", get(ws::runner_ws))
        .route("/ws/channel/{id}", get(ws::channel_ws))
        .route(
            "/channels/{channel_type}/{user_id}",
            post(hooks::channel_webhook),
        )
        .nest("/api", api::router())
        .layer(CorsLayer::permissive())
        .with_state(state)
}

async fn health() -> Json<serde_json::Value> {
    Json(serde_json::json!({ "status": "ok" }))
}
