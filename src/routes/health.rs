// src/routes/health.rs
//! Health check endpoint.
//!
//! `GET /health` answers without touching the store or the gateway, so
//! orchestrators can probe it cheaply. It also names the active store
//! backend so a deployment without `DATABASE_URL` is easy to spot.

use axum::{extract::State, routing::get, Json, Router};
use serde::Serialize;

use super::AppState;

/// JSON response body for the `/health` endpoint.
#[derive(Serialize)]
struct HealthResponse {
    status: &'static str,
    store: &'static str,
}

async fn health(State(state): State<AppState>) -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok",
        store: state.store.backend(),
    })
}

pub fn router() -> Router<AppState> {
    Router::new().route("/health", get(health))
}
