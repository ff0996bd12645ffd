use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::IntoResponse,
    routing::post,
    Json, Router,
};
use serde::Serialize;
use tracing::{error, info};
use uuid::Uuid;

use super::{error_response, AppState};
use crate::synchroniser::{
    ProgressLog, ProgressUpdate, SensorSyncResult, SyncError, SyncReport, SyncStage,
};

// ---

pub fn router() -> Router<AppState> {
    // ---
    Router::new()
        .route("/sync", post(sync_all))
        .route("/sensors/{id}/sync", post(sync_one))
}

#[derive(Serialize)]
struct SyncAllResponse {
    results: Vec<SensorSyncResult>,
    progress: Vec<ProgressUpdate>,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct SyncOneResponse {
    success: bool,
    report: Option<SyncReport>,
    error: Option<String>,
    failed_stage: Option<SyncStage>,
    progress: Vec<ProgressUpdate>,
}

/// Handle `POST /sync`: sync every located sensor in turn.
async fn sync_all(State(state): State<AppState>) -> impl IntoResponse {
    // ---
    let _guard = state.sync_lock.lock().await;
    info!("POST /sync - Starting");

    let progress = ProgressLog::new();
    match state.synchroniser.synchronise_sensors(&progress).await {
        Ok(results) => (
            StatusCode::OK,
            Json(SyncAllResponse {
                results,
                progress: progress.updates(),
            }),
        )
            .into_response(),
        Err(e) => {
            error!("Failed to list sensors: {}", e);
            error_response(StatusCode::INTERNAL_SERVER_ERROR, "Failed to list sensors")
        }
    }
}

fn failure_status(error: &SyncError) -> StatusCode {
    match error {
        SyncError::NotInRange(_) => StatusCode::NOT_FOUND,
        SyncError::Device { .. } => StatusCode::BAD_GATEWAY,
        SyncError::Timeout { .. } => StatusCode::GATEWAY_TIMEOUT,
        SyncError::Store { .. } => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

/// Handle `POST /sensors/{id}/sync`.
async fn sync_one(Path(id): Path<Uuid>, State(state): State<AppState>) -> impl IntoResponse {
    // ---
    let sensor = match state.store.sensor(id).await {
        Ok(Some(sensor)) => sensor,
        Ok(None) => return error_response(StatusCode::NOT_FOUND, format!("Unknown sensor {id}")),
        Err(e) => {
            error!("Failed to load sensor {}: {}", id, e);
            return error_response(StatusCode::INTERNAL_SERVER_ERROR, "Failed to load sensor");
        }
    };

    let _guard = state.sync_lock.lock().await;
    info!("POST /sensors/{}/sync - Starting", id);

    let progress = ProgressLog::new();
    let (status, body) = match state.synchroniser.sync_sensor(&sensor, &progress).await {
        Ok(report) => (
            StatusCode::OK,
            SyncOneResponse {
                success: true,
                report: Some(report),
                error: None,
                failed_stage: None,
                progress: progress.updates(),
            },
        ),
        Err(e) => (
            failure_status(&e),
            SyncOneResponse {
                success: false,
                report: None,
                error: Some(e.to_string()),
                failed_stage: Some(e.stage()),
                progress: progress.updates(),
            },
        ),
    };
    (status, Json(body)).into_response()
}
