use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::get,
    Json, Router,
};
use serde::Deserialize;
use tracing::{debug, error};
use uuid::Uuid;

use super::{error_response, AppState};
use crate::models::{Aggregation, Sensor};
use crate::report::sensor_breach_report;
use crate::store::LogQuery;

// ---

/// Applied when `limit` is absent.
const DEFAULT_LOG_LIMIT: usize = 1000;

pub fn router() -> Router<AppState> {
    // ---
    Router::new()
        .route("/sensors/{id}/logs", get(logs))
        .route("/sensors/{id}/breaches", get(breaches))
}

/// Query parameters for `GET /sensors/{id}/logs`.
#[derive(Debug, Deserialize)]
pub struct LogsQuery {
    /// `none`, `preAggregate` or `aggregate`; all stages when absent.
    aggregation: Option<String>,
    limit: Option<usize>,
}

async fn known_sensor(state: &AppState, id: Uuid) -> Result<Sensor, Response> {
    // ---
    match state.store.sensor(id).await {
        Ok(Some(sensor)) => Ok(sensor),
        Ok(None) => Err(error_response(
            StatusCode::NOT_FOUND,
            format!("Unknown sensor {id}"),
        )),
        Err(e) => {
            error!("Failed to load sensor {}: {}", id, e);
            Err(error_response(
                StatusCode::INTERNAL_SERVER_ERROR,
                "Failed to load sensor",
            ))
        }
    }
}

/// Handle `GET /sensors/{id}/logs`, oldest first.
async fn logs(
    Path(id): Path<Uuid>,
    Query(params): Query<LogsQuery>,
    State(state): State<AppState>,
) -> impl IntoResponse {
    // ---
    debug!("GET /sensors/{}/logs {:?}", id, params);
    let sensor = match known_sensor(&state, id).await {
        Ok(sensor) => sensor,
        Err(response) => return response,
    };

    let mut query = LogQuery::all().limit(params.limit.unwrap_or(DEFAULT_LOG_LIMIT));
    if let Some(aggregation) = params.aggregation.as_deref() {
        match aggregation.parse::<Aggregation>() {
            Ok(aggregation) => query.aggregation = Some(aggregation),
            Err(e) => return error_response(StatusCode::BAD_REQUEST, e),
        }
    }

    match state.store.sensor_logs(sensor.id, &query).await {
        Ok(logs) => (StatusCode::OK, Json(logs)).into_response(),
        Err(e) => {
            error!("Failed to load logs for {}: {}", id, e);
            error_response(StatusCode::INTERNAL_SERVER_ERROR, "Failed to load logs")
        }
    }
}

/// Handle `GET /sensors/{id}/breaches`: one summary per breach.
async fn breaches(Path(id): Path<Uuid>, State(state): State<AppState>) -> impl IntoResponse {
    // ---
    let sensor = match known_sensor(&state, id).await {
        Ok(sensor) => sensor,
        Err(response) => return response,
    };

    match sensor_breach_report(state.store.as_ref(), sensor.id).await {
        Ok(report) => (StatusCode::OK, Json(report)).into_response(),
        Err(e) => {
            error!("Failed to build breach report for {}: {}", id, e);
            error_response(StatusCode::INTERNAL_SERVER_ERROR, "Failed to load breaches")
        }
    }
}
