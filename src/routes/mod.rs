//! HTTP gateway (EMBP): merges the sibling subrouters and owns the shared
//! application state.

use std::sync::Arc;
use std::time::Duration;

use axum::{http::StatusCode, response::IntoResponse, response::Response, Json, Router};
use serde::Serialize;
use tokio::sync::Mutex;

use crate::device::DeviceDriver;
use crate::store::SensorStore;
use crate::synchroniser::Synchroniser;
use crate::Config;

mod health;
mod sensors;
mod sync;

// ---

/// State shared by every handler.
#[derive(Clone)]
pub struct AppState {
    pub store: Arc<dyn SensorStore>,
    pub synchroniser: Synchroniser,
    /// One BLE session at a time: concurrent sync requests queue here.
    pub sync_lock: Arc<Mutex<()>>,
}

impl AppState {
    // ---
    pub fn new(store: Arc<dyn SensorStore>, driver: Arc<dyn DeviceDriver>, config: &Config) -> Self {
        let synchroniser = Synchroniser::new(store.clone(), driver)
            .with_device_timeout(Duration::from_millis(config.device_timeout_ms))
            .with_reset_log_interval(i64::from(config.reset_log_interval_secs));
        AppState {
            store,
            synchroniser,
            sync_lock: Arc::new(Mutex::new(())),
        }
    }
}

#[derive(Serialize)]
struct ErrorBody {
    error: String,
}

/// `(status, {"error": message})`
pub(crate) fn error_response(status: StatusCode, message: impl Into<String>) -> Response {
    (
        status,
        Json(ErrorBody {
            error: message.into(),
        }),
    )
        .into_response()
}

pub fn router(store: Arc<dyn SensorStore>, driver: Arc<dyn DeviceDriver>, config: Config) -> Router {
    // ---
    router_with_state(AppState::new(store, driver, &config))
}

pub fn router_with_state(state: AppState) -> Router {
    // ---
    Router::new()
        .merge(health::router())
        .merge(sync::router())
        .merge(sensors::router())
        .with_state(state)
}
