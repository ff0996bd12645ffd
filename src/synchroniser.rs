//! Per-sensor sync state machine.
//!
//! One sync walks the stages in [`SyncStage`] order: find the logger, pull
//! its readings, store them, run the log pipeline, then reset the device.
//! Every stage reports progress; the first failure reports a terminal
//! message and stops the sync. Stages that already committed stay
//! committed, and the device buffer is only cleared after every data stage
//! succeeded.

use std::fmt;
use std::future::Future;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::Utc;
use serde::Serialize;
use thiserror::Error;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::device::{DeviceDriver, DeviceError, SensorAdvertisement};
use crate::models::Sensor;
use crate::pipeline::{
    full_aggregate, ingest, pre_aggregate, scan_breaches, BreachScan, FullAggregation, Ingestion,
    PreAggregation,
};
use crate::store::{SensorStore, StoreError};

// ---

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub enum SyncStage {
    Searching,
    Downloading,
    CreatingLogs,
    PreAggregating,
    BreachScanning,
    FullAggregating,
    ResettingDevice,
    Done,
}

impl SyncStage {
    // ---
    /// Terminal message and progress reported when this stage fails.
    fn failure(&self) -> (&'static str, Option<u8>) {
        match self {
            SyncStage::Searching => ("Failed to search for sensor", None),
            SyncStage::Downloading => ("Failed to sync temperature data", None),
            SyncStage::CreatingLogs => ("Failed to create temperature logs", None),
            SyncStage::PreAggregating => (
                "Temperature sync successful, but failure during aggregation",
                Some(45),
            ),
            SyncStage::BreachScanning => (
                "Temperature sync successful, but failed to search for breaches",
                None,
            ),
            SyncStage::FullAggregating => (
                "Temperature sync successful, but failed to finalise aggregation",
                None,
            ),
            SyncStage::ResettingDevice => ("Sync successful, but failed to reset sensor", None),
            SyncStage::Done => ("Sync failed", None),
        }
    }
}

impl fmt::Display for SyncStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            SyncStage::Searching => "searching",
            SyncStage::Downloading => "downloading",
            SyncStage::CreatingLogs => "creating logs",
            SyncStage::PreAggregating => "pre-aggregating",
            SyncStage::BreachScanning => "breach scanning",
            SyncStage::FullAggregating => "full aggregating",
            SyncStage::ResettingDevice => "resetting device",
            SyncStage::Done => "done",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ProgressUpdate {
    pub stage: SyncStage,
    pub message: String,
    /// Percent complete, when the stage has a fixed place in the sync.
    pub progress: Option<u8>,
}

/// Receives progress updates. Fire-and-forget.
pub trait ProgressReporter: Send + Sync {
    fn report(&self, update: ProgressUpdate);
}

impl<F> ProgressReporter for F
where
    F: Fn(ProgressUpdate) + Send + Sync,
{
    fn report(&self, update: ProgressUpdate) {
        self(update)
    }
}

/// Reporter that keeps every update, for HTTP responses and tests.
#[derive(Debug, Default)]
pub struct ProgressLog {
    updates: Mutex<Vec<ProgressUpdate>>,
}

impl ProgressLog {
    // ---
    pub fn new() -> Self {
        Self::default()
    }

    pub fn updates(&self) -> Vec<ProgressUpdate> {
        self.updates
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone()
    }

    pub fn messages(&self) -> Vec<String> {
        self.updates().into_iter().map(|u| u.message).collect()
    }
}

impl ProgressReporter for ProgressLog {
    fn report(&self, update: ProgressUpdate) {
        self.updates
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .push(update);
    }
}

#[derive(Error, Debug)]
pub enum SyncError {
    #[error("sensor {0} is not in range")]
    NotInRange(String),
    #[error("{stage} failed: {source}")]
    Device {
        stage: SyncStage,
        #[source]
        source: DeviceError,
    },
    #[error("{stage} timed out after {timeout_ms} ms")]
    Timeout { stage: SyncStage, timeout_ms: u64 },
    #[error("{stage} failed: {source}")]
    Store {
        stage: SyncStage,
        #[source]
        source: StoreError,
    },
}

impl SyncError {
    // ---
    pub fn stage(&self) -> SyncStage {
        match self {
            SyncError::NotInRange(_) => SyncStage::Searching,
            SyncError::Device { stage, .. }
            | SyncError::Timeout { stage, .. }
            | SyncError::Store { stage, .. } => *stage,
        }
    }

    fn terminal_update(&self) -> ProgressUpdate {
        // ---
        let stage = self.stage();
        let (message, progress) = match self {
            SyncError::NotInRange(_) => ("Cannot find sensor in proximity", None),
            _ => stage.failure(),
        };
        ProgressUpdate {
            stage,
            message: message.to_string(),
            progress,
        }
    }
}

fn store_failure(stage: SyncStage) -> impl FnOnce(StoreError) -> SyncError {
    move |source| SyncError::Store { stage, source }
}

/// What each pipeline stage did during a successful sync.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncReport {
    pub sensor_id: Uuid,
    pub ingestion: Ingestion,
    pub pre_aggregation: PreAggregation,
    pub breach_scan: BreachScan,
    pub full_aggregation: FullAggregation,
}

/// Outcome for one sensor of a multi-sensor sync.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SensorSyncResult {
    pub sensor_id: Uuid,
    pub mac_address: String,
    pub success: bool,
    pub message: String,
    pub report: Option<SyncReport>,
}

/// Drives syncs against one store and one device driver.
#[derive(Clone)]
pub struct Synchroniser {
    store: Arc<dyn SensorStore>,
    driver: Arc<dyn DeviceDriver>,
    device_timeout: Duration,
    reset_log_interval: i64,
}

impl Synchroniser {
    // ---
    pub fn new(store: Arc<dyn SensorStore>, driver: Arc<dyn DeviceDriver>) -> Self {
        Synchroniser {
            store,
            driver,
            device_timeout: Duration::from_millis(10_000),
            reset_log_interval: 240,
        }
    }

    /// Upper bound on each scan, download and reset call.
    pub fn with_device_timeout(mut self, timeout: Duration) -> Self {
        self.device_timeout = timeout;
        self
    }

    /// Log interval written to the device on reset.
    pub fn with_reset_log_interval(mut self, seconds: i64) -> Self {
        self.reset_log_interval = seconds;
        self
    }

    fn progress(
        &self,
        reporter: &dyn ProgressReporter,
        stage: SyncStage,
        message: impl Into<String>,
        progress: u8,
    ) {
        // ---
        let message = message.into();
        debug!("[{}%] {}", progress, message);
        reporter.report(ProgressUpdate {
            stage,
            message,
            progress: Some(progress),
        });
    }

    async fn bounded<T>(
        &self,
        stage: SyncStage,
        call: impl Future<Output = Result<T, DeviceError>>,
    ) -> Result<T, SyncError> {
        // ---
        match tokio::time::timeout(self.device_timeout, call).await {
            Ok(result) => result.map_err(|source| SyncError::Device { stage, source }),
            Err(_) => Err(SyncError::Timeout {
                stage,
                timeout_ms: self.device_timeout.as_millis() as u64,
            }),
        }
    }

    /// Run every stage for `sensor`, reporting progress to `reporter`.
    pub async fn sync_sensor(
        &self,
        sensor: &Sensor,
        reporter: &dyn ProgressReporter,
    ) -> Result<SyncReport, SyncError> {
        // ---
        info!(sensor = %sensor.id, "Syncing sensor {}", sensor.mac_address);
        match self.run_stages(sensor, reporter).await {
            Ok(report) => {
                info!(sensor = %sensor.id, "Sync complete: {:?}", report);
                Ok(report)
            }
            Err(e) => {
                match &e {
                    SyncError::NotInRange(_) => warn!(sensor = %sensor.id, "{}", e),
                    _ => error!(sensor = %sensor.id, "Sync failed: {}", e),
                }
                reporter.report(e.terminal_update());
                Err(e)
            }
        }
    }

    async fn run_stages(
        &self,
        sensor: &Sensor,
        reporter: &dyn ProgressReporter,
    ) -> Result<SyncReport, SyncError> {
        // ---
        let store = self.store.as_ref();
        let mac_address = sensor.mac_address.as_str();

        self.progress(reporter, SyncStage::Searching, "Searching for sensor", 0);
        let bytes = self
            .bounded(SyncStage::Searching, self.driver.scan(mac_address))
            .await?
            .ok_or_else(|| SyncError::NotInRange(mac_address.to_string()))?;
        let advertisement =
            SensorAdvertisement::parse(&bytes).map_err(|e| SyncError::Device {
                stage: SyncStage::Searching,
                source: e.into(),
            })?;
        let sensor = refreshed(sensor, &advertisement);
        store
            .upsert_sensor(&sensor)
            .await
            .map_err(store_failure(SyncStage::Searching))?;

        self.progress(
            reporter,
            SyncStage::Downloading,
            format!("Syncing logs: {}", sensor.number_of_logs),
            10,
        );
        let downloaded = self
            .bounded(SyncStage::Downloading, self.driver.download_logs(mac_address))
            .await?;
        if downloaded.total_number_of_records != downloaded.readings.len() as i64 {
            debug!(
                sensor = %sensor.id,
                "Device reported {} records, downloaded {}",
                downloaded.total_number_of_records,
                downloaded.readings.len()
            );
        }

        self.progress(
            reporter,
            SyncStage::CreatingLogs,
            format!("Creating Logs: {}", downloaded.readings.len()),
            25,
        );
        let ingestion = ingest(store, &downloaded.readings, &sensor, Utc::now())
            .await
            .map_err(store_failure(SyncStage::CreatingLogs))?;

        self.progress(reporter, SyncStage::PreAggregating, "Pre aggregating Logs", 40);
        let pre_aggregation = pre_aggregate(store, &sensor, sensor.location_id)
            .await
            .map_err(store_failure(SyncStage::PreAggregating))?;

        self.progress(reporter, SyncStage::BreachScanning, "Searching for breaches", 50);
        let breach_scan = scan_breaches(store, &sensor)
            .await
            .map_err(store_failure(SyncStage::BreachScanning))?;

        self.progress(reporter, SyncStage::FullAggregating, "Finalising aggregation", 55);
        let full_aggregation = full_aggregate(store, &sensor, Utc::now())
            .await
            .map_err(store_failure(SyncStage::FullAggregating))?;

        self.progress(reporter, SyncStage::ResettingDevice, "Resetting Sensor", 80);
        self.bounded(
            SyncStage::ResettingDevice,
            self.driver.send_reset(mac_address, self.reset_log_interval),
        )
        .await?;

        self.progress(reporter, SyncStage::Done, "Full temperature sync successful", 100);
        Ok(SyncReport {
            sensor_id: sensor.id,
            ingestion,
            pre_aggregation,
            breach_scan,
            full_aggregation,
        })
    }

    /// Sync every sensor that has a location, one after another.
    ///
    /// A failing sensor does not stop the others; only failing to list the
    /// sensors is an error.
    pub async fn synchronise_sensors(
        &self,
        reporter: &dyn ProgressReporter,
    ) -> Result<Vec<SensorSyncResult>, StoreError> {
        // ---
        let sensors = self.store.located_sensors().await?;
        info!("Synchronising {} located sensors", sensors.len());

        let mut results = Vec::with_capacity(sensors.len());
        for sensor in &sensors {
            let result = match self.sync_sensor(sensor, reporter).await {
                Ok(report) => SensorSyncResult {
                    sensor_id: sensor.id,
                    mac_address: sensor.mac_address.clone(),
                    success: true,
                    message: "Full temperature sync successful".to_string(),
                    report: Some(report),
                },
                Err(e) => SensorSyncResult {
                    sensor_id: sensor.id,
                    mac_address: sensor.mac_address.clone(),
                    success: false,
                    message: e.to_string(),
                    report: None,
                },
            };
            results.push(result);
        }
        Ok(results)
    }
}

/// `sensor` updated with what its advertisement says.
fn refreshed(sensor: &Sensor, advertisement: &SensorAdvertisement) -> Sensor {
    // ---
    Sensor {
        battery_level: i32::from(advertisement.battery_level),
        log_interval: advertisement.log_interval,
        number_of_logs: advertisement.number_of_logs,
        last_temperature: Some(advertisement.temperature),
        last_connection_timestamp: Some(Utc::now()),
        ..sensor.clone()
    }
}
