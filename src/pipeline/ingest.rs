use chrono::{DateTime, Duration, Utc};
use serde::Serialize;
use tracing::{debug, info, warn};

use super::factory;
use crate::device::TemperatureReading;
use crate::models::Sensor;
use crate::store::{LogQuery, SensorStore, StoreError, StoreWrite};

// ---

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
pub struct Ingestion {
    pub count: usize,
}

/// Turn a downloaded batch of readings into raw logs.
///
/// Readings carry no timestamps: the last one is placed one interval before
/// `now` and the rest are spaced backwards by `log_interval`. When the
/// sensor already has a log newer than that naive start, only the readings
/// taken after it are kept, so a re-downloaded buffer is not stored twice.
/// All new logs are committed in one write.
pub async fn ingest(
    store: &dyn SensorStore,
    readings: &[TemperatureReading],
    sensor: &Sensor,
    now: DateTime<Utc>,
) -> Result<Ingestion, StoreError> {
    // ---
    if readings.is_empty() {
        debug!(sensor = %sensor.id, "No readings to ingest");
        return Ok(Ingestion::default());
    }
    if sensor.log_interval <= 0 {
        warn!(
            sensor = %sensor.id,
            "Sensor has no usable log interval ({}), skipping {} readings",
            sensor.log_interval,
            readings.len()
        );
        return Ok(Ingestion::default());
    }

    let interval_ms = sensor.log_interval * 1_000;
    let total = readings.len() as i64;
    let naive_start = now - Duration::milliseconds(interval_ms * total);

    let latest = store
        .latest_log_timestamp(sensor.id, &LogQuery::all())
        .await?;
    let (count, start) = match latest {
        Some(latest) if latest > naive_start => {
            let elapsed_ms = (now - latest).num_milliseconds();
            let look_back = (elapsed_ms.div_euclid(interval_ms) - 1).clamp(0, total);
            debug!(
                sensor = %sensor.id,
                "Latest stored log at {} overlaps download, keeping {} of {} readings",
                latest,
                look_back,
                total
            );
            (look_back, now - Duration::milliseconds(interval_ms * look_back))
        }
        _ => (total, naive_start),
    };

    let skip = (total - count) as usize;
    let logs: Vec<_> = readings[skip..]
        .iter()
        .enumerate()
        .map(|(i, reading)| {
            let timestamp = start + Duration::milliseconds(interval_ms * i as i64);
            factory::raw_log(sensor, reading, timestamp)
        })
        .collect();

    let ingestion = Ingestion { count: logs.len() };
    if !logs.is_empty() {
        store.commit(StoreWrite::new().put_logs(logs)).await?;
    }

    info!(sensor = %sensor.id, "Ingested {} raw logs", ingestion.count);
    Ok(ingestion)
}
