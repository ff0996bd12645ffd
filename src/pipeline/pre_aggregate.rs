use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::{debug, info};
use uuid::Uuid;

use super::{factory, pre_aggregate_interval};
use crate::models::{Aggregation, Sensor, SensorLog};
use crate::store::{LogQuery, SensorStore, StoreError, StoreWrite};

// ---

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
pub struct PreAggregation {
    pub additions: usize,
    pub deletions: usize,
}

/// Windows cut from a sorted run of raw logs.
struct Windows {
    additions: Vec<SensorLog>,
    consumed: Vec<Uuid>,
}

/// Split sorted raw logs into 20-minute windows anchored at the first log.
///
/// A log later than the current window end closes the window; the closed
/// window yields one pre-aggregate at its end timestamp carrying its lowest
/// temperature. The last window is left open.
fn cut_windows(raw: &[SensorLog], sensor_id: Uuid, location_id: Option<Uuid>) -> Windows {
    // ---
    let mut additions = Vec::new();
    let mut consumed = Vec::new();

    let Some(first) = raw.first() else {
        return Windows { additions, consumed };
    };

    let interval = pre_aggregate_interval();
    let mut window_end: DateTime<Utc> = first.timestamp + interval;
    let mut window_min = first.temperature;
    let mut window_ids = vec![first.id];

    for log in &raw[1..] {
        if log.timestamp > window_end {
            additions.push(factory::create_log(
                sensor_id,
                location_id,
                window_min,
                window_end,
                Aggregation::PreAggregate,
            ));
            consumed.append(&mut window_ids);

            // Skip empty windows across gaps in the data.
            while log.timestamp > window_end {
                window_end += interval;
            }
            window_min = log.temperature;
        } else {
            window_min = window_min.min(log.temperature);
        }
        window_ids.push(log.id);
    }

    Windows { additions, consumed }
}

/// Replace completed 20-minute windows of raw logs with one minimum log each.
///
/// New pre-aggregates are committed before the consumed raw logs are deleted,
/// in a separate write, so an interruption between the two leaves duplicated
/// data rather than lost data.
pub async fn pre_aggregate(
    store: &dyn SensorStore,
    sensor: &Sensor,
    location_id: Option<Uuid>,
) -> Result<PreAggregation, StoreError> {
    // ---
    let raw = store
        .sensor_logs(sensor.id, &LogQuery::of(Aggregation::None))
        .await?;
    if raw.is_empty() {
        debug!(sensor = %sensor.id, "No raw logs to pre-aggregate");
        return Ok(PreAggregation::default());
    }

    let Windows {
        additions,
        consumed,
    } = cut_windows(&raw, sensor.id, location_id);
    let result = PreAggregation {
        additions: additions.len(),
        deletions: consumed.len(),
    };
    if additions.is_empty() {
        debug!(
            sensor = %sensor.id,
            "{} raw logs all fall in the open window",
            raw.len()
        );
        return Ok(result);
    }

    store.commit(StoreWrite::new().put_logs(additions)).await?;
    store.commit(StoreWrite::new().delete_logs(consumed)).await?;

    info!(
        sensor = %sensor.id,
        "Pre-aggregated {} raw logs into {} logs",
        result.deletions,
        result.additions
    );
    Ok(result)
}
