//! Construction of [`SensorLog`] records.
//!
//! Pure: every call assigns a fresh id and touches nothing else.

use chrono::{DateTime, Utc};
use uuid::Uuid;

use crate::device::TemperatureReading;
use crate::models::{Aggregation, Sensor, SensorLog};

// ---

/// A log outside any breach with no batch links.
///
/// Breach membership and batch links are applied afterwards with
/// [`SensorLog::in_breach`], [`SensorLog::edge_of`] and
/// [`SensorLog::with_item_batches`].
pub fn create_log(
    sensor_id: Uuid,
    location_id: Option<Uuid>,
    temperature: f64,
    timestamp: DateTime<Utc>,
    aggregation: Aggregation,
) -> SensorLog {
    // ---
    SensorLog {
        id: Uuid::new_v4(),
        sensor_id,
        location_id,
        temperature,
        timestamp,
        is_in_breach: false,
        aggregation,
        breach_id: None,
        item_batches: Vec::new(),
    }
}

/// Raw log for a device reading, placed at the sensor's current location.
pub fn raw_log(sensor: &Sensor, reading: &TemperatureReading, timestamp: DateTime<Utc>) -> SensorLog {
    create_log(
        sensor.id,
        sensor.location_id,
        reading.temperature,
        timestamp,
        Aggregation::None,
    )
}

/// The max and min aggregate logs summarising a closed run of pre-aggregates.
///
/// Both are stamped with, and copy sensor and location from, the run's
/// element at index `len / 2`. Returns `None` for an empty run.
pub fn aggregate_pair(run: &[SensorLog]) -> Option<[SensorLog; 2]> {
    // ---
    let median = run.get(run.len() / 2)?;
    let maximum = run
        .iter()
        .map(|log| log.temperature)
        .fold(f64::NEG_INFINITY, f64::max);
    let minimum = run
        .iter()
        .map(|log| log.temperature)
        .fold(f64::INFINITY, f64::min);

    let stamp = |temperature| {
        create_log(
            median.sensor_id,
            median.location_id,
            temperature,
            median.timestamp,
            Aggregation::Aggregate,
        )
    };
    Some([stamp(maximum), stamp(minimum)])
}

impl SensorLog {
    // ---
    pub fn with_item_batches(mut self, item_batches: Vec<Uuid>) -> Self {
        self.item_batches = item_batches;
        self
    }

    pub fn in_breach(mut self, breach_id: Uuid) -> Self {
        self.is_in_breach = true;
        self.breach_id = Some(breach_id);
        self
    }

    /// Pin the log to a breach it borders without putting it in breach.
    pub fn edge_of(mut self, breach_id: Uuid) -> Self {
        self.breach_id = Some(breach_id);
        self
    }

    /// Part of a breach or pinned to one as its edge.
    pub fn is_pinned(&self) -> bool {
        self.breach_id.is_some()
    }
}

#[cfg(test)]
mod tests {
    // ---
    use super::*;
    use chrono::{Duration, TimeZone};

    fn run_of(temperatures: &[f64]) -> Vec<SensorLog> {
        // ---
        let sensor = Uuid::new_v4();
        let location = Some(Uuid::new_v4());
        let start = Utc.with_ymd_and_hms(2025, 1, 1, 0, 0, 0).unwrap();
        temperatures
            .iter()
            .enumerate()
            .map(|(i, t)| {
                create_log(
                    sensor,
                    location,
                    *t,
                    start + Duration::minutes(20 * i as i64),
                    Aggregation::PreAggregate,
                )
            })
            .collect()
    }

    #[test]
    fn test_create_log_defaults() {
        // ---
        let now = Utc::now();
        let a = create_log(Uuid::new_v4(), None, 4.0, now, Aggregation::None);
        let b = create_log(a.sensor_id, None, 4.0, now, Aggregation::None);

        assert_ne!(a.id, b.id);
        assert!(!a.is_in_breach);
        assert!(a.breach_id.is_none());
        assert!(a.item_batches.is_empty());
    }

    #[test]
    fn test_aggregate_pair_uses_extremes_and_median_stamp() {
        // ---
        let run = run_of(&[1.0, 5.0, 3.0, 9.0, 2.0]);
        let [max, min] = aggregate_pair(&run).unwrap();

        assert_eq!(max.temperature, 9.0);
        assert_eq!(min.temperature, 1.0);
        assert_eq!(max.timestamp, run[2].timestamp);
        assert_eq!(min.timestamp, run[2].timestamp);
        assert_eq!(max.location_id, run[2].location_id);
        assert_eq!(max.aggregation, Aggregation::Aggregate);
        assert_ne!(max.id, min.id);
    }

    #[test]
    fn test_aggregate_pair_of_single_and_empty_runs() {
        // ---
        let run = run_of(&[6.5]);
        let [max, min] = aggregate_pair(&run).unwrap();
        assert_eq!((max.temperature, min.temperature), (6.5, 6.5));

        assert!(aggregate_pair(&[]).is_none());
    }

    #[test]
    fn test_breach_marking() {
        // ---
        let breach = Uuid::new_v4();
        let log = run_of(&[12.0]).remove(0).in_breach(breach);
        assert!(log.is_in_breach);
        assert_eq!(log.breach_id, Some(breach));
        assert!(log.is_pinned());
    }

    #[test]
    fn test_edge_log_is_pinned_but_not_in_breach() {
        // ---
        let breach = Uuid::new_v4();
        let log = run_of(&[6.0]).remove(0).edge_of(breach);
        assert!(!log.is_in_breach);
        assert_eq!(log.breach_id, Some(breach));
        assert!(log.is_pinned());
        assert!(!run_of(&[6.0])[0].is_pinned());
    }
}
