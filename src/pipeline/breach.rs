use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::{debug, info};
use uuid::Uuid;

use super::batches_at;
use crate::models::{Aggregation, BreachConfiguration, Sensor, SensorLog, TemperatureBreach};
use crate::store::{LogQuery, SensorStore, StoreError, StoreWrite};

// ---

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct BreachScan {
    pub breaches_opened: usize,
    pub breaches_closed: usize,
    pub logs_marked: usize,
    pub edge_logs_pinned: usize,
}

/// Outcome of walking a sorted run of logs.
#[derive(Debug, Default)]
struct Detection {
    /// Breaches created or changed by the walk, including a resumed one.
    breaches: Vec<TemperatureBreach>,
    /// (log index, index into `breaches`)
    marked: Vec<(usize, usize)>,
    opened: usize,
}

/// Walk `logs` (ascending) and open, continue or close breaches.
///
/// A log outside the current breach's thresholds closes it at the log's
/// timestamp. Each configuration keeps its own run of consecutive logs
/// inside its range; once a run spans that configuration's duration a
/// breach opens at the run's first log and the whole run joins it.
/// Configurations are tried in order. Logs inside the thresholds of the
/// current breach join it directly.
fn detect(
    sensor: &Sensor,
    logs: &[SensorLog],
    configs: &[BreachConfiguration],
    open_breach: Option<TemperatureBreach>,
) -> Detection {
    // ---
    let mut detection = Detection::default();
    let mut current: Option<usize> = None;
    if let Some(breach) = open_breach.filter(TemperatureBreach::is_open) {
        detection.breaches.push(breach);
        current = Some(0);
    }

    // Candidate log indices, one run per configuration.
    let mut runs: Vec<Vec<usize>> = vec![Vec::new(); configs.len()];

    for (index, log) in logs.iter().enumerate() {
        let continues = current.is_some_and(|c| detection.breaches[c].continues_with(log.temperature));

        if let Some(c) = current.filter(|_| !continues) {
            detection.breaches[c].end_timestamp = Some(log.timestamp);
            current = None;
            runs.iter_mut().for_each(Vec::clear);
        }

        for (config, run) in configs.iter().zip(runs.iter_mut()) {
            if config.contains(log.temperature) {
                run.push(index);
            } else {
                run.clear();
            }
        }

        if let Some(c) = current {
            detection.marked.push((index, c));
            continue;
        }

        let breaching = configs.iter().zip(&runs).find(|(config, run)| {
            match (run.first(), run.last()) {
                (Some(&first), Some(&last)) => {
                    logs[last].timestamp - logs[first].timestamp >= config.duration()
                }
                _ => false,
            }
        });
        if let Some((config, run)) = breaching {
            let start = logs[run[0]].timestamp;
            detection
                .breaches
                .push(TemperatureBreach::open(sensor, config, start));
            let opened = detection.breaches.len() - 1;
            detection.opened += 1;
            detection.marked.extend(run.iter().map(|i| (*i, opened)));
            current = Some(opened);
        }
    }

    detection
}

/// Pin the pre-aggregates just before and just after each breach run.
///
/// Looks at the pre-aggregates newer than the latest aggregate. A log that
/// is not pinned yet and borders a breach log takes that breach's id,
/// without being put in breach, and the given batch links. Returns how many
/// logs were pinned.
async fn pin_breach_edges(
    store: &dyn SensorStore,
    sensor: &Sensor,
    batches: &[Uuid],
) -> Result<usize, StoreError> {
    // ---
    let from = store
        .latest_log_timestamp(sensor.id, &LogQuery::of(Aggregation::Aggregate))
        .await?
        .unwrap_or(DateTime::<Utc>::UNIX_EPOCH);
    let logs = store
        .sensor_logs(sensor.id, &LogQuery::of(Aggregation::PreAggregate).after(from))
        .await?;

    let breach_of = |i: Option<usize>| {
        i.and_then(|i| logs.get(i))
            .filter(|log| log.is_in_breach)
            .and_then(|log| log.breach_id)
    };
    let edges: Vec<SensorLog> = logs
        .iter()
        .enumerate()
        .filter(|(_, log)| !log.is_pinned())
        .filter_map(|(i, log)| {
            let breach = breach_of(i.checked_sub(1)).or_else(|| breach_of(Some(i + 1)))?;
            Some(
                log.clone()
                    .edge_of(breach)
                    .with_item_batches(batches.to_vec()),
            )
        })
        .collect();

    let pinned = edges.len();
    if pinned > 0 {
        store.commit(StoreWrite::new().put_logs(edges)).await?;
    }
    Ok(pinned)
}

/// Where the next scan starts: after the newest breach log, else after the
/// newest aggregate, else from the epoch.
async fn scan_from(store: &dyn SensorStore, sensor: &Sensor) -> Result<DateTime<Utc>, StoreError> {
    // ---
    if let Some(ts) = store
        .latest_log_timestamp(sensor.id, &LogQuery::all().in_breach(true))
        .await?
    {
        return Ok(ts);
    }
    Ok(store
        .latest_log_timestamp(sensor.id, &LogQuery::of(Aggregation::Aggregate))
        .await?
        .unwrap_or(DateTime::<Utc>::UNIX_EPOCH))
}

async fn configurations(store: &dyn SensorStore) -> Result<Vec<BreachConfiguration>, StoreError> {
    // ---
    let configs = store.breach_configurations().await?;
    if !configs.is_empty() {
        return Ok(configs);
    }

    let defaults = BreachConfiguration::defaults();
    for config in &defaults {
        store.upsert_breach_configuration(config).await?;
    }
    info!("Installed {} default breach configurations", defaults.len());
    Ok(defaults)
}

/// Scan the sensor's unscanned pre-aggregates for temperature breaches.
///
/// Sensors without a location are skipped. An open breach from an earlier
/// sync is resumed. New and changed breaches and the logs that belong to
/// them are committed in one write; breach logs are linked to the batches
/// stocked at the sensor's location. The bordering pre-aggregates of every
/// breach run are then pinned to it.
pub async fn scan_breaches(
    store: &dyn SensorStore,
    sensor: &Sensor,
) -> Result<BreachScan, StoreError> {
    // ---
    if sensor.location_id.is_none() {
        debug!(sensor = %sensor.id, "Sensor has no location, skipping breach scan");
        return Ok(BreachScan::default());
    }

    let configs = configurations(store).await?;
    let from = scan_from(store, sensor).await?;
    let logs = store
        .sensor_logs(
            sensor.id,
            &LogQuery::of(Aggregation::PreAggregate).after(from),
        )
        .await?;
    if logs.is_empty() {
        debug!(sensor = %sensor.id, "No pre-aggregates after {} to scan", from);
        return Ok(BreachScan::default());
    }

    let open_breach = store.most_recent_breach(sensor.id).await?;
    let detection = detect(sensor, &logs, &configs, open_breach);

    let mut result = BreachScan {
        breaches_opened: detection.opened,
        breaches_closed: detection
            .breaches
            .iter()
            .filter(|b| !b.is_open())
            .count(),
        logs_marked: detection.marked.len(),
        edge_logs_pinned: 0,
    };
    if detection.breaches.is_empty() {
        debug!(sensor = %sensor.id, "Scanned {} logs, no breaches", logs.len());
        return Ok(result);
    }

    let batches = batches_at(store, sensor.location_id).await?;
    let marked: Vec<SensorLog> = detection
        .marked
        .iter()
        .map(|(log, breach)| {
            logs[*log]
                .clone()
                .in_breach(detection.breaches[*breach].id)
                .with_item_batches(batches.clone())
        })
        .collect();

    store
        .commit(
            StoreWrite::new()
                .put_breaches(detection.breaches)
                .put_logs(marked),
        )
        .await?;
    result.edge_logs_pinned = pin_breach_edges(store, sensor, &batches).await?;

    info!(
        sensor = %sensor.id,
        "Breach scan over {} logs: {} opened, {} closed, {} logs marked, {} edge logs pinned",
        logs.len(),
        result.breaches_opened,
        result.breaches_closed,
        result.logs_marked,
        result.edge_logs_pinned
    );
    Ok(result)
}

#[cfg(test)]
mod tests {
    // ---
    use super::*;
    use crate::models::{BreachType, ItemBatch};
    use crate::pipeline::factory;
    use crate::store::MemoryStore;
    use chrono::{Duration, TimeZone};

    fn start() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2025, 3, 26, 18, 0, 0).unwrap()
    }

    fn located() -> Sensor {
        Sensor::new("AA", "fridge", 300).with_location(Uuid::new_v4())
    }

    async fn seed(store: &MemoryStore, sensor: &Sensor, points: &[(i64, f64)]) {
        // ---
        let logs: Vec<SensorLog> = points
            .iter()
            .map(|(minutes, temperature)| {
                factory::create_log(
                    sensor.id,
                    sensor.location_id,
                    *temperature,
                    start() + Duration::minutes(*minutes),
                    Aggregation::PreAggregate,
                )
            })
            .collect();
        store.commit(StoreWrite::new().put_logs(logs)).await.unwrap();
    }

    #[tokio::test]
    async fn test_hot_run_opens_and_closes_breach() {
        // ---
        let store = MemoryStore::new();
        let sensor = located();
        seed(
            &store,
            &sensor,
            &[(0, 5.0), (20, 9.0), (40, 9.5), (60, 10.0), (80, 9.0), (100, 5.0)],
        )
        .await;

        let scan = scan_breaches(&store, &sensor).await.unwrap();

        assert_eq!(
            scan,
            BreachScan {
                breaches_opened: 1,
                breaches_closed: 1,
                logs_marked: 4,
                edge_logs_pinned: 2,
            }
        );
        let breaches = store.breaches(sensor.id).await.unwrap();
        assert_eq!(breaches.len(), 1);
        let breach = &breaches[0];
        assert_eq!(breach.breach_type, BreachType::HotConsecutive);
        assert_eq!(breach.start_timestamp, start() + Duration::minutes(20));
        assert_eq!(breach.end_timestamp, Some(start() + Duration::minutes(100)));

        let logs = store.breach_logs(breach.id).await.unwrap();
        let in_breach: Vec<f64> = logs
            .iter()
            .filter(|l| l.is_in_breach)
            .map(|l| l.temperature)
            .collect();
        assert_eq!(in_breach, vec![9.0, 9.5, 10.0, 9.0]);
        let edges: Vec<i64> = logs
            .iter()
            .filter(|l| !l.is_in_breach)
            .map(|l| (l.timestamp - start()).num_minutes())
            .collect();
        assert_eq!(edges, vec![0, 100]);
    }

    #[tokio::test]
    async fn test_short_excursion_is_not_a_breach() {
        // ---
        let store = MemoryStore::new();
        let sensor = located();
        seed(&store, &sensor, &[(0, 5.0), (20, 9.0), (40, 9.0), (60, 5.0)]).await;

        let scan = scan_breaches(&store, &sensor).await.unwrap();

        assert_eq!(scan, BreachScan::default());
        assert!(store.breaches(sensor.id).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_open_breach_is_resumed_by_next_scan() {
        // ---
        let store = MemoryStore::new();
        let sensor = located();
        seed(&store, &sensor, &[(0, 1.0), (20, 1.5)]).await;

        let first = scan_breaches(&store, &sensor).await.unwrap();
        assert_eq!(first.breaches_opened, 1);
        assert_eq!(first.breaches_closed, 0);

        seed(&store, &sensor, &[(40, 1.0), (60, 5.0)]).await;
        let second = scan_breaches(&store, &sensor).await.unwrap();
        assert_eq!(second.breaches_opened, 0);
        assert_eq!(second.breaches_closed, 1);
        assert_eq!(second.logs_marked, 1);

        let breaches = store.breaches(sensor.id).await.unwrap();
        assert_eq!(breaches.len(), 1);
        assert_eq!(breaches[0].breach_type, BreachType::ColdConsecutive);
        assert_eq!(breaches[0].start_timestamp, start());
        assert_eq!(breaches[0].end_timestamp, Some(start() + Duration::minutes(60)));
        let logs = store.breach_logs(breaches[0].id).await.unwrap();
        assert_eq!(logs.iter().filter(|l| l.is_in_breach).count(), 3);
        assert_eq!(second.edge_logs_pinned, 1);
        assert!(!logs[3].is_in_breach);
        assert_eq!(logs[3].temperature, 5.0);
    }

    #[tokio::test]
    async fn test_defaults_are_seeded_once() {
        // ---
        let store = MemoryStore::new();
        let sensor = located();
        seed(&store, &sensor, &[(0, 5.0)]).await;

        scan_breaches(&store, &sensor).await.unwrap();
        scan_breaches(&store, &sensor).await.unwrap();

        assert_eq!(store.breach_configurations().await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn test_breach_logs_link_stocked_batches() {
        // ---
        let store = MemoryStore::new();
        let location = Uuid::new_v4();
        let sensor = Sensor::new("AA", "fridge", 300).with_location(location);
        let batch = ItemBatch {
            id: Uuid::new_v4(),
            item_id: Uuid::new_v4(),
            batch: "MMR-7".into(),
            location_id: Some(location),
            number_of_packs: 12.0,
        };
        store.upsert_item_batch(&batch).await.unwrap();
        seed(&store, &sensor, &[(0, -1.0), (20, 0.5)]).await;

        scan_breaches(&store, &sensor).await.unwrap();

        let breach = store.most_recent_breach(sensor.id).await.unwrap().unwrap();
        assert_eq!(breach.location_id, Some(location));
        for log in store.breach_logs(breach.id).await.unwrap() {
            assert_eq!(log.item_batches, vec![batch.id]);
        }
    }

    #[tokio::test]
    async fn test_sensor_without_location_is_skipped() {
        // ---
        let store = MemoryStore::new();
        let sensor = Sensor::new("AA", "fridge", 300);
        seed(&store, &sensor, &[(0, 1.0), (20, 1.0), (40, 1.0)]).await;

        let scan = scan_breaches(&store, &sensor).await.unwrap();

        assert_eq!(scan, BreachScan::default());
        assert!(store.breaches(sensor.id).await.unwrap().is_empty());
        assert!(store.breach_configurations().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_edge_logs_are_pinned_with_batches() {
        // ---
        let store = MemoryStore::new();
        let location = Uuid::new_v4();
        let sensor = Sensor::new("AA", "fridge", 300).with_location(location);
        let batch = ItemBatch {
            id: Uuid::new_v4(),
            item_id: Uuid::new_v4(),
            batch: "HPV-3".into(),
            location_id: Some(location),
            number_of_packs: 5.0,
        };
        store.upsert_item_batch(&batch).await.unwrap();
        seed(
            &store,
            &sensor,
            &[(0, 5.0), (20, 4.0), (40, -1.0), (60, 0.0), (80, 4.5), (100, 5.0)],
        )
        .await;

        let scan = scan_breaches(&store, &sensor).await.unwrap();

        assert_eq!(scan.logs_marked, 2);
        assert_eq!(scan.edge_logs_pinned, 2);
        let breach = store.most_recent_breach(sensor.id).await.unwrap().unwrap();
        let logs = store
            .sensor_logs(sensor.id, &LogQuery::of(Aggregation::PreAggregate))
            .await
            .unwrap();
        let pinned: Vec<(i64, bool)> = logs
            .iter()
            .filter(|l| l.breach_id == Some(breach.id))
            .map(|l| ((l.timestamp - start()).num_minutes(), l.is_in_breach))
            .collect();
        assert_eq!(pinned, vec![(20, false), (40, true), (60, true), (80, false)]);
        for log in logs.iter().filter(|l| l.is_pinned()) {
            assert_eq!(log.item_batches, vec![batch.id]);
        }
        assert!(logs.iter().filter(|l| !l.is_pinned()).all(|l| l.item_batches.is_empty()));

        // A second scan finds nothing new and pins nothing twice.
        let again = scan_breaches(&store, &sensor).await.unwrap();
        assert_eq!(again, BreachScan::default());
    }

    #[test]
    fn test_cold_reading_does_not_block_hot_breach() {
        // ---
        let sensor = Sensor::new("AA", "fridge", 300);
        let configs = BreachConfiguration::defaults();
        let logs: Vec<SensorLog> = std::iter::once((0, 1.0))
            .chain((1..=6).map(|i| (20 * i, 9.0)))
            .map(|(m, t)| {
                factory::create_log(
                    sensor.id,
                    None,
                    t,
                    start() + Duration::minutes(m),
                    Aggregation::PreAggregate,
                )
            })
            .collect();

        let detection = detect(&sensor, &logs, &configs, None);

        assert_eq!(detection.opened, 1);
        let breach = &detection.breaches[0];
        assert_eq!(breach.breach_type, BreachType::HotConsecutive);
        assert_eq!(breach.start_timestamp, start() + Duration::minutes(20));
        assert!(breach.is_open());
        let marked: Vec<usize> = detection.marked.iter().map(|(i, _)| *i).collect();
        assert_eq!(marked, vec![1, 2, 3, 4, 5, 6]);
    }

    #[test]
    fn test_closing_log_can_start_the_next_candidate_run() {
        // ---
        let sensor = Sensor::new("AA", "fridge", 300);
        let configs = BreachConfiguration::defaults();
        let logs: Vec<SensorLog> = [(0, 9.0), (30, 9.0), (60, 9.0), (80, 1.0), (100, 1.0)]
            .iter()
            .map(|(m, t)| {
                factory::create_log(
                    sensor.id,
                    None,
                    *t,
                    start() + Duration::minutes(*m),
                    Aggregation::PreAggregate,
                )
            })
            .collect();

        let detection = detect(&sensor, &logs, &configs, None);

        assert_eq!(detection.opened, 2);
        assert_eq!(detection.breaches[0].breach_type, BreachType::HotConsecutive);
        assert_eq!(
            detection.breaches[0].end_timestamp,
            Some(start() + Duration::minutes(80))
        );
        assert_eq!(detection.breaches[1].breach_type, BreachType::ColdConsecutive);
        assert_eq!(detection.breaches[1].start_timestamp, start() + Duration::minutes(80));
        assert!(detection.breaches[1].is_open());
        assert_eq!(detection.marked.len(), 5);
    }

    #[test]
    fn test_closed_breach_is_not_resumed() {
        // ---
        let sensor = Sensor::new("AA", "fridge", 300);
        let configs = BreachConfiguration::defaults();
        let mut closed = TemperatureBreach::open(&sensor, &configs[0], start());
        closed.end_timestamp = Some(start() + Duration::minutes(10));
        let logs = vec![factory::create_log(
            sensor.id,
            None,
            9.0,
            start() + Duration::minutes(20),
            Aggregation::PreAggregate,
        )];

        let detection = detect(&sensor, &logs, &configs, Some(closed));

        assert!(detection.breaches.is_empty());
        assert!(detection.marked.is_empty());
    }
}
