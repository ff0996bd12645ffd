use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::{debug, info};
use uuid::Uuid;

use super::{batches_at, factory, full_aggregation_interval, retention_buffer};
use crate::models::{Aggregation, Sensor, SensorLog};
use crate::store::{LogQuery, SensorStore, StoreError, StoreWrite};

// ---

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct FullAggregation {
    pub full_aggregate_additions: usize,
    pub pre_aggregate_deletions: usize,
}

/// Greedy runs over sorted logs. A run holds every log within the window of
/// its first member; the last run is still accumulating and is returned
/// separately.
fn group_runs(logs: &[SensorLog]) -> (Vec<&[SensorLog]>, Option<&[SensorLog]>) {
    // ---
    if logs.is_empty() {
        return (Vec::new(), None);
    }

    let window = full_aggregation_interval();
    let mut closed = Vec::new();
    let mut run_start = 0;
    for (i, log) in logs.iter().enumerate().skip(1) {
        if log.timestamp - logs[run_start].timestamp > window {
            closed.push(&logs[run_start..i]);
            run_start = i;
        }
    }
    (closed, Some(&logs[run_start..]))
}

/// Roll pre-aggregates older than the retention buffer into max/min pairs.
///
/// Only pre-aggregates newer than the latest aggregate and older than
/// `latest pre-aggregate − retention buffer` are considered (`now` stands in
/// when there are no pre-aggregates). Logs in a breach, and the edge logs
/// pinned on either side of one, are left alone. Everything is committed in one write.
pub async fn full_aggregate(
    store: &dyn SensorStore,
    sensor: &Sensor,
    now: DateTime<Utc>,
) -> Result<FullAggregation, StoreError> {
    // ---
    if store.count_logs(sensor.id).await? == 0 {
        debug!(sensor = %sensor.id, "Sensor has no logs to aggregate");
        return Ok(FullAggregation::default());
    }

    let scan_start = store
        .latest_log_timestamp(sensor.id, &LogQuery::of(Aggregation::Aggregate))
        .await?
        .unwrap_or(DateTime::<Utc>::UNIX_EPOCH);
    let scan_end = store
        .latest_log_timestamp(sensor.id, &LogQuery::of(Aggregation::PreAggregate))
        .await?
        .unwrap_or(now)
        - retention_buffer();

    let candidates = store
        .sensor_logs(
            sensor.id,
            &LogQuery::of(Aggregation::PreAggregate)
                .after(scan_start)
                .before(scan_end)
                .in_breach(false),
        )
        .await?
        .into_iter()
        .filter(|log| !log.is_pinned())
        .collect::<Vec<_>>();

    let (closed, trailing) = group_runs(&candidates);
    let delete_before = trailing
        .and_then(|run| run.first())
        .map_or(scan_end, |log| log.timestamp);

    let additions: Vec<SensorLog> = closed
        .iter()
        .filter_map(|run| factory::aggregate_pair(run))
        .flatten()
        .collect();
    let deletions: Vec<Uuid> = candidates
        .iter()
        .filter(|log| log.timestamp < delete_before)
        .map(|log| log.id)
        .collect();

    let result = FullAggregation {
        full_aggregate_additions: additions.len(),
        pre_aggregate_deletions: deletions.len(),
    };
    if additions.is_empty() && deletions.is_empty() {
        debug!(
            sensor = %sensor.id,
            "Nothing to aggregate between {} and {}",
            scan_start,
            scan_end
        );
        return Ok(result);
    }

    let batches = batches_at(store, sensor.location_id).await?;
    let additions = additions
        .into_iter()
        .map(|log| log.with_item_batches(batches.clone()));

    store
        .commit(StoreWrite::new().put_logs(additions).delete_logs(deletions))
        .await?;

    info!(
        sensor = %sensor.id,
        "Full aggregation: {} runs, {} aggregate logs added, {} pre-aggregates removed",
        closed.len(),
        result.full_aggregate_additions,
        result.pre_aggregate_deletions
    );
    Ok(result)
}

#[cfg(test)]
mod tests {
    // ---
    use super::*;
    use crate::models::ItemBatch;
    use crate::store::MemoryStore;
    use chrono::{Duration, TimeZone};

    fn start() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2025, 3, 1, 0, 0, 0).unwrap()
    }

    fn pre(sensor: &Sensor, minutes: i64, temperature: f64) -> SensorLog {
        factory::create_log(
            sensor.id,
            sensor.location_id,
            temperature,
            start() + Duration::minutes(minutes),
            Aggregation::PreAggregate,
        )
    }

    async fn logs_of(store: &MemoryStore, sensor: &Sensor, stage: Aggregation) -> Vec<SensorLog> {
        store
            .sensor_logs(sensor.id, &LogQuery::of(stage))
            .await
            .unwrap()
    }

    /// Five pre-aggregates in one window, a log that closes the window, and
    /// a recent log that pushes the retention boundary past both.
    async fn seed_closed_run(store: &MemoryStore, sensor: &Sensor) -> Vec<SensorLog> {
        // ---
        let run: Vec<SensorLog> = [1.0, 5.0, 3.0, 9.0, 2.0]
            .iter()
            .enumerate()
            .map(|(i, t)| pre(sensor, 20 * i as i64, *t))
            .collect();
        let closer = pre(sensor, 8 * 60 + 10, 4.0);
        let recent = pre(sensor, 8 * 60 + 10 + 33 * 60, 5.0);

        let mut all = run.clone();
        all.push(closer);
        all.push(recent);
        store.commit(StoreWrite::new().put_logs(all)).await.unwrap();
        run
    }

    #[tokio::test]
    async fn test_no_logs_is_a_no_op() {
        // ---
        let store = MemoryStore::new();
        let sensor = Sensor::new("AA", "fridge", 60);

        let result = full_aggregate(&store, &sensor, start()).await.unwrap();

        assert_eq!(result, FullAggregation::default());
    }

    #[tokio::test]
    async fn test_closed_run_becomes_max_min_pair_at_median() {
        // ---
        let store = MemoryStore::new();
        let location = Uuid::new_v4();
        let sensor = Sensor::new("AA", "fridge", 60).with_location(location);
        let batch = ItemBatch {
            id: Uuid::new_v4(),
            item_id: Uuid::new_v4(),
            batch: "BCG-01".into(),
            location_id: Some(location),
            number_of_packs: 20.0,
        };
        store.upsert_item_batch(&batch).await.unwrap();
        let run = seed_closed_run(&store, &sensor).await;

        let result = full_aggregate(&store, &sensor, start()).await.unwrap();

        assert_eq!(result.full_aggregate_additions, 2);
        assert_eq!(result.pre_aggregate_deletions, 5);

        let aggregates = logs_of(&store, &sensor, Aggregation::Aggregate).await;
        let mut temperatures: Vec<f64> = aggregates.iter().map(|l| l.temperature).collect();
        temperatures.sort_by(f64::total_cmp);
        assert_eq!(temperatures, vec![1.0, 9.0]);
        for log in &aggregates {
            assert_eq!(log.timestamp, run[2].timestamp);
            assert_eq!(log.location_id, Some(location));
            assert_eq!(log.item_batches, vec![batch.id]);
        }

        // The closer and the recent log survive.
        assert_eq!(logs_of(&store, &sensor, Aggregation::PreAggregate).await.len(), 2);
    }

    #[tokio::test]
    async fn test_repeat_run_adds_nothing() {
        // ---
        let store = MemoryStore::new();
        let sensor = Sensor::new("AA", "fridge", 60);
        seed_closed_run(&store, &sensor).await;

        full_aggregate(&store, &sensor, start()).await.unwrap();
        let second = full_aggregate(&store, &sensor, start()).await.unwrap();

        assert_eq!(second, FullAggregation::default());
    }

    #[tokio::test]
    async fn test_recent_pre_aggregates_are_never_rolled_up() {
        // ---
        let store = MemoryStore::new();
        let sensor = Sensor::new("AA", "fridge", 60);
        let logs: Vec<SensorLog> = (0..(48 * 3))
            .map(|i| pre(&sensor, 20 * i, 3.0 + (i % 7) as f64))
            .collect();
        let latest = logs.last().unwrap().timestamp;
        store.commit(StoreWrite::new().put_logs(logs.clone())).await.unwrap();

        let result = full_aggregate(&store, &sensor, start()).await.unwrap();
        assert!(result.full_aggregate_additions > 0);

        let boundary = latest - (Duration::hours(32) + Duration::minutes(17));
        let remaining = logs_of(&store, &sensor, Aggregation::PreAggregate).await;
        for log in logs.iter().filter(|l| l.timestamp > boundary) {
            assert!(remaining.iter().any(|r| r.id == log.id));
        }
        for aggregate in logs_of(&store, &sensor, Aggregation::Aggregate).await {
            assert!(aggregate.timestamp < boundary);
        }
    }

    #[tokio::test]
    async fn test_breach_logs_are_pinned() {
        // ---
        let store = MemoryStore::new();
        let sensor = Sensor::new("AA", "fridge", 60);
        seed_closed_run(&store, &sensor).await;
        let breached = pre(&sensor, 30, 12.0).in_breach(Uuid::new_v4());
        store
            .commit(StoreWrite::new().put_logs(vec![breached.clone()]))
            .await
            .unwrap();

        full_aggregate(&store, &sensor, start()).await.unwrap();

        let aggregates = logs_of(&store, &sensor, Aggregation::Aggregate).await;
        assert!(aggregates.iter().all(|l| l.temperature <= 9.0));
        let remaining = logs_of(&store, &sensor, Aggregation::PreAggregate).await;
        assert!(remaining.iter().any(|l| l.id == breached.id));
    }

    #[tokio::test]
    async fn test_breach_edge_logs_survive() {
        // ---
        let store = MemoryStore::new();
        let sensor = Sensor::new("AA", "fridge", 60);
        let run = seed_closed_run(&store, &sensor).await;
        let edge = run[1].clone().edge_of(Uuid::new_v4());
        store
            .commit(StoreWrite::new().put_logs(vec![edge.clone()]))
            .await
            .unwrap();

        let result = full_aggregate(&store, &sensor, start()).await.unwrap();

        assert_eq!(result.pre_aggregate_deletions, 4);
        let aggregates = logs_of(&store, &sensor, Aggregation::Aggregate).await;
        let mut temperatures: Vec<f64> = aggregates.iter().map(|l| l.temperature).collect();
        temperatures.sort_by(f64::total_cmp);
        assert_eq!(temperatures, vec![1.0, 9.0]);
        let remaining = logs_of(&store, &sensor, Aggregation::PreAggregate).await;
        assert!(remaining.iter().any(|l| l.id == edge.id && !l.is_in_breach));
    }

    #[test]
    fn test_group_runs_splits_on_window() {
        // ---
        let sensor = Sensor::new("AA", "fridge", 60);
        let logs = vec![
            pre(&sensor, 0, 1.0),
            pre(&sensor, 485, 1.0),
            pre(&sensor, 486, 1.0),
            pre(&sensor, 1000, 1.0),
        ];

        let (closed, trailing) = group_runs(&logs);

        assert_eq!(closed.len(), 2);
        assert_eq!(closed[0].len(), 2);
        assert_eq!(closed[1].len(), 1);
        assert_eq!(trailing.unwrap().len(), 1);
    }
}
