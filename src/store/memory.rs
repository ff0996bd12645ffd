use std::collections::{BTreeSet, HashMap};
use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::RwLock;
use uuid::Uuid;

use super::{LogQuery, SensorStore, StoreError, StoreWrite};
use crate::models::{
    Aggregation, BreachConfiguration, ItemBatch, Sensor, SensorLog, TemperatureBreach,
};

const ALL_AGGREGATIONS: [Aggregation; 3] = [
    Aggregation::None,
    Aggregation::PreAggregate,
    Aggregation::Aggregate,
];

type LogKey = (Uuid, Aggregation, DateTime<Utc>, Uuid);

#[derive(Default)]
struct Tables {
    sensors: HashMap<Uuid, Sensor>,
    logs: HashMap<Uuid, SensorLog>,
    log_index: BTreeSet<LogKey>,
    item_batches: HashMap<Uuid, ItemBatch>,
    configs: HashMap<Uuid, BreachConfiguration>,
    breaches: HashMap<Uuid, TemperatureBreach>,
}

impl Tables {
    // ---
    fn key(log: &SensorLog) -> LogKey {
        (log.sensor_id, log.aggregation, log.timestamp, log.id)
    }

    fn put_log(&mut self, log: SensorLog) {
        if let Some(previous) = self.logs.remove(&log.id) {
            self.log_index.remove(&Self::key(&previous));
        }
        self.log_index.insert(Self::key(&log));
        self.logs.insert(log.id, log);
    }

    fn delete_log(&mut self, id: &Uuid) {
        if let Some(previous) = self.logs.remove(id) {
            self.log_index.remove(&Self::key(&previous));
        }
    }

    /// Logs for one sensor and stage, ascending by timestamp.
    fn indexed<'a>(
        &'a self,
        sensor_id: Uuid,
        aggregation: Aggregation,
    ) -> impl Iterator<Item = &'a SensorLog> + 'a {
        // ---
        let low = (sensor_id, aggregation, DateTime::<Utc>::MIN_UTC, Uuid::nil());
        let high = (
            sensor_id,
            aggregation,
            DateTime::<Utc>::MAX_UTC,
            Uuid::from_u128(u128::MAX),
        );
        self.log_index
            .range(low..=high)
            .filter_map(move |(_, _, _, id)| self.logs.get(id))
    }

    fn query(&self, sensor_id: Uuid, query: &LogQuery) -> Vec<SensorLog> {
        // ---
        let stages: &[Aggregation] = match &query.aggregation {
            Some(aggregation) => std::slice::from_ref(aggregation),
            None => &ALL_AGGREGATIONS,
        };

        let mut logs: Vec<SensorLog> = stages
            .iter()
            .flat_map(|stage| self.indexed(sensor_id, *stage))
            .filter(|log| query.matches(log))
            .cloned()
            .collect();
        logs.sort_by(|a, b| a.timestamp.cmp(&b.timestamp).then(a.id.cmp(&b.id)));

        if let Some(limit) = query.limit {
            logs.truncate(limit);
        }
        logs
    }
}

/// In-process store with the same semantics as [`super::PgStore`].
///
/// Used when no `DATABASE_URL` is configured and throughout the tests.
#[derive(Default)]
pub struct MemoryStore {
    tables: RwLock<Tables>,
    fail_next_commit: AtomicBool,
}

impl MemoryStore {
    // ---
    pub fn new() -> Self {
        Self::default()
    }

    /// Make the next [`SensorStore::commit`] fail without applying anything.
    pub fn fail_next_commit(&self) {
        self.fail_next_commit.store(true, Ordering::SeqCst);
    }

    pub async fn log_count(&self) -> usize {
        self.tables.read().await.logs.len()
    }
}

#[async_trait]
impl SensorStore for MemoryStore {
    // ---
    fn backend(&self) -> &'static str {
        "memory"
    }

    async fn sensor(&self, id: Uuid) -> Result<Option<Sensor>, StoreError> {
        Ok(self.tables.read().await.sensors.get(&id).cloned())
    }

    async fn located_sensors(&self) -> Result<Vec<Sensor>, StoreError> {
        // ---
        let tables = self.tables.read().await;
        let mut sensors: Vec<Sensor> = tables
            .sensors
            .values()
            .filter(|s| s.location_id.is_some())
            .cloned()
            .collect();
        sensors.sort_by(|a, b| a.mac_address.cmp(&b.mac_address));
        Ok(sensors)
    }

    async fn upsert_sensor(&self, sensor: &Sensor) -> Result<(), StoreError> {
        self.tables
            .write()
            .await
            .sensors
            .insert(sensor.id, sensor.clone());
        Ok(())
    }

    async fn sensor_logs(
        &self,
        sensor_id: Uuid,
        query: &LogQuery,
    ) -> Result<Vec<SensorLog>, StoreError> {
        Ok(self.tables.read().await.query(sensor_id, query))
    }

    async fn latest_log_timestamp(
        &self,
        sensor_id: Uuid,
        query: &LogQuery,
    ) -> Result<Option<DateTime<Utc>>, StoreError> {
        // ---
        let unlimited = LogQuery {
            limit: None,
            ..query.clone()
        };
        let tables = self.tables.read().await;
        Ok(tables
            .query(sensor_id, &unlimited)
            .last()
            .map(|log| log.timestamp))
    }

    async fn count_logs(&self, sensor_id: Uuid) -> Result<usize, StoreError> {
        let tables = self.tables.read().await;
        Ok(ALL_AGGREGATIONS
            .iter()
            .map(|stage| tables.indexed(sensor_id, *stage).count())
            .sum())
    }

    async fn item_batches_at(&self, location_id: Uuid) -> Result<Vec<ItemBatch>, StoreError> {
        // ---
        let tables = self.tables.read().await;
        let mut batches: Vec<ItemBatch> = tables
            .item_batches
            .values()
            .filter(|b| b.location_id == Some(location_id) && b.number_of_packs > 0.0)
            .cloned()
            .collect();
        batches.sort_by(|a, b| a.id.cmp(&b.id));
        Ok(batches)
    }

    async fn item_batches(&self, ids: &[Uuid]) -> Result<Vec<ItemBatch>, StoreError> {
        let tables = self.tables.read().await;
        Ok(ids
            .iter()
            .filter_map(|id| tables.item_batches.get(id))
            .cloned()
            .collect())
    }

    async fn upsert_item_batch(&self, batch: &ItemBatch) -> Result<(), StoreError> {
        self.tables
            .write()
            .await
            .item_batches
            .insert(batch.id, batch.clone());
        Ok(())
    }

    async fn breach_configurations(&self) -> Result<Vec<BreachConfiguration>, StoreError> {
        let tables = self.tables.read().await;
        let mut configs: Vec<BreachConfiguration> = tables.configs.values().cloned().collect();
        configs.sort_by(|a, b| a.breach_type.as_str().cmp(b.breach_type.as_str()));
        Ok(configs)
    }

    async fn upsert_breach_configuration(
        &self,
        config: &BreachConfiguration,
    ) -> Result<(), StoreError> {
        self.tables
            .write()
            .await
            .configs
            .insert(config.id, config.clone());
        Ok(())
    }

    async fn breaches(&self, sensor_id: Uuid) -> Result<Vec<TemperatureBreach>, StoreError> {
        // ---
        let tables = self.tables.read().await;
        let mut breaches: Vec<TemperatureBreach> = tables
            .breaches
            .values()
            .filter(|b| b.sensor_id == sensor_id)
            .cloned()
            .collect();
        breaches.sort_by(|a, b| a.start_timestamp.cmp(&b.start_timestamp));
        Ok(breaches)
    }

    async fn breach_logs(&self, breach_id: Uuid) -> Result<Vec<SensorLog>, StoreError> {
        // ---
        let tables = self.tables.read().await;
        let mut logs: Vec<SensorLog> = tables
            .logs
            .values()
            .filter(|log| log.breach_id == Some(breach_id))
            .cloned()
            .collect();
        logs.sort_by(|a, b| a.timestamp.cmp(&b.timestamp));
        Ok(logs)
    }

    async fn commit(&self, write: StoreWrite) -> Result<(), StoreError> {
        // ---
        if self.fail_next_commit.swap(false, Ordering::SeqCst) {
            return Err(StoreError::Unavailable("injected commit failure".into()));
        }

        let mut tables = self.tables.write().await;
        for log in write.put_logs {
            tables.put_log(log);
        }
        for id in &write.delete_logs {
            tables.delete_log(id);
        }
        for breach in write.put_breaches {
            tables.breaches.insert(breach.id, breach);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    // ---
    use super::*;
    use chrono::{Duration, TimeZone};

    fn log_at(sensor_id: Uuid, aggregation: Aggregation, minutes: i64, temperature: f64) -> SensorLog {
        // ---
        SensorLog {
            id: Uuid::new_v4(),
            sensor_id,
            location_id: None,
            temperature,
            timestamp: Utc.with_ymd_and_hms(2025, 1, 1, 0, 0, 0).unwrap()
                + Duration::minutes(minutes),
            is_in_breach: false,
            aggregation,
            breach_id: None,
            item_batches: Vec::new(),
        }
    }

    #[tokio::test]
    async fn test_query_filters_by_stage_and_sorts() {
        // ---
        let store = MemoryStore::new();
        let sensor = Uuid::new_v4();
        let write = StoreWrite::new().put_logs(vec![
            log_at(sensor, Aggregation::None, 30, 4.0),
            log_at(sensor, Aggregation::None, 10, 5.0),
            log_at(sensor, Aggregation::PreAggregate, 20, 6.0),
            log_at(Uuid::new_v4(), Aggregation::None, 0, 7.0),
        ]);
        store.commit(write).await.unwrap();

        let raw = store
            .sensor_logs(sensor, &LogQuery::of(Aggregation::None))
            .await
            .unwrap();
        assert_eq!(
            raw.iter().map(|l| l.temperature).collect::<Vec<_>>(),
            vec![5.0, 4.0]
        );

        let all = store.sensor_logs(sensor, &LogQuery::all()).await.unwrap();
        assert_eq!(
            all.iter().map(|l| l.temperature).collect::<Vec<_>>(),
            vec![5.0, 6.0, 4.0]
        );
        assert_eq!(store.count_logs(sensor).await.unwrap(), 3);
    }

    #[tokio::test]
    async fn test_bounds_are_exclusive() {
        // ---
        let store = MemoryStore::new();
        let sensor = Uuid::new_v4();
        let logs: Vec<SensorLog> = (0..5)
            .map(|i| log_at(sensor, Aggregation::PreAggregate, i * 20, i as f64))
            .collect();
        let after = logs[1].timestamp;
        let before = logs[4].timestamp;
        store.commit(StoreWrite::new().put_logs(logs)).await.unwrap();

        let query = LogQuery::of(Aggregation::PreAggregate)
            .after(after)
            .before(before);
        let found = store.sensor_logs(sensor, &query).await.unwrap();
        assert_eq!(
            found.iter().map(|l| l.temperature).collect::<Vec<_>>(),
            vec![2.0, 3.0]
        );

        let latest = store
            .latest_log_timestamp(sensor, &LogQuery::all())
            .await
            .unwrap();
        assert_eq!(latest, Some(before));
    }

    #[tokio::test]
    async fn test_put_replaces_and_reindexes() {
        // ---
        let store = MemoryStore::new();
        let sensor = Uuid::new_v4();
        let mut log = log_at(sensor, Aggregation::None, 0, 3.0);
        store
            .commit(StoreWrite::new().put_logs(vec![log.clone()]))
            .await
            .unwrap();

        log.aggregation = Aggregation::PreAggregate;
        store
            .commit(StoreWrite::new().put_logs(vec![log.clone()]))
            .await
            .unwrap();

        let raw = store
            .sensor_logs(sensor, &LogQuery::of(Aggregation::None))
            .await
            .unwrap();
        assert!(raw.is_empty());
        assert_eq!(store.count_logs(sensor).await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_failed_commit_applies_nothing() {
        // ---
        let store = MemoryStore::new();
        let sensor = Uuid::new_v4();
        store.fail_next_commit();

        let write = StoreWrite::new().put_logs(vec![log_at(sensor, Aggregation::None, 0, 1.0)]);
        assert!(store.commit(write.clone()).await.is_err());
        assert_eq!(store.log_count().await, 0);

        store.commit(write).await.unwrap();
        assert_eq!(store.log_count().await, 1);
    }

    #[tokio::test]
    async fn test_item_batches_at_skips_empty_stock() {
        // ---
        let store = MemoryStore::new();
        let location = Uuid::new_v4();
        let stocked = ItemBatch {
            id: Uuid::new_v4(),
            item_id: Uuid::new_v4(),
            batch: "B1".into(),
            location_id: Some(location),
            number_of_packs: 10.0,
        };
        let empty = ItemBatch {
            id: Uuid::new_v4(),
            number_of_packs: 0.0,
            batch: "B2".into(),
            ..stocked.clone()
        };
        store.upsert_item_batch(&stocked).await.unwrap();
        store.upsert_item_batch(&empty).await.unwrap();

        let found = store.item_batches_at(location).await.unwrap();
        assert_eq!(found, vec![stocked]);
    }
}
