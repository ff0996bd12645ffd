//! Persistent object store boundary.
//!
//! The pipeline only talks to [`SensorStore`]; two backends implement it:
//! - [`MemoryStore`]: arena of logs keyed by id plus a
//!   `(sensor, aggregation, timestamp)` index
//! - [`PgStore`]: Postgres via `sqlx`, schema from [`crate::schema`]
//!
//! Every mutation goes through [`SensorStore::commit`], which applies a
//! [`StoreWrite`] atomically: readers never observe half of a write.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use thiserror::Error;
use uuid::Uuid;

use crate::models::{
    Aggregation, BreachConfiguration, ItemBatch, Sensor, SensorLog, TemperatureBreach,
};

mod memory;
mod postgres;

pub use memory::MemoryStore;
pub use postgres::PgStore;

// ---

#[derive(Error, Debug)]
pub enum StoreError {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
    #[error("corrupt record: {0}")]
    Corrupt(String),
    #[error("store unavailable: {0}")]
    Unavailable(String),
}

/// Filter for log queries. Results are always sorted by ascending timestamp.
///
/// `after` and `before` are exclusive bounds.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct LogQuery {
    // ---
    pub aggregation: Option<Aggregation>,
    pub after: Option<DateTime<Utc>>,
    pub before: Option<DateTime<Utc>>,
    pub in_breach: Option<bool>,
    pub limit: Option<usize>,
}

impl LogQuery {
    // ---
    pub fn all() -> Self {
        Self::default()
    }

    pub fn of(aggregation: Aggregation) -> Self {
        LogQuery {
            aggregation: Some(aggregation),
            ..Self::default()
        }
    }

    pub fn after(mut self, timestamp: DateTime<Utc>) -> Self {
        self.after = Some(timestamp);
        self
    }

    pub fn before(mut self, timestamp: DateTime<Utc>) -> Self {
        self.before = Some(timestamp);
        self
    }

    pub fn in_breach(mut self, in_breach: bool) -> Self {
        self.in_breach = Some(in_breach);
        self
    }

    pub fn limit(mut self, limit: usize) -> Self {
        self.limit = Some(limit);
        self
    }

    /// Whether `log` satisfies every filter except `limit`.
    pub fn matches(&self, log: &SensorLog) -> bool {
        // ---
        self.aggregation.map_or(true, |a| log.aggregation == a)
            && self.after.map_or(true, |t| log.timestamp > t)
            && self.before.map_or(true, |t| log.timestamp < t)
            && self.in_breach.map_or(true, |b| log.is_in_breach == b)
    }
}

/// A set of mutations applied in one atomic commit.
#[derive(Debug, Default, Clone)]
pub struct StoreWrite {
    // ---
    /// Inserted, or replaced by id. Item batch links are replaced too.
    pub put_logs: Vec<SensorLog>,
    pub delete_logs: Vec<Uuid>,
    pub put_breaches: Vec<TemperatureBreach>,
}

impl StoreWrite {
    // ---
    pub fn new() -> Self {
        Self::default()
    }

    pub fn put_logs(mut self, logs: impl IntoIterator<Item = SensorLog>) -> Self {
        self.put_logs.extend(logs);
        self
    }

    pub fn delete_logs(mut self, ids: impl IntoIterator<Item = Uuid>) -> Self {
        self.delete_logs.extend(ids);
        self
    }

    pub fn put_breaches(mut self, breaches: impl IntoIterator<Item = TemperatureBreach>) -> Self {
        self.put_breaches.extend(breaches);
        self
    }

    pub fn is_empty(&self) -> bool {
        self.put_logs.is_empty() && self.delete_logs.is_empty() && self.put_breaches.is_empty()
    }
}

#[async_trait]
pub trait SensorStore: Send + Sync {
    // ---
    /// Short backend name for logs and the health endpoint.
    fn backend(&self) -> &'static str;

    async fn sensor(&self, id: Uuid) -> Result<Option<Sensor>, StoreError>;

    /// Sensors currently placed in a location.
    async fn located_sensors(&self) -> Result<Vec<Sensor>, StoreError>;

    async fn upsert_sensor(&self, sensor: &Sensor) -> Result<(), StoreError>;

    async fn sensor_logs(
        &self,
        sensor_id: Uuid,
        query: &LogQuery,
    ) -> Result<Vec<SensorLog>, StoreError>;

    /// Largest timestamp among the sensor's logs matching `query`.
    async fn latest_log_timestamp(
        &self,
        sensor_id: Uuid,
        query: &LogQuery,
    ) -> Result<Option<DateTime<Utc>>, StoreError>;

    async fn count_logs(&self, sensor_id: Uuid) -> Result<usize, StoreError>;

    /// Batches with stock (`number_of_packs > 0`) at `location_id`.
    async fn item_batches_at(&self, location_id: Uuid) -> Result<Vec<ItemBatch>, StoreError>;

    async fn item_batches(&self, ids: &[Uuid]) -> Result<Vec<ItemBatch>, StoreError>;

    async fn upsert_item_batch(&self, batch: &ItemBatch) -> Result<(), StoreError>;

    async fn breach_configurations(&self) -> Result<Vec<BreachConfiguration>, StoreError>;

    async fn upsert_breach_configuration(
        &self,
        config: &BreachConfiguration,
    ) -> Result<(), StoreError>;

    /// Breaches for a sensor, oldest first.
    async fn breaches(&self, sensor_id: Uuid) -> Result<Vec<TemperatureBreach>, StoreError>;

    async fn most_recent_breach(
        &self,
        sensor_id: Uuid,
    ) -> Result<Option<TemperatureBreach>, StoreError> {
        Ok(self.breaches(sensor_id).await?.pop())
    }

    /// Logs linked to a breach, oldest first.
    async fn breach_logs(&self, breach_id: Uuid) -> Result<Vec<SensorLog>, StoreError>;

    /// Apply every mutation in `write`, or none of them.
    async fn commit(&self, write: StoreWrite) -> Result<(), StoreError>;
}
