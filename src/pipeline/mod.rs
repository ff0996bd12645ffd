//! Temperature log pipeline: ingest raw readings, pre-aggregate into
//! 20-minute minimums, scan for breaches, then fold old pre-aggregates into
//! 8-hour min/max pairs.
//!
//! Each stage reads committed store state and commits its own writes before
//! returning, so a later stage never sees a half-finished earlier one.

use chrono::Duration;
use uuid::Uuid;

use crate::store::{SensorStore, StoreError};

mod breach;
pub mod factory;
mod full_aggregate;
mod ingest;
mod pre_aggregate;

pub use breach::{scan_breaches, BreachScan};
pub use full_aggregate::{full_aggregate, FullAggregation};
pub use ingest::{ingest, Ingestion};
pub use pre_aggregate::{pre_aggregate, PreAggregation};

// ---

/// Width of a pre-aggregation window.
pub fn pre_aggregate_interval() -> Duration {
    Duration::minutes(20)
}

/// Maximum span of a full-aggregation run. The extra five minutes absorb
/// clock drift between pre-aggregate stamps.
pub fn full_aggregation_interval() -> Duration {
    Duration::hours(8) + Duration::minutes(5)
}

/// Pre-aggregates younger than this (relative to the newest one) are never
/// rolled up.
pub fn retention_buffer() -> Duration {
    full_aggregation_interval() * 4
}

/// Ids of batches with stock at `location_id` right now.
pub(crate) async fn batches_at(
    store: &dyn SensorStore,
    location_id: Option<Uuid>,
) -> Result<Vec<Uuid>, StoreError> {
    // ---
    match location_id {
        Some(location_id) => Ok(store
            .item_batches_at(location_id)
            .await?
            .into_iter()
            .map(|batch| batch.id)
            .collect()),
        None => Ok(Vec::new()),
    }
}
