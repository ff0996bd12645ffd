//! Breach summaries for compliance reporting.
//!
//! Figures come from the logs in each breach and from the item batches
//! those logs were linked to when the breach was detected. The edge logs
//! pinned on either side give the temperature before and after.

use std::collections::BTreeSet;

use chrono::{DateTime, Utc};
use serde::Serialize;
use uuid::Uuid;

use crate::models::{BreachType, SensorLog, TemperatureBreach};
use crate::store::{SensorStore, StoreError};

// ---

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct BreachSummary {
    // ---
    pub breach_id: Uuid,
    pub sensor_id: Uuid,
    pub location_id: Option<Uuid>,
    pub breach_type: BreachType,
    pub is_open: bool,
    /// Earliest breach log, or the breach start when no logs are linked.
    pub start_timestamp: DateTime<Utc>,
    /// Latest breach log.
    pub end_timestamp: Option<DateTime<Utc>>,
    pub duration_secs: i64,
    pub minimum_temperature: Option<f64>,
    pub maximum_temperature: Option<f64>,
    pub number_of_logs: usize,
    /// Pinned log just before the breach run.
    pub temperature_before: Option<f64>,
    /// Pinned log just after the breach run.
    pub temperature_after: Option<f64>,
    pub number_of_affected_batches: usize,
    /// Packs across every distinct batch linked to the breach's logs.
    pub affected_quantity: f64,
}

/// Summarise one breach from its linked logs and batches.
pub async fn breach_summary(
    store: &dyn SensorStore,
    breach: &TemperatureBreach,
) -> Result<BreachSummary, StoreError> {
    // ---
    let (logs, edges): (Vec<SensorLog>, Vec<SensorLog>) = store
        .breach_logs(breach.id)
        .await?
        .into_iter()
        .partition(|log| log.is_in_breach);

    let temperatures = logs.iter().map(|log| log.temperature);
    let minimum_temperature = temperatures.clone().reduce(f64::min);
    let maximum_temperature = temperatures.reduce(f64::max);

    let start_timestamp = logs
        .iter()
        .map(|log| log.timestamp)
        .min()
        .unwrap_or(breach.start_timestamp);
    let end_timestamp = logs.iter().map(|log| log.timestamp).max();
    let duration_secs = end_timestamp
        .map_or(0, |end| (end - start_timestamp).num_seconds());

    let temperature_before = edges
        .iter()
        .find(|log| log.timestamp < start_timestamp)
        .map(|log| log.temperature);
    let temperature_after = edges
        .iter()
        .rev()
        .find(|log| end_timestamp.is_some_and(|end| log.timestamp > end))
        .map(|log| log.temperature);

    let batch_ids: BTreeSet<Uuid> = logs
        .iter()
        .flat_map(|log| log.item_batches.iter().copied())
        .collect();
    let batch_ids: Vec<Uuid> = batch_ids.into_iter().collect();
    let batches = store.item_batches(&batch_ids).await?;

    Ok(BreachSummary {
        breach_id: breach.id,
        sensor_id: breach.sensor_id,
        location_id: breach.location_id,
        breach_type: breach.breach_type,
        is_open: breach.is_open(),
        start_timestamp,
        end_timestamp,
        duration_secs,
        minimum_temperature,
        maximum_temperature,
        number_of_logs: logs.len(),
        temperature_before,
        temperature_after,
        number_of_affected_batches: batches.len(),
        affected_quantity: batches.iter().map(|b| b.number_of_packs).sum(),
    })
}

/// Summaries for every breach of a sensor, oldest first.
pub async fn sensor_breach_report(
    store: &dyn SensorStore,
    sensor_id: Uuid,
) -> Result<Vec<BreachSummary>, StoreError> {
    // ---
    let mut summaries = Vec::new();
    for breach in store.breaches(sensor_id).await? {
        summaries.push(breach_summary(store, &breach).await?);
    }
    Ok(summaries)
}
