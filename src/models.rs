//! Domain models for sensors, their temperature logs, breaches and the
//! inventory batches those logs are linked to.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

// ---

/// Aggregation stage of a [`SensorLog`].
///
/// The stage decides which pipeline step may consume a log: raw logs feed
/// pre-aggregation, pre-aggregates feed full aggregation, aggregates are
/// terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum Aggregation {
    #[default]
    None,
    PreAggregate,
    Aggregate,
}

impl Aggregation {
    // ---
    pub fn as_str(&self) -> &'static str {
        match self {
            Aggregation::None => "",
            Aggregation::PreAggregate => "preAggregate",
            Aggregation::Aggregate => "aggregate",
        }
    }
}

impl fmt::Display for Aggregation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Aggregation::None => f.write_str("none"),
            other => f.write_str(other.as_str()),
        }
    }
}

impl FromStr for Aggregation {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        // ---
        match s {
            "" | "none" => Ok(Aggregation::None),
            "preAggregate" => Ok(Aggregation::PreAggregate),
            "aggregate" => Ok(Aggregation::Aggregate),
            other => Err(format!("unknown aggregation '{other}'")),
        }
    }
}

/// A single temperature reading, raw or aggregated, owned by a sensor.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SensorLog {
    // ---
    pub id: Uuid,
    pub sensor_id: Uuid,
    pub location_id: Option<Uuid>,
    pub temperature: f64,
    pub timestamp: DateTime<Utc>,
    pub is_in_breach: bool,
    pub aggregation: Aggregation,
    /// Breach this log belongs to, if any.
    pub breach_id: Option<Uuid>,
    /// Item batches stored at the log's location when it was written.
    pub item_batches: Vec<Uuid>,
}

/// A physical temperature logger.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Sensor {
    // ---
    pub id: Uuid,
    pub mac_address: String,
    pub name: String,
    pub location_id: Option<Uuid>,
    /// Seconds between physical readings.
    pub log_interval: i64,
    pub battery_level: i32,
    pub last_temperature: Option<f64>,
    pub number_of_logs: i64,
    pub last_connection_timestamp: Option<DateTime<Utc>>,
}

impl Sensor {
    // ---
    pub fn new(mac_address: impl Into<String>, name: impl Into<String>, log_interval: i64) -> Self {
        Sensor {
            id: Uuid::new_v4(),
            mac_address: mac_address.into(),
            name: name.into(),
            location_id: None,
            log_interval,
            battery_level: 0,
            last_temperature: None,
            number_of_logs: 0,
            last_connection_timestamp: None,
        }
    }

    pub fn with_location(mut self, location_id: Uuid) -> Self {
        self.location_id = Some(location_id);
        self
    }
}

/// Stock of a single item batch and where it currently sits.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, sqlx::FromRow)]
pub struct ItemBatch {
    // ---
    pub id: Uuid,
    pub item_id: Uuid,
    pub batch: String,
    pub location_id: Option<Uuid>,
    pub number_of_packs: f64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum BreachType {
    HotConsecutive,
    ColdConsecutive,
}

impl BreachType {
    // ---
    pub fn as_str(&self) -> &'static str {
        match self {
            BreachType::HotConsecutive => "HOT_CONSECUTIVE",
            BreachType::ColdConsecutive => "COLD_CONSECUTIVE",
        }
    }
}

impl FromStr for BreachType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "HOT_CONSECUTIVE" => Ok(BreachType::HotConsecutive),
            "COLD_CONSECUTIVE" => Ok(BreachType::ColdConsecutive),
            other => Err(format!("unknown breach type '{other}'")),
        }
    }
}

/// Describes which readings form a breach.
///
/// A log could be part of a breach for this configuration when its
/// temperature lies inside the inclusive `[minimum, maximum]` range; a run
/// of such logs becomes a breach once it spans at least `duration_secs`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BreachConfiguration {
    // ---
    pub id: Uuid,
    pub breach_type: BreachType,
    pub minimum_temperature: f64,
    pub maximum_temperature: f64,
    pub duration_secs: i64,
}

impl BreachConfiguration {
    // ---
    pub fn duration(&self) -> Duration {
        Duration::seconds(self.duration_secs)
    }

    pub fn contains(&self, temperature: f64) -> bool {
        temperature >= self.minimum_temperature && temperature <= self.maximum_temperature
    }

    /// Configurations installed when the store has none: above 8°C for an
    /// hour, or below 2°C for 15 minutes.
    pub fn defaults() -> Vec<BreachConfiguration> {
        // ---
        vec![
            BreachConfiguration {
                id: Uuid::new_v4(),
                breach_type: BreachType::HotConsecutive,
                minimum_temperature: 8.0,
                maximum_temperature: 999.0,
                duration_secs: 60 * 60,
            },
            BreachConfiguration {
                id: Uuid::new_v4(),
                breach_type: BreachType::ColdConsecutive,
                minimum_temperature: -999.0,
                maximum_temperature: 2.0,
                duration_secs: 15 * 60,
            },
        ]
    }
}

/// A contiguous excursion outside the configured range. Open while
/// `end_timestamp` is `None`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TemperatureBreach {
    // ---
    pub id: Uuid,
    pub sensor_id: Uuid,
    pub location_id: Option<Uuid>,
    pub breach_type: BreachType,
    pub threshold_minimum_temperature: f64,
    pub threshold_maximum_temperature: f64,
    pub threshold_duration_secs: i64,
    pub start_timestamp: DateTime<Utc>,
    pub end_timestamp: Option<DateTime<Utc>>,
}

impl TemperatureBreach {
    // ---
    pub fn open(sensor: &Sensor, config: &BreachConfiguration, start: DateTime<Utc>) -> Self {
        TemperatureBreach {
            id: Uuid::new_v4(),
            sensor_id: sensor.id,
            location_id: sensor.location_id,
            breach_type: config.breach_type,
            threshold_minimum_temperature: config.minimum_temperature,
            threshold_maximum_temperature: config.maximum_temperature,
            threshold_duration_secs: config.duration_secs,
            start_timestamp: start,
            end_timestamp: None,
        }
    }

    pub fn is_open(&self) -> bool {
        self.end_timestamp.is_none()
    }

    /// Whether `temperature` keeps this breach going.
    pub fn continues_with(&self, temperature: f64) -> bool {
        temperature >= self.threshold_minimum_temperature
            && temperature <= self.threshold_maximum_temperature
    }
}
