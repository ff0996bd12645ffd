//! Cold-chain sensor sync: pulls temperature readings off Bluetooth loggers,
//! aggregates them in two stages to bound storage, and records temperature
//! breaches against the stock held where each sensor sits.
//!
//! Module layout follows the Explicit Module Boundary Pattern (EMBP): each
//! directory module is a gateway that re-exports what its siblings need.
//! - [`device`]: logger protocol and the BLE gateway driver
//! - [`store`]: persistence boundary, Postgres and in-memory backends
//! - [`pipeline`]: ingest, pre-aggregate, breach scan, full aggregate
//! - [`synchroniser`]: the per-sensor sync state machine
//! - [`report`]: breach summaries
//! - [`routes`]: HTTP surface

pub mod config;
pub mod device;
pub mod models;
pub mod pipeline;
pub mod report;
pub mod routes;
pub mod schema;
pub mod store;
pub mod synchroniser;

pub use config::Config;
pub use device::{DeviceDriver, DeviceError, GatewayDriver};
pub use models::{
    Aggregation, BreachConfiguration, BreachType, ItemBatch, Sensor, SensorLog, TemperatureBreach,
};
pub use store::{MemoryStore, PgStore, SensorStore, StoreError};
pub use synchroniser::{ProgressLog, ProgressReporter, ProgressUpdate, SyncError, Synchroniser};
