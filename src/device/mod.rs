//! Bluetooth temperature logger boundary.
//!
//! [`DeviceDriver`] is what the synchroniser needs from a logger: find it,
//! pull its stored readings, and clear them. [`GatewayDriver`] implements it
//! against an HTTP bridge that owns the actual BLE radio.

use async_trait::async_trait;
use thiserror::Error;

mod gateway;
mod parse;

pub use gateway::GatewayDriver;
pub use parse::{
    parse_downloaded_logs, read_i16, DownloadedLogs, ParseError, SensorAdvertisement,
    TemperatureReading, LOG_TERMINATOR,
};

// ---

/// Manufacturer id the loggers advertise with.
pub const MANUFACTURER_ID: u16 = 307;

/// UART command that dumps every stored reading.
pub const COMMAND_DOWNLOAD_LOGS: &str = "*logall";

/// UART command prefix that sets the log interval, which also clears the
/// device's log buffer.
pub const COMMAND_SET_LOG_INTERVAL: &str = "*lint";

#[derive(Error, Debug)]
pub enum DeviceError {
    #[error("failed to communicate with {mac_address} sending '{command}': {reason}")]
    Communication {
        mac_address: String,
        command: String,
        reason: String,
    },
    #[error("gateway request failed: {0}")]
    Gateway(#[from] reqwest::Error),
    #[error("failure while parsing: {0}")]
    Parse(#[from] ParseError),
}

#[async_trait]
pub trait DeviceDriver: Send + Sync {
    // ---
    /// Scan for the logger with `mac_address`, returning its raw
    /// advertisement bytes, or `None` if it is not in range.
    async fn scan(&self, mac_address: &str) -> Result<Option<Vec<u8>>, DeviceError>;

    async fn download_logs(&self, mac_address: &str) -> Result<DownloadedLogs, DeviceError>;

    /// Reset the logger's interval, clearing its onboard buffer.
    async fn send_reset(&self, mac_address: &str, log_interval: i64) -> Result<(), DeviceError>;
}
