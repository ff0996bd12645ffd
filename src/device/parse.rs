//! Decoding of the byte payloads sent by the temperature loggers.
//!
//! All integers are 16-bit big-endian two's complement (`byte[i] * 256 +
//! byte[i + 1]`); temperatures are transmitted in tenths of a degree.

use serde::Serialize;
use thiserror::Error;

// ---

/// Reading value that marks the end of a downloaded log dump.
pub const LOG_TERMINATOR: i16 = 11308;

const BATTERY_OFFSET: usize = 8;
const LOG_INTERVAL_OFFSET: usize = 9;
const NUMBER_OF_LOGS_OFFSET: usize = 11;
const TEMPERATURE_OFFSET: usize = 13;
const TOTAL_RECORDS_OFFSET: usize = 4;

#[derive(Error, Debug, PartialEq, Eq)]
pub enum ParseError {
    #[error("payload too short: need {needed} bytes, got {len}")]
    Truncated { needed: usize, len: usize },
    #[error("no result lines downloaded")]
    Empty,
    #[error("log dump ended without terminator")]
    MissingTerminator,
    #[error("advertised log interval {0}s is not positive")]
    InvalidLogInterval(i64),
}

/// Signed 16-bit big-endian integer at `offset`.
pub fn read_i16(bytes: &[u8], offset: usize) -> Result<i16, ParseError> {
    // ---
    match bytes.get(offset..offset + 2) {
        Some(&[high, low]) => Ok(i16::from_be_bytes([high, low])),
        _ => Err(ParseError::Truncated {
            needed: offset + 2,
            len: bytes.len(),
        }),
    }
}

/// Decoded manufacturer data from a sensor's BLE advertisement.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct SensorAdvertisement {
    // ---
    pub battery_level: u8,
    /// Seconds between readings.
    pub log_interval: i64,
    /// Readings waiting on the device.
    pub number_of_logs: i64,
    pub temperature: f64,
}

impl SensorAdvertisement {
    // ---
    /// Rejects an advertisement whose log interval is zero or negative,
    /// since its readings could not be placed in time.
    pub fn parse(bytes: &[u8]) -> Result<Self, ParseError> {
        // ---
        let battery_level = *bytes.get(BATTERY_OFFSET).ok_or(ParseError::Truncated {
            needed: BATTERY_OFFSET + 1,
            len: bytes.len(),
        })?;

        let advertisement = SensorAdvertisement {
            battery_level,
            log_interval: i64::from(read_i16(bytes, LOG_INTERVAL_OFFSET)?),
            number_of_logs: i64::from(read_i16(bytes, NUMBER_OF_LOGS_OFFSET)?),
            temperature: f64::from(read_i16(bytes, TEMPERATURE_OFFSET)?) / 10.0,
        };
        if advertisement.log_interval <= 0 {
            return Err(ParseError::InvalidLogInterval(advertisement.log_interval));
        }
        Ok(advertisement)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct TemperatureReading {
    pub temperature: f64,
}

/// Readings pulled from a device, oldest first, without timestamps.
#[derive(Debug, Clone, PartialEq, Default, Serialize)]
pub struct DownloadedLogs {
    // ---
    pub readings: Vec<TemperatureReading>,
    /// Record count reported in the dump header.
    pub total_number_of_records: i64,
}

/// Decode the result lines of a `*logall` command.
///
/// The first line is a header with the record count at offset 4. Every
/// following line is a run of 16-bit readings; [`LOG_TERMINATOR`] ends the
/// dump. A dump without the terminator is rejected as incomplete.
pub fn parse_downloaded_logs(lines: &[Vec<u8>]) -> Result<DownloadedLogs, ParseError> {
    // ---
    let (header, body) = lines.split_first().ok_or(ParseError::Empty)?;
    let total_number_of_records = i64::from(read_i16(header, TOTAL_RECORDS_OFFSET)?);

    let mut readings = Vec::new();
    for line in body {
        for offset in (0..line.len()).step_by(2) {
            let raw = read_i16(line, offset)?;
            if raw == LOG_TERMINATOR {
                return Ok(DownloadedLogs {
                    readings,
                    total_number_of_records,
                });
            }
            readings.push(TemperatureReading {
                temperature: f64::from(raw) / 10.0,
            });
        }
    }

    Err(ParseError::MissingTerminator)
}
