use std::collections::HashMap;

use async_trait::async_trait;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use tracing::debug;

use super::{
    parse_downloaded_logs, DeviceDriver, DeviceError, DownloadedLogs, COMMAND_DOWNLOAD_LOGS,
    COMMAND_SET_LOG_INTERVAL,
};
use crate::Config;

// ---

#[derive(Debug, Serialize)]
struct ScanRequest<'a> {
    manufacturer_id: u16,
    timeout_ms: u64,
    mac_address: &'a str,
}

#[derive(Debug, Deserialize)]
struct ScannedDevice {
    #[serde(default)]
    name: Option<String>,
    advertisement_data: Vec<u8>,
}

#[derive(Debug, Serialize)]
struct CommandRequest<'a> {
    command: &'a str,
    connection_delay_ms: u64,
    reconnect_attempts: u32,
}

#[derive(Debug, Deserialize)]
struct CommandResponse {
    #[serde(default)]
    raw_result_lines: Option<Vec<Vec<u8>>>,
}

/// Talks to a BLE bridge over HTTP.
///
/// The bridge exposes:
/// - `POST /devices/scan` → `{ "<mac>": { name, advertisement_data: [u8] } }`
/// - `POST /devices/{mac}/commands` → `{ raw_result_lines: [[u8]] }`
#[derive(Debug, Clone)]
pub struct GatewayDriver {
    client: Client,
    base_url: String,
    manufacturer_id: u16,
    scan_timeout_ms: u64,
    connection_delay_ms: u64,
    reconnect_attempts: u32,
}

impl GatewayDriver {
    // ---
    pub fn new(config: &Config) -> Self {
        GatewayDriver {
            client: Client::new(),
            base_url: config.gateway_url.trim_end_matches('/').to_string(),
            manufacturer_id: config.manufacturer_id,
            scan_timeout_ms: config.device_timeout_ms,
            connection_delay_ms: config.connection_delay_ms,
            reconnect_attempts: config.reconnect_attempts,
        }
    }

    async fn send_command(
        &self,
        mac_address: &str,
        command: &str,
    ) -> Result<Vec<Vec<u8>>, DeviceError> {
        // ---
        let url = format!("{}/devices/{}/commands", self.base_url, mac_address);
        debug!("Sending '{}' to {} via {}", command, mac_address, url);

        let response: CommandResponse = self
            .client
            .post(&url)
            .json(&CommandRequest {
                command,
                connection_delay_ms: self.connection_delay_ms,
                reconnect_attempts: self.reconnect_attempts,
            })
            .send()
            .await?
            .error_for_status()?
            .json()
            .await?;

        response
            .raw_result_lines
            .ok_or_else(|| DeviceError::Communication {
                mac_address: mac_address.to_string(),
                command: command.to_string(),
                reason: "no result from UART command".to_string(),
            })
    }
}

#[async_trait]
impl DeviceDriver for GatewayDriver {
    // ---
    async fn scan(&self, mac_address: &str) -> Result<Option<Vec<u8>>, DeviceError> {
        // ---
        let url = format!("{}/devices/scan", self.base_url);
        let mut found: HashMap<String, ScannedDevice> = self
            .client
            .post(&url)
            .json(&ScanRequest {
                manufacturer_id: self.manufacturer_id,
                timeout_ms: self.scan_timeout_ms,
                mac_address,
            })
            .send()
            .await?
            .error_for_status()?
            .json()
            .await?;

        debug!("Scan for {} returned {} devices", mac_address, found.len());
        Ok(found.remove(mac_address).map(|device| {
            if let Some(name) = &device.name {
                debug!("Found {} ({})", mac_address, name);
            }
            device.advertisement_data
        }))
    }

    async fn download_logs(&self, mac_address: &str) -> Result<DownloadedLogs, DeviceError> {
        // ---
        let lines = self.send_command(mac_address, COMMAND_DOWNLOAD_LOGS).await?;
        Ok(parse_downloaded_logs(&lines)?)
    }

    async fn send_reset(&self, mac_address: &str, log_interval: i64) -> Result<(), DeviceError> {
        // ---
        let command = format!("{COMMAND_SET_LOG_INTERVAL}{log_interval}");
        self.send_command(mac_address, &command).await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    // ---
    use super::*;
    use axum::{extract::Path, routing::post, Json, Router};
    use serde_json::{json, Value};

    const MAC: &str = "AA:BB:CC:DD:EE:FF";

    async fn spawn_bridge() -> String {
        // ---
        async fn scan(Json(body): Json<Value>) -> Json<Value> {
            if body["mac_address"] == MAC {
                let mut advertisement = vec![0u8; 15];
                advertisement[8] = 90;
                advertisement[10] = 60;
                advertisement[14] = 40;
                Json(json!({ MAC: { "name": "fridge", "advertisement_data": advertisement } }))
            } else {
                Json(json!({}))
            }
        }

        async fn command(Path(mac): Path<String>, Json(body): Json<Value>) -> Json<Value> {
            match body["command"].as_str() {
                Some("*logall") if mac == MAC => Json(json!({
                    "raw_result_lines": [[0, 0, 0, 0, 0, 2], [0, 45, 0, 50, 0x2C, 0x2C]]
                })),
                Some("*lint240") => Json(json!({ "raw_result_lines": [] })),
                _ => Json(json!({})),
            }
        }

        let app = Router::new()
            .route("/devices/scan", post(scan))
            .route("/devices/{mac}/commands", post(command));
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });
        format!("http://{}", addr)
    }

    fn driver(base_url: String) -> GatewayDriver {
        // ---
        GatewayDriver {
            client: Client::new(),
            base_url,
            manufacturer_id: 307,
            scan_timeout_ms: 1_000,
            connection_delay_ms: 450,
            reconnect_attempts: 11,
        }
    }

    #[tokio::test]
    async fn test_scan_returns_advertisement_of_requested_sensor() {
        // ---
        let driver = driver(spawn_bridge().await);

        let bytes = driver.scan(MAC).await.unwrap().unwrap();
        assert_eq!(bytes.len(), 15);
        assert_eq!(bytes[8], 90);

        assert!(driver.scan("11:22:33:44:55:66").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_download_logs_parses_dump() {
        // ---
        let driver = driver(spawn_bridge().await);

        let logs = driver.download_logs(MAC).await.unwrap();
        assert_eq!(logs.total_number_of_records, 2);
        let temperatures: Vec<f64> = logs.readings.iter().map(|r| r.temperature).collect();
        assert_eq!(temperatures, vec![4.5, 5.0]);
    }

    #[tokio::test]
    async fn test_reset_and_missing_result() {
        // ---
        let driver = driver(spawn_bridge().await);

        driver.send_reset(MAC, 240).await.unwrap();

        let err = driver.send_reset(MAC, 60).await.unwrap_err();
        assert!(matches!(err, DeviceError::Communication { .. }));
    }
}
