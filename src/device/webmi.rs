//! WebMI JSON read client.
//!
//! Reads are a form-encoded POST of `address[]=<key>` pairs to
//! `http://<address>/webMI/?read`. The device answers with
//! `{"result": [{"value": .., "error": 0}, ..], "error": 0}`, one entry per
//! requested address in request order. A non-zero per-entry error marks that
//! key as unreadable.

use std::time::Duration;

use reqwest::Client;
use serde::Deserialize;

use crate::device::traits::{DeviceClient, DeviceError, RawValues};
use crate::storage::{Device, TagMap};

/// Default request timeout (1500 ms).
pub const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_millis(1_500);

/// Key read by the connectivity probe (network frequency).
const PROBE_ADDRESS: &str = "F_255";

#[derive(Debug, Deserialize)]
struct ReadResponse {
    #[serde(default)]
    result: Vec<ReadResult>,
    #[serde(default)]
    error: i64,
}

#[derive(Debug, Deserialize)]
struct ReadResult {
    #[serde(default)]
    value: serde_json::Value,
    #[serde(default)]
    error: i64,
}

impl ReadResult {
    fn as_f64(&self) -> Option<f64> {
        if self.error != 0 {
            return None;
        }
        match &self.value {
            serde_json::Value::Number(n) => n.as_f64(),
            serde_json::Value::String(s) => s.trim().parse().ok(),
            serde_json::Value::Bool(b) => Some(if *b { 1.0 } else { 0.0 }),
            _ => None,
        }
    }
}

/// HTTP client for WebMI-speaking meters.
#[derive(Debug, Clone)]
pub struct WebMiClient {
    client: Client,
    scheme: &'static str,
}

impl WebMiClient {
    /// Create a client with the given per-request timeout.
    pub fn new(timeout: Duration) -> Result<Self, DeviceError> {
        let client = Client::builder()
            .timeout(timeout)
            .connect_timeout(timeout)
            .build()?;
        Ok(Self {
            client,
            scheme: "http",
        })
    }

    /// Read endpoint for a device.
    pub fn endpoint(&self, device: &Device) -> String {
        format!("{}://{}/webMI/?read", self.scheme, device.address)
    }

    async fn read_addresses(
        &self,
        device: &Device,
        addresses: &[&str],
    ) -> Result<RawValues, DeviceError> {
        let form: Vec<(&str, &str)> = addresses.iter().map(|a| ("address[]", *a)).collect();

        let response = self
            .client
            .post(self.endpoint(device))
            .form(&form)
            .send()
            .await?
            .error_for_status()?;

        let body: ReadResponse = response.json().await?;
        if body.error != 0 && body.result.is_empty() {
            return Err(DeviceError::Device(body.error));
        }

        let mut values = RawValues::with_capacity(addresses.len());
        for (i, address) in addresses.iter().enumerate() {
            let value = body.result.get(i).and_then(ReadResult::as_f64);
            if value.is_none() {
                tracing::debug!(device_id = device.id, address, "Address unreadable");
            }
            values.insert((*address).to_string(), value);
        }
        Ok(values)
    }
}

#[async_trait::async_trait]
impl DeviceClient for WebMiClient {
    async fn read(&self, device: &Device, tags: &[TagMap]) -> Result<RawValues, DeviceError> {
        let addresses: Vec<&str> = tags.iter().map(|t| t.address_key.as_str()).collect();
        self.read_addresses(device, &addresses).await
    }

    async fn probe(&self, device: &Device) -> Result<(), DeviceError> {
        let values = self.read_addresses(device, &[PROBE_ADDRESS]).await?;
        if values.values().any(Option::is_some) {
            Ok(())
        } else {
            Err(DeviceError::Decode(format!(
                "probe address {PROBE_ADDRESS} returned no value"
            )))
        }
    }
}
