//! Device and tag definitions in the configuration file.

use std::collections::HashSet;

use serde::{Deserialize, Serialize};

use crate::storage::{DeviceRecord, TagRecord};

use super::validation::ConfigError;

fn default_protocol() -> String {
    "webmi".to_string()
}

fn default_enabled() -> bool {
    true
}

fn default_scale() -> f64 {
    1.0
}

/// One signal read from a device.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TagConfig {
    /// Stored signal name, e.g. `I_PH1`.
    pub signal: String,

    /// Key requested from the device.
    #[serde(alias = "key")]
    pub address_key: String,

    #[serde(default)]
    pub unit: Option<String>,

    /// Raw values are divided by this.
    #[serde(default = "default_scale")]
    pub scale: f64,

    #[serde(default = "default_enabled")]
    pub enabled: bool,
}

/// One meter in the fleet.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeviceConfig {
    /// Fixed registry id. Assigned by the database when omitted.
    #[serde(default)]
    pub id: Option<i64>,

    /// Unique device name.
    pub name: String,

    /// `host[:port]`.
    pub address: String,

    #[serde(default = "default_protocol")]
    pub protocol: String,

    #[serde(default = "default_enabled")]
    pub enabled: bool,

    /// Overrides `acquisition.default_poll_interval_ms`.
    #[serde(default)]
    pub poll_interval_ms: Option<u64>,

    #[serde(default)]
    pub tags: Vec<TagConfig>,
}

impl DeviceConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        let ctx = format!("device '{}'", self.name);
        if self.name.trim().is_empty() {
            return Err(ConfigError::invalid("device name must not be empty"));
        }
        if self.address.trim().is_empty() {
            return Err(ConfigError::invalid(format!("{ctx}: address must not be empty")));
        }
        if self.protocol != "webmi" {
            return Err(ConfigError::invalid(format!(
                "{ctx}: unsupported protocol '{}'",
                self.protocol
            )));
        }
        if self.poll_interval_ms == Some(0) {
            return Err(ConfigError::invalid(format!(
                "{ctx}: poll_interval_ms must be positive"
            )));
        }

        let mut signals = HashSet::new();
        for tag in &self.tags {
            if tag.signal.is_empty() || tag.address_key.is_empty() {
                return Err(ConfigError::invalid(format!(
                    "{ctx}: tag signal and address_key must not be empty"
                )));
            }
            if !signals.insert(tag.signal.as_str()) {
                return Err(ConfigError::invalid(format!(
                    "{ctx}: duplicate signal '{}'",
                    tag.signal
                )));
            }
            if !tag.scale.is_finite() || tag.scale == 0.0 {
                return Err(ConfigError::invalid(format!(
                    "{ctx}: tag '{}' scale must be finite and non-zero",
                    tag.signal
                )));
            }
        }
        Ok(())
    }

    pub fn to_record(&self) -> DeviceRecord {
        DeviceRecord {
            id: self.id,
            name: self.name.clone(),
            address: self.address.clone(),
            protocol: self.protocol.clone(),
            enabled: self.enabled,
            poll_interval_ms: self.poll_interval_ms,
            tags: self
                .tags
                .iter()
                .map(|t| TagRecord {
                    signal: t.signal.clone(),
                    address_key: t.address_key.clone(),
                    unit: t.unit.clone(),
                    scale: t.scale,
                    enabled: t.enabled,
                })
                .collect(),
        }
    }
}
