//! Core data types shared by the acquisition pipeline and the storage layer.
//!
//! - [`Device`]: A field power meter registered for polling
//! - [`TagMap`]: Mapping from a raw device address key to a named signal
//! - [`Measurement`]: One time-series point produced by a device read
//! - [`Quality`]: Quality flag attached to every measurement

use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use strum_macros::{AsRefStr, Display, EnumString};

/// Identifier of a device in the registry.
pub type DeviceId = i64;

/// A field device polled by the acquisition engine.
///
/// Devices are owned by the registry; the engine only reads them and writes
/// back `last_seen` after a successful read.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Device {
    /// Registry identifier.
    pub id: DeviceId,
    /// Human readable name.
    pub name: String,
    /// Network address (`host` or `host:port`).
    pub address: String,
    /// Protocol tag (e.g. `webmi`).
    pub protocol: String,
    /// Whether the device participates in acquisition cycles.
    pub enabled: bool,
    /// Per-device poll interval, falls back to the acquisition default when absent.
    pub poll_interval_ms: Option<u64>,
    /// Last successful read.
    pub last_seen: Option<DateTime<Utc>>,
}

impl Device {
    /// Create an enabled device with no poll interval override.
    pub fn new(id: DeviceId, name: impl Into<String>, address: impl Into<String>) -> Self {
        Self {
            id,
            name: name.into(),
            address: address.into(),
            protocol: "webmi".to_string(),
            enabled: true,
            poll_interval_ms: None,
            last_seen: None,
        }
    }

    /// Set a per-device poll interval.
    pub fn with_poll_interval_ms(mut self, interval_ms: u64) -> Self {
        self.poll_interval_ms = Some(interval_ms);
        self
    }

    /// Set the enabled flag.
    pub fn with_enabled(mut self, enabled: bool) -> Self {
        self.enabled = enabled;
        self
    }

    /// Effective poll interval given the engine default.
    pub fn poll_interval(&self, default: Duration) -> Duration {
        self.poll_interval_ms
            .filter(|ms| *ms > 0)
            .map(Duration::from_millis)
            .unwrap_or(default)
    }
}

/// Maps a raw device key to a named signal.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TagMap {
    pub device_id: DeviceId,
    /// Logical signal name (e.g. `I_PH1`).
    pub signal: String,
    /// Key used on the wire to read the raw value.
    pub address_key: String,
    pub unit: Option<String>,
    /// Raw values are divided by this factor.
    pub scale: f64,
    pub enabled: bool,
}

impl TagMap {
    /// Create an enabled tag with scale 1.0 and no unit.
    pub fn new(
        device_id: DeviceId,
        signal: impl Into<String>,
        address_key: impl Into<String>,
    ) -> Self {
        Self {
            device_id,
            signal: signal.into(),
            address_key: address_key.into(),
            unit: None,
            scale: 1.0,
            enabled: true,
        }
    }

    pub fn with_unit(mut self, unit: impl Into<String>) -> Self {
        self.unit = Some(unit.into());
        self
    }

    pub fn with_scale(mut self, scale: f64) -> Self {
        self.scale = scale;
        self
    }

    /// Convert a raw device value into engineering units.
    ///
    /// A zero scale is treated as 1.0.
    pub fn apply_scale(&self, raw: f64) -> f64 {
        if self.scale == 0.0 {
            raw
        } else {
            raw / self.scale
        }
    }
}

/// Measurement quality flag.
#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    Hash,
    Serialize,
    Deserialize,
    EnumString,
    Display,
    AsRefStr,
)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase", ascii_case_insensitive)]
pub enum Quality {
    Good,
    Uncertain,
    Bad,
}

impl Quality {
    /// Numeric code persisted in the `measurements.quality` column.
    pub fn code(self) -> i64 {
        match self {
            Self::Good => 1,
            Self::Uncertain => 2,
            Self::Bad => 3,
        }
    }

    /// Parse a persisted quality code.
    pub fn from_code(code: i64) -> Option<Self> {
        match code {
            1 => Some(Self::Good),
            2 => Some(Self::Uncertain),
            3 => Some(Self::Bad),
            _ => None,
        }
    }
}

/// One time-series point. Immutable once created.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Measurement {
    pub device_id: DeviceId,
    pub signal: String,
    pub value: f64,
    pub quality: Quality,
    pub utc_ts: DateTime<Utc>,
}

impl Measurement {
    /// Create a measurement with [`Quality::Good`].
    pub fn new(
        device_id: DeviceId,
        signal: impl Into<String>,
        value: f64,
        utc_ts: DateTime<Utc>,
    ) -> Self {
        Self {
            device_id,
            signal: signal.into(),
            value,
            quality: Quality::Good,
            utc_ts,
        }
    }

    /// Placeholder for a tag whose raw value was missing from a read.
    pub fn missing(device_id: DeviceId, signal: impl Into<String>, utc_ts: DateTime<Utc>) -> Self {
        Self {
            device_id,
            signal: signal.into(),
            value: 0.0,
            quality: Quality::Bad,
            utc_ts,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::str::FromStr;

    #[test]
    fn test_quality_codes() {
        for q in [Quality::Good, Quality::Uncertain, Quality::Bad] {
            assert_eq!(Quality::from_code(q.code()), Some(q));
        }
        assert_eq!(Quality::from_code(0), None);
        assert_eq!(Quality::from_str("BAD").unwrap(), Quality::Bad);
        assert_eq!(Quality::Good.to_string(), "good");
    }

    #[test]
    fn test_apply_scale() {
        let tag = TagMap::new(1, "I_PH1", "I1").with_scale(1000.0);
        assert_eq!(tag.apply_scale(2500.0), 2.5);

        let zero = TagMap::new(1, "U12", "U12").with_scale(0.0);
        assert_eq!(zero.apply_scale(400.0), 400.0);
    }

    #[test]
    fn test_device_poll_interval_fallback() {
        let default = Duration::from_millis(1500);
        let device = Device::new(1, "meter-1", "10.0.0.1");
        assert_eq!(device.poll_interval(default), default);

        let device = device.with_poll_interval_ms(5000);
        assert_eq!(device.poll_interval(default), Duration::from_secs(5));

        let device = Device::new(2, "meter-2", "10.0.0.2").with_poll_interval_ms(0);
        assert_eq!(device.poll_interval(default), default);
    }

    #[test]
    fn test_missing_measurement_is_bad() {
        let m = Measurement::missing(3, "P_TOT", Utc::now());
        assert_eq!(m.quality, Quality::Bad);
        assert_eq!(m.value, 0.0);
    }
}
