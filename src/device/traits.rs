//! Device transport trait and error type.

use std::collections::HashMap;
use std::time::Duration;

use thiserror::Error;

use crate::storage::{Device, StorageError, TagMap};

/// Errors that can occur while reading a device.
///
/// These never escape [`DeviceReader::read`](crate::device::DeviceReader::read);
/// they are recorded in the returned reading and in the device's breaker.
#[derive(Debug, Error)]
pub enum DeviceError {
    /// Connection or request failure.
    #[error("transport error: {0}")]
    Transport(String),

    /// Device answered with a non-success HTTP status.
    #[error("device returned HTTP {0}")]
    Status(u16),

    /// Response body could not be decoded.
    #[error("invalid response: {0}")]
    Decode(String),

    /// Timeout elapsed.
    #[error("read timed out after {0:?}")]
    Timeout(Duration),

    /// Device reported a global error code.
    #[error("device error code {0}")]
    Device(i64),

    /// No enabled tag mappings for the device.
    #[error("no enabled tag mappings")]
    NoTags,

    /// Registry lookup failed.
    #[error("registry error: {0}")]
    Registry(#[from] StorageError),
}

impl From<reqwest::Error> for DeviceError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_decode() {
            Self::Decode(err.to_string())
        } else if let Some(status) = err.status() {
            Self::Status(status.as_u16())
        } else {
            Self::Transport(err.to_string())
        }
    }
}

/// Raw values keyed by tag address. `None` marks a key the device could not read.
pub type RawValues = HashMap<String, Option<f64>>;

/// Protocol client used to talk to one device at a time.
///
/// Implementations must be safe to call concurrently for different devices.
#[async_trait::async_trait]
pub trait DeviceClient: Send + Sync + 'static {
    /// Read the raw values for the given tags.
    async fn read(&self, device: &Device, tags: &[TagMap]) -> Result<RawValues, DeviceError>;

    /// Lightweight connectivity check.
    async fn probe(&self, device: &Device) -> Result<(), DeviceError>;
}
