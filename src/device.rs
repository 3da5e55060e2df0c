//! Device Layer
//!
//! Protocol reads against field meters, isolated per device by a circuit
//! breaker.
//!
//! # Architecture
//!
//! - [`DeviceClient`]: Transport trait; [`WebMiClient`] is the HTTP/JSON implementation
//! - [`CircuitBreaker`]: Closed/Open/HalfOpen state machine with growing cooldown
//! - [`DeviceReader`]: Timeout-bounded reads that record outcomes in the breaker

mod breaker;
mod reader;
mod traits;
pub mod webmi;

pub use breaker::{
    Admission, BreakerSnapshot, CircuitBreaker, CircuitBreakerConfig, CircuitState,
    CircuitStateKind,
};
pub use reader::{DEFAULT_READ_TIMEOUT, DeviceReader, Reading};
pub use traits::{DeviceClient, DeviceError, RawValues};
pub use webmi::WebMiClient;
