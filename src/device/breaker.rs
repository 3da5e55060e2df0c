//! Per-device circuit breaker.
//!
//! ```text
//!   Closed --(failure_threshold consecutive failures)--> Open
//!   Open   --(cooldown elapsed, next attempt)----------> HalfOpen (one probe)
//!   HalfOpen --probe ok--> Closed
//!   HalfOpen --probe failed--> Open (cooldown x multiplier, capped)
//! ```
//!
//! Reads rejected while Open do no I/O and do not count as failures.

use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use strum_macros::{AsRefStr, Display, EnumString};
use tokio::time::Instant;

pub const DEFAULT_FAILURE_THRESHOLD: u32 = 5;
pub const DEFAULT_COOLDOWN: Duration = Duration::from_secs(30);
pub const DEFAULT_MAX_COOLDOWN: Duration = Duration::from_secs(300);
pub const DEFAULT_BACKOFF_MULTIPLIER: f64 = 2.0;

fn default_failure_threshold() -> u32 {
    DEFAULT_FAILURE_THRESHOLD
}

fn default_cooldown() -> Duration {
    DEFAULT_COOLDOWN
}

fn default_max_cooldown() -> Duration {
    DEFAULT_MAX_COOLDOWN
}

fn default_backoff_multiplier() -> f64 {
    DEFAULT_BACKOFF_MULTIPLIER
}

/// Circuit breaker settings shared by all devices.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CircuitBreakerConfig {
    /// Consecutive failures that open the circuit.
    #[serde(default = "default_failure_threshold")]
    pub failure_threshold: u32,
    /// Cooldown after the first trip.
    #[serde(default = "default_cooldown", with = "humantime_serde")]
    pub cooldown: Duration,
    /// Upper bound for the grown cooldown.
    #[serde(default = "default_max_cooldown", with = "humantime_serde")]
    pub max_cooldown: Duration,
    /// Cooldown growth per consecutive trip.
    #[serde(default = "default_backoff_multiplier")]
    pub backoff_multiplier: f64,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: DEFAULT_FAILURE_THRESHOLD,
            cooldown: DEFAULT_COOLDOWN,
            max_cooldown: DEFAULT_MAX_COOLDOWN,
            backoff_multiplier: DEFAULT_BACKOFF_MULTIPLIER,
        }
    }
}

impl CircuitBreakerConfig {
    /// Cooldown for the n-th consecutive trip (1-based).
    pub fn cooldown_for(&self, trips: u32) -> Duration {
        let exponent = trips.saturating_sub(1).min(32) as i32;
        let factor = self.backoff_multiplier.max(1.0).powi(exponent);
        let secs = self.cooldown.as_secs_f64() * factor;
        if !secs.is_finite() || secs >= self.max_cooldown.as_secs_f64() {
            self.max_cooldown.max(self.cooldown)
        } else {
            Duration::from_secs_f64(secs)
        }
    }
}

/// Breaker state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CircuitState {
    Closed,
    Open { until: Instant, cooldown: Duration },
    HalfOpen { probe_in_flight: bool },
}

/// State label without timing details.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, EnumString, Display, AsRefStr,
)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum CircuitStateKind {
    Closed,
    Open,
    HalfOpen,
}

impl CircuitState {
    pub fn kind(&self) -> CircuitStateKind {
        match self {
            Self::Closed => CircuitStateKind::Closed,
            Self::Open { .. } => CircuitStateKind::Open,
            Self::HalfOpen { .. } => CircuitStateKind::HalfOpen,
        }
    }
}

/// Outcome of asking the breaker for permission to read.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Admission {
    /// Circuit closed, normal read.
    Allowed,
    /// Single trial read after the cooldown.
    Probe,
    /// Short-circuited; no I/O must happen.
    Rejected { retry_in: Duration },
}

/// Serializable view of one breaker.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct BreakerSnapshot {
    pub state: CircuitStateKind,
    pub consecutive_failures: u32,
    pub opened_at: Option<DateTime<Utc>>,
    pub last_error: Option<String>,
}

/// Circuit breaker for a single device.
#[derive(Debug, Clone)]
pub struct CircuitBreaker {
    config: CircuitBreakerConfig,
    state: CircuitState,
    consecutive_failures: u32,
    /// Consecutive trips without an intervening success.
    trips: u32,
    opened_at: Option<DateTime<Utc>>,
    last_error: Option<String>,
}

impl CircuitBreaker {
    pub fn new(config: CircuitBreakerConfig) -> Self {
        Self {
            config,
            state: CircuitState::Closed,
            consecutive_failures: 0,
            trips: 0,
            opened_at: None,
            last_error: None,
        }
    }

    pub fn state(&self) -> CircuitState {
        self.state
    }

    pub fn consecutive_failures(&self) -> u32 {
        self.consecutive_failures
    }

    pub fn last_error(&self) -> Option<&str> {
        self.last_error.as_deref()
    }

    pub fn snapshot(&self) -> BreakerSnapshot {
        BreakerSnapshot {
            state: self.state.kind(),
            consecutive_failures: self.consecutive_failures,
            opened_at: self.opened_at,
            last_error: self.last_error.clone(),
        }
    }

    /// Decide whether a read may proceed at `now`.
    pub fn try_acquire(&mut self, now: Instant) -> Admission {
        match self.state {
            CircuitState::Closed => Admission::Allowed,
            CircuitState::Open { until, .. } if now >= until => {
                self.state = CircuitState::HalfOpen {
                    probe_in_flight: true,
                };
                Admission::Probe
            }
            CircuitState::Open { until, .. } => Admission::Rejected {
                retry_in: until.saturating_duration_since(now),
            },
            CircuitState::HalfOpen {
                probe_in_flight: true,
            } => Admission::Rejected {
                retry_in: Duration::ZERO,
            },
            CircuitState::HalfOpen {
                probe_in_flight: false,
            } => {
                self.state = CircuitState::HalfOpen {
                    probe_in_flight: true,
                };
                Admission::Probe
            }
        }
    }

    pub fn on_success(&mut self) {
        self.state = CircuitState::Closed;
        self.consecutive_failures = 0;
        self.trips = 0;
        self.opened_at = None;
        self.last_error = None;
    }

    pub fn on_failure(&mut self, now: Instant, error: impl Into<String>) {
        self.last_error = Some(error.into());
        match self.state {
            CircuitState::Closed => {
                self.consecutive_failures = self.consecutive_failures.saturating_add(1);
                if self.consecutive_failures >= self.config.failure_threshold.max(1) {
                    self.trip(now);
                }
            }
            CircuitState::HalfOpen { .. } => {
                self.consecutive_failures = self.consecutive_failures.saturating_add(1);
                self.trip(now);
            }
            // Late result from a read admitted before the trip.
            CircuitState::Open { .. } => {}
        }
    }

    /// Give back an unfinished probe so the next attempt can probe again.
    pub fn release_probe(&mut self) {
        if let CircuitState::HalfOpen {
            probe_in_flight: true,
        } = self.state
        {
            self.state = CircuitState::HalfOpen {
                probe_in_flight: false,
            };
        }
    }

    /// Force the breaker back to Closed.
    pub fn reset(&mut self) {
        self.on_success();
    }

    fn trip(&mut self, now: Instant) {
        self.trips = self.trips.saturating_add(1);
        let cooldown = self.config.cooldown_for(self.trips);
        self.state = CircuitState::Open {
            until: now + cooldown,
            cooldown,
        };
        self.opened_at = Some(Utc::now());
    }
}
