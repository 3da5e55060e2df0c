//! Per-device due times with jitter.

use std::collections::{HashMap, HashSet};
use std::time::Duration;

use rand::Rng;
use tokio::time::Instant;

use crate::storage::{Device, DeviceId};

/// Tracks when each device is next due for a poll.
#[derive(Debug)]
pub(crate) struct PollSchedule {
    next_due: HashMap<DeviceId, Instant>,
    default_interval: Duration,
    jitter_pct: f64,
}

impl PollSchedule {
    pub(crate) fn new(default_interval: Duration, jitter_pct: f64) -> Self {
        Self {
            next_due: HashMap::new(),
            default_interval,
            jitter_pct: jitter_pct.clamp(0.0, 1.0),
        }
    }

    /// `interval * (1 + U(lo, hi))`, or `interval * (1 + lo)` when the range is empty.
    fn scaled(interval: Duration, lo: f64, hi: f64) -> Duration {
        let factor = if hi > lo {
            rand::thread_rng().gen_range(lo..hi)
        } else {
            lo
        };
        interval.mul_f64((1.0 + factor).max(0.0))
    }

    /// Drop devices that are no longer enabled and return the ones due at `now`.
    ///
    /// A device seen for the first time gets a jittered first due time within
    /// `jitter_pct` of one interval, so a restarted fleet does not poll in lockstep.
    pub(crate) fn due(&mut self, devices: Vec<Device>, now: Instant) -> (Vec<Device>, usize) {
        let live: HashSet<DeviceId> = devices.iter().map(|d| d.id).collect();
        self.next_due.retain(|id, _| live.contains(id));

        let mut skipped = 0;
        let mut due = Vec::with_capacity(devices.len());
        for device in devices {
            let interval = device.poll_interval(self.default_interval);
            let jitter = self.jitter_pct;
            let next = *self
                .next_due
                .entry(device.id)
                .or_insert_with(|| now + Self::scaled(interval, 0.0, jitter) - interval);
            if now >= next {
                due.push(device);
            } else {
                skipped += 1;
            }
        }
        (due, skipped)
    }

    /// Schedule the next poll of `device` relative to `now`.
    pub(crate) fn record_attempt(&mut self, device: &Device, now: Instant) {
        let interval = device.poll_interval(self.default_interval);
        let next = now + Self::scaled(interval, -self.jitter_pct, self.jitter_pct);
        self.next_due.insert(device.id, next);
    }

    #[cfg(test)]
    pub(crate) fn next_due(&self, id: DeviceId) -> Option<Instant> {
        self.next_due.get(&id).copied()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn test_first_poll_is_due_immediately_without_jitter() {
        let mut schedule = PollSchedule::new(Duration::from_millis(1_500), 0.0);
        let now = Instant::now();
        let devices = vec![Device::new(1, "a", "h1"), Device::new(2, "b", "h2")];

        let (due, skipped) = schedule.due(devices, now);
        assert_eq!(due.len(), 2);
        assert_eq!(skipped, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_longer_interval_is_skipped_until_due() {
        let mut schedule = PollSchedule::new(Duration::from_millis(1_000), 0.0);
        let now = Instant::now();
        let slow = Device::new(1, "slow", "h1").with_poll_interval_ms(3_000);
        let fast = Device::new(2, "fast", "h2");

        let (due, _) = schedule.due(vec![slow.clone(), fast.clone()], now);
        for d in &due {
            schedule.record_attempt(d, now);
        }

        let t1 = now + Duration::from_millis(1_000);
        let (due, skipped) = schedule.due(vec![slow.clone(), fast.clone()], t1);
        assert_eq!(due.iter().map(|d| d.id).collect::<Vec<_>>(), vec![2]);
        assert_eq!(skipped, 1);

        let t3 = now + Duration::from_millis(3_000);
        let (due, _) = schedule.due(vec![slow, fast], t3);
        assert_eq!(due.len(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_jitter_stays_within_bounds() {
        let mut schedule = PollSchedule::new(Duration::from_millis(1_000), 0.1);
        let now = Instant::now();
        let device = Device::new(1, "a", "h1");

        for _ in 0..50 {
            schedule.record_attempt(&device, now);
            let offset = schedule.next_due(1).unwrap() - now;
            assert!(offset >= Duration::from_millis(900), "{offset:?}");
            assert!(offset <= Duration::from_millis(1_100), "{offset:?}");
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_disabled_devices_are_forgotten() {
        let mut schedule = PollSchedule::new(Duration::from_millis(1_000), 0.0);
        let now = Instant::now();
        let device = Device::new(1, "a", "h1");
        schedule.record_attempt(&device, now);

        schedule.due(Vec::new(), now);
        assert!(schedule.next_due(1).is_none());
    }
}
