//! Clock-polled timers and the adaptive retransmission timeout.
//!
//! Nothing here sleeps or spawns.  Callers pass the current [`Instant`] and
//! ask whether a deadline has passed, which keeps the window and ACK logic
//! fully deterministic under test.
//!
//! - [`Timer`]: a start instant that can be restarted, stopped and
//!   compared against a duration.
//! - [`VariableTimeout`]: RTO derived from RTT samples using the classic
//!   smoothed estimator:
//!   `est += 1/8·(s − est)`, `dev += 1/4·(|s − est| − dev)`,
//!   `RTO = est + 4·dev`, never below [`MIN_RTO`].

use std::time::{Duration, Instant};

/// Lower bound on any computed RTO.
pub const MIN_RTO: Duration = Duration::from_millis(10);

const ALPHA: f64 = 0.125;
const BETA: f64 = 0.25;

// ---------------------------------------------------------------------------
// Timer
// ---------------------------------------------------------------------------

/// Inactive until [`restart`](Self::restart) is called.
#[derive(Debug, Clone, Copy, Default)]
pub struct Timer {
    started: Option<Instant>,
}

impl Timer {
    pub fn restart(&mut self, now: Instant) {
        self.started = Some(now);
    }

    pub fn stop(&mut self) {
        self.started = None;
    }

    pub fn is_active(&self) -> bool {
        self.started.is_some()
    }

    /// Active, and strictly more than `timeout` has elapsed since the start.
    pub fn has_passed(&self, now: Instant, timeout: Duration) -> bool {
        self.started
            .map_or(false, |start| now.saturating_duration_since(start) > timeout)
    }
}

// ---------------------------------------------------------------------------
// VariableTimeout
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct VariableTimeout {
    default: Duration,
    /// Smoothed RTT in milliseconds.
    estimated: f64,
    /// Smoothed deviation in milliseconds.
    deviation: f64,
    sampled: bool,
}

impl VariableTimeout {
    /// `default` is reported until the first sample arrives.
    pub fn new(default: Duration) -> Self {
        Self {
            default,
            estimated: 0.0,
            deviation: 0.0,
            sampled: false,
        }
    }

    /// Fold one RTT sample into the estimate.
    pub fn update(&mut self, sample: Duration) {
        let sample = sample.as_secs_f64() * 1000.0;
        self.estimated += ALPHA * (sample - self.estimated);
        self.deviation += BETA * ((sample - self.estimated).abs() - self.deviation);
        self.sampled = true;
    }

    pub fn has_sample(&self) -> bool {
        self.sampled
    }

    pub fn timeout(&self) -> Duration {
        if !self.sampled {
            return self.default;
        }
        let millis = self.estimated + 4.0 * self.deviation;
        Duration::from_secs_f64(millis.max(0.0) / 1000.0).max(MIN_RTO)
    }
}
