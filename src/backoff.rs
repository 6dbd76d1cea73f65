//! Exponential backoff schedules
//!
//! Two shapes are used by the client:
//!
//! - reconnection: `min(base * 2^attempt, max)` with optional jitter
//! - publish retry: `base^attempt` seconds between attempts

use rand::Rng;
use std::time::Duration;

/// Capped exponential schedule for reconnect attempts
#[derive(Debug, Clone)]
pub struct ExponentialBackoff {
    base: Duration,
    max: Duration,
    jitter: bool,
}

impl ExponentialBackoff {
    pub fn new(base: Duration, max: Duration) -> Self {
        Self {
            base,
            max: max.max(base),
            jitter: false,
        }
    }

    /// Add up to 25% random jitter on top of the capped delay
    pub fn with_jitter(mut self, jitter: bool) -> Self {
        self.jitter = jitter;
        self
    }

    /// Delay before the given attempt (0-indexed), without jitter
    pub fn base_delay(&self, attempt: u32) -> Duration {
        let factor = 1u32 << attempt.min(16);
        self.base.saturating_mul(factor).min(self.max)
    }

    /// Delay before the given attempt (0-indexed)
    pub fn delay(&self, attempt: u32) -> Duration {
        let delay = self.base_delay(attempt);
        if !self.jitter {
            return delay;
        }
        let range_ms = (delay.as_millis() / 4) as u64;
        if range_ms == 0 {
            return delay;
        }
        let extra = rand::thread_rng().gen_range(0..=range_ms);
        delay + Duration::from_millis(extra)
    }

    pub fn max(&self) -> Duration {
        self.max
    }
}

/// Wait after a failed publish attempt (0-indexed): `base^attempt` seconds
pub fn publish_retry_delay(base: f64, attempt: u32) -> Duration {
    let secs = base.powi(attempt.min(30) as i32);
    Duration::try_from_secs_f64(secs).unwrap_or(Duration::MAX)
}
