//! Human-like pacing and backoff helpers.
//!
//! Every deliberate pause in the fetch path (pre-request, pre-navigation,
//! post-capture, scroll cadence) is drawn from a [`DelayRange`], and the
//! retry controller computes its transient backoff with
//! [`exponential_backoff`].

use std::time::Duration;

use rand::Rng;
use serde::{Deserialize, Serialize};

use crate::config::duration_ms;

/// Inclusive range a randomized delay is sampled from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct DelayRange {
    #[serde(with = "duration_ms")]
    pub min: Duration,
    #[serde(with = "duration_ms")]
    pub max: Duration,
}

impl DelayRange {
    pub const ZERO: DelayRange = DelayRange {
        min: Duration::ZERO,
        max: Duration::ZERO,
    };

    pub fn new(min: Duration, max: Duration) -> Self {
        Self {
            min,
            max: if max < min { min } else { max },
        }
    }

    pub fn from_millis(min: u64, max: u64) -> Self {
        Self::new(Duration::from_millis(min), Duration::from_millis(max))
    }

    pub fn sample(&self) -> Duration {
        if self.max <= self.min {
            return self.min;
        }
        let mut rng = rand::thread_rng();
        let min = self.min.as_millis() as u64;
        let max = self.max.as_millis() as u64;
        Duration::from_millis(rng.gen_range(min..=max))
    }

    /// Sleeps for a sampled delay and returns how long it waited.
    pub async fn pause(&self) -> Duration {
        let delay = self.sample();
        if delay > Duration::ZERO {
            tokio::time::sleep(delay).await;
        }
        delay
    }
}

impl Default for DelayRange {
    fn default() -> Self {
        Self::ZERO
    }
}

/// `base * 2^(attempt - 1)`, jittered by `±jitter/2` of itself, then capped
/// at `ceiling`. `attempt` is 1-based.
pub fn exponential_backoff(
    base: Duration,
    attempt: u32,
    ceiling: Duration,
    jitter: f64,
) -> Duration {
    let exponent = attempt.saturating_sub(1).min(30);
    let mut delay = base.as_secs_f64() * f64::from(1u32 << exponent);

    let variance = delay * jitter.clamp(0.0, 1.0);
    if variance > 0.0 {
        let offset = rand::random::<f64>() * variance - (variance / 2.0);
        delay += offset;
    }

    let capped = delay.clamp(0.0, ceiling.as_secs_f64());
    Duration::from_secs_f64(capped)
}
