//! Exponential retry backoff with jitter.
//!
//! Computes the delay before the next attempt from the attempt count and
//! the failure classification. Delays grow exponentially, scaled by the
//! classification's multiplier, clamped to a configured range, and then
//! jittered symmetrically to avoid synchronized retry storms across items.

use std::time::Duration;

use chrono::{DateTime, Utc};
use rand::Rng;
use serde::{Deserialize, Serialize};

use crate::classify::Classification;

/// Lower clamp on any computed retry delay.
const MIN_DELAY: Duration = Duration::from_millis(1_000);

/// Backoff policy configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BackoffPolicy {
    /// Base delay before classification multiplier and exponent apply.
    pub base_delay: Duration,
    /// Upper clamp on any computed delay.
    pub max_delay: Duration,
    /// Symmetric jitter fraction (0.0 to 1.0) applied after clamping.
    pub jitter_factor: f64,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            base_delay: Duration::from_millis(1_000),
            max_delay: Duration::from_secs(600),
            jitter_factor: 0.10,
        }
    }
}

impl BackoffPolicy {
    /// Deterministic delay for the given attempt count, before jitter.
    ///
    /// `attempts` is the number of attempts already made (1-based: the
    /// first failure computes the delay with `attempts == 1`).
    pub fn raw_delay(&self, attempts: u32, classification: &Classification) -> Duration {
        let exponent = attempts.saturating_sub(1).min(20);
        let doubling = 2_u64.saturating_pow(exponent);
        let scaled =
            self.base_delay.as_millis() as f64 * doubling as f64 * classification.backoff_multiplier;

        let clamped = scaled.clamp(MIN_DELAY.as_millis() as f64, self.max_delay.as_millis() as f64);
        Duration::from_millis(clamped as u64)
    }

    /// Jittered delay for the given attempt count.
    pub fn delay(&self, attempts: u32, classification: &Classification) -> Duration {
        apply_jitter(self.raw_delay(attempts, classification), self.jitter_factor)
    }

    /// Absolute wall-clock time of the next retry.
    pub fn next_retry_at(
        &self,
        now: DateTime<Utc>,
        attempts: u32,
        classification: &Classification,
    ) -> DateTime<Utc> {
        let delay = self.delay(attempts, classification);
        now + chrono::Duration::from_std(delay).unwrap_or_else(|_| chrono::Duration::zero())
    }
}

/// Randomizes a delay by plus-or-minus `jitter_factor`.
fn apply_jitter(duration: Duration, jitter_factor: f64) -> Duration {
    if jitter_factor <= 0.0 {
        return duration;
    }

    let clamped_jitter = jitter_factor.clamp(0.0, 1.0);
    let mut rng = rand::rng();
    let jitter_range = duration.as_secs_f64() * clamped_jitter;
    let offset = rng.random_range(-jitter_range..=jitter_range);

    Duration::from_secs_f64((duration.as_secs_f64() + offset).max(0.0))
}
