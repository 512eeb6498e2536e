//! Exponential backoff with jitter.
//!
//! Shared by socket reconnects and the chunk-send retry policy.

use std::time::Duration;

use rand::Rng;

use crate::core::{
    DEFAULT_BACKOFF, DEFAULT_BACKOFF_JITTER, DEFAULT_BACKOFF_MULTIPLIER, DEFAULT_MAX_BACKOFF,
};

/// Backoff parameters.
#[derive(Debug, Clone)]
pub struct BackoffConfig {
    /// Delay before the first retry.
    pub initial: Duration,
    /// Upper bound on any delay.
    pub max: Duration,
    /// Factor applied per failed attempt.
    pub multiplier: f64,
    /// Random jitter factor in `[0, 1]`; each delay is stretched by up to
    /// this fraction of itself.
    pub jitter: f64,
    /// Give up after this many attempts; `None` retries forever.
    pub max_attempts: Option<u32>,
}

impl Default for BackoffConfig {
    fn default() -> Self {
        Self {
            initial: DEFAULT_BACKOFF,
            max: DEFAULT_MAX_BACKOFF,
            multiplier: DEFAULT_BACKOFF_MULTIPLIER,
            jitter: DEFAULT_BACKOFF_JITTER,
            max_attempts: None,
        }
    }
}

impl BackoffConfig {
    /// Delay before retry number `attempt` (1-based), or `None` to give up.
    pub fn delay(&self, attempt: u32) -> Option<Duration> {
        self.delay_with(attempt, rand::thread_rng().gen::<f64>())
    }

    /// As [`delay`](Self::delay), with the jitter sample injected.
    pub fn delay_with(&self, attempt: u32, jitter_sample: f64) -> Option<Duration> {
        if attempt == 0 {
            return Some(Duration::ZERO);
        }
        if let Some(max_attempts) = self.max_attempts {
            if attempt > max_attempts {
                return None;
            }
        }

        let exp = self.multiplier.powi(attempt.saturating_sub(1) as i32);
        let base = self.initial.as_secs_f64() * exp;
        let jittered = base * (1.0 + self.jitter.clamp(0.0, 1.0) * jitter_sample);
        let capped = jittered.min(self.max.as_secs_f64());
        Some(Duration::from_secs_f64(capped.max(0.0)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config(initial_ms: u64, max_ms: u64, multiplier: f64, max_attempts: Option<u32>) -> BackoffConfig {
        BackoffConfig {
            initial: Duration::from_millis(initial_ms),
            max: Duration::from_millis(max_ms),
            multiplier,
            jitter: 0.0,
            max_attempts,
        }
    }

    #[test]
    fn test_exponential_growth() {
        let backoff = config(100, 10_000, 2.0, None);
        assert_eq!(backoff.delay_with(1, 0.0), Some(Duration::from_millis(100)));
        assert_eq!(backoff.delay_with(2, 0.0), Some(Duration::from_millis(200)));
        assert_eq!(backoff.delay_with(3, 0.0), Some(Duration::from_millis(400)));
    }

    #[test]
    fn test_capped_at_max() {
        let backoff = config(100, 500, 2.0, None);
        assert_eq!(backoff.delay_with(10, 0.0), Some(Duration::from_millis(500)));
    }

    #[test]
    fn test_gives_up_after_max_attempts() {
        let backoff = config(100, 500, 2.0, Some(3));
        assert!(backoff.delay_with(3, 0.0).is_some());
        assert_eq!(backoff.delay_with(4, 0.0), None);
    }

    #[test]
    fn test_jitter_bounds() {
        let mut backoff = config(100, 10_000, 2.0, None);
        backoff.jitter = 0.5;

        let low = backoff.delay_with(1, 0.0).unwrap();
        let high = backoff.delay_with(1, 1.0).unwrap();
        assert_eq!(low, Duration::from_millis(100));
        assert_eq!(high, Duration::from_millis(150));

        for _ in 0..32 {
            let sampled = backoff.delay(1).unwrap();
            assert!(sampled >= low && sampled <= high);
        }
    }
}
