//! Exponential backoff with jitter
//!
//! Used by the metadata client between attempts and by the token refresher
//! between failed background refreshes.

use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Exponential backoff configuration
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct BackoffConfig {
    /// Delay before the first retry, in milliseconds
    #[serde(default = "default_min_delay_ms")]
    pub min_delay_ms: u64,
    /// Upper bound for any single delay, in milliseconds
    #[serde(default = "default_max_delay_ms")]
    pub max_delay_ms: u64,
    /// Growth factor per attempt
    #[serde(default = "default_factor")]
    pub factor: f64,
    /// Random jitter added to each delay, in milliseconds
    #[serde(default = "default_jitter_ms")]
    pub jitter_ms: u64,
}

fn default_min_delay_ms() -> u64 {
    100
}

fn default_max_delay_ms() -> u64 {
    2_000
}

fn default_factor() -> f64 {
    2.0
}

fn default_jitter_ms() -> u64 {
    50
}

impl Default for BackoffConfig {
    fn default() -> Self {
        Self {
            min_delay_ms: default_min_delay_ms(),
            max_delay_ms: default_max_delay_ms(),
            factor: default_factor(),
            jitter_ms: default_jitter_ms(),
        }
    }
}

/// Exponential backoff
#[derive(Debug, Clone, Copy)]
pub struct ExponentialBackoff {
    config: BackoffConfig,
}

impl ExponentialBackoff {
    pub fn new(config: BackoffConfig) -> Self {
        Self { config }
    }

    /// Backoff duration for the given zero-based attempt, capped at the maximum delay
    pub fn duration(&self, attempt: u32) -> Duration {
        let base = self.config.min_delay_ms as f64 * self.config.factor.powi(attempt as i32);
        let jitter = if self.config.jitter_ms > 0 {
            rand::random::<f64>() * self.config.jitter_ms as f64
        } else {
            0.0
        };
        let millis = (base + jitter).min(self.config.max_delay_ms as f64);
        Duration::from_micros((millis.max(0.0) * 1000.0) as u64)
    }
}

impl Default for ExponentialBackoff {
    fn default() -> Self {
        Self::new(BackoffConfig::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn no_jitter() -> BackoffConfig {
        BackoffConfig {
            min_delay_ms: 100,
            max_delay_ms: 1_000,
            factor: 2.0,
            jitter_ms: 0,
        }
    }

    #[test]
    fn test_exponential_growth() {
        let backoff = ExponentialBackoff::new(no_jitter());
        assert_eq!(backoff.duration(0), Duration::from_millis(100));
        assert_eq!(backoff.duration(1), Duration::from_millis(200));
        assert_eq!(backoff.duration(2), Duration::from_millis(400));
    }

    #[test]
    fn test_capped_at_max() {
        let backoff = ExponentialBackoff::new(no_jitter());
        assert_eq!(backoff.duration(10), Duration::from_millis(1_000));
        assert_eq!(backoff.duration(60), Duration::from_millis(1_000));
    }

    #[test]
    fn test_jitter_bounded() {
        let backoff = ExponentialBackoff::default();
        for _ in 0..100 {
            let delay = backoff.duration(0);
            assert!(delay >= Duration::from_millis(100));
            assert!(delay <= Duration::from_millis(150));
        }
    }
}
