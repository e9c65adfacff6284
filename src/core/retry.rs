//! Bounded exponential backoff.

use std::time::Duration;

use rand::Rng;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryPolicy {
    /// Retries after the first attempt.
    pub max_retries: u32,
    pub initial_backoff_ms: u64,
    pub max_backoff_ms: u64,
    pub multiplier: f64,
    /// Spread each delay by ±20%.
    pub jitter: bool,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 2,
            initial_backoff_ms: 250,
            max_backoff_ms: 4_000,
            multiplier: 2.0,
            jitter: true,
        }
    }
}

impl RetryPolicy {
    pub fn new(max_retries: u32, initial_backoff_ms: u64) -> Self {
        Self {
            max_retries,
            initial_backoff_ms,
            ..Default::default()
        }
    }

    /// Policy with no sleeping between attempts. Used by tests.
    pub fn immediate(max_retries: u32) -> Self {
        Self {
            max_retries,
            initial_backoff_ms: 0,
            max_backoff_ms: 0,
            multiplier: 1.0,
            jitter: false,
        }
    }

    /// Delay before retry number `retry` (1-based).
    pub fn delay_for(&self, retry: u32) -> Duration {
        if retry == 0 || self.initial_backoff_ms == 0 {
            return Duration::ZERO;
        }

        let exp = self.multiplier.max(1.0).powi(retry.saturating_sub(1) as i32);
        let mut millis = (self.initial_backoff_ms as f64 * exp).min(self.max_backoff_ms as f64);

        if self.jitter {
            let factor: f64 = rand::rng().random_range(0.8..=1.2);
            millis = (millis * factor).min(self.max_backoff_ms as f64);
        }

        Duration::from_millis(millis.max(0.0) as u64)
    }

    /// Upper bound on the total sleep across all retries, jitter included.
    pub fn worst_case_backoff(&self) -> Duration {
        if self.initial_backoff_ms == 0 {
            return Duration::ZERO;
        }
        let spread = if self.jitter { 1.2 } else { 1.0 };
        let total: f64 = (1..=self.max_retries)
            .map(|retry| {
                let exp = self.multiplier.max(1.0).powi(retry as i32 - 1);
                (self.initial_backoff_ms as f64 * exp * spread).min(self.max_backoff_ms as f64)
            })
            .sum();
        Duration::from_millis(total.ceil() as u64)
    }

    /// Clamp a server-suggested delay to this policy's ceiling.
    pub fn clamp(&self, suggested: Duration) -> Duration {
        suggested.min(Duration::from_millis(self.max_backoff_ms))
    }
}
