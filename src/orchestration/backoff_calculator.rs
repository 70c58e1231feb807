//! # Backoff Calculator
//!
//! Computes the delay before a failed task becomes visible again.
//!
//! ## Overview
//!
//! Delays grow exponentially with the attempt number, are capped, and carry a
//! small upward jitter so that tasks failing together do not retry together.
//! A provider-requested delay (`Retry-After` on a rate limit) raises the delay
//! to at least that value, still under the cap.
//!
//! ## Key Features
//!
//! - **Exponential Backoff**: `base * multiplier^(n-1)` for the n-th failure
//! - **Maximum Delay Caps**: no delay exceeds `max_delay_seconds`
//! - **Jitter Support**: upward only, at most `jitter_fraction` of the delay
//! - **Server-Requested Backoff**: honours `Retry-After`
//!
//! With `jitter_fraction <= multiplier - 1` (enforced by configuration
//! validation) every sampled delay is at least as long as any sample for an
//! earlier attempt.

use crate::config::BackoffConfig;
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Configuration for backoff calculation behavior
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BackoffCalculatorConfig {
    /// Delay after the first failure
    pub base_delay: Duration,
    /// Maximum delay cap
    pub max_delay: Duration,
    /// Exponential multiplier
    pub multiplier: f64,
    /// Maximum upward jitter as a fraction of the delay (0.0 to 1.0)
    pub jitter_fraction: f64,
}

impl Default for BackoffCalculatorConfig {
    fn default() -> Self {
        Self::from(&BackoffConfig::default())
    }
}

impl From<&BackoffConfig> for BackoffCalculatorConfig {
    fn from(config: &BackoffConfig) -> Self {
        Self {
            base_delay: Duration::from_secs(config.base_delay_seconds),
            max_delay: Duration::from_secs(config.max_delay_seconds),
            multiplier: config.multiplier,
            jitter_fraction: config.jitter_fraction,
        }
    }
}

/// How a delay was arrived at
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BackoffType {
    Exponential,
    /// The provider asked for a longer pause than the exponential delay
    ServerRequested,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct BackoffResult {
    pub delay: Duration,
    pub backoff_type: BackoffType,
    /// Failure number the delay was computed for (1-based)
    pub attempt: u32,
}

#[derive(Debug, Clone)]
pub struct BackoffCalculator {
    config: BackoffCalculatorConfig,
}

impl Default for BackoffCalculator {
    fn default() -> Self {
        Self::new(BackoffCalculatorConfig::default())
    }
}

impl BackoffCalculator {
    pub fn new(config: BackoffCalculatorConfig) -> Self {
        Self { config }
    }

    pub fn from_config(config: &BackoffConfig) -> Self {
        Self::new(BackoffCalculatorConfig::from(config))
    }

    pub fn config(&self) -> &BackoffCalculatorConfig {
        &self.config
    }

    /// Delay before retrying after the `attempt`-th failure
    pub fn calculate(&self, attempt: u32, retry_after: Option<Duration>) -> BackoffResult {
        self.calculate_with_jitter(attempt, retry_after, fastrand::f64())
    }

    /// As [`calculate`](Self::calculate) with the jitter sample supplied (`0.0..1.0`)
    pub fn calculate_with_jitter(
        &self,
        attempt: u32,
        retry_after: Option<Duration>,
        jitter_sample: f64,
    ) -> BackoffResult {
        let base = self.exponential_delay(attempt);
        let jitter = self.config.jitter_fraction * jitter_sample.clamp(0.0, 1.0);
        let jittered = base.mul_f64(1.0 + jitter).min(self.config.max_delay);

        match retry_after {
            Some(requested) if requested > jittered => BackoffResult {
                delay: requested.min(self.config.max_delay),
                backoff_type: BackoffType::ServerRequested,
                attempt,
            },
            _ => BackoffResult {
                delay: jittered,
                backoff_type: BackoffType::Exponential,
                attempt,
            },
        }
    }

    /// Un-jittered delay: `min(cap, base * multiplier^(attempt-1))`
    pub fn exponential_delay(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(i32::MAX as u32) as i32;
        let factor = self.config.multiplier.powi(exponent);
        let seconds = self.config.base_delay.as_secs_f64() * factor;
        let cap = self.config.max_delay.as_secs_f64();
        if !seconds.is_finite() || seconds >= cap {
            return self.config.max_delay;
        }
        Duration::from_secs_f64(seconds)
    }
}
