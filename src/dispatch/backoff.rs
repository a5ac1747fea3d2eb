//! Exponential backoff for store errors in the rotation loop.
//!
//! The consumer never gives up on the store: every failed call is followed by
//! a delay that doubles from `initial_delay` up to `max_delay`, and the
//! sequence starts over after the next successful call.
//!
//! - Default: 100ms, 200ms, 400ms, ... capped at 30s

use std::time::Duration;

/// Exponents beyond this are always capped, so there is no point computing them.
const MAX_EXPONENT: u32 = 64;

/// Configuration for exponential backoff.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BackoffConfig {
    /// Delay after the first failure.
    pub initial_delay: Duration,

    /// Maximum delay between retries (cap for exponential growth).
    pub max_delay: Duration,

    /// Multiplier for exponential backoff (typically 2.0).
    pub multiplier: f64,
}

impl BackoffConfig {
    /// Default backoff for store errors.
    pub const DEFAULT: Self = Self {
        initial_delay: Duration::from_millis(100),
        max_delay: Duration::from_secs(30),
        multiplier: 2.0,
    };

    /// Creates a new backoff configuration.
    pub fn new(initial_delay: Duration, max_delay: Duration, multiplier: f64) -> Self {
        Self {
            initial_delay,
            max_delay,
            multiplier,
        }
    }

    /// Computes the delay after the given number of consecutive failures
    /// (0-indexed).
    ///
    /// The delay grows exponentially: `initial_delay * multiplier^attempt`,
    /// capped at `max_delay`.
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        if attempt == 0 {
            return self.initial_delay.min(self.max_delay);
        }

        let exponent = attempt.min(MAX_EXPONENT) as i32;
        let delay_secs = self.initial_delay.as_secs_f64() * self.multiplier.powi(exponent);
        let max_secs = self.max_delay.as_secs_f64();

        if !delay_secs.is_finite() || delay_secs >= max_secs {
            self.max_delay
        } else if delay_secs <= 0.0 {
            Duration::ZERO
        } else {
            Duration::from_secs_f64(delay_secs)
        }
    }
}

impl Default for BackoffConfig {
    fn default() -> Self {
        Self::DEFAULT
    }
}

/// Backoff state for one retry loop.
#[derive(Debug, Clone)]
pub struct Backoff {
    config: BackoffConfig,
    failures: u32,
}

impl Backoff {
    /// Creates a backoff with no recorded failures.
    pub fn new(config: BackoffConfig) -> Self {
        Backoff {
            config,
            failures: 0,
        }
    }

    /// Records a failure and returns how long to wait before retrying.
    pub fn next_delay(&mut self) -> Duration {
        let delay = self.config.delay_for_attempt(self.failures);
        self.failures = self.failures.saturating_add(1);
        delay
    }

    /// Clears the failure count after a successful call.
    pub fn reset(&mut self) {
        self.failures = 0;
    }

    /// Number of consecutive failures since the last reset.
    pub fn failures(&self) -> u32 {
        self.failures
    }
}
