//! Bounded exponential backoff for transport reconnects.
//!
//! [`ExponentialBackoff`] is an iterator yielding sleep durations with
//! jitter, following the gRPC connection backoff scheme: each delay grows by
//! a multiplier up to a cap, randomized by a jitter factor, and the iterator
//! ends after the configured number of attempts.

use std::time::Duration;

/// Default backoff values.
pub mod defaults {
    use std::time::Duration;

    /// Delay before the first reconnect attempt.
    pub const BASE_DELAY: Duration = Duration::from_millis(200);

    /// Multiplier applied after each attempt.
    pub const MULTIPLIER: f64 = 1.6;

    /// Jitter factor (0.2 means +/- 20%).
    pub const JITTER: f64 = 0.2;

    /// Ceiling on any single delay.
    pub const MAX_DELAY: Duration = Duration::from_secs(10);

    /// Reconnect attempts before giving up.
    pub const MAX_ATTEMPTS: u32 = 5;
}

/// Reconnect backoff configuration.
#[derive(Clone, Debug)]
pub struct BackoffPolicy {
    /// Delay before the first attempt.
    pub base_delay: Duration,
    /// Growth factor per attempt. Should be >= 1.0.
    pub multiplier: f64,
    /// Randomization factor between 0.0 and 1.0.
    pub jitter: f64,
    /// Ceiling on any single delay.
    pub max_delay: Duration,
    /// Number of attempts the iterator yields.
    pub max_attempts: u32,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            base_delay: defaults::BASE_DELAY,
            multiplier: defaults::MULTIPLIER,
            jitter: defaults::JITTER,
            max_delay: defaults::MAX_DELAY,
            max_attempts: defaults::MAX_ATTEMPTS,
        }
    }
}

impl BackoffPolicy {
    /// Start a backoff sequence under this policy.
    pub fn iter(&self) -> ExponentialBackoff {
        ExponentialBackoff {
            policy: self.clone(),
            attempt: 0,
            current: self.base_delay.as_secs_f64(),
        }
    }

    /// A policy that never retries.
    pub fn none() -> Self {
        Self {
            max_attempts: 0,
            ..Self::default()
        }
    }
}

/// Iterator over reconnect delays.
pub struct ExponentialBackoff {
    policy: BackoffPolicy,
    attempt: u32,
    current: f64,
}

impl Iterator for ExponentialBackoff {
    type Item = Duration;

    fn next(&mut self) -> Option<Duration> {
        use rand::Rng;

        if self.attempt >= self.policy.max_attempts {
            return None;
        }
        self.attempt += 1;

        let jitter = if self.policy.jitter > 0.0 {
            1.0 + rand::rng().random_range(-self.policy.jitter..=self.policy.jitter)
        } else {
            1.0
        };
        let delay = Duration::from_secs_f64((self.current * jitter).max(0.0));

        self.current = (self.current * self.policy.multiplier)
            .min(self.policy.max_delay.as_secs_f64());

        Some(delay.min(self.policy.max_delay))
    }
}
