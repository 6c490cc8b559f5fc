//! Bounded exponential backoff for transient poll failures.

use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Backoff policy for retrying a failed status poll.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
pub struct RetryPolicy {
    /// Delay before the first retry.
    #[serde(default = "default_initial_delay_secs")]
    pub initial_delay_secs: u64,

    /// Ceiling for the delay between retries.
    #[serde(default = "default_max_delay_secs")]
    pub max_delay_secs: u64,

    /// Factor applied to the delay after every failure.
    #[serde(default = "default_multiplier")]
    pub multiplier: u32,

    /// Consecutive failures tolerated before giving up. Zero means never
    /// give up.
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
}

fn default_initial_delay_secs() -> u64 {
    15
}

fn default_max_delay_secs() -> u64 {
    120
}

fn default_multiplier() -> u32 {
    2
}

fn default_max_attempts() -> u32 {
    60
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            initial_delay_secs: default_initial_delay_secs(),
            max_delay_secs: default_max_delay_secs(),
            multiplier: default_multiplier(),
            max_attempts: default_max_attempts(),
        }
    }
}

impl RetryPolicy {
    /// A fresh backoff sequence following this policy.
    pub fn backoff(&self) -> Backoff {
        Backoff {
            policy: self.clone(),
            attempts: 0,
            next: Duration::from_secs(self.initial_delay_secs),
        }
    }
}

/// State of one run of consecutive failures.
#[derive(Debug, Clone)]
pub struct Backoff {
    policy: RetryPolicy,
    attempts: u32,
    next: Duration,
}

impl Backoff {
    /// Record a failure and return how long to wait before retrying, or
    /// `None` once the attempt cap is reached.
    pub fn next_delay(&mut self) -> Option<Duration> {
        if self.policy.max_attempts != 0 && self.attempts >= self.policy.max_attempts {
            return None;
        }
        self.attempts += 1;

        let delay = self.next;
        let ceiling = Duration::from_secs(self.policy.max_delay_secs);
        self.next = delay.saturating_mul(self.policy.multiplier.max(1)).min(ceiling);
        Some(delay.min(ceiling))
    }

    /// Failures recorded since the last reset.
    pub fn attempts(&self) -> u32 {
        self.attempts
    }

    /// Forget past failures, after a successful poll.
    pub fn reset(&mut self) {
        self.attempts = 0;
        self.next = Duration::from_secs(self.policy.initial_delay_secs);
    }
}
