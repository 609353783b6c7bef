use std::time::Duration;

use rand::Rng;
use serde::{Deserialize, Serialize};

/// Resubscription after an unexpected disconnect. Off unless enabled.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ReconnectPolicy {
    pub enabled: bool,
    pub base_ms: u64,
    pub max_ms: u64,
    pub max_attempts: u32,
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        ReconnectPolicy {
            enabled: false,
            base_ms: 500,
            max_ms: 30_000,
            max_attempts: 10,
        }
    }
}

/// Exponential backoff with full jitter: attempt `n` waits a uniformly
/// random time in `[0, min(max, base * 2^n)]`.
#[derive(Debug, Clone)]
pub struct Backoff {
    policy: ReconnectPolicy,
    attempt: u32,
}

impl Backoff {
    pub fn new(policy: ReconnectPolicy) -> Self {
        Backoff { policy, attempt: 0 }
    }

    pub fn attempt(&self) -> u32 {
        self.attempt
    }

    /// Delay before the next attempt, or `None` once attempts are used up.
    pub fn next_delay(&mut self) -> Option<Duration> {
        if self.attempt >= self.policy.max_attempts {
            return None;
        }
        let ceiling = self.ceiling_ms(self.attempt);
        self.attempt += 1;
        let jittered = rand::thread_rng().gen_range(0..=ceiling);
        Some(Duration::from_millis(jittered))
    }

    pub fn reset(&mut self) {
        self.attempt = 0;
    }

    fn ceiling_ms(&self, attempt: u32) -> u64 {
        let factor = 1u64 << attempt.min(32);
        self.policy
            .base_ms
            .saturating_mul(factor)
            .min(self.policy.max_ms)
    }
}
