//! Retry policies with exponential backoff and seedable jitter.
//!
//! Named presets (`none`, `standard`, `aggressive`, `linear`, `patient`)
//! bound the attempt count and shape the delay curve. Backoff for attempt
//! `n` (1-indexed) is `base * multiplier^(n-1)` plus uniform jitter in
//! `[0, base * jitter_fraction]`.

use std::time::Duration;

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

#[derive(Debug, Clone, PartialEq)]
pub struct RetryPolicy {
    pub name: &'static str,
    /// Total attempt budget, including the first execution.
    pub max_attempts: usize,
    pub base_delay: Duration,
    pub multiplier: f64,
    pub jitter_fraction: f64,
}

impl RetryPolicy {
    pub fn none() -> Self {
        Self {
            name: "none",
            max_attempts: 1,
            base_delay: Duration::ZERO,
            multiplier: 1.0,
            jitter_fraction: 0.0,
        }
    }

    pub fn standard() -> Self {
        Self {
            name: "standard",
            max_attempts: 3,
            base_delay: Duration::from_secs(2),
            multiplier: 2.0,
            jitter_fraction: 0.1,
        }
    }

    pub fn aggressive() -> Self {
        Self {
            name: "aggressive",
            max_attempts: 5,
            base_delay: Duration::from_secs(1),
            multiplier: 2.0,
            jitter_fraction: 0.25,
        }
    }

    pub fn linear() -> Self {
        Self {
            name: "linear",
            max_attempts: 4,
            base_delay: Duration::from_secs(5),
            multiplier: 1.0,
            jitter_fraction: 0.0,
        }
    }

    pub fn patient() -> Self {
        Self {
            name: "patient",
            max_attempts: 8,
            base_delay: Duration::from_secs(10),
            multiplier: 1.5,
            jitter_fraction: 0.1,
        }
    }

    pub fn from_name(name: &str) -> Option<Self> {
        match name {
            "none" => Some(Self::none()),
            "standard" => Some(Self::standard()),
            "aggressive" => Some(Self::aggressive()),
            "linear" => Some(Self::linear()),
            "patient" => Some(Self::patient()),
            _ => None,
        }
    }

    /// Total attempts for a node: `min(policy budget, node max_retries + 1)`
    /// when the node sets its own cap, otherwise the policy budget.
    pub fn attempts_for(&self, node_max_retries: Option<usize>) -> usize {
        match node_max_retries {
            Some(retries) => self.max_attempts.min(retries + 1),
            None => self.max_attempts,
        }
        .max(1)
    }

    /// Delay before re-running after `attempt` failed attempts (1-indexed).
    pub fn backoff(&self, attempt: usize, jitter: &mut Jitter) -> Duration {
        if self.base_delay.is_zero() {
            return Duration::ZERO;
        }
        let exponent = attempt.saturating_sub(1) as i32;
        let scaled = self.base_delay.as_secs_f64() * self.multiplier.powi(exponent);
        let jitter_range = self.base_delay.as_secs_f64() * self.jitter_fraction;
        let jittered = scaled + jitter.uniform(jitter_range);
        Duration::from_secs_f64(jittered)
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::standard()
    }
}

/// Jitter source. Seeded construction makes backoff reproducible in tests.
pub struct Jitter {
    rng: StdRng,
}

impl Jitter {
    pub fn new() -> Self {
        Self {
            rng: StdRng::from_entropy(),
        }
    }

    pub fn seeded(seed: u64) -> Self {
        Self {
            rng: StdRng::seed_from_u64(seed),
        }
    }

    fn uniform(&mut self, upper: f64) -> f64 {
        if upper <= 0.0 {
            0.0
        } else {
            self.rng.gen_range(0.0..upper)
        }
    }
}

impl Default for Jitter {
    fn default() -> Self {
        Self::new()
    }
}
