//! Retry policies per error kind
//!
//! Each [`ErrorKind`] maps to one [`RetryPolicy`]. The table is static
//! configuration: the defaults below can be overridden per kind from the
//! `[retry.<kind>]` sections of the config file.

use rand::Rng;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::time::Duration;

use crate::classifier::ErrorKind;
use crate::config::RetryPolicyConfig;

/// Shape of the delay curve between attempts
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum BackoffStrategy {
    /// Always `base_delay`
    Fixed,
    /// `base_delay * (retry_count + 1)`
    Linear,
    /// `base_delay * base^retry_count`
    Exponential { base: f64 },
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RetryPolicy {
    pub max_retries: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
    pub backoff: BackoffStrategy,
    pub jitter: bool,
}

impl RetryPolicy {
    pub fn new(
        max_retries: u32,
        base_delay: Duration,
        max_delay: Duration,
        backoff: BackoffStrategy,
        jitter: bool,
    ) -> Self {
        Self {
            max_retries,
            base_delay,
            max_delay,
            backoff,
            jitter,
        }
    }

    /// A policy that never retries
    pub fn never() -> Self {
        Self::new(
            0,
            Duration::ZERO,
            Duration::ZERO,
            BackoffStrategy::Fixed,
            false,
        )
    }

    /// Delay before retry number `retry_count + 1`, without jitter.
    ///
    /// Always within `[0, max_delay]`, whatever the policy values are.
    pub fn base_delay_for(&self, retry_count: u32) -> Duration {
        let base = self.base_delay.as_secs_f64();
        let factor = match self.backoff {
            BackoffStrategy::Fixed => 1.0,
            BackoffStrategy::Linear => f64::from(retry_count) + 1.0,
            // A base below 1 would shrink delays; treat it as fixed
            BackoffStrategy::Exponential { base } => {
                base.max(1.0).powi(retry_count.min(64) as i32)
            }
        };
        self.clamp(base * factor)
    }

    /// Delay before retry number `retry_count + 1`, with jitter if enabled
    pub fn delay_for(&self, retry_count: u32) -> Duration {
        let delay = self.base_delay_for(retry_count);
        if !self.jitter || delay.is_zero() {
            return delay;
        }

        let factor = rand::thread_rng().gen_range(0.8..=1.2);
        self.clamp(delay.as_secs_f64() * factor)
    }

    fn clamp(&self, secs: f64) -> Duration {
        let max = self.max_delay.as_secs_f64();
        if !secs.is_finite() || secs >= max {
            self.max_delay
        } else if secs <= 0.0 {
            Duration::ZERO
        } else {
            Duration::from_secs_f64(secs)
        }
    }

    /// Apply config overrides on top of this policy
    pub fn merged(mut self, overrides: &RetryPolicyConfig) -> Self {
        if let Some(max_retries) = overrides.max_retries {
            self.max_retries = max_retries;
        }
        if let Some(secs) = overrides.base_delay_secs {
            self.base_delay = secs_to_duration(secs);
        }
        if let Some(secs) = overrides.max_delay_secs {
            self.max_delay = secs_to_duration(secs);
        }
        if let Some(backoff) = overrides.backoff {
            self.backoff = backoff;
        }
        if let Some(jitter) = overrides.jitter {
            self.jitter = jitter;
        }
        self
    }
}

/// Negative or NaN becomes zero, anything too large for a `Duration` saturates
fn secs_to_duration(secs: f64) -> Duration {
    if secs.is_nan() || secs <= 0.0 {
        return Duration::ZERO;
    }
    Duration::try_from_secs_f64(secs).unwrap_or(Duration::MAX)
}

/// One retry policy per error kind
#[derive(Debug, Clone)]
pub struct RetryPolicyTable {
    policies: HashMap<ErrorKind, RetryPolicy>,
}

impl Default for RetryPolicyTable {
    fn default() -> Self {
        use BackoffStrategy::{Exponential, Fixed, Linear};

        let secs = Duration::from_secs;
        let doubling = Exponential { base: 2.0 };

        let policies = HashMap::from([
            (
                ErrorKind::RateLimit,
                RetryPolicy::new(3, secs(60), secs(900), doubling, true),
            ),
            (
                ErrorKind::Network,
                RetryPolicy::new(3, secs(2), secs(60), doubling, true),
            ),
            (
                ErrorKind::TemporaryFailure,
                RetryPolicy::new(3, secs(5), secs(120), doubling, true),
            ),
            (
                ErrorKind::ApiError,
                RetryPolicy::new(2, secs(5), secs(60), Linear, true),
            ),
            (
                ErrorKind::Unknown,
                RetryPolicy::new(2, secs(10), secs(60), Linear, true),
            ),
            (
                ErrorKind::QuotaExceeded,
                RetryPolicy::new(1, secs(300), secs(900), Fixed, false),
            ),
            (
                ErrorKind::Authentication,
                RetryPolicy::new(1, secs(5), secs(5), Fixed, false),
            ),
            (
                ErrorKind::ContentValidation,
                RetryPolicy::new(1, secs(1), secs(1), Fixed, false),
            ),
            (ErrorKind::PermanentFailure, RetryPolicy::never()),
        ]);

        Self { policies }
    }
}

impl RetryPolicyTable {
    /// Default table with config overrides applied
    pub fn from_overrides(overrides: &HashMap<ErrorKind, RetryPolicyConfig>) -> Self {
        let mut table = Self::default();
        for (kind, config) in overrides {
            let merged = table.get(*kind).merged(config);
            table.set(*kind, merged);
        }
        table
    }

    /// A table applying the same policy to every kind
    pub fn uniform(policy: RetryPolicy) -> Self {
        Self {
            policies: ErrorKind::ALL.into_iter().map(|k| (k, policy)).collect(),
        }
    }

    pub fn with_policy(mut self, kind: ErrorKind, policy: RetryPolicy) -> Self {
        self.set(kind, policy);
        self
    }

    pub fn set(&mut self, kind: ErrorKind, policy: RetryPolicy) {
        self.policies.insert(kind, policy);
    }

    /// Policy for `kind`; kinds missing from the table are never retried
    pub fn get(&self, kind: ErrorKind) -> RetryPolicy {
        self.policies
            .get(&kind)
            .copied()
            .unwrap_or_else(RetryPolicy::never)
    }
}
