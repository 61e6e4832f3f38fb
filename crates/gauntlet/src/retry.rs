// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Per-category retry policies with jittered backoff.
//!
//! Every error category gets its own [`RetryPolicy`]; the middleware chain
//! looks the policy up through [`RetryPolicies::get`] when a stage fails.
//! Delay schedules add 0–10% of the computed delay as jitter so synchronized
//! clients do not retry in lockstep.

use std::fmt::Debug;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::time::Instant;

use verdict::ErrorCategory;

/// Strategy for spacing retry attempts.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "strategy")]
pub enum Backoff {
    /// Retry immediately, with no delay between attempts.
    Immediate,

    /// Delays grow proportionally: `base, 2·base, 3·base, …`.
    Linear,

    /// Delays grow geometrically: `base, base·f, base·f², …`.
    Exponential {
        /// Growth factor per attempt.
        factor: f64,
    },
}

/// Retry behavior for one error category.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryPolicy {
    /// Attempts allowed in total, including the first.
    pub max_attempts: u32,

    /// How delays between attempts grow.
    pub backoff: Backoff,

    /// Delay before the first retry.
    pub base_delay: Duration,

    /// Ceiling applied to every computed delay.
    pub max_delay: Duration,

    /// Budget for the whole attempt sequence, measured from the first
    /// attempt; once exceeded, no further retries are scheduled.
    pub max_duration: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            backoff: Backoff::Exponential { factor: 2.0 },
            base_delay: Duration::from_millis(50),
            max_delay: Duration::from_secs(2),
            max_duration: Duration::from_secs(20),
        }
    }
}

impl RetryPolicy {
    /// A policy that never retries.
    #[must_use]
    pub fn none() -> Self {
        Self {
            max_attempts: 1,
            backoff: Backoff::Immediate,
            base_delay: Duration::ZERO,
            max_delay: Duration::ZERO,
            max_duration: Duration::ZERO,
        }
    }

    /// Whether another attempt is allowed after `attempt` attempts have run
    /// and `started` marks the first attempt.
    #[must_use]
    pub fn allows_retry(&self, attempt: u32, started: Instant) -> bool {
        attempt < self.max_attempts && started.elapsed() <= self.max_duration
    }

    /// The delay before retry number `retry` (1-based), without jitter.
    #[must_use]
    pub fn raw_delay(&self, retry: u32) -> Duration {
        let computed = match self.backoff {
            Backoff::Immediate => Duration::ZERO,
            Backoff::Linear => self.base_delay.saturating_mul(retry),
            Backoff::Exponential { factor } => {
                let scale = factor.max(1.0).powi(retry.saturating_sub(1) as i32);
                self.base_delay.mul_f64(scale)
            }
        };

        computed.min(self.max_delay)
    }

    /// The delay before retry number `retry` with additive jitter applied.
    #[must_use]
    pub fn delay(&self, retry: u32, rnd: &Rnd) -> Duration {
        let raw = self.raw_delay(retry);
        raw + raw.mul_f64(rnd.next_f64() * 0.1)
    }
}

/// Retry policies keyed by [`ErrorCategory`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryPolicies {
    /// Policy for deadline expiries.
    pub timeout: RetryPolicy,

    /// Policy for stage and validator faults.
    pub runtime: RetryPolicy,

    /// Policy for admission and capacity rejections.
    pub resource: RetryPolicy,

    /// Policy for internal faults; never retried by default.
    pub internal: RetryPolicy,
}

impl Default for RetryPolicies {
    fn default() -> Self {
        Self {
            timeout: RetryPolicy {
                base_delay: Duration::from_millis(100),
                max_delay: Duration::from_secs(5),
                max_duration: Duration::from_secs(30),
                ..RetryPolicy::default()
            },
            runtime: RetryPolicy::default(),
            resource: RetryPolicy {
                max_attempts: 2,
                backoff: Backoff::Linear,
                base_delay: Duration::from_millis(500),
                max_delay: Duration::from_secs(5),
                max_duration: Duration::from_secs(10),
            },
            internal: RetryPolicy::none(),
        }
    }
}

impl RetryPolicies {
    /// The policy for `category`.
    #[must_use]
    pub const fn get(&self, category: ErrorCategory) -> &RetryPolicy {
        match category {
            ErrorCategory::Timeout => &self.timeout,
            ErrorCategory::Runtime => &self.runtime,
            ErrorCategory::Resource => &self.resource,
            ErrorCategory::Internal => &self.internal,
        }
    }
}

/// Random source for jitter.
///
/// Not cryptographically secure; jitter only needs to decorrelate clients.
/// Tests pin the generator to a fixed function for deterministic schedules.
#[derive(Clone, Default)]
pub enum Rnd {
    /// Draw from `fastrand`.
    #[default]
    Real,

    /// Fixed generator, used by tests.
    Fixed(std::sync::Arc<dyn Fn() -> f64 + Send + Sync>),
}

impl Debug for Rnd {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Real => write!(f, "Real"),
            Self::Fixed(_) => write!(f, "Fixed"),
        }
    }
}

impl Rnd {
    /// A generator that always returns `value`.
    #[must_use]
    pub fn fixed(value: f64) -> Self {
        Self::Fixed(std::sync::Arc::new(move || value))
    }

    /// The next value in `0.0..1.0`.
    #[must_use]
    pub fn next_f64(&self) -> f64 {
        match self {
            Self::Real => fastrand::f64(),
            Self::Fixed(generator) => generator(),
        }
    }
}

#[cfg(test)]
mod tests {
    use rstest::rstest;

    use super::*;

    #[rstest]
    #[case::immediate_first(Backoff::Immediate, 1, Duration::ZERO)]
    #[case::immediate_later(Backoff::Immediate, 5, Duration::ZERO)]
    #[case::linear_first(Backoff::Linear, 1, Duration::from_millis(100))]
    #[case::linear_third(Backoff::Linear, 3, Duration::from_millis(300))]
    #[case::exponential_first(Backoff::Exponential { factor: 2.0 }, 1, Duration::from_millis(100))]
    #[case::exponential_second(Backoff::Exponential { factor: 2.0 }, 2, Duration::from_millis(200))]
    #[case::exponential_third(Backoff::Exponential { factor: 2.0 }, 3, Duration::from_millis(400))]
    fn backoff_shapes(#[case] backoff: Backoff, #[case] retry: u32, #[case] expected: Duration) {
        let policy = RetryPolicy {
            backoff,
            base_delay: Duration::from_millis(100),
            max_delay: Duration::from_secs(10),
            ..RetryPolicy::default()
        };
        assert_eq!(policy.raw_delay(retry), expected);
    }

    #[test]
    fn max_delay_caps_growth() {
        let policy = RetryPolicy {
            backoff: Backoff::Exponential { factor: 10.0 },
            base_delay: Duration::from_millis(100),
            max_delay: Duration::from_millis(250),
            ..RetryPolicy::default()
        };
        assert_eq!(policy.raw_delay(4), Duration::from_millis(250));
    }

    #[test]
    fn jitter_adds_up_to_ten_percent() {
        let policy = RetryPolicy {
            backoff: Backoff::Linear,
            base_delay: Duration::from_millis(100),
            max_delay: Duration::from_secs(10),
            ..RetryPolicy::default()
        };

        assert_eq!(policy.delay(1, &Rnd::fixed(0.0)), Duration::from_millis(100));
        assert_eq!(policy.delay(1, &Rnd::fixed(1.0)), Duration::from_millis(110));
    }

    #[tokio::test(start_paused = true)]
    async fn attempts_and_duration_budget_gate_retries() {
        let policy = RetryPolicy {
            max_attempts: 3,
            max_duration: Duration::from_secs(10),
            ..RetryPolicy::default()
        };

        let started = Instant::now();
        assert!(policy.allows_retry(1, started));
        assert!(policy.allows_retry(2, started));
        assert!(!policy.allows_retry(3, started), "attempts exhausted");

        tokio::time::advance(Duration::from_secs(11)).await;
        assert!(!policy.allows_retry(1, started), "duration budget exhausted");
    }

    #[test]
    fn none_policy_never_retries() {
        let policy = RetryPolicy::none();
        assert!(!policy.allows_retry(1, Instant::now()));
    }

    #[test]
    fn policies_key_by_category() {
        let policies = RetryPolicies::default();
        assert_eq!(policies.get(ErrorCategory::Internal).max_attempts, 1);
        assert_eq!(policies.get(ErrorCategory::Runtime).max_attempts, 3);
        assert_eq!(policies.get(ErrorCategory::Resource).max_attempts, 2);
    }

    #[test]
    fn policies_round_trip_through_json() {
        let policies = RetryPolicies::default();
        let json = serde_json::to_string(&policies).expect("serialize");
        let back: RetryPolicies = serde_json::from_str(&json).expect("deserialize");
        assert_eq!(policies, back);
    }
}
