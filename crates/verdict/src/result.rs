// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt::{Display, Formatter};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::{Issue, Severity};

/// Lifecycle state of a validation.
///
/// Every request reaches exactly one terminal state: `Completed`,
/// `CompletedWithErrors`, or `Failed`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ValidationState {
    /// Work is still flowing through the pipeline.
    InProgress,

    /// All stages ran and the code is valid.
    Completed,

    /// The pipeline ran to the end but found invalidating issues or lost
    /// a middleware stage on the way.
    CompletedWithErrors,

    /// The pipeline could not produce a verdict.
    Failed,
}

/// Serializable mirror of a circuit breaker state, carried in results and
/// the public metrics API.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BreakerStateTag {
    /// Normal operation.
    Closed,

    /// Short-circuiting; calls are rejected.
    Open,

    /// Probing whether the protected stage recovered.
    HalfOpen,
}

impl Display for BreakerStateTag {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Closed => write!(f, "closed"),
            Self::Open => write!(f, "open"),
            Self::HalfOpen => write!(f, "half_open"),
        }
    }
}

/// Diagnostic record for a middleware stage that exhausted its attempts.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MiddlewareFailure {
    /// Stage name.
    pub name: String,

    /// Last error message observed.
    pub error: String,

    /// Number of attempts made, including the first.
    pub attempts: u32,

    /// Breaker state for the stage at the time the result was sealed.
    pub breaker: BreakerStateTag,
}

/// A phase that consumed a disproportionate share of the request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Bottleneck {
    /// Phase name.
    pub phase: String,

    /// Share of total request time, in percent.
    pub share_pct: f64,

    /// Human-readable detail.
    pub detail: String,
}

/// Performance data gathered while executing one request.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PerformanceStats {
    /// Exclusive wall time per phase.
    pub phase_timings: BTreeMap<String, Duration>,

    /// Mean phase duration.
    pub average_time: Duration,

    /// Peak resident set observed during the request, in bytes.
    pub peak_memory_bytes: u64,

    /// Process CPU utilization in percent.
    pub cpu_percent: f64,

    /// OS threads in the process.
    pub thread_count: u32,

    /// Open handles / file descriptors in the process.
    pub handle_count: u32,

    /// Validations in flight when the request ran.
    pub concurrent_ops: u32,

    /// Worker-pool utilization in percent.
    pub thread_pool_utilization_pct: f64,

    /// Ratio of ideal to observed elapsed time across parallel phases.
    pub parallel_efficiency_pct: f64,

    /// Phases flagged as bottlenecks.
    pub bottlenecks: Vec<Bottleneck>,
}

impl PerformanceStats {
    /// Recomputes `average_time` from the recorded phase timings.
    pub fn refresh_average(&mut self) {
        let count = self.phase_timings.len() as u32;
        if count == 0 {
            self.average_time = Duration::ZERO;
            return;
        }

        let total: Duration = self.phase_timings.values().sum();
        self.average_time = total / count;
    }
}

/// Aggregate statistics for a sealed result.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Stats {
    /// Count of `Info` issues.
    pub info_count: usize,

    /// Count of `Warning` issues.
    pub warning_count: usize,

    /// Count of `Error` issues.
    pub error_count: usize,

    /// Count of `SecurityVulnerability` issues.
    pub security_count: usize,

    /// Performance data for the request.
    pub performance: PerformanceStats,
}

impl Stats {
    /// Tallies issue counts by severity.
    #[must_use]
    pub fn tally(issues: &[Issue]) -> Self {
        let mut stats = Self::default();
        for issue in issues {
            match issue.severity {
                Severity::Info => stats.info_count += 1,
                Severity::Warning => stats.warning_count += 1,
                Severity::Error => stats.error_count += 1,
                Severity::SecurityVulnerability => stats.security_count += 1,
            }
        }

        stats
    }
}

/// The structured outcome of a validation request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ValidationResult {
    /// Lifecycle state; terminal once sealed.
    pub state: ValidationState,

    /// Language tag the request targeted.
    pub language: String,

    /// Ordered diagnostics, in the order phases produced them.
    pub issues: Vec<Issue>,

    /// Derived validity; see the crate-level invariant.
    pub is_valid: bool,

    /// True when some middleware failed but the verdict is still valid.
    pub partial: bool,

    /// Aggregate statistics.
    pub stats: Stats,

    /// Stages skipped by circuit protection.
    pub skipped_middleware: BTreeSet<String>,

    /// Stages that exhausted their attempts.
    pub failed_middleware: Vec<MiddlewareFailure>,
}

impl ValidationResult {
    /// Creates an in-progress result for the given language.
    pub fn begin(language: impl Into<String>) -> Self {
        Self {
            state: ValidationState::InProgress,
            language: language.into(),
            issues: Vec::new(),
            is_valid: true,
            partial: false,
            stats: Stats::default(),
            skipped_middleware: BTreeSet::new(),
            failed_middleware: Vec::new(),
        }
    }

    /// Creates a terminal failed result carrying a single explanatory issue.
    pub fn failure(language: impl Into<String>, issue: Issue) -> Self {
        let mut result = Self::begin(language);
        result.issues.push(issue);
        result.stats = Stats::tally(&result.issues);
        result.is_valid = false;
        result.partial = false;
        result.state = ValidationState::Failed;
        result
    }

    /// Appends an issue.
    pub fn push_issue(&mut self, issue: Issue) {
        self.issues.push(issue);
    }

    /// Derives `is_valid`, `partial`, issue tallies, and the terminal state.
    ///
    /// Call exactly once, after all phases have contributed. `Failed` results
    /// are left untouched so a failure reason cannot be accidentally upgraded.
    pub fn seal(&mut self) {
        if self.state == ValidationState::Failed {
            return;
        }

        let performance = std::mem::take(&mut self.stats.performance);
        self.stats = Stats::tally(&self.issues);
        self.stats.performance = performance;

        self.is_valid = !self.issues.iter().any(|issue| issue.severity.invalidates());
        self.partial = self.is_valid && !self.failed_middleware.is_empty();

        self.state = if self.is_valid && self.failed_middleware.is_empty() {
            ValidationState::Completed
        } else {
            ValidationState::CompletedWithErrors
        };
    }

    /// Whether the result reached a terminal state.
    #[must_use]
    pub const fn is_terminal(&self) -> bool {
        !matches!(self.state, ValidationState::InProgress)
    }
}
