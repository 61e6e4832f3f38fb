// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

use std::collections::{BTreeMap, BTreeSet};
use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Per-request validation configuration.
///
/// Options use ordered maps and sets throughout so that serializing the same
/// logical configuration always yields the same bytes. The execution core
/// relies on this when deriving a [`Fingerprint`][crate::Fingerprint] from a
/// request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ValidationOptions {
    /// Run the syntax phase.
    pub syntax: bool,

    /// Run the security phase.
    pub security: bool,

    /// Run the style phase.
    pub style: bool,

    /// Run the best-practices phase.
    pub best_practices: bool,

    /// Run the error-handling phase.
    pub error_handling: bool,

    /// Custom rules keyed by rule id; the body format is validator-defined.
    pub custom_rules: BTreeMap<String, String>,

    /// Minimum score (0–10) a security finding must reach to be reported.
    pub security_severity_threshold: u8,

    /// Rule ids excluded from the verdict.
    pub exclude_rules: BTreeSet<String>,

    /// Per-request performance budget, checked after execution.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub performance_thresholds: Option<PerformanceThresholds>,

    /// Hints for running phases concurrently inside one request.
    pub parallel: ParallelOptions,
}

impl Default for ValidationOptions {
    fn default() -> Self {
        Self {
            syntax: true,
            security: false,
            style: false,
            best_practices: false,
            error_handling: false,
            custom_rules: BTreeMap::new(),
            security_severity_threshold: 0,
            exclude_rules: BTreeSet::new(),
            performance_thresholds: None,
            parallel: ParallelOptions::default(),
        }
    }
}

impl ValidationOptions {
    /// Options with every built-in phase enabled.
    #[must_use]
    pub fn all_phases() -> Self {
        Self {
            syntax: true,
            security: true,
            style: true,
            best_practices: true,
            error_handling: true,
            ..Self::default()
        }
    }

    /// Sets the security severity threshold, clamped to the 0–10 scale.
    #[must_use]
    pub fn with_security_threshold(mut self, threshold: u8) -> Self {
        self.security_severity_threshold = threshold.min(10);
        self
    }

    /// Adds a custom rule.
    #[must_use]
    pub fn with_rule(mut self, id: impl Into<String>, body: impl Into<String>) -> Self {
        let _ = self.custom_rules.insert(id.into(), body.into());
        self
    }

    /// Excludes a rule id from the verdict.
    #[must_use]
    pub fn without_rule(mut self, id: impl Into<String>) -> Self {
        let _ = self.exclude_rules.insert(id.into());
        self
    }

    /// Names of the enabled built-in phases, in canonical order.
    #[must_use]
    pub fn enabled_phases(&self) -> Vec<&'static str> {
        let toggles = [
            ("syntax", self.syntax),
            ("security", self.security),
            ("style", self.style),
            ("best_practices", self.best_practices),
            ("error_handling", self.error_handling),
        ];

        toggles.into_iter().filter_map(|(name, on)| on.then_some(name)).collect()
    }
}

/// Resource budget for a single request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PerformanceThresholds {
    /// Wall-clock budget for the whole validation.
    pub max_time: Duration,

    /// Peak memory budget in bytes.
    pub max_memory_bytes: u64,
}

/// Hints controlling intra-request phase concurrency.
///
/// The execution core forwards these to the language validator; phases named
/// in `sequential_phases` always run in their declared order.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ParallelOptions {
    /// Let the validator scale phase concurrency with observed load.
    pub adaptive: bool,

    /// Minimum number of cores before phases run concurrently at all.
    pub min_cores: u32,

    /// CPU ceiling (percent) for concurrent phase execution.
    pub max_cpu_pct: f64,

    /// Memory ceiling in bytes for concurrent phase execution.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_memory_bytes: Option<u64>,

    /// Upper bound on concurrently running phases.
    pub max_concurrent_phases: u32,

    /// Phases that must run sequentially, in declared order.
    pub sequential_phases: BTreeSet<String>,
}

impl Default for ParallelOptions {
    fn default() -> Self {
        Self {
            adaptive: true,
            min_cores: 2,
            max_cpu_pct: 80.0,
            max_memory_bytes: None,
            max_concurrent_phases: 4,
            sequential_phases: BTreeSet::new(),
        }
    }
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;

    #[test]
    fn defaults_enable_syntax_only() {
        let options = ValidationOptions::default();
        assert_eq!(options.enabled_phases(), vec!["syntax"]);
    }

    #[test]
    fn all_phases_enables_everything() {
        let options = ValidationOptions::all_phases();
        assert_eq!(
            options.enabled_phases(),
            vec!["syntax", "security", "style", "best_practices", "error_handling"]
        );
    }

    #[test]
    fn security_threshold_clamps_to_scale() {
        let options = ValidationOptions::default().with_security_threshold(42);
        assert_eq!(options.security_severity_threshold, 10);
    }

    #[test]
    fn serialization_is_canonical() {
        let a = ValidationOptions::default()
            .with_rule("no-eval", "deny eval()")
            .with_rule("max-len", "120")
            .without_rule("style/trailing-comma");
        let mut b = ValidationOptions::default().without_rule("style/trailing-comma");
        // Insertion order differs; serialized form must not.
        b = b.with_rule("max-len", "120").with_rule("no-eval", "deny eval()");

        let ja = serde_json::to_string(&a).expect("serialize");
        let jb = serde_json::to_string(&b).expect("serialize");
        assert_eq!(ja, jb);
    }

    #[test]
    fn round_trips_through_json() {
        let options = ValidationOptions::all_phases()
            .with_security_threshold(7)
            .with_rule("no-eval", "deny eval()");

        let json = serde_json::to_string(&options).expect("serialize");
        let back: ValidationOptions = serde_json::from_str(&json).expect("deserialize");
        assert_eq!(options, back);
    }
}
