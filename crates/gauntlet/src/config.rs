// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::alerts::AlertThresholds;
use crate::breaker::BreakerOptions;
use crate::retry::RetryPolicies;

/// Top-level configuration for a [`Pipeline`][crate::Pipeline].
///
/// Every knob has a production-reasonable default; deserialize a partial
/// JSON document to override only what you need.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineOptions {
    /// Upper bound on validations executing concurrently.
    pub max_concurrent_validations: usize,

    /// Upper bound on requests waiting for an execution slot.
    pub max_queue_size: usize,

    /// How long a request may wait for an execution slot.
    pub admission_wait_timeout: Duration,

    /// Hard resource ceilings consulted by the admission resource gate.
    pub resource_limits: ResourceLimits,

    /// Share of capacity (percent) reserved for critical requests.
    pub critical_reservation_pct: u8,

    /// Adaptive throttling of the concurrency gate.
    pub throttle: ThrottleOptions,

    /// Per-category retry policies.
    pub retry: RetryPolicies,

    /// Circuit breaker behavior, shared by all protected stages.
    pub breaker: BreakerOptions,

    /// Result cache retention.
    pub cache: CacheSettings,

    /// Middleware chain behavior.
    pub chain: ChainOptions,

    /// Thresholds for flagging per-request bottlenecks.
    pub bottlenecks: BottleneckOptions,

    /// Validator discovery and health checking.
    pub discovery: DiscoveryOptions,

    /// Resource sampling cadence.
    pub sampler: SamplerOptions,

    /// Alerting thresholds.
    pub alerts: AlertThresholds,
}

impl Default for PipelineOptions {
    fn default() -> Self {
        Self {
            max_concurrent_validations: 4,
            max_queue_size: 1000,
            admission_wait_timeout: Duration::from_secs(30),
            resource_limits: ResourceLimits::default(),
            critical_reservation_pct: 20,
            throttle: ThrottleOptions::default(),
            retry: RetryPolicies::default(),
            breaker: BreakerOptions::default(),
            cache: CacheSettings::default(),
            chain: ChainOptions::default(),
            bottlenecks: BottleneckOptions::default(),
            discovery: DiscoveryOptions::default(),
            sampler: SamplerOptions::default(),
            alerts: AlertThresholds::default(),
        }
    }
}

/// Resource ceilings for the admission resource gate.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ResourceLimits {
    /// Process CPU ceiling in percent.
    pub max_cpu_pct: f64,

    /// Resident-set ceiling in bytes, when bounded.
    pub max_memory_bytes: Option<u64>,

    /// Disk throughput ceiling in bytes per second, when bounded.
    pub max_disk_bps: Option<f64>,
}

impl Default for ResourceLimits {
    fn default() -> Self {
        Self {
            max_cpu_pct: 80.0,
            max_memory_bytes: None,
            max_disk_bps: None,
        }
    }
}

/// Adaptive throttle tuning.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ThrottleOptions {
    /// How often the CPU trend is evaluated.
    pub interval: Duration,

    /// Absolute CPU slope (percent per second) that triggers an adjustment.
    pub slope_threshold: f64,

    /// Multiplicative capacity step; `0.75` shrinks capacity by a quarter.
    pub adjustment_factor: f64,
}

impl Default for ThrottleOptions {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(60),
            slope_threshold: 0.1,
            adjustment_factor: 0.75,
        }
    }
}

/// Result cache retention settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheSettings {
    /// Whether completed results are retained at all. Duplicate in-flight
    /// requests still coalesce when disabled.
    pub enabled: bool,

    /// How long a completed result stays fresh.
    pub ttl: Duration,

    /// Entry-count bound.
    pub max_entries: usize,

    /// Total-cost bound in bytes.
    pub max_bytes: u64,
}

impl Default for CacheSettings {
    fn default() -> Self {
        Self {
            enabled: true,
            ttl: Duration::from_secs(60 * 60),
            max_entries: 10_000,
            max_bytes: 256 * 1024 * 1024,
        }
    }
}

/// Middleware chain behavior.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct ChainOptions {
    /// Fallback per-stage deadline for middleware that declare none.
    pub default_timeout: Option<Duration>,

    /// Keep flowing inward when a stage exhausts its attempts instead of
    /// failing the request.
    pub continue_on_failure: bool,
}

/// Thresholds for flagging a phase as a bottleneck.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BottleneckOptions {
    /// A phase consuming more than this share (percent) of the request is
    /// flagged.
    pub phase_share_pct: f64,

    /// Peak memory above this flags the request.
    pub memory_bytes: u64,
}

impl Default for BottleneckOptions {
    fn default() -> Self {
        Self {
            phase_share_pct: 25.0,
            memory_bytes: 500 * 1024 * 1024,
        }
    }
}

/// Validator discovery and health checking.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct DiscoveryOptions {
    /// Directories scanned for validator manifests.
    pub auto_discovery_paths: Vec<PathBuf>,

    /// React to manifest changes after startup.
    pub enable_hot_reload: bool,

    /// Debounce window between directory scans.
    pub file_change_delay: Duration,

    /// Periodically probe registered validators.
    pub enable_health_checks: bool,

    /// Cadence of health probes.
    pub health_check_interval: Duration,
}

impl Default for DiscoveryOptions {
    fn default() -> Self {
        Self {
            auto_discovery_paths: Vec::new(),
            enable_hot_reload: false,
            file_change_delay: Duration::from_millis(500),
            enable_health_checks: false,
            health_check_interval: Duration::from_secs(60),
        }
    }
}

/// Resource sampling cadence.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SamplerOptions {
    /// Interval between resource snapshots.
    pub interval: Duration,
}

impl Default for SamplerOptions {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(1),
        }
    }
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;

    #[test]
    fn defaults_match_contract() {
        let options = PipelineOptions::default();
        assert_eq!(options.max_concurrent_validations, 4);
        assert_eq!(options.max_queue_size, 1000);
        assert_eq!(options.admission_wait_timeout, Duration::from_secs(30));
        assert_eq!(options.critical_reservation_pct, 20);
        assert!((options.resource_limits.max_cpu_pct - 80.0).abs() < f64::EPSILON);
        assert_eq!(options.throttle.interval, Duration::from_secs(60));
        assert_eq!(options.cache.ttl, Duration::from_secs(3600));
    }

    #[test]
    fn partial_json_overrides_only_named_fields() {
        let options: PipelineOptions =
            serde_json::from_str(r#"{"max_concurrent_validations": 16}"#).expect("deserialize");
        assert_eq!(options.max_concurrent_validations, 16);
        assert_eq!(options.max_queue_size, 1000);
    }

    #[test]
    fn round_trips_through_json() {
        let options = PipelineOptions::default();
        let json = serde_json::to_string(&options).expect("serialize");
        let back: PipelineOptions = serde_json::from_str(&json).expect("deserialize");
        assert_eq!(options, back);
    }
}
