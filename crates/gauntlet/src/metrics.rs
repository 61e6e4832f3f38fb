// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Rolling execution and resource metrics.
//!
//! [`MetricsHub`] is the process-wide aggregation point: every middleware
//! execution, retry, and circuit transition lands here, along with the
//! resource snapshots produced by the sampler. Retention is bounded on both
//! axes — per-stage duration rings keep the last [`MetricsOptions::duration_ring`]
//! samples, and the resource ring is trimmed by age and entry count on a
//! pruning cadence.

use std::collections::BTreeMap;
use std::collections::VecDeque;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use dashmap::DashMap;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::task::JoinHandle;
use tokio::time::Instant;

use verdict::BreakerStateTag;

use crate::sampler::ResourceSnapshot;

/// Retention bounds for [`MetricsHub`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MetricsOptions {
    /// Per-stage duration samples retained.
    pub duration_ring: usize,

    /// Maximum resource snapshots retained.
    pub resource_cap: usize,

    /// Maximum resource snapshot age.
    pub resource_age: Duration,

    /// Cadence of the pruning task.
    pub prune_interval: Duration,
}

impl Default for MetricsOptions {
    fn default() -> Self {
        Self {
            duration_ring: 1000,
            resource_cap: 86_400,
            resource_age: Duration::from_secs(24 * 60 * 60),
            prune_interval: Duration::from_secs(60 * 60),
        }
    }
}

#[derive(Debug)]
struct StageMetrics {
    success: AtomicU64,
    failure: AtomicU64,
    retries: AtomicU64,
    durations: Mutex<VecDeque<Duration>>,
    breaker: Mutex<BreakerStateTag>,
    last_failure: Mutex<Option<(Instant, String)>>,
}

impl Default for StageMetrics {
    fn default() -> Self {
        Self {
            success: AtomicU64::new(0),
            failure: AtomicU64::new(0),
            retries: AtomicU64::new(0),
            durations: Mutex::new(VecDeque::new()),
            breaker: Mutex::new(BreakerStateTag::Closed),
            last_failure: Mutex::new(None),
        }
    }
}

/// Aggregated view of one stage, as exposed by [`MetricsHub::current_summary`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StageSummary {
    /// Successful executions.
    pub success: u64,

    /// Failed executions (each attempt counts).
    pub failure: u64,

    /// Retries scheduled.
    pub retries: u64,

    /// Mean duration over the retained ring, in milliseconds.
    pub average_ms: f64,

    /// 95th percentile duration over the retained ring, in milliseconds.
    pub p95_ms: f64,

    /// Failures as a share of all executions, `0.0..=1.0`.
    pub failure_rate: f64,

    /// Latest circuit state.
    pub breaker: BreakerStateTag,

    /// Seconds since the last recorded failure, when one occurred.
    pub last_failure_age_secs: Option<f64>,

    /// Message of the last recorded failure.
    pub last_failure_reason: Option<String>,
}

/// Latest resource figures carried in a summary.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResourceStat {
    /// Process CPU utilization in percent.
    pub cpu_pct: f64,

    /// Resident set size in bytes.
    pub rss_bytes: u64,

    /// OS threads.
    pub threads: u32,

    /// Open handles.
    pub handles: u32,

    /// Worker-pool utilization in percent.
    pub thread_pool_util_pct: f64,
}

/// Point-in-time aggregation of everything the hub knows.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct MetricsSummary {
    /// Per-stage aggregates, keyed by stage name.
    pub stages: BTreeMap<String, StageSummary>,

    /// Latest resource snapshot, when the sampler has produced one.
    pub resource: Option<ResourceStat>,
}

/// Process-wide metrics aggregation.
pub struct MetricsHub {
    options: MetricsOptions,
    stages: DashMap<String, Arc<StageMetrics>>,
    resources: Mutex<VecDeque<ResourceSnapshot>>,
}

impl std::fmt::Debug for MetricsHub {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MetricsHub")
            .field("options", &self.options)
            .field("stages", &self.stages.len())
            .finish_non_exhaustive()
    }
}

impl MetricsHub {
    /// Creates a hub with the given retention bounds.
    #[must_use]
    pub fn new(options: MetricsOptions) -> Self {
        Self {
            options,
            stages: DashMap::new(),
            resources: Mutex::new(VecDeque::new()),
        }
    }

    fn stage(&self, name: &str) -> Arc<StageMetrics> {
        if let Some(existing) = self.stages.get(name) {
            return Arc::clone(existing.value());
        }

        Arc::clone(
            self.stages
                .entry(name.to_string())
                .or_insert_with(|| Arc::new(StageMetrics::default()))
                .value(),
        )
    }

    /// Records one execution of a stage.
    pub fn record_execution(&self, name: &str, success: bool, duration: Duration) {
        let stage = self.stage(name);
        if success {
            let _ = stage.success.fetch_add(1, Ordering::Relaxed);
        } else {
            let _ = stage.failure.fetch_add(1, Ordering::Relaxed);
        }

        let mut durations = stage.durations.lock();
        if durations.len() >= self.options.duration_ring {
            let _ = durations.pop_front();
        }
        durations.push_back(duration);
    }

    /// Records a scheduled retry for a stage.
    pub fn record_retry(&self, name: &str) {
        let _ = self.stage(name).retries.fetch_add(1, Ordering::Relaxed);
    }

    /// Records the latest circuit state for a stage.
    pub fn record_circuit(&self, name: &str, state: BreakerStateTag) {
        *self.stage(name).breaker.lock() = state;
    }

    /// Records the reason for a stage failure.
    pub fn record_failure_reason(&self, name: &str, reason: &str) {
        *self.stage(name).last_failure.lock() = Some((Instant::now(), reason.to_string()));
    }

    /// Appends a resource snapshot to the rolling window.
    pub fn record_resource(&self, snapshot: ResourceSnapshot) {
        let mut resources = self.resources.lock();
        if resources.len() >= self.options.resource_cap {
            let _ = resources.pop_front();
        }
        resources.push_back(snapshot);
    }

    /// Snapshots retained within `window` of now, oldest first.
    #[must_use]
    pub fn historical(&self, window: Duration) -> Vec<ResourceSnapshot> {
        let cutoff = Instant::now().checked_sub(window);
        self.resources
            .lock()
            .iter()
            .filter(|snapshot| cutoff.is_none_or(|cutoff| snapshot.at >= cutoff))
            .cloned()
            .collect()
    }

    /// Latest snapshot, if the sampler has produced one.
    #[must_use]
    pub fn latest_resource(&self) -> Option<ResourceSnapshot> {
        self.resources.lock().back().cloned()
    }

    /// Nearest-rank percentile of a stage's retained durations.
    ///
    /// `p` is in `0.0..=100.0`. Returns `None` for unknown stages or empty
    /// rings.
    #[must_use]
    pub fn percentile(&self, name: &str, p: f64) -> Option<Duration> {
        let stage = self.stages.get(name)?;
        let durations = stage.durations.lock();
        if durations.is_empty() {
            return None;
        }

        let mut sorted: Vec<Duration> = durations.iter().copied().collect();
        drop(durations);
        sorted.sort_unstable();
        Some(Self::nearest_rank(&sorted, p))
    }

    fn nearest_rank(sorted: &[Duration], p: f64) -> Duration {
        let rank = ((p / 100.0) * sorted.len() as f64).ceil() as usize;
        sorted[rank.clamp(1, sorted.len()) - 1]
    }

    /// Least-squares slope of CPU utilization (percent per second) over the
    /// retained snapshots within `window`.
    ///
    /// Returns `None` with fewer than two points.
    #[must_use]
    pub fn cpu_slope(&self, window: Duration) -> Option<f64> {
        let snapshots = self.historical(window);
        if snapshots.len() < 2 {
            return None;
        }

        let origin = snapshots[0].at;
        let n = snapshots.len() as f64;
        let (mut sum_x, mut sum_y, mut sum_xy, mut sum_xx) = (0.0, 0.0, 0.0, 0.0);
        for snapshot in &snapshots {
            let x = snapshot.at.duration_since(origin).as_secs_f64();
            let y = snapshot.cpu_pct;
            sum_x += x;
            sum_y += y;
            sum_xy += x * y;
            sum_xx += x * x;
        }

        let denominator = n * sum_xx - sum_x * sum_x;
        if denominator.abs() < f64::EPSILON {
            return None;
        }

        Some((n * sum_xy - sum_x * sum_y) / denominator)
    }

    /// Builds a point-in-time summary of every stage and the latest snapshot.
    #[must_use]
    pub fn current_summary(&self) -> MetricsSummary {
        let mut stages = BTreeMap::new();
        let now = Instant::now();

        for entry in &self.stages {
            let metrics = entry.value();
            let success = metrics.success.load(Ordering::Relaxed);
            let failure = metrics.failure.load(Ordering::Relaxed);
            let total = success + failure;

            // Everything is computed from locks owned by this entry; touching
            // the map itself while iterating could deadlock a shard.
            let durations = metrics.durations.lock();
            let average_ms = if durations.is_empty() {
                0.0
            } else {
                durations.iter().map(Duration::as_secs_f64).sum::<f64>() / durations.len() as f64
                    * 1000.0
            };
            let p95_ms = if durations.is_empty() {
                0.0
            } else {
                let mut sorted: Vec<Duration> = durations.iter().copied().collect();
                sorted.sort_unstable();
                Self::nearest_rank(&sorted, 95.0).as_secs_f64() * 1000.0
            };
            drop(durations);

            let last_failure = metrics.last_failure.lock().clone();

            let _ = stages.insert(
                entry.key().clone(),
                StageSummary {
                    success,
                    failure,
                    retries: metrics.retries.load(Ordering::Relaxed),
                    average_ms,
                    p95_ms,
                    failure_rate: if total == 0 { 0.0 } else { failure as f64 / total as f64 },
                    breaker: *metrics.breaker.lock(),
                    last_failure_age_secs: last_failure
                        .as_ref()
                        .map(|(at, _)| now.duration_since(*at).as_secs_f64()),
                    last_failure_reason: last_failure.map(|(_, reason)| reason),
                },
            );
        }

        MetricsSummary {
            stages,
            resource: self.latest_resource().map(|snapshot| ResourceStat {
                cpu_pct: snapshot.cpu_pct,
                rss_bytes: snapshot.rss_bytes,
                threads: snapshot.threads,
                handles: snapshot.handles,
                thread_pool_util_pct: snapshot.thread_pool_util_pct,
            }),
        }
    }

    /// Removes resource snapshots older than the retention age.
    ///
    /// Runs in time proportional to the number of pruned entries.
    pub fn prune(&self) -> usize {
        let Some(cutoff) = Instant::now().checked_sub(self.options.resource_age) else {
            return 0;
        };

        let mut resources = self.resources.lock();
        let mut pruned = 0;
        while resources.front().is_some_and(|snapshot| snapshot.at < cutoff) {
            let _ = resources.pop_front();
            pruned += 1;
        }

        pruned
    }

    /// Spawns the periodic pruning task.
    pub fn spawn_pruner(self: &Arc<Self>) -> JoinHandle<()> {
        let hub = Arc::clone(self);
        let interval = hub.options.prune_interval;
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            // The immediate first tick is a no-op prune; harmless.
            loop {
                let _ = ticker.tick().await;
                let pruned = hub.prune();
                if pruned > 0 {
                    tracing::debug!(name: "gauntlet.metrics", pruned, "pruned resource snapshots");
                }
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn snapshot_at(at: Instant, cpu_pct: f64) -> ResourceSnapshot {
        ResourceSnapshot {
            at,
            cpu_pct,
            rss_bytes: 0,
            disk_rate_bps: 0.0,
            net_rate_bps: 0.0,
            threads: 1,
            handles: 1,
            gc_rate_per_min: 0.0,
            thread_pool_util_pct: 0.0,
        }
    }

    #[tokio::test]
    async fn execution_counters_accumulate() {
        let hub = MetricsHub::new(MetricsOptions::default());
        hub.record_execution("syntax", true, Duration::from_millis(5));
        hub.record_execution("syntax", false, Duration::from_millis(10));
        hub.record_retry("syntax");

        let summary = hub.current_summary();
        let stage = &summary.stages["syntax"];
        assert_eq!(stage.success, 1);
        assert_eq!(stage.failure, 1);
        assert_eq!(stage.retries, 1);
        assert!((stage.failure_rate - 0.5).abs() < f64::EPSILON);
    }

    #[tokio::test]
    async fn duration_ring_is_bounded() {
        let hub = MetricsHub::new(MetricsOptions {
            duration_ring: 3,
            ..MetricsOptions::default()
        });

        for ms in 1..=10u64 {
            hub.record_execution("stage", true, Duration::from_millis(ms));
        }

        // Ring holds 8, 9, 10 → p100 is 10ms, p1 is 8ms.
        assert_eq!(hub.percentile("stage", 100.0), Some(Duration::from_millis(10)));
        assert_eq!(hub.percentile("stage", 1.0), Some(Duration::from_millis(8)));
    }

    #[tokio::test]
    async fn percentile_nearest_rank() {
        let hub = MetricsHub::new(MetricsOptions::default());
        for ms in [10u64, 20, 30, 40] {
            hub.record_execution("stage", true, Duration::from_millis(ms));
        }

        assert_eq!(hub.percentile("stage", 50.0), Some(Duration::from_millis(20)));
        assert_eq!(hub.percentile("stage", 95.0), Some(Duration::from_millis(40)));
        assert_eq!(hub.percentile("missing", 50.0), None);
    }

    #[tokio::test(start_paused = true)]
    async fn cpu_slope_detects_trends() {
        let hub = MetricsHub::new(MetricsOptions::default());
        let origin = Instant::now();
        for i in 0..10u64 {
            hub.record_resource(snapshot_at(origin + Duration::from_secs(i), i as f64));
        }

        let slope = hub.cpu_slope(Duration::from_secs(3600)).expect("slope");
        assert!((slope - 1.0).abs() < 1e-9, "rising 1pct/s, got {slope}");
    }

    #[tokio::test(start_paused = true)]
    async fn prune_drops_old_snapshots_only() {
        let hub = MetricsHub::new(MetricsOptions {
            resource_age: Duration::from_secs(60),
            ..MetricsOptions::default()
        });

        let start = Instant::now();
        hub.record_resource(snapshot_at(start, 1.0));
        tokio::time::advance(Duration::from_secs(120)).await;
        hub.record_resource(snapshot_at(Instant::now(), 2.0));

        assert_eq!(hub.prune(), 1);
        let remaining = hub.historical(Duration::from_secs(3600));
        assert_eq!(remaining.len(), 1);
        assert!((remaining[0].cpu_pct - 2.0).abs() < f64::EPSILON);
    }

    #[tokio::test]
    async fn breaker_state_is_latest_wins() {
        let hub = MetricsHub::new(MetricsOptions::default());
        hub.record_circuit("stage", BreakerStateTag::Open);
        hub.record_circuit("stage", BreakerStateTag::HalfOpen);
        // A summary needs at least one execution for the stage to exist.
        hub.record_execution("stage", true, Duration::from_millis(1));

        let summary = hub.current_summary();
        assert_eq!(summary.stages["stage"].breaker, BreakerStateTag::HalfOpen);
    }
}
