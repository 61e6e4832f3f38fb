// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Keyed circuit breakers protecting pipeline stages.
//!
//! Each protected stage gets its own breaker, looked up by name in a
//! [`BreakerSet`]. The state machine follows the classic three states:
//!
//! - **Closed**: calls pass; consecutive failures are counted and reaching
//!   the threshold opens the circuit.
//! - **Open**: calls are rejected until the reset timeout elapses.
//! - **Half-open**: exactly one probe call is allowed through at a time; a
//!   success closes the circuit and zeroes the failure count, any failure
//!   re-opens it for another full reset timeout.
//!
//! Probes are serialized: while one is in flight every other caller is
//! rejected. A probe that is abandoned (its guard dropped without an
//! outcome) re-arms the probe slot so the next caller can try, after the
//! configured probe spacing.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use dashmap::DashMap;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::time::Instant;

use verdict::BreakerStateTag;

/// Circuit breaker tuning, shared by every breaker in a set.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct BreakerOptions {
    /// Consecutive failures that open the circuit.
    pub failure_threshold: u32,

    /// How long the circuit stays open before probing.
    pub reset_timeout: Duration,

    /// Minimum spacing between successive half-open probes.
    pub half_open_probe_delay: Duration,
}

impl Default for BreakerOptions {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            reset_timeout: Duration::from_secs(30),
            half_open_probe_delay: Duration::from_millis(100),
        }
    }
}

/// Outcome of asking a breaker whether a call may proceed.
#[derive(Debug)]
pub enum BreakerAdmission {
    /// Circuit closed; call normally.
    Pass,

    /// Circuit half-open; this caller carries the probe. Drop the guard
    /// without recording an outcome to abandon the probe.
    Probe(ProbeGuard),

    /// Circuit open; the call must not be made.
    Rejected,
}

/// Counters exposed for one breaker.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct BreakerMetrics {
    /// Total admission requests.
    pub requests: u64,

    /// Successful outcomes recorded.
    pub success: u64,

    /// Failed outcomes recorded.
    pub failure: u64,

    /// Calls rejected while open.
    pub rejected: u64,

    /// Seconds since the most recent failure, when one occurred.
    pub last_failure_age_secs: Option<f64>,

    /// Message of the most recent failure.
    pub last_failure_reason: Option<String>,
}

#[derive(Debug)]
struct BreakerCore {
    tag: BreakerStateTag,
    consecutive_failures: u32,
    open_until: Option<Instant>,
    probe_in_flight: bool,
    last_probe_at: Option<Instant>,
    last_failure_at: Option<Instant>,
    last_failure_reason: Option<String>,
}

#[derive(Debug)]
struct BreakerCell {
    name: String,
    core: Mutex<BreakerCore>,
    requests: AtomicU64,
    success: AtomicU64,
    failure: AtomicU64,
    rejected: AtomicU64,
}

impl BreakerCell {
    fn new(name: String) -> Self {
        Self {
            name,
            core: Mutex::new(BreakerCore {
                tag: BreakerStateTag::Closed,
                consecutive_failures: 0,
                open_until: None,
                probe_in_flight: false,
                last_probe_at: None,
                last_failure_at: None,
                last_failure_reason: None,
            }),
            requests: AtomicU64::new(0),
            success: AtomicU64::new(0),
            failure: AtomicU64::new(0),
            rejected: AtomicU64::new(0),
        }
    }
}

/// Re-arms the probe slot if the probe is abandoned without an outcome.
#[derive(Debug)]
pub struct ProbeGuard {
    cell: Arc<BreakerCell>,
    armed: bool,
}

impl ProbeGuard {
    /// Marks the probe as resolved; the recorded outcome already updated the
    /// breaker, so dropping the guard must not re-arm the slot.
    pub fn disarm(mut self) {
        self.armed = false;
    }
}

impl Drop for ProbeGuard {
    fn drop(&mut self) {
        if self.armed {
            let mut core = self.cell.core.lock();
            if core.tag == BreakerStateTag::HalfOpen {
                core.probe_in_flight = false;
            }
        }
    }
}

type OpenCallback = Arc<dyn Fn(&str) + Send + Sync>;

/// A family of named circuit breakers with shared options.
pub struct BreakerSet {
    options: BreakerOptions,
    cells: DashMap<String, Arc<BreakerCell>>,
    on_open: Mutex<Option<OpenCallback>>,
}

impl std::fmt::Debug for BreakerSet {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BreakerSet")
            .field("options", &self.options)
            .field("cells", &self.cells.len())
            .finish_non_exhaustive()
    }
}

impl BreakerSet {
    /// Creates an empty set.
    #[must_use]
    pub fn new(options: BreakerOptions) -> Self {
        Self {
            options,
            cells: DashMap::new(),
            on_open: Mutex::new(None),
        }
    }

    /// Installs a callback invoked whenever any breaker transitions to open.
    pub fn on_open(&self, callback: impl Fn(&str) + Send + Sync + 'static) {
        *self.on_open.lock() = Some(Arc::new(callback));
    }

    fn cell(&self, name: &str) -> Arc<BreakerCell> {
        if let Some(existing) = self.cells.get(name) {
            return Arc::clone(existing.value());
        }

        Arc::clone(
            self.cells
                .entry(name.to_string())
                .or_insert_with(|| Arc::new(BreakerCell::new(name.to_string())))
                .value(),
        )
    }

    /// Asks whether a call to `name` may proceed.
    pub fn admit(&self, name: &str) -> BreakerAdmission {
        let cell = self.cell(name);
        let _ = cell.requests.fetch_add(1, Ordering::Relaxed);

        let now = Instant::now();
        let mut core = cell.core.lock();
        match core.tag {
            BreakerStateTag::Closed => BreakerAdmission::Pass,
            BreakerStateTag::Open => {
                if core.open_until.is_some_and(|until| now >= until) {
                    core.tag = BreakerStateTag::HalfOpen;
                    core.probe_in_flight = true;
                    core.last_probe_at = Some(now);
                    drop(core);
                    tracing::debug!(name: "gauntlet.breaker", stage = %cell.name, "half-open probe");
                    BreakerAdmission::Probe(ProbeGuard { cell: Arc::clone(&cell), armed: true })
                } else {
                    let _ = cell.rejected.fetch_add(1, Ordering::Relaxed);
                    BreakerAdmission::Rejected
                }
            }
            BreakerStateTag::HalfOpen => {
                let probe_due = !core.probe_in_flight
                    && core
                        .last_probe_at
                        .is_none_or(|at| now >= at + self.options.half_open_probe_delay);
                if probe_due {
                    core.probe_in_flight = true;
                    core.last_probe_at = Some(now);
                    drop(core);
                    BreakerAdmission::Probe(ProbeGuard { cell: Arc::clone(&cell), armed: true })
                } else {
                    let _ = cell.rejected.fetch_add(1, Ordering::Relaxed);
                    BreakerAdmission::Rejected
                }
            }
        }
    }

    /// Records a successful call for `name`.
    pub fn record_success(&self, name: &str) {
        let cell = self.cell(name);
        let _ = cell.success.fetch_add(1, Ordering::Relaxed);

        let mut core = cell.core.lock();
        core.consecutive_failures = 0;
        if core.tag != BreakerStateTag::Closed {
            core.tag = BreakerStateTag::Closed;
            core.open_until = None;
            core.probe_in_flight = false;
            drop(core);
            tracing::info!(name: "gauntlet.breaker", stage = %name, "circuit closed");
        }
    }

    /// Records a failed call for `name`.
    pub fn record_failure(&self, name: &str, reason: &str) {
        let cell = self.cell(name);
        let _ = cell.failure.fetch_add(1, Ordering::Relaxed);

        let now = Instant::now();
        let mut core = cell.core.lock();
        core.last_failure_at = Some(now);
        core.last_failure_reason = Some(reason.to_string());

        let opened = match core.tag {
            BreakerStateTag::HalfOpen => {
                core.probe_in_flight = false;
                true
            }
            BreakerStateTag::Closed => {
                core.consecutive_failures += 1;
                core.consecutive_failures >= self.options.failure_threshold
            }
            BreakerStateTag::Open => false,
        };

        if opened {
            core.tag = BreakerStateTag::Open;
            core.open_until = Some(now + self.options.reset_timeout);
            drop(core);
            tracing::warn!(
                name: "gauntlet.breaker",
                stage = %name,
                reason = %reason,
                reset_secs = self.options.reset_timeout.as_secs_f64(),
                "circuit opened",
            );
            let callback = self.on_open.lock().clone();
            if let Some(callback) = callback {
                callback(name);
            }
        }
    }

    /// The current state of the breaker for `name`.
    #[must_use]
    pub fn state(&self, name: &str) -> BreakerStateTag {
        self.cells
            .get(name)
            .map_or(BreakerStateTag::Closed, |cell| cell.core.lock().tag)
    }

    /// Counters for the breaker for `name`.
    #[must_use]
    pub fn metrics(&self, name: &str) -> BreakerMetrics {
        self.cells.get(name).map_or_else(BreakerMetrics::default, |cell| {
            let core = cell.core.lock();
            BreakerMetrics {
                requests: cell.requests.load(Ordering::Relaxed),
                success: cell.success.load(Ordering::Relaxed),
                failure: cell.failure.load(Ordering::Relaxed),
                rejected: cell.rejected.load(Ordering::Relaxed),
                last_failure_age_secs: core
                    .last_failure_at
                    .map(|at| Instant::now().duration_since(at).as_secs_f64()),
                last_failure_reason: core.last_failure_reason.clone(),
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn options() -> BreakerOptions {
        BreakerOptions {
            failure_threshold: 3,
            reset_timeout: Duration::from_secs(30),
            half_open_probe_delay: Duration::from_millis(100),
        }
    }

    fn trip(set: &BreakerSet, name: &str) {
        for _ in 0..3 {
            set.record_failure(name, "boom");
        }
    }

    #[tokio::test(start_paused = true)]
    async fn opens_at_consecutive_threshold() {
        let set = BreakerSet::new(options());
        set.record_failure("stage", "one");
        set.record_failure("stage", "two");
        assert_eq!(set.state("stage"), BreakerStateTag::Closed);

        set.record_failure("stage", "three");
        assert_eq!(set.state("stage"), BreakerStateTag::Open);
        assert!(matches!(set.admit("stage"), BreakerAdmission::Rejected));
    }

    #[tokio::test(start_paused = true)]
    async fn success_resets_consecutive_count() {
        let set = BreakerSet::new(options());
        set.record_failure("stage", "one");
        set.record_failure("stage", "two");
        set.record_success("stage");
        set.record_failure("stage", "three");
        assert_eq!(set.state("stage"), BreakerStateTag::Closed);
    }

    #[tokio::test(start_paused = true)]
    async fn probes_after_reset_timeout_and_serializes_them() {
        let set = BreakerSet::new(options());
        trip(&set, "stage");

        tokio::time::advance(Duration::from_secs(31)).await;
        let first = set.admit("stage");
        assert!(matches!(first, BreakerAdmission::Probe(_)));
        // Concurrent caller while the probe is outstanding is rejected.
        assert!(matches!(set.admit("stage"), BreakerAdmission::Rejected));

        set.record_success("stage");
        if let BreakerAdmission::Probe(guard) = first {
            guard.disarm();
        }
        assert_eq!(set.state("stage"), BreakerStateTag::Closed);
        assert!(matches!(set.admit("stage"), BreakerAdmission::Pass));
    }

    #[tokio::test(start_paused = true)]
    async fn probe_failure_reopens_for_full_timeout() {
        let set = BreakerSet::new(options());
        trip(&set, "stage");

        tokio::time::advance(Duration::from_secs(31)).await;
        let admission = set.admit("stage");
        assert!(matches!(admission, BreakerAdmission::Probe(_)));
        set.record_failure("stage", "still broken");
        if let BreakerAdmission::Probe(guard) = admission {
            guard.disarm();
        }

        assert_eq!(set.state("stage"), BreakerStateTag::Open);
        // Not yet: a fresh reset timeout applies.
        tokio::time::advance(Duration::from_secs(15)).await;
        assert!(matches!(set.admit("stage"), BreakerAdmission::Rejected));
        tokio::time::advance(Duration::from_secs(16)).await;
        assert!(matches!(set.admit("stage"), BreakerAdmission::Probe(_)));
    }

    #[tokio::test(start_paused = true)]
    async fn abandoned_probe_rearms_after_spacing() {
        let set = BreakerSet::new(options());
        trip(&set, "stage");

        tokio::time::advance(Duration::from_secs(31)).await;
        let admission = set.admit("stage");
        assert!(matches!(admission, BreakerAdmission::Probe(_)));
        drop(admission); // abandoned without an outcome

        // Immediately after abandonment the spacing has not elapsed.
        assert!(matches!(set.admit("stage"), BreakerAdmission::Rejected));
        tokio::time::advance(Duration::from_millis(150)).await;
        assert!(matches!(set.admit("stage"), BreakerAdmission::Probe(_)));
    }

    #[tokio::test(start_paused = true)]
    async fn on_open_callback_fires() {
        let set = BreakerSet::new(options());
        let opened = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&opened);
        set.on_open(move |name| sink.lock().push(name.to_string()));

        trip(&set, "stage");
        assert_eq!(opened.lock().clone(), vec!["stage".to_string()]);
    }

    #[tokio::test(start_paused = true)]
    async fn metrics_track_outcomes() {
        let set = BreakerSet::new(options());
        assert!(matches!(set.admit("stage"), BreakerAdmission::Pass));
        set.record_success("stage");
        trip(&set, "stage");
        assert!(matches!(set.admit("stage"), BreakerAdmission::Rejected));

        let metrics = set.metrics("stage");
        assert_eq!(metrics.requests, 2);
        assert_eq!(metrics.success, 1);
        assert_eq!(metrics.failure, 3);
        assert_eq!(metrics.rejected, 1);
        assert_eq!(metrics.last_failure_reason.as_deref(), Some("boom"));
    }
}
