// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Periodic best-effort measurement of process resource usage.
//!
//! The sampler runs as a background task on a fixed cadence. Each tick turns
//! a raw [`ResourceReading`] from the configured [`ResourceProbe`] into a
//! [`ResourceSnapshot`] with derived rates, then publishes it to the metrics
//! hub and to a watch channel consumed by the admission controller.
//!
//! Measurement is best-effort by design: a failing probe logs at WARN and
//! the previous good reading is republished, and a missed tick is skipped
//! rather than caught up, so sampling never develops a backlog.

use std::io;
use std::sync::Arc;

use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};

use crate::config::SamplerOptions;
use crate::metrics::MetricsHub;

/// One measurement of process-wide resource usage.
#[derive(Debug, Clone, PartialEq)]
pub struct ResourceSnapshot {
    /// When the snapshot was taken.
    pub at: Instant,

    /// Process CPU utilization in percent.
    pub cpu_pct: f64,

    /// Resident set size in bytes.
    pub rss_bytes: u64,

    /// Disk throughput in bytes per second since the previous snapshot.
    pub disk_rate_bps: f64,

    /// Network throughput in bytes per second since the previous snapshot.
    pub net_rate_bps: f64,

    /// OS threads in the process.
    pub threads: u32,

    /// Open handles / file descriptors.
    pub handles: u32,

    /// Garbage collections per minute. Always `0` on this runtime; the field
    /// is kept so persisted histories stay schema-compatible.
    pub gc_rate_per_min: f64,

    /// Worker-pool utilization in percent.
    pub thread_pool_util_pct: f64,
}

/// Raw counters read from the operating system.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct ResourceReading {
    /// Process CPU utilization in percent.
    pub cpu_pct: f64,

    /// Resident set size in bytes.
    pub rss_bytes: u64,

    /// Cumulative disk bytes (read + written) for the process.
    pub disk_bytes_total: u64,

    /// Cumulative network bytes (sent + received), when measurable.
    pub net_bytes_total: u64,

    /// OS threads in the process.
    pub threads: u32,

    /// Open handles / file descriptors.
    pub handles: u32,
}

/// Source of raw resource counters.
///
/// Implementations may keep internal state between reads (most OS interfaces
/// report CPU as a delta), hence `&mut self`.
pub trait ResourceProbe: Send {
    /// Reads the current counters.
    fn read(&mut self) -> io::Result<ResourceReading>;
}

/// View of the execution gate exposed to the sampler, so snapshots can carry
/// worker-pool utilization without the sampler depending on admission
/// internals.
pub trait LoadView: Send + Sync {
    /// Validations currently holding an execution slot.
    fn in_flight(&self) -> usize;

    /// Current slot capacity.
    fn capacity(&self) -> usize;
}

/// [`ResourceProbe`] backed by the `sysinfo` crate.
pub struct SystemProbe {
    system: sysinfo::System,
    pid: sysinfo::Pid,
}

impl std::fmt::Debug for SystemProbe {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SystemProbe").field("pid", &self.pid).finish_non_exhaustive()
    }
}

impl SystemProbe {
    /// Creates a probe for the current process.
    #[must_use]
    pub fn current_process() -> Self {
        Self {
            system: sysinfo::System::new(),
            pid: sysinfo::Pid::from_u32(std::process::id()),
        }
    }

    #[cfg(target_os = "linux")]
    fn handle_count() -> u32 {
        std::fs::read_dir("/proc/self/fd").map_or(0, |entries| entries.count() as u32)
    }

    #[cfg(not(target_os = "linux"))]
    fn handle_count() -> u32 {
        0
    }
}

impl ResourceProbe for SystemProbe {
    fn read(&mut self) -> io::Result<ResourceReading> {
        let _ = self.system.refresh_processes(
            sysinfo::ProcessesToUpdate::Some(&[self.pid]),
            true,
        );

        let process = self
            .system
            .process(self.pid)
            .ok_or_else(|| io::Error::new(io::ErrorKind::NotFound, "own process not visible"))?;

        let disk = process.disk_usage();
        let threads = process.tasks().map_or(1, |tasks| tasks.len() as u32);

        Ok(ResourceReading {
            cpu_pct: f64::from(process.cpu_usage()),
            rss_bytes: process.memory(),
            disk_bytes_total: disk.total_read_bytes + disk.total_written_bytes,
            // Per-process network counters are not available portably.
            net_bytes_total: 0,
            threads,
            handles: Self::handle_count(),
        })
    }
}

/// Periodic resource sampling task.
#[derive(Debug)]
pub struct ResourceSampler;

impl ResourceSampler {
    /// Spawns the sampling task.
    ///
    /// Snapshots are sent on `publish` and recorded into `hub`. The task runs
    /// until aborted.
    pub fn spawn(
        options: SamplerOptions,
        mut probe: Box<dyn ResourceProbe>,
        load: Arc<dyn LoadView>,
        hub: Arc<MetricsHub>,
        publish: watch::Sender<Option<ResourceSnapshot>>,
    ) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(options.interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

            let mut last_good = ResourceReading::default();
            let mut last_totals: Option<(Instant, u64, u64)> = None;

            loop {
                let _ = ticker.tick().await;

                let reading = match probe.read() {
                    Ok(reading) => {
                        last_good = reading;
                        reading
                    }
                    Err(error) => {
                        tracing::warn!(
                            name: "gauntlet.sampler",
                            error = %error,
                            "resource probe failed; republishing last good reading",
                        );
                        last_good
                    }
                };

                let now = Instant::now();
                let (disk_rate_bps, net_rate_bps) = match last_totals {
                    Some((prev_at, prev_disk, prev_net)) => {
                        let secs = now.duration_since(prev_at).as_secs_f64().max(f64::EPSILON);
                        (
                            reading.disk_bytes_total.saturating_sub(prev_disk) as f64 / secs,
                            reading.net_bytes_total.saturating_sub(prev_net) as f64 / secs,
                        )
                    }
                    None => (0.0, 0.0),
                };
                last_totals = Some((now, reading.disk_bytes_total, reading.net_bytes_total));

                let capacity = load.capacity().max(1);
                let snapshot = ResourceSnapshot {
                    at: now,
                    cpu_pct: reading.cpu_pct,
                    rss_bytes: reading.rss_bytes,
                    disk_rate_bps,
                    net_rate_bps,
                    threads: reading.threads,
                    handles: reading.handles,
                    gc_rate_per_min: 0.0,
                    thread_pool_util_pct: load.in_flight() as f64 / capacity as f64 * 100.0,
                };

                hub.record_resource(snapshot.clone());
                let _ = publish.send(Some(snapshot));
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    use crate::metrics::MetricsOptions;
    use crate::testing::ScriptedProbe;

    use super::*;

    struct FixedLoad(AtomicUsize);

    impl LoadView for FixedLoad {
        fn in_flight(&self) -> usize {
            self.0.load(Ordering::Relaxed)
        }

        fn capacity(&self) -> usize {
            4
        }
    }

    // One tick per advance; a single large jump would coalesce ticks
    // because missed ticks are skipped, not caught up.
    async fn run_ticks(seconds: u64) {
        tokio::task::yield_now().await;
        for _ in 0..seconds {
            tokio::time::advance(Duration::from_secs(1)).await;
        }
        tokio::task::yield_now().await;
    }

    #[tokio::test(start_paused = true)]
    async fn publishes_snapshots_on_cadence() {
        let hub = Arc::new(MetricsHub::new(MetricsOptions::default()));
        let (tx, mut rx) = watch::channel(None);
        let probe = ScriptedProbe::cpu_series(vec![10.0, 20.0, 30.0]);

        let handle = ResourceSampler::spawn(
            SamplerOptions { interval: Duration::from_secs(1) },
            Box::new(probe),
            Arc::new(FixedLoad(AtomicUsize::new(2))),
            Arc::clone(&hub),
            tx,
        );

        run_ticks(2).await;
        rx.changed().await.expect("snapshot");
        let snapshot = rx.borrow().clone().expect("some snapshot");
        assert!((snapshot.cpu_pct - 30.0).abs() < f64::EPSILON);
        assert!((snapshot.thread_pool_util_pct - 50.0).abs() < f64::EPSILON);
        assert_eq!(hub.historical(Duration::from_secs(60)).len(), 3);

        handle.abort();
    }

    #[tokio::test(start_paused = true)]
    async fn probe_failure_republishes_last_good_reading() {
        let hub = Arc::new(MetricsHub::new(MetricsOptions::default()));
        let (tx, rx) = watch::channel(None);
        let probe = ScriptedProbe::cpu_series(vec![42.0]); // exhausted after one tick

        let handle = ResourceSampler::spawn(
            SamplerOptions { interval: Duration::from_secs(1) },
            Box::new(probe),
            Arc::new(FixedLoad(AtomicUsize::new(0))),
            Arc::clone(&hub),
            tx,
        );

        run_ticks(3).await;
        // The first tick read 42.0; later ticks failed and reused it.
        let snapshot = rx.borrow().clone().expect("some snapshot");
        assert!((snapshot.cpu_pct - 42.0).abs() < f64::EPSILON);
        assert!(hub.historical(Duration::from_secs(60)).len() >= 2);

        handle.abort();
    }
}
