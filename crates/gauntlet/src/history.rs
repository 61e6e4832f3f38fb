// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Optional JSON persistence of resource snapshot history.
//!
//! Records are flat objects with an ISO-8601 timestamp and numeric fields,
//! capped by entry count. Rendering and analysis of the persisted files is
//! out of scope; this module only reads and writes them.

use std::io;
use std::path::{Path, PathBuf};

use jiff::Timestamp;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

use crate::sampler::ResourceSnapshot;

/// One persisted snapshot.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SnapshotRecord {
    /// When the snapshot was recorded, ISO-8601.
    pub at: Timestamp,

    /// Process CPU utilization in percent.
    pub cpu_pct: f64,

    /// Resident set size in bytes.
    pub rss_bytes: u64,

    /// Disk throughput in bytes per second.
    pub disk_rate_bps: f64,

    /// Network throughput in bytes per second.
    pub net_rate_bps: f64,

    /// OS threads.
    pub threads: u32,

    /// Open handles.
    pub handles: u32,

    /// Garbage collections per minute; zero on this runtime.
    pub gc_rate_per_min: f64,

    /// Worker-pool utilization in percent.
    pub thread_pool_util_pct: f64,
}

impl SnapshotRecord {
    fn from_snapshot(snapshot: &ResourceSnapshot, at: Timestamp) -> Self {
        Self {
            at,
            cpu_pct: snapshot.cpu_pct,
            rss_bytes: snapshot.rss_bytes,
            disk_rate_bps: snapshot.disk_rate_bps,
            net_rate_bps: snapshot.net_rate_bps,
            threads: snapshot.threads,
            handles: snapshot.handles,
            gc_rate_per_min: snapshot.gc_rate_per_min,
            thread_pool_util_pct: snapshot.thread_pool_util_pct,
        }
    }
}

/// Append-bounded snapshot history persisted as a JSON array.
#[derive(Debug)]
pub struct SnapshotHistory {
    path: PathBuf,
    cap: usize,
    records: Mutex<Vec<SnapshotRecord>>,
}

impl SnapshotHistory {
    /// Opens a history file, loading existing records when present.
    ///
    /// Loaded records beyond `cap` are trimmed oldest-first.
    pub fn open(path: impl Into<PathBuf>, cap: usize) -> io::Result<Self> {
        let path = path.into();
        let mut records: Vec<SnapshotRecord> = if path.exists() {
            let bytes = std::fs::read(&path)?;
            serde_json::from_slice(&bytes).map_err(io::Error::other)?
        } else {
            Vec::new()
        };

        if records.len() > cap {
            records.drain(..records.len() - cap);
        }

        Ok(Self {
            path,
            cap,
            records: Mutex::new(records),
        })
    }

    /// Appends a snapshot, stamping it with the current wall-clock time.
    pub fn record(&self, snapshot: &ResourceSnapshot) {
        let record = SnapshotRecord::from_snapshot(snapshot, Timestamp::now());
        let mut records = self.records.lock();
        if records.len() >= self.cap && !records.is_empty() {
            let _ = records.remove(0);
        }
        records.push(record);
    }

    /// Number of retained records.
    #[must_use]
    pub fn len(&self) -> usize {
        self.records.lock().len()
    }

    /// Whether no records are retained.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// A copy of the retained records, oldest first.
    #[must_use]
    pub fn records(&self) -> Vec<SnapshotRecord> {
        self.records.lock().clone()
    }

    /// Writes the history to its file.
    pub fn save(&self) -> io::Result<()> {
        let records = self.records.lock().clone();
        let json = serde_json::to_vec_pretty(&records).map_err(io::Error::other)?;
        std::fs::write(&self.path, json)
    }

    /// The backing file path.
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }
}

#[cfg(test)]
mod tests {
    use tokio::time::Instant;

    use super::*;

    fn snapshot(cpu_pct: f64) -> ResourceSnapshot {
        ResourceSnapshot {
            at: Instant::now(),
            cpu_pct,
            rss_bytes: 1024,
            disk_rate_bps: 0.0,
            net_rate_bps: 0.0,
            threads: 2,
            handles: 8,
            gc_rate_per_min: 0.0,
            thread_pool_util_pct: 25.0,
        }
    }

    fn temp_path(name: &str) -> PathBuf {
        std::env::temp_dir().join(format!("gauntlet-history-{name}-{}.json", std::process::id()))
    }

    #[tokio::test]
    async fn records_are_capped() {
        let path = temp_path("cap");
        let history = SnapshotHistory::open(&path, 3).expect("open");
        for i in 0..5 {
            history.record(&snapshot(f64::from(i)));
        }

        let records = history.records();
        assert_eq!(records.len(), 3);
        assert!((records[0].cpu_pct - 2.0).abs() < f64::EPSILON, "oldest trimmed first");
    }

    #[tokio::test]
    async fn save_and_reload_round_trips() {
        let path = temp_path("roundtrip");
        let history = SnapshotHistory::open(&path, 10).expect("open");
        history.record(&snapshot(33.0));
        history.save().expect("save");

        let reloaded = SnapshotHistory::open(&path, 10).expect("reload");
        assert_eq!(reloaded.len(), 1);
        assert_eq!(reloaded.records()[0].cpu_pct, 33.0);
        assert_eq!(reloaded.records(), history.records());

        let _ = std::fs::remove_file(&path);
    }

    #[tokio::test]
    async fn persisted_timestamps_are_iso8601() {
        let path = temp_path("iso");
        let history = SnapshotHistory::open(&path, 10).expect("open");
        history.record(&snapshot(1.0));
        history.save().expect("save");

        let text = std::fs::read_to_string(&path).expect("read");
        // e.g. "at": "2026-08-01T12:34:56.789Z"
        assert!(text.contains("\"at\""));
        assert!(text.contains('T') && text.contains('Z'));

        let _ = std::fs::remove_file(&path);
    }
}
