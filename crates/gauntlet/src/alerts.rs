// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Threshold-driven alerting over the metrics hub.
//!
//! The alert manager is a consumer of [`MetricsSummary`] data: the pipeline
//! feeds it after each request and on breaker transitions, and it fans
//! alerts out to registered handlers and a broadcast channel.

use std::collections::BTreeMap;
use std::fmt::{Display, Formatter};
use std::time::Duration;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;

use crate::metrics::MetricsSummary;

/// How urgent an alert is.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AlertSeverity {
    /// Informational.
    Info,

    /// Worth a look.
    Warning,

    /// Degradation in progress.
    High,

    /// Immediate action needed.
    Critical,
}

impl Display for AlertSeverity {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Info => write!(f, "info"),
            Self::Warning => write!(f, "warning"),
            Self::High => write!(f, "high"),
            Self::Critical => write!(f, "critical"),
        }
    }
}

/// Direction a monitored metric is moving.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Trend {
    /// Getting worse.
    Rising,

    /// Recovering.
    Falling,

    /// Flat.
    Steady,
}

/// A bottleneck or threshold crossing surfaced to subscribers.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Alert {
    /// The resource or stage the alert concerns.
    pub resource: String,

    /// Urgency.
    pub severity: AlertSeverity,

    /// What happened.
    pub message: String,

    /// What an operator should do about it.
    pub recommended_action: String,

    /// Direction the underlying metric is moving.
    pub trend: Trend,
}

/// Thresholds that trigger alerts.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AlertThresholds {
    /// CPU percent above which an alert fires.
    pub cpu_pct: f64,

    /// Resident-set bytes above which an alert fires, when bounded.
    pub memory_bytes: Option<u64>,

    /// Queue depth as a share of queue capacity (percent).
    pub queue_depth_pct: f64,

    /// Share of total request time (percent) above which a phase is flagged.
    pub phase_share_pct: f64,

    /// Stage failure rate (`0.0..=1.0`) above which an alert fires.
    pub failure_rate: f64,
}

impl Default for AlertThresholds {
    fn default() -> Self {
        Self {
            cpu_pct: 85.0,
            memory_bytes: None,
            queue_depth_pct: 80.0,
            phase_share_pct: 25.0,
            failure_rate: 0.5,
        }
    }
}

type AlertHandler = Box<dyn Fn(&Alert) + Send + Sync>;

/// Fans alerts out to handlers and a broadcast channel.
pub struct AlertManager {
    thresholds: AlertThresholds,
    handlers: Mutex<Vec<AlertHandler>>,
    channel: broadcast::Sender<Alert>,
}

impl std::fmt::Debug for AlertManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AlertManager")
            .field("thresholds", &self.thresholds)
            .finish_non_exhaustive()
    }
}

impl AlertManager {
    /// Creates a manager with the given thresholds.
    #[must_use]
    pub fn new(thresholds: AlertThresholds) -> Self {
        let (channel, _) = broadcast::channel(256);
        Self {
            thresholds,
            handlers: Mutex::new(Vec::new()),
            channel,
        }
    }

    /// Registers a synchronous alert handler.
    pub fn subscribe(&self, handler: impl Fn(&Alert) + Send + Sync + 'static) {
        self.handlers.lock().push(Box::new(handler));
    }

    /// Returns a broadcast receiver of alerts.
    #[must_use]
    pub fn stream(&self) -> broadcast::Receiver<Alert> {
        self.channel.subscribe()
    }

    /// Emits an alert to every subscriber.
    pub fn emit(&self, alert: Alert) {
        tracing::warn!(
            name: "gauntlet.alerts",
            resource = %alert.resource,
            severity = %alert.severity,
            message = %alert.message,
            "alert",
        );
        for handler in self.handlers.lock().iter() {
            handler(&alert);
        }
        let _ = self.channel.send(alert);
    }

    /// Checks a metrics summary plus queue state against the thresholds.
    ///
    /// `cpu_slope` (percent per second), when known, determines trends.
    pub fn evaluate(
        &self,
        summary: &MetricsSummary,
        queue_depth: usize,
        queue_capacity: usize,
        cpu_slope: Option<f64>,
    ) {
        let trend = cpu_slope.map_or(Trend::Steady, |slope| {
            if slope > 0.01 {
                Trend::Rising
            } else if slope < -0.01 {
                Trend::Falling
            } else {
                Trend::Steady
            }
        });

        if let Some(resource) = &summary.resource {
            if resource.cpu_pct > self.thresholds.cpu_pct {
                self.emit(Alert {
                    resource: "cpu".to_string(),
                    severity: AlertSeverity::High,
                    message: format!("cpu at {:.1}% exceeds {:.1}%", resource.cpu_pct, self.thresholds.cpu_pct),
                    recommended_action: "reduce concurrency or add capacity".to_string(),
                    trend,
                });
            }

            if let Some(limit) = self.thresholds.memory_bytes
                && resource.rss_bytes > limit
            {
                self.emit(Alert {
                    resource: "memory".to_string(),
                    severity: AlertSeverity::High,
                    message: format!("rss {} exceeds {limit} bytes", resource.rss_bytes),
                    recommended_action: "lower cache bounds or validation concurrency".to_string(),
                    trend,
                });
            }
        }

        if queue_capacity > 0 {
            let depth_pct = queue_depth as f64 / queue_capacity as f64 * 100.0;
            if depth_pct > self.thresholds.queue_depth_pct {
                self.emit(Alert {
                    resource: "queue".to_string(),
                    severity: AlertSeverity::Warning,
                    message: format!("admission queue at {depth_pct:.0}% of capacity"),
                    recommended_action: "shed load or raise concurrency".to_string(),
                    trend,
                });
            }
        }

        for (name, stage) in &summary.stages {
            if stage.failure_rate > self.thresholds.failure_rate && stage.failure > 0 {
                self.emit(Alert {
                    resource: name.clone(),
                    severity: AlertSeverity::High,
                    message: format!("stage failing {:.0}% of executions", stage.failure_rate * 100.0),
                    recommended_action: "inspect the stage's last failure reason".to_string(),
                    trend: Trend::Steady,
                });
            }
        }
    }

    /// Flags phases consuming an outsized share of one request.
    pub fn evaluate_phases(&self, phase_timings: &BTreeMap<String, Duration>, total: Duration) {
        if total.is_zero() {
            return;
        }

        for (phase, duration) in phase_timings {
            let share_pct = duration.as_secs_f64() / total.as_secs_f64() * 100.0;
            if share_pct > self.thresholds.phase_share_pct {
                self.emit(Alert {
                    resource: phase.clone(),
                    severity: AlertSeverity::Warning,
                    message: format!("phase took {share_pct:.0}% of the request"),
                    recommended_action: "profile the phase or run it in parallel".to_string(),
                    trend: Trend::Steady,
                });
            }
        }
    }

    /// Announces a circuit transition to open.
    pub fn breaker_opened(&self, stage: &str) {
        self.emit(Alert {
            resource: stage.to_string(),
            severity: AlertSeverity::Critical,
            message: "circuit opened; calls are being short-circuited".to_string(),
            recommended_action: "investigate the protected dependency".to_string(),
            trend: Trend::Rising,
        });
    }

    /// The configured phase-share threshold, in percent.
    #[must_use]
    pub const fn phase_share_pct(&self) -> f64 {
        self.thresholds.phase_share_pct
    }
}
