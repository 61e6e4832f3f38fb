// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! The pipeline coordinator: the public entry point of the execution core.
//!
//! [`Pipeline::validate`] takes a request through the full flow: fingerprint
//! and cache lookup, validator resolution, admission, the middleware chain
//! under a single-build cache lease (so duplicate in-flight requests
//! coalesce onto one execution), statistics, and metrics/alert publication.
//!
//! Operational failures — admission rejections, stage exhaustion, circuit
//! protection, deadlines — fold into a `failed` result carrying diagnostics;
//! only input-shape errors (unknown language), caller cancellation, and
//! internal faults surface as hard errors.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use parking_lot::{Mutex, RwLock};
use tokio::sync::{broadcast, watch};
use tokio::task::JoinHandle;
use tokio::time::Instant;

use verdict::{
    BreakerStateTag, Fingerprint, Issue, Severity, Stats, ValidateError, ValidationRequest,
    ValidationResult, ValidationState,
};

use crate::admission::AdmissionController;
use crate::alerts::{Alert, AlertManager};
use crate::breaker::BreakerSet;
use crate::cache::ResultCache;
use crate::chain::{ChainExecutor, Middleware, MiddlewareDescriptor, PhaseContext, StageSlot};
use crate::config::PipelineOptions;
use crate::discovery::{DiscoveryWatcher, ManifestLoader};
use crate::metrics::{MetricsHub, MetricsOptions, MetricsSummary};
use crate::registry::{Validator, ValidatorEntry, ValidatorMetadata, ValidatorRegistry};
use crate::retry::{RetryPolicies, Rnd};
use crate::sampler::{LoadView, ResourceProbe, ResourceSampler, ResourceSnapshot, SystemProbe};

struct RegisteredStage {
    seq: u64,
    descriptor: MiddlewareDescriptor,
    implementation: Arc<dyn Middleware>,
}

struct Shared {
    options: PipelineOptions,
    registry: Arc<ValidatorRegistry>,
    middleware: RwLock<Vec<RegisteredStage>>,
    stage_seq: AtomicU64,
    breakers: Arc<BreakerSet>,
    policies: Arc<RetryPolicies>,
    hub: Arc<MetricsHub>,
    cache: ResultCache,
    admission: Arc<AdmissionController>,
    alerts: Arc<AlertManager>,
    rnd: Rnd,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl Drop for Shared {
    fn drop(&mut self) {
        for task in self.tasks.lock().drain(..) {
            task.abort();
        }
    }
}

/// Builder for a [`Pipeline`].
pub struct PipelineBuilder {
    options: PipelineOptions,
    probe: Option<Box<dyn ResourceProbe>>,
    loader: Option<Arc<dyn ManifestLoader>>,
    sampling: bool,
}

impl std::fmt::Debug for PipelineBuilder {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PipelineBuilder")
            .field("options", &self.options)
            .finish_non_exhaustive()
    }
}

impl Default for PipelineBuilder {
    fn default() -> Self {
        Self {
            options: PipelineOptions::default(),
            probe: None,
            loader: None,
            sampling: true,
        }
    }
}

impl PipelineBuilder {
    /// Creates a builder with default options.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Replaces the options.
    #[must_use]
    pub fn options(mut self, options: PipelineOptions) -> Self {
        self.options = options;
        self
    }

    /// Replaces the resource probe (the default measures the current
    /// process via `sysinfo`).
    #[must_use]
    pub fn probe(mut self, probe: impl ResourceProbe + 'static) -> Self {
        self.probe = Some(Box::new(probe));
        self
    }

    /// Enables manifest discovery with the given loader.
    #[must_use]
    pub fn manifest_loader(mut self, loader: Arc<dyn ManifestLoader>) -> Self {
        self.loader = Some(loader);
        self
    }

    /// Disables the resource sampler entirely; the resource gate and the
    /// adaptive throttle become inert. Intended for tests.
    #[must_use]
    pub fn without_sampler(mut self) -> Self {
        self.sampling = false;
        self
    }

    /// Builds the pipeline and spawns its background tasks.
    #[must_use]
    pub fn build(self) -> Pipeline {
        let options = self.options;
        let hub = Arc::new(MetricsHub::new(MetricsOptions::default()));
        let (snapshot_tx, snapshot_rx) = watch::channel::<Option<ResourceSnapshot>>(None);

        let admission = Arc::new(AdmissionController::new(
            options.max_concurrent_validations,
            options.max_queue_size,
            options.admission_wait_timeout,
            options.resource_limits.clone(),
            options.critical_reservation_pct,
            snapshot_rx,
        ));

        let breakers = Arc::new(BreakerSet::new(options.breaker.clone()));
        let alerts = Arc::new(AlertManager::new(options.alerts.clone()));
        {
            let alerts = Arc::clone(&alerts);
            let hub = Arc::clone(&hub);
            breakers.on_open(move |stage| {
                hub.record_circuit(stage, BreakerStateTag::Open);
                alerts.breaker_opened(stage);
            });
        }

        let registry = Arc::new(ValidatorRegistry::new());
        let mut tasks = Vec::new();

        if self.sampling {
            let probe = self
                .probe
                .unwrap_or_else(|| Box::new(SystemProbe::current_process()));
            let load: Arc<dyn LoadView> = admission.clone();
            tasks.push(ResourceSampler::spawn(
                options.sampler.clone(),
                probe,
                load,
                Arc::clone(&hub),
                snapshot_tx,
            ));
        }

        tasks.push(admission.spawn_throttle(Arc::clone(&hub), options.throttle.clone()));
        tasks.push(hub.spawn_pruner());

        if options.discovery.enable_health_checks {
            tasks.push(registry.spawn_health_checks(options.discovery.health_check_interval));
        }

        if let Some(loader) = self.loader
            && !options.discovery.auto_discovery_paths.is_empty()
        {
            tasks.push(DiscoveryWatcher::spawn(
                options.discovery.clone(),
                Arc::clone(&registry),
                loader,
            ));
        }

        let cache = ResultCache::new(&options.cache);
        let policies = Arc::new(options.retry.clone());

        Pipeline {
            shared: Arc::new(Shared {
                options,
                registry,
                middleware: RwLock::new(Vec::new()),
                stage_seq: AtomicU64::new(0),
                breakers,
                policies,
                hub,
                cache,
                admission,
                alerts,
                rnd: Rnd::Real,
                tasks: Mutex::new(tasks),
            }),
        }
    }
}

/// The validation execution core.
///
/// Cheap to clone; clones share all state.
#[derive(Clone)]
pub struct Pipeline {
    shared: Arc<Shared>,
}

impl std::fmt::Debug for Pipeline {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Pipeline")
            .field("options", &self.shared.options)
            .finish_non_exhaustive()
    }
}

impl Pipeline {
    /// Starts building a pipeline.
    #[must_use]
    pub fn builder() -> PipelineBuilder {
        PipelineBuilder::new()
    }

    /// Validates a request and returns the structured verdict.
    ///
    /// Returns `Err` only for unknown languages, caller cancellation, and
    /// internal faults; every operational failure is folded into a `failed`
    /// result with an explanatory issue and stage diagnostics.
    pub async fn validate(
        &self,
        request: ValidationRequest,
    ) -> Result<Arc<ValidationResult>, ValidateError> {
        let request = Arc::new(request);
        let fingerprint = Fingerprint::compute(&request.code, &request.options);

        if let Some(hit) = self.shared.cache.get(&fingerprint) {
            tracing::debug!(
                name: "gauntlet.pipeline",
                language = %request.language,
                fingerprint = %fingerprint,
                "cache hit",
            );
            return Ok(hit);
        }

        let entry = self
            .shared
            .registry
            .get(&request.language)
            .ok_or_else(|| ValidateError::UnsupportedLanguage {
                language: request.language.clone(),
            })?;

        let shared = Arc::clone(&self.shared);
        let build_request = Arc::clone(&request);
        self.shared
            .cache
            .get_or_build(fingerprint, move || Shared::execute(shared, build_request, entry))
            .await
    }

    /// Registers a validator.
    pub fn register_validator(
        &self,
        validator: Arc<dyn Validator>,
        metadata: ValidatorMetadata,
    ) -> Result<(), ValidateError> {
        self.shared.registry.register(validator, metadata)
    }

    /// Unregisters a validator.
    pub fn unregister_validator(&self, language: &str) -> Result<(), ValidateError> {
        self.shared.registry.unregister(language)
    }

    /// Registered validators, highest priority first.
    #[must_use]
    pub fn validators(&self) -> Vec<Arc<ValidatorEntry>> {
        self.shared.registry.list()
    }

    /// Adds a middleware stage to subsequent chain builds.
    pub fn add_middleware(&self, middleware: Arc<dyn Middleware>) {
        let descriptor = middleware.descriptor();
        let seq = self.shared.stage_seq.fetch_add(1, Ordering::Relaxed);
        self.shared.middleware.write().push(RegisteredStage {
            seq,
            descriptor,
            implementation: middleware,
        });
    }

    /// Removes every middleware stage with the given name. Returns how many
    /// were removed.
    pub fn remove_middleware(&self, name: &str) -> usize {
        let mut middleware = self.shared.middleware.write();
        let before = middleware.len();
        middleware.retain(|stage| stage.descriptor.name != name);
        before - middleware.len()
    }

    /// Current metrics summary.
    #[must_use]
    pub fn current_metrics(&self) -> MetricsSummary {
        self.shared.hub.current_summary()
    }

    /// Resource snapshots retained within `window`.
    #[must_use]
    pub fn historical_metrics(&self, window: Duration) -> Vec<ResourceSnapshot> {
        self.shared.hub.historical(window)
    }

    /// Circuit state for a stage name.
    #[must_use]
    pub fn circuit_state(&self, name: &str) -> BreakerStateTag {
        self.shared.breakers.state(name)
    }

    /// Registers an alert handler.
    pub fn subscribe_alerts(&self, handler: impl Fn(&Alert) + Send + Sync + 'static) {
        self.shared.alerts.subscribe(handler);
    }

    /// Returns a broadcast receiver of alerts.
    #[must_use]
    pub fn alert_stream(&self) -> broadcast::Receiver<Alert> {
        self.shared.alerts.stream()
    }

    /// Current concurrency capacity, as adjusted by the adaptive throttle.
    #[must_use]
    pub fn admission_capacity(&self) -> usize {
        self.shared.admission.capacity()
    }

    /// Requests waiting for an execution slot.
    #[must_use]
    pub fn queue_depth(&self) -> usize {
        self.shared.admission.queue_depth()
    }

    /// Stops background tasks. Requests already in flight run to completion.
    pub fn shutdown(&self) {
        for task in self.shared.tasks.lock().drain(..) {
            task.abort();
        }
    }
}

impl Shared {
    fn stage_snapshot(&self) -> Vec<StageSlot> {
        let middleware = self.middleware.read();
        let mut stages: Vec<(i32, u64, StageSlot)> = middleware
            .iter()
            .map(|stage| {
                (
                    stage.descriptor.order,
                    stage.seq,
                    StageSlot {
                        descriptor: stage.descriptor.clone(),
                        implementation: Arc::clone(&stage.implementation),
                    },
                )
            })
            .collect();
        drop(middleware);

        stages.sort_by_key(|(order, seq, _)| (*order, *seq));
        stages.into_iter().map(|(_, _, slot)| slot).collect()
    }

    async fn execute(
        shared: Arc<Self>,
        request: Arc<ValidationRequest>,
        entry: Arc<ValidatorEntry>,
    ) -> Result<Arc<ValidationResult>, ValidateError> {
        let language = request.language.clone();

        let permit = match shared.admission.admit(request.critical, &request.cancellation).await {
            Ok(permit) => permit,
            Err(error) if error.is_rejection() => {
                tracing::debug!(
                    name: "gauntlet.pipeline",
                    language = %language,
                    reason = error.code(),
                    "request rejected at admission",
                );
                return Ok(Arc::new(ValidationResult::failure(
                    &language,
                    Issue::new(error.code(), Severity::Error, error.to_string()),
                )));
            }
            Err(error) => return Err(error),
        };

        let executor = ChainExecutor::new(
            shared.stage_snapshot(),
            language.clone(),
            Arc::clone(&entry.validator),
            Arc::clone(&shared.breakers),
            Arc::clone(&shared.policies),
            Arc::clone(&shared.hub),
            shared.options.chain.clone(),
            shared.rnd.clone(),
        );

        // Run the chain in its own task: cleanup is guaranteed to finish
        // even if this future is dropped, and the deadline winds the chain
        // down through the cancellation token instead of cutting it off.
        let chain_token = request.cancellation.child_token();
        let watchdog = request.deadline.map(|limit| {
            let token = chain_token.clone();
            tokio::spawn(async move {
                tokio::time::sleep(limit).await;
                token.cancel();
            })
        });

        let started = Instant::now();
        let task_request = Arc::clone(&request);
        let task_token = chain_token.clone();
        let chain_task = tokio::spawn(async move {
            let mut ctx = PhaseContext::new(task_request, task_token);
            let outcome = executor.run(&mut ctx).await;
            (ctx, outcome)
        });

        let joined = chain_task.await;
        if let Some(watchdog) = watchdog {
            watchdog.abort();
        }
        let total_elapsed = started.elapsed();
        let concurrent = shared.admission.in_flight();
        drop(permit);

        let (ctx, outcome) = joined.map_err(|join_error| {
            if join_error.is_panic() {
                ValidateError::Internal("validation task panicked".to_string())
            } else {
                ValidateError::Cancelled
            }
        })?;

        let deadline_hit = request.deadline.is_some_and(|limit| total_elapsed >= limit);

        match outcome {
            Ok(()) => {
                let mut result = ctx.result;
                shared.finalize(&request, &mut result, total_elapsed, concurrent);
                result.seal();
                shared.publish(&result, total_elapsed);
                Ok(Arc::new(result))
            }
            Err(ValidateError::Cancelled) if deadline_hit => {
                let error = ValidateError::Timeout {
                    stage: "request".to_string(),
                };
                Ok(Arc::new(Self::fold_failure(ctx.result, &error)))
            }
            Err(error @ (ValidateError::Cancelled | ValidateError::Internal(_))) => Err(error),
            Err(error) => Ok(Arc::new(Self::fold_failure(ctx.result, &error))),
        }
    }

    fn fold_failure(mut result: ValidationResult, error: &ValidateError) -> ValidationResult {
        result.push_issue(Issue::new(error.code(), Severity::Error, error.to_string()));
        let performance = std::mem::take(&mut result.stats.performance);
        result.stats = Stats::tally(&result.issues);
        result.stats.performance = performance;
        result.is_valid = false;
        result.partial = false;
        result.state = ValidationState::Failed;
        result
    }

    fn finalize(
        &self,
        request: &ValidationRequest,
        result: &mut ValidationResult,
        total: Duration,
        concurrent: usize,
    ) {
        let mut warnings: Vec<Issue> = Vec::new();

        {
            let performance = &mut result.stats.performance;
            performance.refresh_average();
            performance.concurrent_ops = concurrent as u32;

            if let Some(snapshot) = self.hub.latest_resource() {
                performance.peak_memory_bytes = snapshot.rss_bytes;
                performance.cpu_percent = snapshot.cpu_pct;
                performance.thread_count = snapshot.threads;
                performance.handle_count = snapshot.handles;
                performance.thread_pool_utilization_pct = snapshot.thread_pool_util_pct;
            }

            let busy: Duration = performance.phase_timings.values().sum();
            performance.parallel_efficiency_pct = if total.is_zero() {
                100.0
            } else {
                (busy.as_secs_f64() / total.as_secs_f64() * 100.0).min(100.0)
            };

            if !total.is_zero() {
                let flagged: Vec<(String, f64)> = performance
                    .phase_timings
                    .iter()
                    .filter_map(|(phase, duration)| {
                        let share_pct = duration.as_secs_f64() / total.as_secs_f64() * 100.0;
                        (share_pct > self.options.bottlenecks.phase_share_pct)
                            .then(|| (phase.clone(), share_pct))
                    })
                    .collect();

                for (phase, share_pct) in flagged {
                    performance.bottlenecks.push(verdict::Bottleneck {
                        phase: phase.clone(),
                        share_pct,
                        detail: format!("phase consumed {share_pct:.0}% of the request"),
                    });
                    warnings.push(Issue::new(
                        "performance_bottleneck",
                        Severity::Warning,
                        format!("phase `{phase}` consumed {share_pct:.0}% of the request"),
                    ));
                }
            }

            if performance.peak_memory_bytes > self.options.bottlenecks.memory_bytes {
                warnings.push(Issue::new(
                    "memory_pressure",
                    Severity::Warning,
                    format!("peak memory {} bytes exceeds the bottleneck threshold", performance.peak_memory_bytes),
                ));
            }

            if let Some(thresholds) = &request.options.performance_thresholds {
                if total > thresholds.max_time {
                    warnings.push(Issue::new(
                        "performance_time",
                        Severity::Warning,
                        format!(
                            "validation took {}ms, over the {}ms budget",
                            total.as_millis(),
                            thresholds.max_time.as_millis()
                        ),
                    ));
                }
                if performance.peak_memory_bytes > thresholds.max_memory_bytes {
                    warnings.push(Issue::new(
                        "performance_memory",
                        Severity::Warning,
                        format!(
                            "peak memory {} bytes over the {} byte budget",
                            performance.peak_memory_bytes, thresholds.max_memory_bytes
                        ),
                    ));
                }
            }
        }

        result.issues.extend(warnings);
    }

    fn publish(&self, result: &ValidationResult, total: Duration) {
        let summary = self.hub.current_summary();
        let slope = self.hub.cpu_slope(self.options.throttle.interval);
        self.alerts.evaluate(
            &summary,
            self.admission.queue_depth(),
            self.admission.queue_capacity(),
            slope,
        );
        self.alerts
            .evaluate_phases(&result.stats.performance.phase_timings, total);
    }
}
