// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Ordered middleware chain around the terminal validator call.
//!
//! Middleware declare a [`MiddlewareDescriptor`] and wrap the rest of the
//! chain through [`Middleware::process`], which receives a [`Next`]
//! continuation. The executor sorts stages by `(order, registration)` and
//! drives them outer-to-inner; the language validator runs as the innermost,
//! terminal stage.
//!
//! Around every stage invocation the executor applies the cross-cutting
//! machinery: circuit-breaker admission (an open circuit skips the stage and
//! records it in the result), a per-call deadline, retry scheduling for
//! failures classified recoverable, and metrics. Cleanup callbacks run in
//! reverse entry order on every path out of the chain, including
//! cancellation and panics, exactly once per entered stage.
//!
//! Failures returned by `next` propagate outward untouched: they are
//! attributed to the stage that produced them, not to the stages above it,
//! and outer breakers and retry budgets are left alone. A middleware may
//! still observe and swallow an inner failure by returning `Ok`.

use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures::FutureExt;
use futures::future::BoxFuture;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use verdict::{
    BreakerStateTag, ErrorCategory, MiddlewareFailure, Recourse, ValidateError, ValidationRequest,
    ValidationResult,
};

use crate::breaker::{BreakerAdmission, BreakerSet, ProbeGuard};
use crate::config::ChainOptions;
use crate::metrics::MetricsHub;
use crate::registry::{Validator, ValidatorError};
use crate::retry::{RetryPolicies, Rnd};

/// Static description of a middleware stage.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MiddlewareDescriptor {
    /// Stage name, used for breakers, metrics, and diagnostics.
    pub name: String,

    /// Position in the chain; lower runs outermost. Ties resolve by
    /// registration order.
    pub order: i32,

    /// Whether failures of this stage may be retried.
    pub supports_retry: bool,

    /// Whether [`Middleware::cleanup`] must run after the chain unwinds.
    pub requires_cleanup: bool,

    /// Per-call deadline; falls back to the chain default when `None`.
    pub timeout: Option<Duration>,
}

impl MiddlewareDescriptor {
    /// Creates a descriptor with retries and cleanup disabled.
    pub fn new(name: impl Into<String>, order: i32) -> Self {
        Self {
            name: name.into(),
            order,
            supports_retry: false,
            requires_cleanup: false,
            timeout: None,
        }
    }

    /// Enables retries for this stage.
    #[must_use]
    pub const fn retryable(mut self) -> Self {
        self.supports_retry = true;
        self
    }

    /// Requires cleanup after the chain unwinds.
    #[must_use]
    pub const fn with_cleanup(mut self) -> Self {
        self.requires_cleanup = true;
        self
    }

    /// Sets a per-call deadline.
    #[must_use]
    pub const fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }
}

/// Failure produced by a middleware stage.
#[derive(Debug, Clone, PartialEq)]
pub struct PhaseError {
    /// Human-readable failure detail.
    pub message: String,

    /// Retry-policy category.
    pub category: ErrorCategory,

    /// What the executor may do about the failure.
    pub recourse: Recourse,
}

impl PhaseError {
    /// A transient runtime failure worth retrying.
    pub fn transient(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            category: ErrorCategory::Runtime,
            recourse: Recourse::retry(),
        }
    }

    /// A permanent runtime failure.
    pub fn permanent(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            category: ErrorCategory::Runtime,
            recourse: Recourse::Permanent,
        }
    }

    fn deadline(limit: Duration) -> Self {
        Self {
            message: format!("timed out after {}ms", limit.as_millis()),
            category: ErrorCategory::Timeout,
            recourse: Recourse::retry(),
        }
    }

    fn propagated() -> Self {
        Self {
            message: "inner stage failed".to_string(),
            category: ErrorCategory::Runtime,
            recourse: Recourse::Permanent,
        }
    }
}

impl From<ValidatorError> for PhaseError {
    fn from(error: ValidatorError) -> Self {
        Self {
            message: error.message,
            category: ErrorCategory::Runtime,
            recourse: error.recourse,
        }
    }
}

/// A cross-cutting stage wrapping validator execution.
#[async_trait]
pub trait Middleware: Send + Sync {
    /// Static description of the stage.
    fn descriptor(&self) -> MiddlewareDescriptor;

    /// Runs the stage. Call `next.run(ctx)` exactly once on the success
    /// path to continue inward; returning without calling it short-circuits
    /// the rest of the chain.
    async fn process(&self, ctx: &mut PhaseContext, next: Next<'_>) -> Result<(), PhaseError>;

    /// Releases stage resources after the chain unwinds. Errors are logged
    /// and never mask the primary outcome.
    async fn cleanup(&self, ctx: &mut PhaseContext) -> Result<(), PhaseError> {
        let _ = ctx;
        Ok(())
    }
}

/// Mutable state flowing through one chain execution.
pub struct PhaseContext {
    /// The request being validated.
    pub request: Arc<ValidationRequest>,

    /// The result under construction; middleware may annotate it.
    pub result: ValidationResult,

    pub(crate) token: CancellationToken,
    subtree_elapsed: Duration,
    terminal_done: bool,
    entered: Vec<usize>,
    propagating: Option<ChainError>,
}

impl std::fmt::Debug for PhaseContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PhaseContext")
            .field("language", &self.request.language)
            .field("entered", &self.entered)
            .finish_non_exhaustive()
    }
}

impl PhaseContext {
    pub(crate) fn new(request: Arc<ValidationRequest>, token: CancellationToken) -> Self {
        let result = ValidationResult::begin(request.language.clone());
        Self {
            request,
            result,
            token,
            subtree_elapsed: Duration::ZERO,
            terminal_done: false,
            entered: Vec::new(),
            propagating: None,
        }
    }

    /// Whether the request has been cancelled.
    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        self.token.is_cancelled()
    }
}

/// Continuation handed to [`Middleware::process`]; runs the rest of the
/// chain.
pub struct Next<'a> {
    exec: &'a ChainExecutor,
    index: usize,
}

impl std::fmt::Debug for Next<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Next").field("index", &self.index).finish_non_exhaustive()
    }
}

impl Next<'_> {
    /// Runs the remaining stages and the terminal validator.
    pub async fn run(self, ctx: &mut PhaseContext) -> Result<(), PhaseError> {
        match self.exec.dispatch(self.index, ctx).await {
            Ok(()) => Ok(()),
            Err(error) => {
                ctx.propagating = Some(error);
                Err(PhaseError::propagated())
            }
        }
    }
}

#[derive(Debug)]
pub(crate) enum ChainError {
    Cancelled,
    CircuitOpen { stage: String },
    Timeout { stage: String },
    Stage { stage: String, message: String, retryable: bool, terminal: bool },
    Panicked,
}

impl ChainError {
    pub(crate) fn into_validate_error(self, language: &str) -> ValidateError {
        match self {
            Self::Cancelled => ValidateError::Cancelled,
            Self::CircuitOpen { stage } => ValidateError::CircuitOpen { name: stage },
            Self::Timeout { stage } => ValidateError::Timeout { stage },
            Self::Stage { message, terminal: true, .. } => ValidateError::ValidatorFailed {
                language: language.to_string(),
                message,
            },
            Self::Stage { stage, retryable, .. } => ValidateError::MiddlewareFailed {
                name: stage,
                retryable,
            },
            Self::Panicked => ValidateError::Internal("stage panicked".to_string()),
        }
    }
}

pub(crate) struct StageSlot {
    pub(crate) descriptor: MiddlewareDescriptor,
    pub(crate) implementation: Arc<dyn Middleware>,
}

/// Drives one request through the sorted stages and the terminal validator.
pub(crate) struct ChainExecutor {
    stages: Vec<StageSlot>,
    terminal_name: String,
    validator: Arc<dyn Validator>,
    breakers: Arc<BreakerSet>,
    policies: Arc<RetryPolicies>,
    hub: Arc<MetricsHub>,
    options: ChainOptions,
    rnd: Rnd,
}

impl ChainExecutor {
    pub(crate) fn new(
        stages: Vec<StageSlot>,
        terminal_name: String,
        validator: Arc<dyn Validator>,
        breakers: Arc<BreakerSet>,
        policies: Arc<RetryPolicies>,
        hub: Arc<MetricsHub>,
        options: ChainOptions,
        rnd: Rnd,
    ) -> Self {
        Self {
            stages,
            terminal_name,
            validator,
            breakers,
            policies,
            hub,
            options,
            rnd,
        }
    }

    /// Runs the chain, then the cleanups, and maps the outcome.
    pub(crate) async fn run(&self, ctx: &mut PhaseContext) -> Result<(), ValidateError> {
        let outcome = match AssertUnwindSafe(self.dispatch(0, ctx)).catch_unwind().await {
            Ok(result) => result,
            Err(_) => Err(ChainError::Panicked),
        };

        self.run_cleanups(ctx).await;

        outcome.map_err(|error| error.into_validate_error(&self.terminal_name))
    }

    async fn run_cleanups(&self, ctx: &mut PhaseContext) {
        let entered = std::mem::take(&mut ctx.entered);
        for &index in entered.iter().rev() {
            let stage = &self.stages[index];
            if !stage.descriptor.requires_cleanup {
                continue;
            }

            match AssertUnwindSafe(stage.implementation.cleanup(ctx)).catch_unwind().await {
                Ok(Ok(())) => {}
                Ok(Err(error)) => {
                    tracing::warn!(
                        name: "gauntlet.chain",
                        stage = %stage.descriptor.name,
                        error = %error.message,
                        "cleanup failed",
                    );
                }
                Err(_) => {
                    tracing::error!(
                        name: "gauntlet.chain",
                        stage = %stage.descriptor.name,
                        "cleanup panicked",
                    );
                }
            }
        }
    }

    fn dispatch<'s, 'c, 'f>(
        &'s self,
        index: usize,
        ctx: &'c mut PhaseContext,
    ) -> BoxFuture<'f, Result<(), ChainError>>
    where
        's: 'f,
        'c: 'f,
    {
        Box::pin(async move {
            if ctx.token.is_cancelled() {
                return Err(ChainError::Cancelled);
            }

            if index == self.stages.len() {
                self.run_terminal(ctx).await
            } else {
                self.run_stage(index, ctx).await
            }
        })
    }

    async fn run_stage(&self, index: usize, ctx: &mut PhaseContext) -> Result<(), ChainError> {
        let descriptor = self.stages[index].descriptor.clone();
        let name = descriptor.name.clone();
        let token = ctx.token.clone();

        let mut probe = match self.breakers.admit(&name) {
            BreakerAdmission::Rejected => {
                let _ = ctx.result.skipped_middleware.insert(name.clone());
                tracing::debug!(name: "gauntlet.chain", stage = %name, "stage skipped by open circuit");
                return self.dispatch(index + 1, ctx).await;
            }
            BreakerAdmission::Probe(guard) => Some(guard),
            BreakerAdmission::Pass => None,
        };

        ctx.entered.push(index);

        let deadline = descriptor.timeout.or(self.options.default_timeout);
        let first_attempt_at = Instant::now();
        let mut attempts: u32 = 0;

        loop {
            attempts += 1;
            ctx.subtree_elapsed = Duration::ZERO;
            ctx.propagating = None;

            let started = Instant::now();
            let future = self.stages[index].implementation.process(ctx, Next { exec: self, index: index + 1 });
            let bounded = async {
                match deadline {
                    Some(limit) => match tokio::time::timeout(limit, future).await {
                        Ok(inner) => inner,
                        Err(_) => Err(PhaseError::deadline(limit)),
                    },
                    None => future.await,
                }
            };
            let processed = tokio::select! {
                biased;
                outcome = bounded => outcome,
                () = token.cancelled() => return Err(ChainError::Cancelled),
            };
            let elapsed = started.elapsed();

            match processed {
                Ok(()) => {
                    self.hub.record_execution(&name, true, elapsed);
                    self.breakers.record_success(&name);
                    self.sync_circuit(&name);
                    disarm(&mut probe);
                    Self::record_phase_timing(ctx, &name, elapsed);
                    return Ok(());
                }
                Err(_) if ctx.propagating.is_some() => {
                    // The failure belongs to an inner stage; pass it through
                    // without charging this stage's breaker or retry budget.
                    return Err(ctx
                        .propagating
                        .take()
                        .unwrap_or(ChainError::Panicked));
                }
                Err(error) => {
                    self.hub.record_execution(&name, false, elapsed);
                    self.hub.record_failure_reason(&name, &error.message);
                    self.breakers.record_failure(&name, &error.message);
                    self.sync_circuit(&name);
                    disarm(&mut probe);

                    if let Some(delay) =
                        self.next_retry_delay(descriptor.supports_retry, &error, attempts, first_attempt_at, &name)
                    {
                        self.hub.record_retry(&name);
                        tracing::warn!(
                            name: "gauntlet.retry",
                            stage = %name,
                            attempt = attempts,
                            delay_ms = delay.as_millis() as u64,
                            error = %error.message,
                            "stage failed; retrying",
                        );
                        tokio::select! {
                            () = tokio::time::sleep(delay) => {}
                            () = token.cancelled() => return Err(ChainError::Cancelled),
                        }
                        continue;
                    }

                    let retryable = error.recourse.is_retryable();
                    let timed_out = error.category == ErrorCategory::Timeout;
                    ctx.result.failed_middleware.push(MiddlewareFailure {
                        name: name.clone(),
                        error: error.message.clone(),
                        attempts,
                        breaker: self.breakers.state(&name),
                    });

                    if self.options.continue_on_failure {
                        tracing::debug!(name: "gauntlet.chain", stage = %name, "continuing past failed stage");
                        return if ctx.terminal_done {
                            Ok(())
                        } else {
                            self.dispatch(index + 1, ctx).await
                        };
                    }

                    return Err(if timed_out {
                        ChainError::Timeout { stage: name }
                    } else {
                        ChainError::Stage {
                            stage: name,
                            message: error.message,
                            retryable,
                            terminal: false,
                        }
                    });
                }
            }
        }
    }

    async fn run_terminal(&self, ctx: &mut PhaseContext) -> Result<(), ChainError> {
        let name = self.terminal_name.clone();
        let token = ctx.token.clone();

        let mut probe = match self.breakers.admit(&name) {
            BreakerAdmission::Rejected => {
                let _ = ctx.result.skipped_middleware.insert(name.clone());
                return Err(ChainError::CircuitOpen { stage: name });
            }
            BreakerAdmission::Probe(guard) => Some(guard),
            BreakerAdmission::Pass => None,
        };

        let deadline = self.options.default_timeout;
        let first_attempt_at = Instant::now();
        let mut attempts: u32 = 0;

        loop {
            attempts += 1;
            if token.is_cancelled() {
                return Err(ChainError::Cancelled);
            }

            let started = Instant::now();
            let future = self.validator.validate(&ctx.request.code, &ctx.request.options);
            let bounded = async {
                match deadline {
                    Some(limit) => match tokio::time::timeout(limit, future).await {
                        Ok(inner) => inner.map_err(PhaseError::from),
                        Err(_) => Err(PhaseError::deadline(limit)),
                    },
                    None => future.await.map_err(PhaseError::from),
                }
            };
            let validated: Result<ValidationResult, PhaseError> = tokio::select! {
                biased;
                outcome = bounded => outcome,
                () = token.cancelled() => return Err(ChainError::Cancelled),
            };
            let elapsed = started.elapsed();

            match validated {
                Ok(baseline) => {
                    self.hub.record_execution(&name, true, elapsed);
                    self.breakers.record_success(&name);
                    self.sync_circuit(&name);
                    disarm(&mut probe);
                    self.merge_baseline(ctx, baseline);
                    Self::record_phase_timing(ctx, &name, elapsed);
                    ctx.terminal_done = true;
                    return Ok(());
                }
                Err(error) => {
                    self.hub.record_execution(&name, false, elapsed);
                    self.hub.record_failure_reason(&name, &error.message);
                    self.breakers.record_failure(&name, &error.message);
                    self.sync_circuit(&name);
                    disarm(&mut probe);

                    if let Some(delay) =
                        self.next_retry_delay(true, &error, attempts, first_attempt_at, &name)
                    {
                        self.hub.record_retry(&name);
                        tracing::warn!(
                            name: "gauntlet.retry",
                            stage = %name,
                            attempt = attempts,
                            delay_ms = delay.as_millis() as u64,
                            error = %error.message,
                            "validator failed; retrying",
                        );
                        tokio::select! {
                            () = tokio::time::sleep(delay) => {}
                            () = token.cancelled() => return Err(ChainError::Cancelled),
                        }
                        continue;
                    }

                    let timed_out = error.category == ErrorCategory::Timeout;
                    ctx.result.failed_middleware.push(MiddlewareFailure {
                        name: name.clone(),
                        error: error.message.clone(),
                        attempts,
                        breaker: self.breakers.state(&name),
                    });

                    return Err(if timed_out {
                        ChainError::Timeout { stage: name }
                    } else {
                        ChainError::Stage {
                            stage: name,
                            message: error.message,
                            retryable: error.recourse.is_retryable(),
                            terminal: true,
                        }
                    });
                }
            }
        }
    }

    /// Computes the delay before the next retry, or `None` when no retry is
    /// allowed: the stage opts out, the failure is not recoverable, the
    /// stage's circuit is open, attempts are exhausted, or the overall retry
    /// budget has elapsed. An explicit delay hint on the failure overrides
    /// the backoff schedule.
    fn next_retry_delay(
        &self,
        supports_retry: bool,
        error: &PhaseError,
        attempts: u32,
        first_attempt_at: Instant,
        name: &str,
    ) -> Option<Duration> {
        if !supports_retry || !error.recourse.is_retryable() {
            return None;
        }

        if self.breakers.state(name) == BreakerStateTag::Open {
            return None;
        }

        let policy = self.policies.get(error.category);
        if !policy.allows_retry(attempts, first_attempt_at) {
            return None;
        }

        Some(
            error
                .recourse
                .retry_hint()
                .unwrap_or_else(|| policy.delay(attempts, &self.rnd)),
        )
    }

    fn merge_baseline(&self, ctx: &mut PhaseContext, baseline: ValidationResult) {
        let excluded = &ctx.request.options.exclude_rules;
        ctx.result
            .issues
            .extend(baseline.issues.into_iter().filter(|issue| !excluded.contains(&issue.code)));
        ctx.result
            .stats
            .performance
            .phase_timings
            .extend(baseline.stats.performance.phase_timings);
        ctx.result.skipped_middleware.extend(baseline.skipped_middleware);
        ctx.result.failed_middleware.extend(baseline.failed_middleware);
    }

    fn sync_circuit(&self, name: &str) {
        self.hub.record_circuit(name, self.breakers.state(name));
    }

    fn record_phase_timing(ctx: &mut PhaseContext, name: &str, elapsed: Duration) {
        let exclusive = elapsed.saturating_sub(ctx.subtree_elapsed);
        let _ = ctx
            .result
            .stats
            .performance
            .phase_timings
            .insert(name.to_string(), exclusive);
        ctx.subtree_elapsed = elapsed;
    }
}

fn disarm(probe: &mut Option<ProbeGuard>) {
    if let Some(guard) = probe.take() {
        guard.disarm();
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;

    use crate::breaker::BreakerOptions;
    use crate::metrics::MetricsOptions;
    use crate::testing::{FailNTimesMiddleware, FnValidator, RecordingMiddleware};

    use super::*;

    fn executor(stages: Vec<StageSlot>, validator: FnValidator) -> ChainExecutor {
        executor_with(stages, validator, ChainOptions::default(), BreakerOptions::default())
    }

    fn executor_with(
        stages: Vec<StageSlot>,
        validator: FnValidator,
        options: ChainOptions,
        breaker: BreakerOptions,
    ) -> ChainExecutor {
        let language = validator.language_tag();
        ChainExecutor::new(
            stages,
            language,
            Arc::new(validator),
            Arc::new(BreakerSet::new(breaker)),
            Arc::new(RetryPolicies::default()),
            Arc::new(MetricsHub::new(MetricsOptions::default())),
            options,
            Rnd::fixed(0.0),
        )
    }

    fn context() -> PhaseContext {
        let request = Arc::new(ValidationRequest::new("x = 1", "py"));
        let token = request.cancellation.clone();
        PhaseContext::new(request, token)
    }

    fn slot(middleware: impl Middleware + 'static) -> StageSlot {
        let implementation: Arc<dyn Middleware> = Arc::new(middleware);
        StageSlot {
            descriptor: implementation.descriptor(),
            implementation,
        }
    }

    #[tokio::test(start_paused = true)]
    async fn stages_run_outer_to_inner_and_cleanup_reverses() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let stages = vec![
            slot(RecordingMiddleware::new("outer", 1, Arc::clone(&log))),
            slot(RecordingMiddleware::new("inner", 2, Arc::clone(&log))),
        ];

        let exec = executor(stages, FnValidator::valid("py"));
        let mut ctx = context();
        exec.run(&mut ctx).await.expect("chain");

        assert_eq!(
            log.lock().expect("log").clone(),
            vec![
                "process:outer".to_string(),
                "process:inner".to_string(),
                "cleanup:inner".to_string(),
                "cleanup:outer".to_string(),
            ]
        );
        assert!(ctx.terminal_done);
    }

    #[tokio::test(start_paused = true)]
    async fn cleanup_runs_even_when_terminal_fails() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let stages = vec![slot(RecordingMiddleware::new("outer", 1, Arc::clone(&log)))];

        let exec = executor(stages, FnValidator::failing("py", "no parser"));
        let mut ctx = context();
        let outcome = exec.run(&mut ctx).await;

        assert!(matches!(outcome, Err(ValidateError::ValidatorFailed { .. })));
        assert_eq!(log.lock().expect("log").last().map(String::as_str), Some("cleanup:outer"));
    }

    #[tokio::test(start_paused = true)]
    async fn retryable_stage_failure_is_retried_until_success() {
        let middleware = FailNTimesMiddleware::new("flaky", 1, 2);
        let calls = middleware.calls();
        let exec = executor(vec![slot(middleware)], FnValidator::valid("py"));

        let mut ctx = context();
        exec.run(&mut ctx).await.expect("chain succeeds after retries");
        assert_eq!(calls.load(std::sync::atomic::Ordering::SeqCst), 3);
        assert!(ctx.result.failed_middleware.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn exhausted_stage_records_failure_and_propagates() {
        let middleware = FailNTimesMiddleware::new("flaky", 1, u32::MAX);
        let exec = executor(vec![slot(middleware)], FnValidator::valid("py"));

        let mut ctx = context();
        let outcome = exec.run(&mut ctx).await;

        assert!(matches!(outcome, Err(ValidateError::MiddlewareFailed { .. })));
        let failure = &ctx.result.failed_middleware[0];
        assert_eq!(failure.name, "flaky");
        assert_eq!(failure.attempts, 3, "runtime policy allows three attempts");
    }

    #[tokio::test(start_paused = true)]
    async fn continue_on_failure_reaches_the_validator() {
        let middleware = FailNTimesMiddleware::new("flaky", 1, u32::MAX);
        let exec = executor_with(
            vec![slot(middleware)],
            FnValidator::valid("py"),
            ChainOptions { continue_on_failure: true, ..ChainOptions::default() },
            BreakerOptions::default(),
        );

        let mut ctx = context();
        exec.run(&mut ctx).await.expect("chain continues");
        assert!(ctx.terminal_done);
        assert_eq!(ctx.result.failed_middleware.len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn open_circuit_skips_middleware_and_continues_inward() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let middleware = RecordingMiddleware::new("guarded", 1, Arc::clone(&log));
        let exec = executor_with(
            vec![slot(middleware)],
            FnValidator::valid("py"),
            ChainOptions::default(),
            BreakerOptions { failure_threshold: 1, ..BreakerOptions::default() },
        );

        exec.breakers.record_failure("guarded", "pre-tripped");

        let mut ctx = context();
        exec.run(&mut ctx).await.expect("chain");
        assert!(ctx.result.skipped_middleware.contains("guarded"));
        assert!(log.lock().expect("log").is_empty(), "stage never ran");
        assert!(ctx.terminal_done);
    }

    #[tokio::test(start_paused = true)]
    async fn open_terminal_circuit_fails_with_circuit_open() {
        let exec = executor_with(
            Vec::new(),
            FnValidator::valid("py"),
            ChainOptions::default(),
            BreakerOptions { failure_threshold: 1, ..BreakerOptions::default() },
        );
        exec.breakers.record_failure("py", "pre-tripped");

        let mut ctx = context();
        let outcome = exec.run(&mut ctx).await;
        assert!(matches!(outcome, Err(ValidateError::CircuitOpen { .. })));
        assert!(ctx.result.skipped_middleware.contains("py"));
    }

    #[tokio::test(start_paused = true)]
    async fn stage_deadline_surfaces_as_timeout() {
        struct Stuck;

        #[async_trait]
        impl Middleware for Stuck {
            fn descriptor(&self) -> MiddlewareDescriptor {
                MiddlewareDescriptor::new("stuck", 1).with_timeout(Duration::from_millis(50))
            }

            async fn process(&self, ctx: &mut PhaseContext, next: Next<'_>) -> Result<(), PhaseError> {
                tokio::time::sleep(Duration::from_secs(3600)).await;
                next.run(ctx).await
            }
        }

        let exec = executor(vec![slot(Stuck)], FnValidator::valid("py"));
        let mut ctx = context();
        let outcome = exec.run(&mut ctx).await;

        // The timeout policy retries the stage, then gives up.
        assert!(matches!(outcome, Err(ValidateError::Timeout { .. })));
        assert_eq!(ctx.result.failed_middleware[0].name, "stuck");
    }

    #[tokio::test(start_paused = true)]
    async fn inner_failure_is_not_charged_to_outer_stage() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let outer = RecordingMiddleware::new("outer", 1, Arc::clone(&log));
        let exec = executor(vec![slot(outer)], FnValidator::failing("py", "no parser"));

        let mut ctx = context();
        let outcome = exec.run(&mut ctx).await;

        assert!(matches!(outcome, Err(ValidateError::ValidatorFailed { .. })));
        // Only the terminal stage shows up in failure diagnostics.
        assert!(ctx.result.failed_middleware.iter().all(|failure| failure.name == "py"));
        assert_eq!(exec.breakers.metrics("outer").failure, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn phase_timings_are_exclusive() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let stages = vec![
            slot(RecordingMiddleware::new("outer", 1, Arc::clone(&log))),
        ];
        let exec = executor(stages, FnValidator::valid("py").with_delay(Duration::from_millis(100)));

        let mut ctx = context();
        exec.run(&mut ctx).await.expect("chain");

        let timings = &ctx.result.stats.performance.phase_timings;
        assert!(timings.contains_key("py"));
        assert!(timings.contains_key("outer"));
        assert!(timings["py"] >= Duration::from_millis(100));
        assert!(timings["outer"] < Duration::from_millis(100), "outer time excludes the subtree");
    }

    #[tokio::test(start_paused = true)]
    async fn cancellation_stops_the_chain() {
        let request = Arc::new(ValidationRequest::new("x = 1", "py"));
        let token = request.cancellation.clone();
        token.cancel();

        let exec = executor(Vec::new(), FnValidator::valid("py"));
        let mut ctx = PhaseContext::new(request, token);
        let outcome = exec.run(&mut ctx).await;
        assert!(matches!(outcome, Err(ValidateError::Cancelled)));
    }
}
