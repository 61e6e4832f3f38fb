// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Test doubles for exercising the pipeline without real validators or a
//! real operating system underneath.
//!
//! These helpers are part of the public surface so downstream crates can
//! test their own middleware and wiring against the same doubles this crate
//! uses internally.

use std::collections::{BTreeSet, VecDeque};
use std::io;
use std::sync::Arc;
use std::sync::Mutex as StdMutex;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;

use async_trait::async_trait;

use verdict::{Issue, ValidationOptions, ValidationResult};

use crate::chain::{Middleware, MiddlewareDescriptor, Next, PhaseContext, PhaseError};
use crate::registry::{Capability, Validator, ValidatorError};
use crate::sampler::{ResourceProbe, ResourceReading};

type ProbeFn = Box<dyn FnMut() -> io::Result<ResourceReading> + Send>;

/// A [`ResourceProbe`] that replays scripted readings.
pub struct ScriptedProbe {
    source: ProbeFn,
}

impl std::fmt::Debug for ScriptedProbe {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ScriptedProbe").finish_non_exhaustive()
    }
}

impl ScriptedProbe {
    /// A probe driven by an arbitrary closure.
    pub fn from_fn(source: impl FnMut() -> io::Result<ResourceReading> + Send + 'static) -> Self {
        Self { source: Box::new(source) }
    }

    /// A probe that replays the given CPU percentages once, then fails.
    #[must_use]
    pub fn cpu_series(series: Vec<f64>) -> Self {
        let mut series: VecDeque<f64> = series.into();
        Self::from_fn(move || {
            series.pop_front().map_or_else(
                || Err(io::Error::new(io::ErrorKind::UnexpectedEof, "script exhausted")),
                |cpu_pct| {
                    Ok(ResourceReading {
                        cpu_pct,
                        rss_bytes: 64 * 1024 * 1024,
                        threads: 4,
                        handles: 16,
                        ..ResourceReading::default()
                    })
                },
            )
        })
    }

    /// A probe that ramps CPU linearly from `start` by `step` per reading,
    /// forever.
    #[must_use]
    pub fn cpu_ramp(start: f64, step: f64) -> Self {
        let mut current = start;
        Self::from_fn(move || {
            let cpu_pct = current;
            current += step;
            Ok(ResourceReading {
                cpu_pct,
                rss_bytes: 64 * 1024 * 1024,
                threads: 4,
                handles: 16,
                ..ResourceReading::default()
            })
        })
    }
}

impl ResourceProbe for ScriptedProbe {
    fn read(&mut self) -> io::Result<ResourceReading> {
        (self.source)()
    }
}

enum ValidatorBehavior {
    Valid,
    Issues(Vec<Issue>),
    Failing(String),
}

/// A scriptable in-process [`Validator`].
pub struct FnValidator {
    language: String,
    capabilities: BTreeSet<Capability>,
    delay: Option<Duration>,
    calls: Arc<AtomicU32>,
    behavior: ValidatorBehavior,
}

impl std::fmt::Debug for FnValidator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FnValidator").field("language", &self.language).finish_non_exhaustive()
    }
}

impl FnValidator {
    fn new(language: &str, behavior: ValidatorBehavior) -> Self {
        Self {
            language: language.to_string(),
            capabilities: BTreeSet::from([Capability::Syntax]),
            delay: None,
            calls: Arc::new(AtomicU32::new(0)),
            behavior,
        }
    }

    /// A validator that always returns an empty, valid result.
    #[must_use]
    pub fn valid(language: &str) -> Self {
        Self::new(language, ValidatorBehavior::Valid)
    }

    /// A validator that always reports the given issues.
    #[must_use]
    pub fn with_issues(language: &str, issues: Vec<Issue>) -> Self {
        Self::new(language, ValidatorBehavior::Issues(issues))
    }

    /// A validator that always fails with a transient error.
    #[must_use]
    pub fn failing(language: &str, message: &str) -> Self {
        Self::new(language, ValidatorBehavior::Failing(message.to_string()))
    }

    /// Sleeps for `delay` before producing the outcome.
    #[must_use]
    pub const fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    /// Shared invocation counter.
    #[must_use]
    pub fn calls(&self) -> Arc<AtomicU32> {
        Arc::clone(&self.calls)
    }

    /// The language tag, owned.
    #[must_use]
    pub fn language_tag(&self) -> String {
        self.language.clone()
    }
}

#[async_trait]
impl Validator for FnValidator {
    fn language(&self) -> &str {
        &self.language
    }

    fn capabilities(&self) -> BTreeSet<Capability> {
        self.capabilities.clone()
    }

    async fn validate(
        &self,
        _code: &str,
        _options: &ValidationOptions,
    ) -> Result<ValidationResult, ValidatorError> {
        let _ = self.calls.fetch_add(1, Ordering::SeqCst);
        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }

        match &self.behavior {
            ValidatorBehavior::Valid => {
                let mut result = ValidationResult::begin(&self.language);
                result.seal();
                Ok(result)
            }
            ValidatorBehavior::Issues(issues) => {
                let mut result = ValidationResult::begin(&self.language);
                result.issues.extend(issues.iter().cloned());
                result.seal();
                Ok(result)
            }
            ValidatorBehavior::Failing(message) => Err(ValidatorError::transient(message.clone())),
        }
    }
}

/// Middleware that logs `process`/`cleanup` invocations in order.
pub struct RecordingMiddleware {
    name: String,
    order: i32,
    log: Arc<StdMutex<Vec<String>>>,
}

impl std::fmt::Debug for RecordingMiddleware {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RecordingMiddleware").field("name", &self.name).finish_non_exhaustive()
    }
}

impl RecordingMiddleware {
    /// Creates a recorder writing into `log`.
    #[must_use]
    pub fn new(name: &str, order: i32, log: Arc<StdMutex<Vec<String>>>) -> Self {
        Self {
            name: name.to_string(),
            order,
            log,
        }
    }

    fn note(&self, event: &str) {
        if let Ok(mut log) = self.log.lock() {
            log.push(format!("{event}:{}", self.name));
        }
    }
}

#[async_trait]
impl Middleware for RecordingMiddleware {
    fn descriptor(&self) -> MiddlewareDescriptor {
        MiddlewareDescriptor::new(self.name.clone(), self.order).with_cleanup()
    }

    async fn process(&self, ctx: &mut PhaseContext, next: Next<'_>) -> Result<(), PhaseError> {
        self.note("process");
        next.run(ctx).await
    }

    async fn cleanup(&self, _ctx: &mut PhaseContext) -> Result<(), PhaseError> {
        self.note("cleanup");
        Ok(())
    }
}

/// Middleware that fails its first `failures` invocations, then succeeds.
pub struct FailNTimesMiddleware {
    name: String,
    order: i32,
    failures: u32,
    calls: Arc<AtomicU32>,
}

impl std::fmt::Debug for FailNTimesMiddleware {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FailNTimesMiddleware").field("name", &self.name).finish_non_exhaustive()
    }
}

impl FailNTimesMiddleware {
    /// Creates the middleware.
    #[must_use]
    pub fn new(name: &str, order: i32, failures: u32) -> Self {
        Self {
            name: name.to_string(),
            order,
            failures,
            calls: Arc::new(AtomicU32::new(0)),
        }
    }

    /// Shared invocation counter.
    #[must_use]
    pub fn calls(&self) -> Arc<AtomicU32> {
        Arc::clone(&self.calls)
    }
}

#[async_trait]
impl Middleware for FailNTimesMiddleware {
    fn descriptor(&self) -> MiddlewareDescriptor {
        MiddlewareDescriptor::new(self.name.clone(), self.order).retryable()
    }

    async fn process(&self, ctx: &mut PhaseContext, next: Next<'_>) -> Result<(), PhaseError> {
        let call = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
        if call <= self.failures {
            return Err(PhaseError::transient(format!("induced failure #{call}")));
        }

        next.run(ctx).await
    }
}
