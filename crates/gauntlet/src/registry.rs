// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Thread-safe registry of language validators.
//!
//! The registry maps a language tag to a [`ValidatorEntry`] carrying the
//! capability object, its advertised capabilities, metadata (including
//! declared dependencies on other validators), and rolling health state.
//!
//! Registration is atomic and validated: duplicate tags fail, missing
//! non-optional dependencies fail, and a registration that would close a
//! dependency cycle is rejected by a depth-first three-color scan of the
//! dependency graph.

use std::collections::{BTreeSet, HashMap, HashSet};
use std::fmt::{Display, Formatter};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use tokio::task::JoinHandle;
use tokio::time::Instant;

use verdict::{Recourse, ValidateError, ValidationOptions, ValidationResult};

/// What a validator can check.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum Capability {
    /// Syntax / parse checking.
    Syntax,

    /// Security scanning.
    Security,

    /// Style conventions.
    Style,

    /// Best-practice lints.
    BestPractices,

    /// Error-handling audits.
    ErrorHandling,

    /// Caller-supplied custom rules.
    CustomRules,

    /// Performance diagnostics.
    Performance,
}

/// Failure reported by a validator.
#[derive(Debug, Clone, PartialEq)]
pub struct ValidatorError {
    /// Human-readable failure detail.
    pub message: String,

    /// What the pipeline may do about the failure; drives retry and
    /// breaker handling.
    pub recourse: Recourse,
}

impl ValidatorError {
    /// A transient failure worth retrying.
    pub fn transient(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            recourse: Recourse::retry(),
        }
    }

    /// A permanent failure; retrying will not help.
    pub fn permanent(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            recourse: Recourse::Permanent,
        }
    }
}

impl Display for ValidatorError {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.message)
    }
}

impl std::error::Error for ValidatorError {}

/// A language validator capability.
///
/// Implementations front concrete syntax/AST/lint tooling; the execution
/// core only ever calls through this interface.
#[async_trait]
pub trait Validator: Send + Sync {
    /// The language tag this validator serves.
    fn language(&self) -> &str;

    /// The checks this validator can perform.
    fn capabilities(&self) -> BTreeSet<Capability>;

    /// Validates `code` under `options`, producing the baseline result.
    async fn validate(
        &self,
        code: &str,
        options: &ValidationOptions,
    ) -> Result<ValidationResult, ValidatorError>;

    /// Liveness probe used by periodic health checks.
    async fn health(&self) -> Result<(), ValidatorError> {
        Ok(())
    }
}

/// A declared dependency on another validator.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DependencyRequirement {
    /// Language tag of the required validator.
    pub language: String,

    /// Accepted version range, recorded for diagnostics.
    #[serde(default)]
    pub version_req: String,

    /// Whether registration may proceed when the dependency is absent.
    #[serde(default)]
    pub optional: bool,
}

/// Descriptive metadata registered alongside a validator.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ValidatorMetadata {
    /// Implementation version.
    pub version: String,

    /// Who provides the validator.
    pub provider: String,

    /// One-line description.
    pub description: String,

    /// Required or optional peer validators.
    pub dependencies: Vec<DependencyRequirement>,

    /// Relative priority among validators; higher sorts first in listings.
    pub priority: i32,
}

/// Rolling health of a registered validator.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct HealthState {
    /// Whether the last probe succeeded.
    pub healthy: bool,

    /// When the last probe ran.
    pub last_checked: Option<Instant>,

    /// How long the last probe took.
    pub load_time: Duration,

    /// Memory attributed to the validator, when known.
    pub memory_bytes: u64,

    /// Failure message of the last unhealthy probe.
    pub last_error: Option<String>,
}

/// A registered validator with its metadata and health.
pub struct ValidatorEntry {
    /// Language tag.
    pub language: String,

    /// The capability object.
    pub validator: Arc<dyn Validator>,

    /// Advertised capabilities, captured at registration.
    pub capabilities: BTreeSet<Capability>,

    /// Registration metadata.
    pub metadata: ValidatorMetadata,

    /// Rolling health state.
    pub health: Mutex<HealthState>,
}

impl std::fmt::Debug for ValidatorEntry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ValidatorEntry")
            .field("language", &self.language)
            .field("capabilities", &self.capabilities)
            .field("metadata", &self.metadata)
            .finish_non_exhaustive()
    }
}

/// Thread-safe language → validator mapping with dependency validation.
///
/// Reads vastly outnumber writes, so the interior is a readers–writer lock;
/// register and unregister take the exclusive side.
#[derive(Debug, Default)]
pub struct ValidatorRegistry {
    entries: RwLock<HashMap<String, Arc<ValidatorEntry>>>,
}

impl ValidatorRegistry {
    /// Creates an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a validator atomically.
    ///
    /// Fails without side effects when the tag is already registered, a
    /// non-optional dependency is absent, or the registration would create
    /// a dependency cycle.
    pub fn register(
        &self,
        validator: Arc<dyn Validator>,
        metadata: ValidatorMetadata,
    ) -> Result<(), ValidateError> {
        let language = validator.language().to_string();
        let mut entries = self.entries.write();

        if entries.contains_key(&language) {
            return Err(ValidateError::DuplicateValidator { language });
        }

        for dependency in &metadata.dependencies {
            if !dependency.optional && !entries.contains_key(&dependency.language) {
                return Err(ValidateError::DependencyMissing {
                    language,
                    dependency: dependency.language.clone(),
                });
            }
        }

        if Self::would_cycle(&entries, &language, &metadata) {
            return Err(ValidateError::DependencyCycle { language });
        }

        let capabilities = validator.capabilities();
        let entry = Arc::new(ValidatorEntry {
            language: language.clone(),
            validator,
            capabilities,
            metadata,
            health: Mutex::new(HealthState::default()),
        });
        let _ = entries.insert(language.clone(), entry);
        drop(entries);

        tracing::info!(name: "gauntlet.registry", language = %language, "validator registered");
        Ok(())
    }

    /// Removes a validator. Fails when the tag is unknown.
    pub fn unregister(&self, language: &str) -> Result<(), ValidateError> {
        let removed = self.entries.write().remove(language);
        match removed {
            Some(_) => {
                tracing::info!(name: "gauntlet.registry", language = %language, "validator unregistered");
                Ok(())
            }
            None => Err(ValidateError::UnsupportedLanguage {
                language: language.to_string(),
            }),
        }
    }

    /// Looks up the entry for a language.
    #[must_use]
    pub fn get(&self, language: &str) -> Option<Arc<ValidatorEntry>> {
        self.entries.read().get(language).cloned()
    }

    /// All entries, highest priority first, ties by language tag.
    #[must_use]
    pub fn list(&self) -> Vec<Arc<ValidatorEntry>> {
        let mut entries: Vec<_> = self.entries.read().values().cloned().collect();
        entries.sort_by(|a, b| {
            b.metadata
                .priority
                .cmp(&a.metadata.priority)
                .then_with(|| a.language.cmp(&b.language))
        });
        entries
    }

    /// Metadata for a language, when registered.
    #[must_use]
    pub fn metadata(&self, language: &str) -> Option<ValidatorMetadata> {
        self.entries.read().get(language).map(|entry| entry.metadata.clone())
    }

    /// Registered language tags, sorted.
    #[must_use]
    pub fn languages(&self) -> Vec<String> {
        let mut languages: Vec<_> = self.entries.read().keys().cloned().collect();
        languages.sort();
        languages
    }

    // Depth-first three-color reachability over the dependency graph that
    // would exist after inserting `candidate`.
    fn would_cycle(
        entries: &HashMap<String, Arc<ValidatorEntry>>,
        candidate: &str,
        metadata: &ValidatorMetadata,
    ) -> bool {
        let mut adjacency: HashMap<&str, Vec<&str>> = HashMap::new();
        for (language, entry) in entries {
            let deps = entry
                .metadata
                .dependencies
                .iter()
                .map(|dependency| dependency.language.as_str())
                .collect();
            let _ = adjacency.insert(language.as_str(), deps);
        }
        let _ = adjacency.insert(
            candidate,
            metadata
                .dependencies
                .iter()
                .map(|dependency| dependency.language.as_str())
                .collect(),
        );

        let mut visiting = HashSet::new();
        let mut visited = HashSet::new();
        Self::dfs_cycle(&adjacency, candidate, &mut visiting, &mut visited)
    }

    fn dfs_cycle<'graph>(
        adjacency: &HashMap<&'graph str, Vec<&'graph str>>,
        node: &'graph str,
        visiting: &mut HashSet<&'graph str>,
        visited: &mut HashSet<&'graph str>,
    ) -> bool {
        if visited.contains(node) {
            return false;
        }
        if !visiting.insert(node) {
            return true;
        }

        for &next in adjacency.get(node).into_iter().flatten() {
            if Self::dfs_cycle(adjacency, next, visiting, visited) {
                return true;
            }
        }

        let _ = visiting.remove(node);
        let _ = visited.insert(node);
        false
    }

    /// Spawns the periodic health-check task.
    pub fn spawn_health_checks(self: &Arc<Self>, interval: Duration) -> JoinHandle<()> {
        let registry = Arc::clone(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

            loop {
                let _ = ticker.tick().await;
                for entry in registry.list() {
                    let started = Instant::now();
                    let outcome = entry.validator.health().await;
                    let load_time = started.elapsed();

                    let mut health = entry.health.lock();
                    health.last_checked = Some(started);
                    health.load_time = load_time;
                    match outcome {
                        Ok(()) => {
                            health.healthy = true;
                            health.last_error = None;
                        }
                        Err(error) => {
                            health.healthy = false;
                            health.last_error = Some(error.message.clone());
                            drop(health);
                            tracing::warn!(
                                name: "gauntlet.registry",
                                language = %entry.language,
                                error = %error,
                                "validator failed health check",
                            );
                        }
                    }
                }
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use crate::testing::FnValidator;

    use super::*;

    fn depends_on(languages: &[&str]) -> ValidatorMetadata {
        ValidatorMetadata {
            dependencies: languages
                .iter()
                .map(|language| DependencyRequirement {
                    language: (*language).to_string(),
                    version_req: String::new(),
                    optional: false,
                })
                .collect(),
            ..ValidatorMetadata::default()
        }
    }

    #[tokio::test]
    async fn register_then_unregister_restores_the_set() {
        let registry = ValidatorRegistry::new();
        let before = registry.languages();

        registry
            .register(Arc::new(FnValidator::valid("py")), ValidatorMetadata::default())
            .expect("register");
        assert_eq!(registry.languages(), vec!["py".to_string()]);

        registry.unregister("py").expect("unregister");
        assert_eq!(registry.languages(), before);
    }

    #[tokio::test]
    async fn duplicate_registration_fails() {
        let registry = ValidatorRegistry::new();
        registry
            .register(Arc::new(FnValidator::valid("py")), ValidatorMetadata::default())
            .expect("first");

        let outcome = registry.register(Arc::new(FnValidator::valid("py")), ValidatorMetadata::default());
        assert_eq!(
            outcome.unwrap_err(),
            ValidateError::DuplicateValidator { language: "py".into() }
        );
    }

    #[tokio::test]
    async fn missing_required_dependency_fails() {
        let registry = ValidatorRegistry::new();
        let outcome = registry.register(Arc::new(FnValidator::valid("ts")), depends_on(&["js"]));
        assert_eq!(
            outcome.unwrap_err(),
            ValidateError::DependencyMissing { language: "ts".into(), dependency: "js".into() }
        );
    }

    #[tokio::test]
    async fn optional_dependency_may_be_absent() {
        let registry = ValidatorRegistry::new();
        let metadata = ValidatorMetadata {
            dependencies: vec![DependencyRequirement {
                language: "js".into(),
                version_req: ">=1".into(),
                optional: true,
            }],
            ..ValidatorMetadata::default()
        };

        assert!(registry.register(Arc::new(FnValidator::valid("ts")), metadata).is_ok());
    }

    #[tokio::test]
    async fn transitive_dependency_cycle_is_rejected() {
        let registry = ValidatorRegistry::new();

        // `c` declares an optional edge to `a`, which does not exist yet;
        // optional dependencies may point at absent validators.
        let c_metadata = ValidatorMetadata {
            dependencies: vec![DependencyRequirement {
                language: "a".into(),
                version_req: String::new(),
                optional: true,
            }],
            ..ValidatorMetadata::default()
        };
        registry
            .register(Arc::new(FnValidator::valid("c")), c_metadata)
            .expect("c");
        registry
            .register(Arc::new(FnValidator::valid("b")), depends_on(&["c"]))
            .expect("b");

        // Registering `a` with an edge to `b` closes a → b → c → a.
        let outcome = registry.register(Arc::new(FnValidator::valid("a")), depends_on(&["b"]));
        assert_eq!(
            outcome.unwrap_err(),
            ValidateError::DependencyCycle { language: "a".into() }
        );

        // The rejected registration left no trace.
        assert_eq!(registry.languages(), vec!["b".to_string(), "c".to_string()]);
    }

    #[tokio::test]
    async fn self_cycle_detected_even_with_absent_dependency_checks() {
        let registry = ValidatorRegistry::new();
        let metadata = ValidatorMetadata {
            dependencies: vec![DependencyRequirement {
                language: "e".into(),
                version_req: String::new(),
                optional: true,
            }],
            ..ValidatorMetadata::default()
        };
        // Optional self-dependency still forms a cycle.
        let outcome = registry.register(Arc::new(FnValidator::valid("e")), metadata);
        assert_eq!(
            outcome.unwrap_err(),
            ValidateError::DependencyCycle { language: "e".into() }
        );
    }

    #[tokio::test]
    async fn list_orders_by_priority_then_language() {
        let registry = ValidatorRegistry::new();
        registry
            .register(
                Arc::new(FnValidator::valid("py")),
                ValidatorMetadata { priority: 1, ..ValidatorMetadata::default() },
            )
            .expect("py");
        registry
            .register(
                Arc::new(FnValidator::valid("rust")),
                ValidatorMetadata { priority: 5, ..ValidatorMetadata::default() },
            )
            .expect("rust");

        let listed: Vec<_> = registry.list().iter().map(|entry| entry.language.clone()).collect();
        assert_eq!(listed, vec!["rust".to_string(), "py".to_string()]);
    }

    #[tokio::test(start_paused = true)]
    async fn health_checks_record_outcomes() {
        let registry = Arc::new(ValidatorRegistry::new());
        registry
            .register(Arc::new(FnValidator::valid("py")), ValidatorMetadata::default())
            .expect("register");

        let handle = registry.spawn_health_checks(Duration::from_secs(60));
        tokio::time::advance(Duration::from_secs(61)).await;
        tokio::task::yield_now().await;

        let entry = registry.get("py").expect("entry");
        let health = entry.health.lock().clone();
        assert!(health.healthy);
        assert!(health.last_checked.is_some());

        handle.abort();
    }
}
