// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

use std::sync::Arc;

use coalesce::{Cache, CacheOptions};

use verdict::{Fingerprint, ValidateError, ValidationResult, ValidationState};

use crate::config::CacheSettings;

/// Content-addressed cache of completed validation results.
///
/// Keys are request [`Fingerprint`]s. Only results that reached a
/// non-`Failed` terminal state are retained — a `completed_with_errors`
/// verdict is a perfectly good cache hit, but admission rejections and
/// pipeline failures must be re-attempted on the next request. Duplicate
/// in-flight requests always coalesce onto one build, even when retention
/// is disabled.
pub struct ResultCache {
    enabled: bool,
    inner: Cache<Fingerprint, ValidationResult, ValidateError>,
}

impl std::fmt::Debug for ResultCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ResultCache")
            .field("enabled", &self.enabled)
            .field("len", &self.inner.len())
            .finish_non_exhaustive()
    }
}

fn estimated_cost(result: &ValidationResult) -> u64 {
    let issue_bytes: usize = result
        .issues
        .iter()
        .map(|issue| issue.code.len() + issue.message.len() + 64)
        .sum();
    256 + issue_bytes as u64
}

impl ResultCache {
    /// Creates a cache from pipeline settings.
    #[must_use]
    pub fn new(settings: &CacheSettings) -> Self {
        let options = CacheOptions {
            ttl: settings.ttl,
            // Zero entries keeps single-flight coalescing but stores nothing.
            max_entries: if settings.enabled { settings.max_entries } else { 0 },
            max_bytes: settings.max_bytes,
        };

        Self {
            enabled: settings.enabled,
            inner: Cache::new(options, |result: &ValidationResult| {
                (result.state != ValidationState::Failed).then(|| estimated_cost(result))
            }),
        }
    }

    /// Looks up a cached result.
    #[must_use]
    pub fn get(&self, fingerprint: &Fingerprint) -> Option<Arc<ValidationResult>> {
        if !self.enabled {
            return None;
        }

        self.inner.get(fingerprint)
    }

    /// Returns the cached result or runs `build` under a single-build lease,
    /// so concurrent requests with the same fingerprint share one execution.
    pub async fn get_or_build<F, Fut>(
        &self,
        fingerprint: Fingerprint,
        build: F,
    ) -> Result<Arc<ValidationResult>, ValidateError>
    where
        F: FnOnce() -> Fut + Send,
        Fut: Future<Output = Result<Arc<ValidationResult>, ValidateError>> + Send,
    {
        self.inner.get_or_build(fingerprint, build).await
    }

    /// Number of retained results.
    #[must_use]
    pub fn len(&self) -> usize {
        self.inner.len()
    }

    /// Whether no results are retained.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.inner.is_empty()
    }

    /// Drops all retained results.
    pub fn clear(&self) {
        self.inner.clear();
    }
}

#[cfg(test)]
mod tests {
    use verdict::{Issue, Severity};

    use super::*;

    fn completed(language: &str) -> Arc<ValidationResult> {
        let mut result = ValidationResult::begin(language);
        result.seal();
        Arc::new(result)
    }

    fn fingerprint(code: &str) -> Fingerprint {
        Fingerprint::compute(code, &verdict::ValidationOptions::default())
    }

    #[tokio::test]
    async fn stores_completed_results() {
        let cache = ResultCache::new(&CacheSettings::default());
        let built = cache
            .get_or_build(fingerprint("a"), || async { Ok(completed("py")) })
            .await
            .expect("build");

        let hit = cache.get(&fingerprint("a")).expect("hit");
        assert!(Arc::ptr_eq(&built, &hit));
    }

    #[tokio::test]
    async fn failed_results_are_not_retained() {
        let cache = ResultCache::new(&CacheSettings::default());
        let failed = Arc::new(ValidationResult::failure(
            "py",
            Issue::new("queue_full", Severity::Error, "rejected"),
        ));

        let seen = cache
            .get_or_build(fingerprint("a"), || async { Ok(failed) })
            .await
            .expect("build");
        assert_eq!(seen.state, ValidationState::Failed);
        assert!(cache.get(&fingerprint("a")).is_none());
    }

    #[tokio::test]
    async fn disabled_cache_coalesces_but_does_not_store() {
        let cache = ResultCache::new(&CacheSettings {
            enabled: false,
            ..CacheSettings::default()
        });

        let _ = cache
            .get_or_build(fingerprint("a"), || async { Ok(completed("py")) })
            .await
            .expect("build");
        assert!(cache.get(&fingerprint("a")).is_none());
        assert!(cache.is_empty());
    }

    #[tokio::test]
    async fn errors_propagate_and_are_not_cached() {
        let cache = ResultCache::new(&CacheSettings::default());
        let outcome = cache
            .get_or_build(fingerprint("a"), || async { Err(ValidateError::Cancelled) })
            .await;
        assert_eq!(outcome.unwrap_err(), ValidateError::Cancelled);

        let recovered = cache
            .get_or_build(fingerprint("a"), || async { Ok(completed("py")) })
            .await
            .expect("rebuild");
        assert!(recovered.is_valid);
    }
}
