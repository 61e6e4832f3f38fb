// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Manifest-driven validator discovery.
//!
//! Configured directories are scanned for `*.json` validator manifests. A
//! caller-supplied [`ManifestLoader`] turns a parsed manifest into a live
//! validator, which is registered under the manifest's language tag. Scans
//! are debounced by the configured delay; a SHA-256 digest per file
//! suppresses reloads when nothing changed. A changed file replaces its
//! previous registration, and a deleted file unregisters whatever it
//! sourced.

use std::collections::{BTreeSet, HashMap};
use std::path::PathBuf;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tokio::task::JoinHandle;

use verdict::{Fingerprint, ValidateError};

use crate::config::DiscoveryOptions;
use crate::registry::{Capability, Validator, ValidatorMetadata, ValidatorRegistry};

/// A validator manifest as found on disk.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ValidatorManifest {
    /// Language tag to register under.
    pub language: String,

    /// Capabilities the loaded validator will advertise.
    #[serde(default)]
    pub capabilities: BTreeSet<Capability>,

    /// Registration metadata.
    #[serde(default)]
    pub metadata: ValidatorMetadata,
}

/// Turns a manifest into a live validator.
pub trait ManifestLoader: Send + Sync {
    /// Instantiates the validator a manifest describes.
    fn load(&self, manifest: &ValidatorManifest) -> Result<Arc<dyn Validator>, ValidateError>;
}

#[derive(Debug)]
struct SourceState {
    digest: Fingerprint,
    // None when the file was seen but produced no registration.
    language: Option<String>,
}

/// Polling watcher over the discovery directories.
#[derive(Debug)]
pub struct DiscoveryWatcher;

impl DiscoveryWatcher {
    /// Spawns the watcher task.
    ///
    /// With hot reload disabled the directories are scanned once and the
    /// task exits; otherwise scanning repeats on the debounce cadence.
    pub fn spawn(
        options: DiscoveryOptions,
        registry: Arc<ValidatorRegistry>,
        loader: Arc<dyn ManifestLoader>,
    ) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut known: HashMap<PathBuf, SourceState> = HashMap::new();
            let mut ticker = tokio::time::interval(options.file_change_delay);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

            loop {
                let _ = ticker.tick().await;
                Self::scan(&options.auto_discovery_paths, &registry, &loader, &mut known);

                if !options.enable_hot_reload {
                    return;
                }
            }
        })
    }

    fn scan(
        paths: &[PathBuf],
        registry: &ValidatorRegistry,
        loader: &Arc<dyn ManifestLoader>,
        known: &mut HashMap<PathBuf, SourceState>,
    ) {
        let mut seen: Vec<PathBuf> = Vec::new();

        for dir in paths {
            let Ok(entries) = std::fs::read_dir(dir) else {
                continue;
            };

            for entry in entries.flatten() {
                let path = entry.path();
                if path.extension().is_none_or(|extension| extension != "json") {
                    continue;
                }

                seen.push(path.clone());
                let Ok(bytes) = std::fs::read(&path) else {
                    continue;
                };

                let digest = Fingerprint::of_bytes(&bytes);
                if known.get(&path).is_some_and(|state| state.digest == digest) {
                    continue;
                }

                // Changed or new: drop whatever this file previously sourced.
                if let Some(previous) = known.remove(&path)
                    && let Some(language) = previous.language
                {
                    let _ = registry.unregister(&language);
                }

                let language = Self::load_manifest(&path, &bytes, registry, loader);
                let _ = known.insert(path, SourceState { digest, language });
            }
        }

        // Deleted files unregister everything they sourced.
        let removed: Vec<PathBuf> = known
            .keys()
            .filter(|path| !seen.contains(path))
            .cloned()
            .collect();
        for path in removed {
            if let Some(state) = known.remove(&path)
                && let Some(language) = state.language
            {
                tracing::info!(
                    name: "gauntlet.discovery",
                    path = %path.display(),
                    language = %language,
                    "manifest removed; unregistering validator",
                );
                let _ = registry.unregister(&language);
            }
        }
    }

    fn load_manifest(
        path: &std::path::Path,
        bytes: &[u8],
        registry: &ValidatorRegistry,
        loader: &Arc<dyn ManifestLoader>,
    ) -> Option<String> {
        let manifest: ValidatorManifest = match serde_json::from_slice(bytes) {
            Ok(manifest) => manifest,
            Err(error) => {
                tracing::warn!(
                    name: "gauntlet.discovery",
                    path = %path.display(),
                    error = %error,
                    "manifest is not valid JSON; ignoring",
                );
                return None;
            }
        };

        let validator = match loader.load(&manifest) {
            Ok(validator) => validator,
            Err(error) => {
                tracing::warn!(
                    name: "gauntlet.discovery",
                    path = %path.display(),
                    error = %error,
                    "loader rejected manifest",
                );
                return None;
            }
        };

        let language = manifest.language.clone();
        match registry.register(validator, manifest.metadata.clone()) {
            Ok(()) => {
                tracing::info!(
                    name: "gauntlet.discovery",
                    path = %path.display(),
                    language = %language,
                    "validator discovered",
                );
                Some(language)
            }
            Err(error) => {
                tracing::warn!(
                    name: "gauntlet.discovery",
                    path = %path.display(),
                    error = %error,
                    "discovered validator failed to register",
                );
                None
            }
        }
    }
}
