// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Data model for multi-language source-code validation.
//!
//! This crate defines the vocabulary shared by every part of a validation
//! pipeline: what a request looks like, which phases it enables, what the
//! structured outcome contains, and how failures are classified.
//!
//! # Core Types
//!
//! - [`ValidationRequest`]: an immutable unit of work (code + language + options).
//! - [`ValidationOptions`]: phase toggles, custom rules, thresholds, and
//!   parallelism hints. Serialization of the options is canonical, which makes
//!   them usable as part of a cache key.
//! - [`ValidationResult`]: the structured verdict with ordered [`Issue`]s,
//!   per-phase statistics, and diagnostics about skipped or failed stages.
//! - [`Fingerprint`]: a 256-bit content digest identifying a request for
//!   caching and deduplication.
//! - [`ValidateError`]: the error taxonomy surfaced by the execution core.
//!   Every kind classifies into an [`ErrorCategory`] for retry-policy keying
//!   and a [`Recourse`] that tells the pipeline (and callers) whether another
//!   attempt can help.
//!
//! # Validity Invariant
//!
//! A sealed result upholds `is_valid ⇔` no issue has severity
//! [`Severity::Error`] or [`Severity::SecurityVulnerability`]. Use
//! [`ValidationResult::seal`] to derive the terminal state rather than
//! assigning fields by hand.

mod issue;
pub use issue::{Issue, Location, Severity};

mod options;
pub use options::{ParallelOptions, PerformanceThresholds, ValidationOptions};

mod request;
pub use request::ValidationRequest;

mod result;
pub use result::{
    Bottleneck, BreakerStateTag, MiddlewareFailure, PerformanceStats, Stats, ValidationResult,
    ValidationState,
};

mod fingerprint;
pub use fingerprint::Fingerprint;

mod error;
pub use error::{ErrorCategory, Recourse, ValidateError, exit_code};
