// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

use std::fmt::{Display, Formatter};
use std::time::Duration;

use crate::{ValidationResult, ValidationState};

/// Error taxonomy surfaced by the validation execution core.
///
/// Operational failures (admission rejections, stage failures, circuit
/// protection) are normally folded into a failed [`ValidationResult`] so the
/// caller gets diagnostics; this type is what escapes as a hard error for
/// input-shape problems, cancellation, and internal faults, and it names
/// every kind so components can classify uniformly.
#[derive(Debug, Clone, thiserror::Error, PartialEq, Eq)]
#[non_exhaustive]
pub enum ValidateError {
    /// No validator is registered for the requested language.
    #[error("no validator registered for language `{language}`")]
    UnsupportedLanguage {
        /// The unrecognized language tag.
        language: String,
    },

    /// The admission queue is at capacity.
    #[error("admission queue is full")]
    QueueFull,

    /// No execution slot became available before the admission deadline.
    #[error("timed out waiting for an execution slot")]
    Overloaded,

    /// Resource limits are exceeded and the request is not critical.
    #[error("rejected by adaptive throttling")]
    Throttled,

    /// A stage or the whole request ran past its deadline.
    #[error("`{stage}` timed out")]
    Timeout {
        /// The stage (or `request`) that exceeded its budget.
        stage: String,
    },

    /// The caller cancelled the request.
    #[error("request was cancelled")]
    Cancelled,

    /// The language validator itself failed.
    #[error("validator for `{language}` failed: {message}")]
    ValidatorFailed {
        /// Language of the failing validator.
        language: String,
        /// Validator-reported failure detail.
        message: String,
    },

    /// A middleware stage exhausted its attempts.
    #[error("middleware `{name}` failed")]
    MiddlewareFailed {
        /// Stage name.
        name: String,
        /// Whether the failure was classified retryable.
        retryable: bool,
    },

    /// Circuit protection rejected the call.
    #[error("circuit for `{name}` is open")]
    CircuitOpen {
        /// Protected stage name.
        name: String,
    },

    /// A validator dependency is not registered.
    #[error("validator `{language}` requires missing dependency `{dependency}`")]
    DependencyMissing {
        /// Language being registered.
        language: String,
        /// The absent dependency.
        dependency: String,
    },

    /// A validator with the same language tag is already registered.
    #[error("validator for `{language}` is already registered")]
    DuplicateValidator {
        /// The conflicting language tag.
        language: String,
    },

    /// Registration would create a dependency cycle.
    #[error("registering validator `{language}` would create a dependency cycle")]
    DependencyCycle {
        /// Language whose registration was rejected.
        language: String,
    },

    /// An unexpected internal fault.
    #[error("internal error: {0}")]
    Internal(String),
}

/// Coarse error categories used to key per-category retry policies.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum ErrorCategory {
    /// Deadline expiries.
    Timeout,

    /// Stage and validator execution faults.
    Runtime,

    /// Admission and capacity rejections.
    Resource,

    /// Everything that indicates a bug rather than an environment problem.
    Internal,
}

impl Display for ErrorCategory {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Timeout => write!(f, "timeout"),
            Self::Runtime => write!(f, "runtime"),
            Self::Resource => write!(f, "resource"),
            Self::Internal => write!(f, "internal"),
        }
    }
}

/// What the execution core may do about a failure.
///
/// Deliberately narrower than a general recoverability taxonomy: it answers
/// the two questions the pipeline machinery actually asks. The retry path
/// schedules another attempt only for [`Recourse::Retry`], preferring the
/// failure's own delay hint over the configured backoff, and load-shed
/// rejections advertise [`Recourse::Resubmit`] so callers know that trying
/// again later — not immediately — is what helps.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Recourse {
    /// Another attempt inside the pipeline may succeed.
    Retry {
        /// When the next attempt is likely to succeed; overrides backoff.
        after: Option<Duration>,
    },

    /// The system is shedding load or a circuit is open; retrying within
    /// this request will not help, resubmitting later might.
    Resubmit,

    /// Permanent: the input, configuration, or code has to change first.
    Permanent,
}

impl Recourse {
    /// A retry with no timing hint.
    #[must_use]
    pub const fn retry() -> Self {
        Self::Retry { after: None }
    }

    /// A retry hinted to wait at least `delay` before the next attempt.
    #[must_use]
    pub const fn retry_after(delay: Duration) -> Self {
        Self::Retry {
            after: Some(delay),
        }
    }

    /// Whether the pipeline may schedule another attempt.
    #[must_use]
    pub const fn is_retryable(&self) -> bool {
        matches!(self, Self::Retry { .. })
    }

    /// The delay hint for the next attempt, when one was provided.
    #[must_use]
    pub const fn retry_hint(&self) -> Option<Duration> {
        match self {
            Self::Retry { after } => *after,
            Self::Resubmit | Self::Permanent => None,
        }
    }
}

impl ValidateError {
    /// Stable machine-readable code for this kind, also used as the `code`
    /// of the explanatory [`Issue`][crate::Issue] on failed results.
    #[must_use]
    pub const fn code(&self) -> &'static str {
        match self {
            Self::UnsupportedLanguage { .. } => "unsupported_language",
            Self::QueueFull => "queue_full",
            Self::Overloaded => "overloaded",
            Self::Throttled => "throttled",
            Self::Timeout { .. } => "timeout",
            Self::Cancelled => "cancelled",
            Self::ValidatorFailed { .. } => "validator_failed",
            Self::MiddlewareFailed { .. } => "middleware_failed",
            Self::CircuitOpen { .. } => "circuit_open",
            Self::DependencyMissing { .. } => "dependency_missing",
            Self::DuplicateValidator { .. } => "duplicate_validator",
            Self::DependencyCycle { .. } => "dependency_cycle",
            Self::Internal(_) => "internal",
        }
    }

    /// The retry-policy category of this error.
    #[must_use]
    pub const fn category(&self) -> ErrorCategory {
        match self {
            Self::Timeout { .. } => ErrorCategory::Timeout,
            Self::ValidatorFailed { .. } | Self::MiddlewareFailed { .. } | Self::CircuitOpen { .. } => {
                ErrorCategory::Runtime
            }
            Self::QueueFull | Self::Overloaded | Self::Throttled => ErrorCategory::Resource,
            Self::UnsupportedLanguage { .. }
            | Self::Cancelled
            | Self::DependencyMissing { .. }
            | Self::DuplicateValidator { .. }
            | Self::DependencyCycle { .. }
            | Self::Internal(_) => ErrorCategory::Internal,
        }
    }

    /// What a caller (or the pipeline itself) may do about this error.
    #[must_use]
    pub const fn recourse(&self) -> Recourse {
        match self {
            Self::Timeout { .. } | Self::ValidatorFailed { .. } => Recourse::retry(),
            Self::MiddlewareFailed { retryable, .. } => {
                if *retryable {
                    Recourse::retry()
                } else {
                    Recourse::Permanent
                }
            }
            Self::QueueFull | Self::Overloaded | Self::Throttled | Self::CircuitOpen { .. } => {
                Recourse::Resubmit
            }
            Self::UnsupportedLanguage { .. }
            | Self::Cancelled
            | Self::DependencyMissing { .. }
            | Self::DuplicateValidator { .. }
            | Self::DependencyCycle { .. }
            | Self::Internal(_) => Recourse::Permanent,
        }
    }

    /// Whether this kind is an admission rejection.
    #[must_use]
    pub const fn is_rejection(&self) -> bool {
        matches!(self, Self::QueueFull | Self::Overloaded | Self::Throttled)
    }
}

/// Maps a validation outcome to a process exit code.
///
/// `0` valid, `1` invalid (issues with error or security severity), `2`
/// request rejected (overloaded, queue full, or throttled), `3` unsupported
/// language, `4` internal failure.
#[must_use]
pub fn exit_code(outcome: &Result<ValidationResult, ValidateError>) -> i32 {
    match outcome {
        Ok(result) => match result.state {
            ValidationState::Failed => match result.issues.first().map(|issue| issue.code.as_str()) {
                Some("queue_full" | "overloaded" | "throttled") => 2,
                Some("unsupported_language") => 3,
                _ => 4,
            },
            _ if result.is_valid => 0,
            _ => 1,
        },
        Err(error) => match error {
            ValidateError::UnsupportedLanguage { .. } => 3,
            ValidateError::QueueFull | ValidateError::Overloaded | ValidateError::Throttled => 2,
            _ => 4,
        },
    }
}

#[cfg(test)]
mod tests {
    use crate::{Issue, Severity};

    use super::*;

    #[test]
    fn codes_are_stable() {
        assert_eq!(ValidateError::QueueFull.code(), "queue_full");
        assert_eq!(
            ValidateError::CircuitOpen { name: "py".into() }.code(),
            "circuit_open"
        );
        assert_eq!(
            ValidateError::Timeout { stage: "security_scan".into() }.code(),
            "timeout"
        );
    }

    #[test]
    fn categories_key_retry_policies() {
        assert_eq!(
            ValidateError::Timeout { stage: "x".into() }.category(),
            ErrorCategory::Timeout
        );
        assert_eq!(ValidateError::Throttled.category(), ErrorCategory::Resource);
        assert_eq!(
            ValidateError::ValidatorFailed { language: "py".into(), message: "boom".into() }.category(),
            ErrorCategory::Runtime
        );
        assert_eq!(ValidateError::Cancelled.category(), ErrorCategory::Internal);
    }

    #[test]
    fn recourse_classification() {
        assert!(ValidateError::Timeout { stage: "x".into() }.recourse().is_retryable());
        assert_eq!(ValidateError::QueueFull.recourse(), Recourse::Resubmit);
        assert_eq!(ValidateError::Cancelled.recourse(), Recourse::Permanent);
        assert!(
            !ValidateError::MiddlewareFailed { name: "m".into(), retryable: false }
                .recourse()
                .is_retryable()
        );
    }

    #[test]
    fn retry_hints_only_come_from_retry() {
        let hinted = Recourse::retry_after(Duration::from_millis(50));
        assert!(hinted.is_retryable());
        assert_eq!(hinted.retry_hint(), Some(Duration::from_millis(50)));

        assert_eq!(Recourse::retry().retry_hint(), None);
        assert_eq!(Recourse::Resubmit.retry_hint(), None);
        assert_eq!(Recourse::Permanent.retry_hint(), None);
        assert!(!Recourse::Resubmit.is_retryable());
    }

    #[test]
    fn exit_codes_cover_the_contract() {
        let valid = {
            let mut result = ValidationResult::begin("py");
            result.seal();
            result
        };
        assert_eq!(exit_code(&Ok(valid)), 0);

        let invalid = {
            let mut result = ValidationResult::begin("py");
            result.push_issue(Issue::new("syntax_error", Severity::Error, "bad"));
            result.seal();
            result
        };
        assert_eq!(exit_code(&Ok(invalid)), 1);

        let rejected = ValidationResult::failure(
            "py",
            Issue::new("queue_full", Severity::Error, "admission queue is full"),
        );
        assert_eq!(exit_code(&Ok(rejected)), 2);

        assert_eq!(
            exit_code(&Err(ValidateError::UnsupportedLanguage { language: "cobol".into() })),
            3
        );
        assert_eq!(exit_code(&Err(ValidateError::Internal("bug".into()))), 4);
    }
}
