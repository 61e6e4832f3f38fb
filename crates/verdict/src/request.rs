// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

use std::time::Duration;

use tokio_util::sync::CancellationToken;

use crate::ValidationOptions;

/// A unit of validation work.
///
/// Requests are immutable once submitted to the pipeline; builders are
/// consumed before submission. Cancellation is advisory: the execution core
/// observes the token at every suspension point and winds down promptly, but
/// a stage that is already running is not preempted mid-instruction.
#[derive(Debug, Clone)]
pub struct ValidationRequest {
    /// Source text to validate.
    pub code: String,

    /// Language tag, e.g. `py` or `rust`.
    pub language: String,

    /// Per-request configuration.
    pub options: ValidationOptions,

    /// Whether this request may use reserved capacity under load.
    pub critical: bool,

    /// Overall wall-clock budget for the request, if any.
    pub deadline: Option<Duration>,

    /// Advisory cancellation token.
    pub cancellation: CancellationToken,
}

impl ValidationRequest {
    /// Creates a request with default options and no deadline.
    pub fn new(code: impl Into<String>, language: impl Into<String>) -> Self {
        Self {
            code: code.into(),
            language: language.into(),
            options: ValidationOptions::default(),
            critical: false,
            deadline: None,
            cancellation: CancellationToken::new(),
        }
    }

    /// Replaces the options.
    #[must_use]
    pub fn with_options(mut self, options: ValidationOptions) -> Self {
        self.options = options;
        self
    }

    /// Marks the request as critical.
    #[must_use]
    pub const fn critical(mut self) -> Self {
        self.critical = true;
        self
    }

    /// Sets the overall deadline.
    #[must_use]
    pub const fn with_deadline(mut self, deadline: Duration) -> Self {
        self.deadline = Some(deadline);
        self
    }

    /// Attaches an externally owned cancellation token.
    #[must_use]
    pub fn with_cancellation(mut self, token: CancellationToken) -> Self {
        self.cancellation = token;
        self
    }
}

#[cfg(test)]
mod tests {
    use static_assertions::assert_impl_all;

    use super::*;

    #[test]
    fn assert_types() {
        assert_impl_all!(ValidationRequest: Send, Sync, Clone);
    }

    #[test]
    fn builder_sets_fields() {
        let token = CancellationToken::new();
        let request = ValidationRequest::new("x = 1", "py")
            .critical()
            .with_deadline(Duration::from_secs(5))
            .with_cancellation(token.clone());

        assert!(request.critical);
        assert_eq!(request.deadline, Some(Duration::from_secs(5)));
        token.cancel();
        assert!(request.cancellation.is_cancelled());
    }
}
