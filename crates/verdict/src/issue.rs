// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

use std::fmt::{Display, Formatter};

use serde::{Deserialize, Serialize};

/// Severity of a single diagnostic finding.
///
/// Ordering is by increasing severity, so `Severity::Info < Severity::Error`
/// holds and collections of issues can be sorted worst-last.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Severity {
    /// Informational finding with no impact on validity.
    Info,

    /// A finding worth attention that does not invalidate the code.
    Warning,

    /// A defect that makes the code invalid.
    Error,

    /// A security finding; always invalidates the code.
    SecurityVulnerability,
}

impl Severity {
    /// Position of this severity on the 0–10 scale used by security
    /// severity thresholds.
    #[must_use]
    pub const fn score(self) -> u8 {
        match self {
            Self::Info => 1,
            Self::Warning => 4,
            Self::Error => 7,
            Self::SecurityVulnerability => 10,
        }
    }

    /// Whether a finding of this severity invalidates the code.
    #[must_use]
    pub const fn invalidates(self) -> bool {
        matches!(self, Self::Error | Self::SecurityVulnerability)
    }
}

impl Display for Severity {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Info => write!(f, "info"),
            Self::Warning => write!(f, "warning"),
            Self::Error => write!(f, "error"),
            Self::SecurityVulnerability => write!(f, "security_vulnerability"),
        }
    }
}

/// Position of a finding within the validated source.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Location {
    /// 1-based line number.
    pub line: u32,

    /// 1-based column number.
    pub column: u32,
}

/// A single diagnostic produced by a validation phase.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Issue {
    /// Stable machine-readable code, e.g. `syntax_error` or `queue_full`.
    pub code: String,

    /// How bad the finding is.
    pub severity: Severity,

    /// Human-readable explanation.
    pub message: String,

    /// Where in the source the finding applies, when known.
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub location: Option<Location>,

    /// A suggested remediation, when the producing phase has one.
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub suggestion: Option<String>,
}

impl Issue {
    /// Creates an issue with the given code, severity, and message.
    pub fn new(code: impl Into<String>, severity: Severity, message: impl Into<String>) -> Self {
        Self {
            code: code.into(),
            severity,
            message: message.into(),
            location: None,
            suggestion: None,
        }
    }

    /// Attaches a source location.
    #[must_use]
    pub const fn at(mut self, line: u32, column: u32) -> Self {
        self.location = Some(Location { line, column });
        self
    }

    /// Attaches a remediation suggestion.
    #[must_use]
    pub fn suggest(mut self, suggestion: impl Into<String>) -> Self {
        self.suggestion = Some(suggestion.into());
        self
    }
}

#[cfg(test)]
mod tests {
    use static_assertions::assert_impl_all;

    use super::*;

    #[test]
    fn assert_types() {
        assert_impl_all!(Severity: Send, Sync, Copy, Ord);
        assert_impl_all!(Issue: Send, Sync, Clone);
    }

    #[test]
    fn severity_orders_by_badness() {
        assert!(Severity::Info < Severity::Warning);
        assert!(Severity::Warning < Severity::Error);
        assert!(Severity::Error < Severity::SecurityVulnerability);
    }

    #[test]
    fn invalidating_severities() {
        assert!(!Severity::Info.invalidates());
        assert!(!Severity::Warning.invalidates());
        assert!(Severity::Error.invalidates());
        assert!(Severity::SecurityVulnerability.invalidates());
    }

    #[test]
    fn issue_builder_chains() {
        let issue = Issue::new("unused_variable", Severity::Warning, "`x` is never read")
            .at(3, 5)
            .suggest("remove the binding");

        assert_eq!(issue.location, Some(Location { line: 3, column: 5 }));
        assert_eq!(issue.suggestion.as_deref(), Some("remove the binding"));
    }

    #[test]
    fn severity_display_matches_wire_names() {
        assert_eq!(Severity::SecurityVulnerability.to_string(), "security_vulnerability");
        assert_eq!(Severity::Info.to_string(), "info");
    }
}
