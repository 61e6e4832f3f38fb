// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

use std::fmt::{Debug, Display, Formatter};

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::ValidationOptions;

/// 256-bit content digest identifying a request for caching purposes.
///
/// The digest covers the source bytes and the canonical serialization of the
/// options, so two requests with the same code but different phase toggles
/// get distinct fingerprints.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Fingerprint([u8; 32]);

impl Fingerprint {
    /// Computes the fingerprint of `code` under `options`.
    #[must_use]
    pub fn compute(code: &str, options: &ValidationOptions) -> Self {
        let mut hasher = Sha256::new();
        hasher.update(code.as_bytes());
        // Canonical by construction: options use ordered collections only.
        let canonical = serde_json::to_vec(options).unwrap_or_default();
        hasher.update(&canonical);
        Self(hasher.finalize().into())
    }

    /// Computes the digest of arbitrary bytes, e.g. a discovery manifest.
    #[must_use]
    pub fn of_bytes(bytes: &[u8]) -> Self {
        let mut hasher = Sha256::new();
        hasher.update(bytes);
        Self(hasher.finalize().into())
    }

    /// The raw digest bytes.
    #[must_use]
    pub const fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }
}

impl Display for Fingerprint {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        for byte in &self.0 {
            write!(f, "{byte:02x}")?;
        }

        Ok(())
    }
}

impl Debug for Fingerprint {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "Fingerprint({self})")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn same_input_same_fingerprint() {
        let options = ValidationOptions::default();
        assert_eq!(
            Fingerprint::compute("x = 1", &options),
            Fingerprint::compute("x = 1", &options)
        );
    }

    #[test]
    fn code_changes_fingerprint() {
        let options = ValidationOptions::default();
        assert_ne!(
            Fingerprint::compute("x = 1", &options),
            Fingerprint::compute("x = 2", &options)
        );
    }

    #[test]
    fn options_change_fingerprint() {
        assert_ne!(
            Fingerprint::compute("x = 1", &ValidationOptions::default()),
            Fingerprint::compute("x = 1", &ValidationOptions::all_phases())
        );
    }

    #[test]
    fn displays_as_64_hex_chars() {
        let fingerprint = Fingerprint::compute("x = 1", &ValidationOptions::default());
        let hex = fingerprint.to_string();
        assert_eq!(hex.len(), 64);
        assert!(hex.chars().all(|c| c.is_ascii_hexdigit()));
    }
}
