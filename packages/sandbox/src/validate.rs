// ABOUTME: Boundary validation for externally derived identifiers
// ABOUTME: Allow-pattern matching applied before any resource name or path is built

use crate::error::SandboxError;
use regex::Regex;

/// Allow-pattern for workspace slugs and session ids. Anything used to
/// construct a container name or filesystem path must match this exactly.
pub const IDENTIFIER_PATTERN: &str = "^[A-Za-z0-9_-]+$";

/// Longest accepted identifier. Container names embed the identifier and
/// engines cap name length, so oversized input is rejected up front.
const MAX_IDENTIFIER_LEN: usize = 64;

/// Validates externally derived identifiers against the allow-pattern.
///
/// The compiled pattern lives on the instance; construct one per component
/// and reuse it. Validation happens at this boundary regardless of whether
/// callers claim to have validated already.
#[derive(Debug, Clone)]
pub struct SlugValidator {
    pattern: Regex,
}

impl SlugValidator {
    pub fn new() -> Self {
        Self {
            pattern: Regex::new(IDENTIFIER_PATTERN).expect("identifier pattern is valid"),
        }
    }

    /// Check one identifier. `kind` names the field for the error message
    /// ("workspace slug", "session id").
    pub fn validate(&self, kind: &str, value: &str) -> Result<(), SandboxError> {
        if value.is_empty() {
            return Err(SandboxError::Validation(format!("{} is empty", kind)));
        }
        if value.len() > MAX_IDENTIFIER_LEN {
            return Err(SandboxError::Validation(format!(
                "{} exceeds {} characters",
                kind, MAX_IDENTIFIER_LEN
            )));
        }
        if !self.pattern.is_match(value) {
            return Err(SandboxError::Validation(format!(
                "{} {:?} does not match {}",
                kind, value, IDENTIFIER_PATTERN
            )));
        }
        Ok(())
    }
}

impl Default for SlugValidator {
    fn default() -> Self {
        Self::new()
    }
}
