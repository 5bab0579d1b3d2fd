//! Signature matching over request URLs.
//!
//! The built-in signature list is versioned ([`SIGNATURE_SET_VERSION`]) and
//! can be extended from a JSON file without a code change:
//!
//! ```json
//! [
//!   { "label": "shell_injection", "pattern": "(?i);\\s*(cat|wget|curl)\\s", "severity": "high" }
//! ]
//! ```
//!
//! Extra signatures are appended after the built-in ones. This is coarse
//! matching, not a WAF: false positives are accepted.

use std::path::Path;

use percent_encoding::percent_decode_str;
use regex::RegexSet;
use serde::{Deserialize, Serialize};

use crate::error::AppError;
use crate::models::Severity;

/// Bumped whenever the built-in list changes.
pub const SIGNATURE_SET_VERSION: u32 = 1;

/// One threat signature.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ThreatSignature {
    pub label: String,
    pub pattern: String,
    #[serde(default = "default_severity")]
    pub severity: Severity,
}

fn default_severity() -> Severity {
    Severity::High
}

impl ThreatSignature {
    pub fn new(label: impl Into<String>, pattern: impl Into<String>, severity: Severity) -> Self {
        Self {
            label: label.into(),
            pattern: pattern.into(),
            severity,
        }
    }
}

/// The built-in signatures, in reporting priority order.
pub fn builtin_signatures() -> Vec<ThreatSignature> {
    vec![
        ThreatSignature::new("path_traversal", r"\.\.", Severity::High),
        ThreatSignature::new("script_injection", r"(?i)<script", Severity::High),
        ThreatSignature::new("sql_injection", r"(?i)union.*select", Severity::High),
        ThreatSignature::new("code_injection", r"(?i)eval\(", Severity::High),
    ]
}

/// Read extra signatures from a JSON array file.
pub fn load_signature_file(path: &Path) -> Result<Vec<ThreatSignature>, AppError> {
    let raw = std::fs::read_to_string(path).map_err(|e| {
        AppError::ConfigError(format!(
            "Cannot read THREAT_SIGNATURES_FILE '{}': {e}",
            path.display()
        ))
    })?;
    serde_json::from_str(&raw).map_err(|e| {
        AppError::ConfigError(format!(
            "Invalid THREAT_SIGNATURES_FILE '{}': {e}",
            path.display()
        ))
    })
}

/// A signature that fired.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ThreatMatch {
    pub label: String,
    pub severity: Severity,
}

/// Compiled signature list.
#[derive(Debug, Clone)]
pub struct ThreatMatcher {
    set: RegexSet,
    signatures: Vec<ThreatSignature>,
}

impl ThreatMatcher {
    /// Compile `signatures`. An invalid pattern is a configuration error.
    pub fn new(signatures: Vec<ThreatSignature>) -> Result<Self, AppError> {
        let set = RegexSet::new(signatures.iter().map(|s| s.pattern.as_str())).map_err(|e| {
            AppError::ConfigError(format!("Invalid threat signature pattern: {e}"))
        })?;
        Ok(Self { set, signatures })
    }

    /// The built-in list followed by `extra`.
    pub fn with_extra(extra: Vec<ThreatSignature>) -> Result<Self, AppError> {
        let mut signatures = builtin_signatures();
        signatures.extend(extra);
        Self::new(signatures)
    }

    pub fn signatures(&self) -> &[ThreatSignature] {
        &self.signatures
    }

    /// First signature (lowest index) matching `url`, checked both as sent
    /// and percent-decoded.
    pub fn scan(&self, url: &str) -> Option<ThreatMatch> {
        let raw = self.set.matches(url).iter().next();
        let decoded_url = percent_decode_str(url).decode_utf8_lossy();
        let decoded = if decoded_url != url {
            self.set.matches(&decoded_url).iter().next()
        } else {
            None
        };

        let index = match (raw, decoded) {
            (Some(a), Some(b)) => a.min(b),
            (a, b) => a.or(b)?,
        };
        let signature = &self.signatures[index];
        Some(ThreatMatch {
            label: signature.label.clone(),
            severity: signature.severity,
        })
    }
}

impl Default for ThreatMatcher {
    fn default() -> Self {
        let signatures = builtin_signatures();
        // Built-in patterns are literals known to compile.
        let set = RegexSet::new(signatures.iter().map(|s| s.pattern.as_str()))
            .unwrap_or_else(|_| RegexSet::empty());
        Self { set, signatures }
    }
}
