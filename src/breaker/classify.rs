//! Error-text matching and classification.

use crate::core::{GuardError, Result};
use regex::{RegexSet, RegexSetBuilder};
use serde::Serialize;
use std::fmt;

/// Decides whether an error text counts as a breaker failure
#[derive(Debug, Clone)]
pub struct ErrorMatcher {
    set: Option<RegexSet>,
}

impl ErrorMatcher {
    /// Compile case-insensitive patterns. An empty list matches every error.
    pub fn new(patterns: &[String]) -> Result<Self> {
        if patterns.is_empty() {
            return Ok(Self { set: None });
        }
        let set = RegexSetBuilder::new(patterns)
            .case_insensitive(true)
            .build()
            .map_err(|e| GuardError::config(format!("invalid error pattern: {e}")))?;
        Ok(Self { set: Some(set) })
    }

    /// True when `text` should count as a failure
    pub fn is_failure(&self, text: &str) -> bool {
        match &self.set {
            Some(set) => set.is_match(text),
            None => true,
        }
    }
}

/// Broad category of a matched failure
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCategory {
    /// Timeouts and deadline errors
    Timeout,
    /// Refused or dropped connections
    Connection,
    /// Rejected credentials or API keys
    Authentication,
    /// Series or key limits hit downstream
    Cardinality,
    /// Rate limits and quotas
    RateLimit,
    /// Out of memory
    Memory,
    /// Disk full or I/O failures
    Disk,
    /// Matched a pattern but no category
    Other,
}

/// Number of error categories
pub const CATEGORY_COUNT: usize = 8;

impl ErrorCategory {
    /// Every category, in display order
    pub const ALL: [ErrorCategory; CATEGORY_COUNT] = [
        ErrorCategory::Timeout,
        ErrorCategory::Connection,
        ErrorCategory::Authentication,
        ErrorCategory::Cardinality,
        ErrorCategory::RateLimit,
        ErrorCategory::Memory,
        ErrorCategory::Disk,
        ErrorCategory::Other,
    ];

    /// Classify error text by well-known keywords
    pub fn classify(text: &str) -> Self {
        let lower = text.to_ascii_lowercase();
        let has = |needles: &[&str]| needles.iter().any(|n| lower.contains(n));

        if has(&["timeout", "timed out", "deadline exceeded"]) {
            ErrorCategory::Timeout
        } else if has(&["connection", "connect", "broken pipe", "reset by peer"]) {
            ErrorCategory::Connection
        } else if has(&["auth", "api-key", "api key", "permission denied", "unauthorized", "forbidden"]) {
            ErrorCategory::Authentication
        } else if has(&["cardinality", "unique time series", "nrintegrationerror"]) {
            ErrorCategory::Cardinality
        } else if has(&["rate limit", "quota exceeded", "too many requests", "throttl"]) {
            ErrorCategory::RateLimit
        } else if has(&["out of memory", "memory"]) {
            ErrorCategory::Memory
        } else if has(&["disk", "no space left"]) {
            ErrorCategory::Disk
        } else {
            ErrorCategory::Other
        }
    }

    /// Index into a per-category counter array
    pub fn index(self) -> usize {
        self as usize
    }
}

impl fmt::Display for ErrorCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ErrorCategory::Timeout => "timeout",
            ErrorCategory::Connection => "connection",
            ErrorCategory::Authentication => "authentication",
            ErrorCategory::Cardinality => "cardinality",
            ErrorCategory::RateLimit => "rate_limit",
            ErrorCategory::Memory => "memory",
            ErrorCategory::Disk => "disk",
            ErrorCategory::Other => "other",
        };
        f.write_str(s)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_patterns_are_case_insensitive() {
        let matcher = ErrorMatcher::new(&["rate limit".to_string(), "NrIntegrationError".to_string()]).unwrap();
        assert!(matcher.is_failure("429: Rate Limit reached"));
        assert!(matcher.is_failure("nrintegrationerror: too many attributes"));
        assert!(!matcher.is_failure("syntax error at or near SELECT"));
    }

    #[test]
    fn test_empty_patterns_match_everything() {
        let matcher = ErrorMatcher::new(&[]).unwrap();
        assert!(matcher.is_failure("anything"));
    }

    #[test]
    fn test_invalid_pattern() {
        assert!(ErrorMatcher::new(&["(".to_string()]).is_err());
    }

    #[test]
    fn test_classification() {
        assert_eq!(ErrorCategory::classify("query timed out after 30s"), ErrorCategory::Timeout);
        assert_eq!(ErrorCategory::classify("connection refused"), ErrorCategory::Connection);
        assert_eq!(ErrorCategory::classify("invalid api-key"), ErrorCategory::Authentication);
        assert_eq!(ErrorCategory::classify("unique time series limit"), ErrorCategory::Cardinality);
        assert_eq!(ErrorCategory::classify("quota exceeded"), ErrorCategory::RateLimit);
        assert_eq!(ErrorCategory::classify("out of memory"), ErrorCategory::Memory);
        assert_eq!(ErrorCategory::classify("no space left on device"), ErrorCategory::Disk);
        assert_eq!(ErrorCategory::classify("boom"), ErrorCategory::Other);
    }
}
