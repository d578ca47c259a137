//! Crate-wide error type.

use thiserror::Error;

/// Errors raised by dbwarden components
#[derive(Error, Debug)]
pub enum GuardError {
    /// Invalid configuration
    #[error("Configuration error: {0}")]
    Config(String),

    /// Rule condition failed to parse
    #[error("Invalid condition `{input}` at offset {offset}: {message}")]
    Expression {
        /// The condition text
        input: String,
        /// Byte offset where parsing stopped
        offset: usize,
        /// What the parser expected
        message: String,
    },

    /// Rate outside [0, 1]
    #[error("Sampling rate must be between 0.0 and 1.0, got {0}")]
    InvalidSamplingRate(f64),

    /// Session source failed
    #[error("Session capture failed: {0}")]
    Capture(String),

    /// Feature probe failed
    #[error("Feature probe failed: {0}")]
    FeatureProbe(String),

    /// A capture cycle exceeded its deadline
    #[error("Timeout error: operation took longer than {timeout_ms}ms")]
    Timeout {
        /// The deadline that elapsed
        timeout_ms: u64,
    },

    /// The output queue receiver was dropped
    #[error("Output channel closed")]
    ChannelClosed,

    /// Filesystem failure
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// YAML parse or emit failure
    #[error("YAML error: {0}")]
    Yaml(#[from] serde_yaml::Error),

    /// JSON serialization failure
    #[error("Serialization error: {0}")]
    Json(#[from] serde_json::Error),
}

/// Result type alias for admission-control operations
pub type Result<T> = std::result::Result<T, GuardError>;

impl GuardError {
    /// Creates a new configuration error
    pub fn config<S: Into<String>>(msg: S) -> Self {
        Self::Config(msg.into())
    }

    /// Creates a new capture error
    pub fn capture<S: Into<String>>(msg: S) -> Self {
        Self::Capture(msg.into())
    }

    /// Creates a new feature probe error
    pub fn probe<S: Into<String>>(msg: S) -> Self {
        Self::FeatureProbe(msg.into())
    }

    /// Creates a new expression error
    pub fn expression<I: Into<String>, S: Into<String>>(input: I, offset: usize, msg: S) -> Self {
        Self::Expression {
            input: input.into(),
            offset,
            message: msg.into(),
        }
    }

    /// Creates a timeout error from an elapsed bound
    pub fn timeout(bound: std::time::Duration) -> Self {
        Self::Timeout {
            timeout_ms: u64::try_from(bound.as_millis()).unwrap_or(u64::MAX),
        }
    }

    /// Returns true if this error is recoverable
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            Self::Capture(_) | Self::FeatureProbe(_) | Self::Timeout { .. } | Self::ChannelClosed
        )
    }

    /// Returns the error category for metrics/logging
    pub fn category(&self) -> &'static str {
        match self {
            Self::Config(_) | Self::InvalidSamplingRate(_) => "config",
            Self::Expression { .. } => "expression",
            Self::Capture(_) => "capture",
            Self::FeatureProbe(_) => "feature_probe",
            Self::Timeout { .. } => "timeout",
            Self::ChannelClosed => "channel",
            Self::Io(_) => "io",
            Self::Yaml(_) | Self::Json(_) => "serialization",
        }
    }
}
