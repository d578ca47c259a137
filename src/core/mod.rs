//! Core domain types, configuration and errors for dbwarden.
//!
//! Everything else in the crate builds on the record model and the
//! immutable configuration snapshot defined here.

#![warn(missing_docs)]

pub mod config;
pub mod error;
pub mod types;

// Re-export commonly used types
pub use config::{
    AnomalyConfig, AshConfig, AshSamplingConfig, BreakerConfig, ConditionConfig,
    ConditionOperator, Config, ConfigBuilder, DeduplicationConfig, LogLevel, LoggingConfig,
    PipelineConfig, RuleConfig, SamplerConfig,
};
pub use error::{GuardError, Result};
pub use types::{attrs, AttributeValue, ResourceId, TelemetryRecord};
