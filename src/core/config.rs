//! Configuration management for dbwarden.
//!
//! This module provides configuration handling with:
//! - YAML file support
//! - CLI argument overrides (through [`ConfigBuilder`])
//! - Validation and defaults
//!
//! A validated [`Config`] is an immutable snapshot: components copy what
//! they need at construction and never re-read it.

use crate::core::types::{attrs, AttributeValue};
use crate::core::{GuardError, Result};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::path::Path;
use std::time::Duration;

/// Complete configuration for dbwarden
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Record-level adaptive sampler
    pub sampler: SamplerConfig,
    /// Resource-level circuit breaker
    pub circuit_breaker: BreakerConfig,
    /// Active session history sampler
    pub ash: AshConfig,
    /// Output queue and pipeline wiring
    pub pipeline: PipelineConfig,
    /// Logging configuration
    pub logging: LoggingConfig,
    /// Debug mode
    #[serde(skip)]
    pub debug: bool,
}

/// Adaptive sampler configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SamplerConfig {
    /// Rate applied when no rule matches (0.0 to 1.0)
    pub default_sampling_rate: f64,
    /// How long a cached verdict stays sticky
    #[serde(with = "humantime_serde")]
    pub cache_ttl: Duration,
    /// Maximum number of cached verdicts before LRU eviction
    pub max_cache_size: usize,
    /// Number of independently locked cache shards
    pub cache_shards: usize,
    /// Attribute holding the resource id
    pub resource_attribute: String,
    /// Attribute holding the query id
    pub query_attribute: String,
    /// Distinct query ids per resource that get their own fingerprint
    pub max_fingerprint_queries: usize,
    /// Window over which fingerprint query ids are counted
    #[serde(with = "humantime_serde")]
    pub fingerprint_window: Duration,
    /// Ordered sampling rules
    pub rules: Vec<RuleConfig>,
    /// Plan-hash deduplication
    pub deduplication: DeduplicationConfig,
}

/// One sampling rule as written in configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RuleConfig {
    /// Unique rule name
    pub name: String,
    /// Condition expression, e.g. `duration_ms > 1000 && db.name = "orders"`
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub condition: Option<String>,
    /// Structured conditions, AND-ed with `condition`
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub conditions: Vec<ConditionConfig>,
    /// Sampling rate for matching records (0.0 to 1.0)
    #[serde(alias = "sample_rate")]
    pub rate: f64,
    /// Higher priority rules are evaluated first
    #[serde(default)]
    pub priority: i32,
    /// Upper bound on records kept by this rule per minute
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_per_minute: Option<u32>,
}

/// Structured attribute condition
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConditionConfig {
    /// Attribute name
    pub attribute: String,
    /// Comparison operator
    pub operator: ConditionOperator,
    /// Comparison value; unused for `exists`
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub value: Option<AttributeValue>,
}

/// Operators available to structured conditions
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConditionOperator {
    /// Equal
    Eq,
    /// Not equal
    Ne,
    /// Greater than
    Gt,
    /// Greater than or equal
    Gte,
    /// Less than
    Lt,
    /// Less than or equal
    Lte,
    /// Substring match on the text form
    Contains,
    /// Attribute present; `value` is ignored
    Exists,
}

/// Plan-hash deduplication configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DeduplicationConfig {
    /// Enable deduplication
    pub enabled: bool,
    /// Attribute holding the hash to deduplicate on
    pub hash_attribute: String,
    /// A repeated hash within this window is dropped
    #[serde(with = "humantime_serde")]
    pub window: Duration,
    /// Maximum remembered hashes
    pub max_entries: usize,
}

/// Circuit breaker configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BreakerConfig {
    /// Matching failures within the window that open the circuit
    pub failure_threshold: u32,
    /// Consecutive half-open successes that close the circuit
    pub success_threshold: u32,
    /// Open duration on the first trip
    #[serde(with = "humantime_serde")]
    pub timeout: Duration,
    /// Backoff growth on repeat trips
    pub backoff_multiplier: f64,
    /// Upper bound on the open duration
    #[serde(with = "humantime_serde")]
    pub max_backoff: Duration,
    /// Trial records admitted while half-open
    pub half_open_max_requests: u32,
    /// Rolling failure window, also the cardinality window
    #[serde(with = "humantime_serde")]
    pub window_duration: Duration,
    /// Distinct query ids tracked per resource per window
    pub max_unique_queries: usize,
    /// Distinct users tracked per resource per window
    pub max_unique_users: usize,
    /// Case-insensitive regexes; an error counts as a failure only on match
    pub error_patterns: Vec<String>,
    /// Maximum tracked resources before LRU eviction
    pub max_resources: usize,
}

/// Active session history configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AshConfig {
    /// Enable the ASH sampler
    pub enabled: bool,
    /// Time between capture cycles
    #[serde(with = "humantime_serde")]
    pub collection_interval: Duration,
    /// Upper bound on a single capture
    #[serde(with = "humantime_serde")]
    pub capture_timeout: Duration,
    /// Adaptive rate parameters
    pub sampling: AshSamplingConfig,
    /// Maximum samples held in the ring buffer
    pub buffer_size: usize,
    /// Maximum sample age in the ring buffer
    #[serde(with = "humantime_serde")]
    pub retention_duration: Duration,
    /// Rolling aggregation windows
    #[serde(with = "duration_list")]
    pub aggregation_windows: Vec<Duration>,
    /// Sessions active longer than this are always sampled
    #[serde(with = "humantime_serde")]
    pub slow_query_threshold: Duration,
    /// Lock waits longer than this count as blocked
    #[serde(with = "humantime_serde")]
    pub blocked_session_threshold: Duration,
    /// Query text kept per sample, in characters
    pub query_prefix_len: usize,
    /// Distinct wait events tracked per window
    pub max_wait_keys: usize,
    /// How often window aggregates are emitted downstream
    #[serde(with = "humantime_serde")]
    pub emit_interval: Duration,
    /// How often database features are re-probed
    #[serde(with = "humantime_serde")]
    pub feature_refresh_interval: Duration,
    /// Wait-event anomaly detection
    pub anomaly: AnomalyConfig,
}

/// ASH adaptive rate parameters
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AshSamplingConfig {
    /// Rate under light load
    pub base_rate: f64,
    /// Lower bound on the rate
    pub min_rate: f64,
    /// Upper bound on the rate
    pub max_rate: f64,
    /// Session count where the rate starts to fall
    pub low_session_threshold: usize,
    /// Session count where the rate reaches its floor
    pub high_session_threshold: usize,
    /// Always capture blocked sessions
    pub always_sample_blocked: bool,
    /// Always capture long-running sessions
    pub always_sample_long_running: bool,
    /// Always capture maintenance operations
    pub always_sample_maintenance: bool,
    /// Weight of the newly computed rate against the previous one, in (0, 1];
    /// 1.0 disables smoothing
    pub rate_smoothing: f64,
}

/// Wait-event anomaly detection configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AnomalyConfig {
    /// Enable anomaly flags
    pub enabled: bool,
    /// Observed value must exceed baseline by this factor
    pub threshold_multiple: f64,
    /// Completed windows forming the baseline
    pub baseline_windows: usize,
    /// Minimum observations before a key can be flagged
    pub min_samples: u64,
}

/// Pipeline configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineConfig {
    /// Capacity of the outbound queue
    pub output_queue_capacity: usize,
    /// Feed breaker outcomes from records carrying the error flag
    pub report_record_errors: bool,
    /// How often a stats record is emitted by long-running drivers
    #[serde(with = "humantime_serde")]
    pub stats_interval: Duration,
}

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Default log level when RUST_LOG is unset
    pub level: LogLevel,
    /// Include targets, thread ids and line numbers in log lines
    pub structured: bool,
}

/// Log levels
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    /// Most verbose
    Trace,
    /// Per-cycle and per-decision detail
    Debug,
    /// Lifecycle events and transitions
    Info,
    /// Degradation and dropped data
    Warn,
    /// Unexpected failures only
    Error,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            sampler: SamplerConfig::default(),
            circuit_breaker: BreakerConfig::default(),
            ash: AshConfig::default(),
            pipeline: PipelineConfig::default(),
            logging: LoggingConfig::default(),
            debug: false,
        }
    }
}

impl Default for SamplerConfig {
    fn default() -> Self {
        SamplerConfig {
            default_sampling_rate: 0.1,
            cache_ttl: Duration::from_secs(300),
            max_cache_size: 100_000,
            cache_shards: 16,
            resource_attribute: attrs::RESOURCE_ID.to_string(),
            query_attribute: attrs::QUERY_ID.to_string(),
            max_fingerprint_queries: 10_000,
            fingerprint_window: Duration::from_secs(300),
            rules: vec![
                RuleConfig {
                    name: "critical_queries".to_string(),
                    condition: Some("duration_ms > 1000".to_string()),
                    conditions: Vec::new(),
                    rate: 1.0,
                    priority: 100,
                    max_per_minute: None,
                },
                RuleConfig {
                    name: "errors".to_string(),
                    condition: Some("error == true".to_string()),
                    conditions: Vec::new(),
                    rate: 1.0,
                    priority: 90,
                    max_per_minute: None,
                },
                RuleConfig {
                    name: "high_frequency".to_string(),
                    condition: Some("execution_count > 1000".to_string()),
                    conditions: Vec::new(),
                    rate: 0.01,
                    priority: 10,
                    max_per_minute: Some(10),
                },
            ],
            deduplication: DeduplicationConfig::default(),
        }
    }
}

impl Default for DeduplicationConfig {
    fn default() -> Self {
        DeduplicationConfig {
            enabled: false,
            hash_attribute: attrs::PLAN_HASH.to_string(),
            window: Duration::from_secs(300),
            max_entries: 10_000,
        }
    }
}

impl Default for BreakerConfig {
    fn default() -> Self {
        BreakerConfig {
            failure_threshold: 5,
            success_threshold: 3,
            timeout: Duration::from_secs(30),
            backoff_multiplier: 2.0,
            max_backoff: Duration::from_secs(600),
            half_open_max_requests: 10,
            window_duration: Duration::from_secs(60),
            max_unique_queries: 10_000,
            max_unique_users: 1_000,
            error_patterns: vec![
                "cardinality".to_string(),
                "NrIntegrationError".to_string(),
                "api-key".to_string(),
                "rate limit".to_string(),
                "quota exceeded".to_string(),
                "unique time series".to_string(),
                "timeout".to_string(),
                "connection refused".to_string(),
            ],
            max_resources: 10_000,
        }
    }
}

impl Default for AshConfig {
    fn default() -> Self {
        AshConfig {
            enabled: true,
            collection_interval: Duration::from_secs(1),
            capture_timeout: Duration::from_millis(800),
            sampling: AshSamplingConfig::default(),
            buffer_size: 10_000,
            retention_duration: Duration::from_secs(3600),
            aggregation_windows: vec![
                Duration::from_secs(60),
                Duration::from_secs(300),
                Duration::from_secs(900),
                Duration::from_secs(3600),
            ],
            slow_query_threshold: Duration::from_secs(1),
            blocked_session_threshold: Duration::from_secs(5),
            query_prefix_len: 100,
            max_wait_keys: 500,
            emit_interval: Duration::from_secs(60),
            feature_refresh_interval: Duration::from_secs(300),
            anomaly: AnomalyConfig::default(),
        }
    }
}

impl Default for AshSamplingConfig {
    fn default() -> Self {
        AshSamplingConfig {
            base_rate: 1.0,
            min_rate: 0.1,
            max_rate: 1.0,
            low_session_threshold: 50,
            high_session_threshold: 500,
            always_sample_blocked: true,
            always_sample_long_running: true,
            always_sample_maintenance: true,
            rate_smoothing: 1.0,
        }
    }
}

impl Default for AnomalyConfig {
    fn default() -> Self {
        AnomalyConfig {
            enabled: true,
            threshold_multiple: 3.0,
            baseline_windows: 10,
            min_samples: 5,
        }
    }
}

impl Default for PipelineConfig {
    fn default() -> Self {
        PipelineConfig {
            output_queue_capacity: 10_000,
            report_record_errors: true,
            stats_interval: Duration::from_secs(60),
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        LoggingConfig {
            level: LogLevel::Info,
            structured: false,
        }
    }
}

fn check_rate(what: &str, rate: f64) -> Result<()> {
    if !(0.0..=1.0).contains(&rate) {
        return Err(GuardError::config(format!(
            "{what} must be between 0.0 and 1.0, got {rate}"
        )));
    }
    Ok(())
}

fn check_positive(what: &str, value: usize) -> Result<()> {
    if value == 0 {
        return Err(GuardError::config(format!("{what} must be greater than 0")));
    }
    Ok(())
}

fn check_duration(what: &str, value: Duration) -> Result<()> {
    if value.is_zero() {
        return Err(GuardError::config(format!("{what} must be greater than 0")));
    }
    Ok(())
}

impl Config {
    /// Create new config with defaults
    pub fn new() -> Result<Self> {
        let config = Config::default();
        config.validate()?;
        Ok(config)
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<()> {
        self.sampler.validate()?;
        self.circuit_breaker.validate()?;
        self.ash.validate()?;
        check_positive("pipeline.output_queue_capacity", self.pipeline.output_queue_capacity)?;
        check_duration("pipeline.stats_interval", self.pipeline.stats_interval)?;
        Ok(())
    }
}

impl SamplerConfig {
    /// Validate rates, rule names and rule conditions
    pub fn validate(&self) -> Result<()> {
        if !(0.0..=1.0).contains(&self.default_sampling_rate) {
            return Err(GuardError::InvalidSamplingRate(self.default_sampling_rate));
        }
        check_duration("sampler.cache_ttl", self.cache_ttl)?;
        check_positive("sampler.max_cache_size", self.max_cache_size)?;
        check_positive("sampler.cache_shards", self.cache_shards)?;
        check_positive("sampler.max_fingerprint_queries", self.max_fingerprint_queries)?;
        check_duration("sampler.fingerprint_window", self.fingerprint_window)?;
        if self.resource_attribute.is_empty() || self.query_attribute.is_empty() {
            return Err(GuardError::config(
                "sampler.resource_attribute and sampler.query_attribute cannot be empty",
            ));
        }

        let mut names = HashSet::new();
        for rule in &self.rules {
            if rule.name.trim().is_empty() {
                return Err(GuardError::config("sampling rule name cannot be empty"));
            }
            if !names.insert(rule.name.as_str()) {
                return Err(GuardError::config(format!(
                    "duplicate sampling rule name '{}'",
                    rule.name
                )));
            }
            check_rate(&format!("rate of rule '{}'", rule.name), rule.rate)?;
            if rule.max_per_minute == Some(0) {
                return Err(GuardError::config(format!(
                    "max_per_minute of rule '{}' must be greater than 0",
                    rule.name
                )));
            }
            crate::expr::compile_rule_condition(rule)?;
        }

        if self.deduplication.enabled {
            if self.deduplication.hash_attribute.is_empty() {
                return Err(GuardError::config(
                    "sampler.deduplication.hash_attribute cannot be empty",
                ));
            }
            check_duration("sampler.deduplication.window", self.deduplication.window)?;
            check_positive("sampler.deduplication.max_entries", self.deduplication.max_entries)?;
        }
        Ok(())
    }
}

impl BreakerConfig {
    /// Validate thresholds, backoff and error patterns
    pub fn validate(&self) -> Result<()> {
        if self.failure_threshold == 0 {
            return Err(GuardError::config("circuit_breaker.failure_threshold must be greater than 0"));
        }
        if self.success_threshold == 0 {
            return Err(GuardError::config("circuit_breaker.success_threshold must be greater than 0"));
        }
        if self.half_open_max_requests < self.success_threshold {
            return Err(GuardError::config(format!(
                "circuit_breaker.half_open_max_requests ({}) must be at least success_threshold ({})",
                self.half_open_max_requests, self.success_threshold
            )));
        }
        check_duration("circuit_breaker.timeout", self.timeout)?;
        check_duration("circuit_breaker.window_duration", self.window_duration)?;
        if !self.backoff_multiplier.is_finite() || self.backoff_multiplier < 1.0 {
            return Err(GuardError::config(format!(
                "circuit_breaker.backoff_multiplier must be >= 1.0, got {}",
                self.backoff_multiplier
            )));
        }
        if self.max_backoff < self.timeout {
            return Err(GuardError::config(
                "circuit_breaker.max_backoff must be at least circuit_breaker.timeout",
            ));
        }
        check_positive("circuit_breaker.max_unique_queries", self.max_unique_queries)?;
        check_positive("circuit_breaker.max_unique_users", self.max_unique_users)?;
        check_positive("circuit_breaker.max_resources", self.max_resources)?;
        for pattern in &self.error_patterns {
            regex::Regex::new(pattern).map_err(|e| {
                GuardError::config(format!("invalid error pattern '{pattern}': {e}"))
            })?;
        }
        Ok(())
    }
}

impl AshConfig {
    /// Validate rates, thresholds and windows
    pub fn validate(&self) -> Result<()> {
        let s = &self.sampling;
        check_rate("ash.sampling.base_rate", s.base_rate)?;
        check_rate("ash.sampling.min_rate", s.min_rate)?;
        check_rate("ash.sampling.max_rate", s.max_rate)?;
        if s.min_rate > s.max_rate {
            return Err(GuardError::config(format!(
                "ash.sampling.min_rate ({}) cannot exceed max_rate ({})",
                s.min_rate, s.max_rate
            )));
        }
        if !(s.rate_smoothing > 0.0 && s.rate_smoothing <= 1.0) {
            return Err(GuardError::config(format!(
                "ash.sampling.rate_smoothing must be in (0, 1], got {}",
                s.rate_smoothing
            )));
        }
        if s.low_session_threshold >= s.high_session_threshold {
            return Err(GuardError::config(format!(
                "ash.sampling.low_session_threshold ({}) must be below high_session_threshold ({})",
                s.low_session_threshold, s.high_session_threshold
            )));
        }
        check_duration("ash.collection_interval", self.collection_interval)?;
        check_duration("ash.capture_timeout", self.capture_timeout)?;
        check_positive("ash.buffer_size", self.buffer_size)?;
        check_duration("ash.retention_duration", self.retention_duration)?;
        check_positive("ash.query_prefix_len", self.query_prefix_len)?;
        check_positive("ash.max_wait_keys", self.max_wait_keys)?;
        check_duration("ash.emit_interval", self.emit_interval)?;
        check_duration("ash.feature_refresh_interval", self.feature_refresh_interval)?;
        if self.aggregation_windows.is_empty() {
            return Err(GuardError::config("ash.aggregation_windows cannot be empty"));
        }
        for window in &self.aggregation_windows {
            check_duration("ash.aggregation_windows entry", *window)?;
        }
        if self.anomaly.enabled {
            if !self.anomaly.threshold_multiple.is_finite() || self.anomaly.threshold_multiple <= 1.0 {
                return Err(GuardError::config(format!(
                    "ash.anomaly.threshold_multiple must be > 1.0, got {}",
                    self.anomaly.threshold_multiple
                )));
            }
            check_positive("ash.anomaly.baseline_windows", self.anomaly.baseline_windows)?;
        }
        Ok(())
    }
}

impl LogLevel {
    /// Convert to tracing filter string
    pub fn as_str(&self) -> &'static str {
        match self {
            LogLevel::Trace => "trace",
            LogLevel::Debug => "debug",
            LogLevel::Info => "info",
            LogLevel::Warn => "warn",
            LogLevel::Error => "error",
        }
    }
}

/// Configuration builder for programmatic construction
pub struct ConfigBuilder {
    config: Config,
}

impl Default for ConfigBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl ConfigBuilder {
    /// Create a new builder with defaults
    pub fn new() -> Self {
        ConfigBuilder {
            config: Config::default(),
        }
    }

    /// Load configuration from YAML string
    pub fn from_yaml(mut self, yaml: &str) -> Result<Self> {
        self.config = serde_yaml::from_str(yaml)
            .map_err(|e| GuardError::config(format!("Failed to parse YAML config: {e}")))?;
        Ok(self)
    }

    /// Load configuration from a YAML file
    pub fn from_file(self, path: &Path) -> Result<Self> {
        let yaml = std::fs::read_to_string(path)?;
        self.from_yaml(&yaml)
    }

    /// Set the default sampling rate
    pub fn sampling_rate(mut self, rate: f64) -> Self {
        self.config.sampler.default_sampling_rate = rate;
        self
    }

    /// Replace the sampling rules
    pub fn rules(mut self, rules: Vec<RuleConfig>) -> Self {
        self.config.sampler.rules = rules;
        self
    }

    /// Set the breaker failure threshold
    pub fn failure_threshold(mut self, threshold: u32) -> Self {
        self.config.circuit_breaker.failure_threshold = threshold;
        self
    }

    /// Enable or disable the ASH sampler
    pub fn ash_enabled(mut self, enabled: bool) -> Self {
        self.config.ash.enabled = enabled;
        self
    }

    /// Set the ASH collection interval
    pub fn collection_interval(mut self, interval: Duration) -> Self {
        self.config.ash.collection_interval = interval;
        self
    }

    /// Set debug mode
    pub fn debug(mut self, debug: bool) -> Self {
        self.config.debug = debug;
        self
    }

    /// Build and validate the configuration
    pub fn build(self) -> Result<Config> {
        self.config.validate()?;
        Ok(self.config)
    }
}

/// Serde adapter for a list of human-readable durations
mod duration_list {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(value: &[Duration], serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_seq(value.iter().map(|d| humantime_serde::Serde::from(*d)))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<Duration>, D::Error> {
        let raw: Vec<humantime_serde::Serde<Duration>> = Vec::deserialize(deserializer)?;
        Ok(raw.into_iter().map(humantime_serde::Serde::into_inner).collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_default_config_is_valid() {
        let config = Config::default();
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_invalid_sampling_rate() {
        let mut config = Config::default();
        config.sampler.default_sampling_rate = 1.5;
        assert!(matches!(config.validate(), Err(GuardError::InvalidSamplingRate(_))));

        config.sampler.default_sampling_rate = -0.1;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_rule_rate_out_of_range() {
        let mut config = Config::default();
        config.sampler.rules[0].rate = 1.2;
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("critical_queries"));
    }

    #[test]
    fn test_duplicate_rule_names() {
        let mut config = Config::default();
        let dup = config.sampler.rules[0].clone();
        config.sampler.rules.push(dup);
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_bad_condition_fails_validation() {
        let mut config = Config::default();
        config.sampler.rules[0].condition = Some("duration_ms >".to_string());
        assert!(matches!(config.validate(), Err(GuardError::Expression { .. })));
    }

    #[test]
    fn test_breaker_thresholds() {
        let mut config = Config::default();
        config.circuit_breaker.failure_threshold = 0;
        assert!(config.validate().is_err());

        let mut config = Config::default();
        config.circuit_breaker.backoff_multiplier = 0.5;
        assert!(config.validate().is_err());

        let mut config = Config::default();
        config.circuit_breaker.error_patterns = vec!["(unclosed".to_string()];
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_ash_rate_bounds() {
        let mut config = Config::default();
        config.ash.sampling.min_rate = 0.8;
        config.ash.sampling.max_rate = 0.5;
        assert!(config.validate().is_err());

        let mut config = Config::default();
        config.ash.sampling.low_session_threshold = 600;
        assert!(config.validate().is_err());

        let mut config = Config::default();
        config.ash.aggregation_windows.clear();
        assert!(config.validate().is_err());

        for smoothing in [0.0, -0.5, 1.5, f64::NAN] {
            let mut config = Config::default();
            config.ash.sampling.rate_smoothing = smoothing;
            assert!(config.validate().is_err(), "accepted smoothing {smoothing}");
        }
    }

    #[test]
    fn test_config_builder() {
        let config = ConfigBuilder::new()
            .sampling_rate(0.5)
            .failure_threshold(7)
            .collection_interval(Duration::from_millis(500))
            .debug(true)
            .build()
            .unwrap();

        assert_eq!(config.sampler.default_sampling_rate, 0.5);
        assert_eq!(config.circuit_breaker.failure_threshold, 7);
        assert_eq!(config.ash.collection_interval, Duration::from_millis(500));
        assert!(config.debug);
    }

    #[test]
    fn test_yaml_parsing() {
        let yaml = r#"
sampler:
  default_sampling_rate: 0.2
  cache_ttl: 2m
  rules:
    - name: slow
      condition: duration_ms > 1000
      rate: 1.0
      priority: 100
    - name: orders_inserts
      sample_rate: 0.5
      conditions:
        - attribute: db.name
          operator: eq
          value: orders
        - attribute: db.operation
          operator: exists
circuit_breaker:
  failure_threshold: 3
  timeout: 10s
  max_backoff: 5m
ash:
  aggregation_windows: [1m, 5m]
  sampling:
    high_session_threshold: 400
"#;

        let config = ConfigBuilder::new().from_yaml(yaml).unwrap().build().unwrap();

        assert_eq!(config.sampler.default_sampling_rate, 0.2);
        assert_eq!(config.sampler.cache_ttl, Duration::from_secs(120));
        assert_eq!(config.sampler.rules.len(), 2);
        assert_eq!(config.sampler.rules[1].rate, 0.5);
        assert_eq!(config.sampler.rules[1].conditions[0].operator, ConditionOperator::Eq);
        assert_eq!(
            config.sampler.rules[1].conditions[0].value,
            Some(AttributeValue::Str("orders".to_string()))
        );
        assert_eq!(config.circuit_breaker.failure_threshold, 3);
        assert_eq!(config.circuit_breaker.timeout, Duration::from_secs(10));
        assert_eq!(
            config.ash.aggregation_windows,
            vec![Duration::from_secs(60), Duration::from_secs(300)]
        );
        assert_eq!(config.ash.sampling.high_session_threshold, 400);
        assert_eq!(config.ash.sampling.low_session_threshold, 50);
    }

    #[test]
    fn test_yaml_round_trips_defaults() {
        let yaml = serde_yaml::to_string(&Config::default()).unwrap();
        let parsed = ConfigBuilder::new().from_yaml(&yaml).unwrap().build().unwrap();
        assert_eq!(parsed.ash.aggregation_windows, Config::default().ash.aggregation_windows);
        assert_eq!(parsed.sampler.rules, Config::default().sampler.rules);
    }
}
