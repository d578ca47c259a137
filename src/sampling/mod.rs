//! Record-level adaptive sampling.
//!
//! Every record is matched against priority-ordered rules, fingerprinted and
//! decided by a deterministic draw. Verdicts are cached per fingerprint so
//! that one logical query is never split across keep and drop.

pub mod adaptive;
pub mod dedup;
pub mod rules;

pub use adaptive::AdaptiveSampler;
pub use dedup::Deduplicator;
pub use rules::{CompiledRule, MinuteLimiter, RuleSet};

use crate::core::{attrs, TelemetryRecord};
use serde::Serialize;
use std::sync::Arc;

/// Rule name used when no rule matches
pub const DEFAULT_RULE: &str = "default";

/// Why a record was dropped by the sampler
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum DropReason {
    /// The deterministic draw exceeded the applied rate
    Sampled,
    /// The matched rule exhausted its per-minute budget
    RateLimited,
    /// Same plan hash kept recently
    Duplicate,
}

/// Sampler verdict for a single record
#[derive(Debug, Clone, PartialEq)]
pub struct Verdict {
    /// Whether the record continues downstream
    pub keep: bool,
    /// Rate the decision was drawn against
    pub applied_rate: f64,
    /// Matched rule, or [`DEFAULT_RULE`]
    pub rule: Arc<str>,
    /// Served from the decision cache
    pub cached: bool,
    /// Set when `keep` is false
    pub reason: Option<DropReason>,
}

impl Verdict {
    /// Rate-correction weight for numeric telemetry: `1 / applied_rate`
    pub fn weight(&self) -> Option<f64> {
        (self.keep && self.applied_rate > 0.0).then(|| 1.0 / self.applied_rate)
    }

    /// Write sampling annotations onto a kept record
    pub fn annotate(&self, record: &mut TelemetryRecord) {
        if !self.keep {
            return;
        }
        record.set_attr(attrs::SAMPLING_RATE, self.applied_rate);
        if let Some(weight) = self.weight() {
            record.set_attr(attrs::SAMPLING_WEIGHT, weight);
        }
        record.set_attr(attrs::SAMPLING_RULE, self.rule.as_ref());
    }
}
