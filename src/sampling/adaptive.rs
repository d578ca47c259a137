//! Rule-based sampler with sticky, deterministic verdicts.
//!
//! The hot path is lock-light: rule matching is pure, the decision cache
//! locks a single shard and counters are relaxed atomics.

use super::{DropReason, Verdict, DEFAULT_RULE};
use super::dedup::Deduplicator;
use super::rules::RuleSet;
use crate::core::{Result, SamplerConfig, TelemetryRecord};
use crate::monitoring::{Counter, GuardStats};
use crate::tracking::{
    stable_hash, unit_interval, CacheStats, CardinalityTracker, DecisionCache, Dimension,
};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, warn};

/// Evaluations between housekeeping passes
const MAINTENANCE_EVERY: u64 = 8192;

#[derive(Debug, Clone)]
struct CachedVerdict {
    keep: bool,
    applied_rate: f64,
    rule: Arc<str>,
}

/// Adaptive sampler applying rule-based, cardinality-stable decisions
pub struct AdaptiveSampler {
    rules: RuleSet,
    default_rate: f64,
    default_rule: Arc<str>,
    resource_attribute: String,
    query_attribute: String,
    cache: DecisionCache<CachedVerdict>,
    fingerprint_queries: CardinalityTracker,
    dedup: Option<Deduplicator>,
    stats: Arc<GuardStats>,
    evaluations: AtomicU64,
}

impl AdaptiveSampler {
    /// Create a sampler from validated configuration
    pub fn new(config: &SamplerConfig) -> Result<Self> {
        Self::with_stats(config, Arc::new(GuardStats::new()))
    }

    /// Create a sampler reporting into shared counters
    pub fn with_stats(config: &SamplerConfig, stats: Arc<GuardStats>) -> Result<Self> {
        config.validate()?;
        let rules = RuleSet::compile(&config.rules)?;
        if config.default_sampling_rate == 0.0 {
            warn!("default sampling rate is 0; records matching no rule will be dropped");
        }
        debug!(rules = rules.len(), default_rate = config.default_sampling_rate, "sampler configured");

        Ok(Self {
            rules,
            default_rate: config.default_sampling_rate,
            default_rule: Arc::from(DEFAULT_RULE),
            resource_attribute: config.resource_attribute.clone(),
            query_attribute: config.query_attribute.clone(),
            cache: DecisionCache::new(config.max_cache_size, config.cache_shards, config.cache_ttl),
            fingerprint_queries: CardinalityTracker::new(
                config.max_fingerprint_queries,
                config.fingerprint_window,
            ),
            dedup: Deduplicator::from_config(&config.deduplication),
            stats,
            evaluations: AtomicU64::new(0),
        })
    }

    /// Evaluate a record now
    pub fn evaluate(&self, record: &TelemetryRecord) -> Verdict {
        self.evaluate_at(record, Instant::now())
    }

    /// Evaluate a record at an explicit instant
    pub fn evaluate_at(&self, record: &TelemetryRecord, now: Instant) -> Verdict {
        if self.evaluations.fetch_add(1, Ordering::Relaxed) % MAINTENANCE_EVERY == MAINTENANCE_EVERY - 1 {
            self.maintain_at(now);
        }

        let matched = self.rules.first_match(record);
        let (rule_name, rate) = match matched {
            Some(rule) => (&rule.name, rule.rate),
            None => (&self.default_rule, self.default_rate),
        };

        let fingerprint = self.fingerprint_at(record, rule_name, now);
        let (decided, cached) = match self.cache.get_at(fingerprint, now) {
            Some(hit) => (hit, true),
            None => {
                let fresh = CachedVerdict {
                    keep: unit_interval(fingerprint) < rate,
                    applied_rate: rate,
                    rule: Arc::clone(rule_name),
                };
                // A concurrent worker may have inserted first; its value wins.
                match self.cache.get_or_insert_at(fingerprint, fresh.clone(), now) {
                    Some(existing) => (existing, true),
                    None => (fresh, false),
                }
            },
        };

        let mut verdict = Verdict {
            keep: decided.keep,
            applied_rate: decided.applied_rate,
            rule: decided.rule,
            cached,
            reason: (!decided.keep).then_some(DropReason::Sampled),
        };

        if verdict.keep {
            let limited = matched
                .and_then(|rule| rule.limiter.as_ref())
                .is_some_and(|limiter| !limiter.try_acquire_at(now));
            if limited {
                verdict.keep = false;
                verdict.reason = Some(DropReason::RateLimited);
            } else if self
                .dedup
                .as_ref()
                .is_some_and(|d| d.is_duplicate_at(record, now))
            {
                verdict.keep = false;
                verdict.reason = Some(DropReason::Duplicate);
            }
        }

        match verdict.reason {
            None => {},
            Some(DropReason::Sampled) => self.stats.incr(Counter::SampledOut),
            Some(DropReason::RateLimited) => self.stats.incr(Counter::RateLimited),
            Some(DropReason::Duplicate) => self.stats.incr(Counter::Deduplicated),
        }
        verdict
    }

    /// Fingerprint of (resource, rule, query id). Query ids beyond the
    /// per-resource cardinality limit are left out, coalescing them by
    /// resource and rule.
    pub fn fingerprint_at(&self, record: &TelemetryRecord, rule: &str, now: Instant) -> u64 {
        let resource = record.attr_text(&self.resource_attribute).unwrap_or_default();
        let Some(query) = record.attr_text(&self.query_attribute) else {
            return stable_hash(&[&resource, rule]);
        };

        let query_key = stable_hash(&[&query]);
        let admission =
            self.fingerprint_queries
                .observe_at(&resource, Dimension::Queries, query_key, now);
        if admission.is_overflow() {
            stable_hash(&[&resource, rule])
        } else {
            stable_hash(&[&resource, rule, &query])
        }
    }

    /// Purge expired cache entries and idle cardinality windows
    pub fn maintain_at(&self, now: Instant) {
        let expired = self.cache.purge_expired_at(now);
        let idle = self.fingerprint_queries.purge_idle_at(now);
        debug!(expired, idle, "sampler maintenance");
    }

    /// Decision cache counters
    pub fn cache_stats(&self) -> CacheStats {
        self.cache.stats()
    }

    /// Compiled rules in evaluation order
    pub fn rules(&self) -> &RuleSet {
        &self.rules
    }
}
