//! Per-resource circuit breaker.
//!
//! Each resource (database) gets its own Closed/Open/HalfOpen state machine
//! and bounded key tracking. The registry is a `DashMap` of per-resource
//! mutexes: records for different resources never contend, and records for
//! the same resource serialize only on that resource's lock.

pub mod classify;
pub mod state;

pub use classify::{ErrorCategory, ErrorMatcher};
pub use state::{CircuitState, RejectReason, ResourceBreaker, Transition};

use crate::core::{attrs, BreakerConfig, ResourceId, Result, TelemetryRecord};
use crate::monitoring::{Counter, GuardStats};
use crate::pipeline::{BreakerEvent, OutputQueue, OutputRecord, OverflowEvent};
use crate::tracking::{stable_hash, Dimension};
use dashmap::DashMap;
use parking_lot::Mutex;
use serde::Serialize;
use std::sync::Arc;
use std::time::{Duration, Instant, SystemTime};
use tracing::{debug, info, warn};

/// Result of gating one record
#[derive(Debug, Clone, PartialEq)]
pub struct Admission {
    /// Whether the record may continue
    pub allowed: bool,
    /// Resource state after the decision
    pub state: CircuitState,
    /// Set when `allowed` is false
    pub reason: Option<RejectReason>,
    /// Dimensions whose key was coalesced into overflow
    pub overflow: Vec<Dimension>,
}

/// How a reported outcome was interpreted
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutcomeClass {
    /// The operation succeeded
    Success,
    /// Matched a failure pattern
    Failure(ErrorCategory),
    /// Error text matched no pattern; breaker state untouched
    Ignored,
}

/// Serializable view of one resource
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ResourceHealth {
    /// Resource the view belongs to
    pub resource: ResourceId,
    /// Current state
    pub state: CircuitState,
    /// Failures inside the current window
    pub failure_count: u32,
    /// Consecutive half-open successes
    pub success_count: u32,
    /// Current open duration
    pub backoff_ms: u64,
    /// Time since the breaker opened
    pub open_for_ms: Option<u64>,
    /// Distinct query ids in the current window
    pub distinct_queries: usize,
    /// Distinct users in the current window
    pub distinct_users: usize,
    /// Matched failures per category
    pub errors: Vec<(ErrorCategory, u64)>,
}

/// Registry of per-resource breakers
pub struct CircuitBreaker {
    config: BreakerConfig,
    matcher: ErrorMatcher,
    resources: DashMap<ResourceId, Arc<Mutex<ResourceBreaker>>>,
    stats: Arc<GuardStats>,
    events: Option<OutputQueue>,
    query_attribute: String,
}

impl CircuitBreaker {
    /// Create a breaker from validated configuration
    pub fn new(config: &BreakerConfig) -> Result<Self> {
        Self::with_stats(config, Arc::new(GuardStats::new()))
    }

    /// Create a breaker reporting into shared counters
    pub fn with_stats(config: &BreakerConfig, stats: Arc<GuardStats>) -> Result<Self> {
        config.validate()?;
        Ok(Self {
            matcher: ErrorMatcher::new(&config.error_patterns)?,
            config: config.clone(),
            resources: DashMap::new(),
            stats,
            events: None,
            query_attribute: attrs::QUERY_ID.to_string(),
        })
    }

    /// Track query cardinality on `attribute` instead of the default query id
    pub fn with_query_attribute(mut self, attribute: &str) -> Self {
        self.query_attribute = attribute.to_string();
        self
    }

    /// Emit transitions and overflow events into `queue`
    pub fn with_events(mut self, queue: OutputQueue) -> Self {
        self.events = Some(queue);
        self
    }

    fn entry(&self, resource: &ResourceId, now: Instant) -> Arc<Mutex<ResourceBreaker>> {
        if let Some(existing) = self.resources.get(resource) {
            return Arc::clone(existing.value());
        }
        let created = Arc::clone(
            self.resources
                .entry(resource.clone())
                .or_insert_with(|| Arc::new(Mutex::new(ResourceBreaker::new(&self.config, now))))
                .value(),
        );
        if self.resources.len() > self.config.max_resources {
            self.evict_least_recent(resource);
        }
        created
    }

    /// Drop the least recently seen resource other than `keep`
    fn evict_least_recent(&self, keep: &ResourceId) {
        let victim = self
            .resources
            .iter()
            .filter(|e| e.key() != keep)
            .filter_map(|e| e.value().try_lock().map(|b| (e.key().clone(), b.last_seen())))
            .min_by_key(|(_, seen)| *seen)
            .map(|(id, _)| id);
        if let Some(id) = victim {
            self.resources.remove(&id);
            debug!(resource = %id, "evicted idle resource from breaker registry");
        }
    }

    /// Gate a record for `resource` now
    pub fn admit(&self, resource: &ResourceId, record: &mut TelemetryRecord) -> Admission {
        self.admit_at(resource, record, Instant::now())
    }

    /// Gate a record for `resource`. Allowed records have over-limit
    /// query and user keys replaced by the overflow marker.
    pub fn admit_at(
        &self,
        resource: &ResourceId,
        record: &mut TelemetryRecord,
        now: Instant,
    ) -> Admission {
        let handle = self.entry(resource, now);
        let mut breaker = handle.lock();

        if let Some(t) = breaker.poll_at(&self.config, now) {
            self.on_transition(resource, t);
        }

        if let Err(reason) = breaker.admit_at(&self.config, now) {
            self.stats.incr(Counter::CircuitRejected);
            return Admission {
                allowed: false,
                state: breaker.state(),
                reason: Some(reason),
                overflow: Vec::new(),
            };
        }

        let mut overflow = Vec::new();
        for (dimension, key, limit) in [
            (Dimension::Queries, self.query_attribute.as_str(), self.config.max_unique_queries),
            (Dimension::Users, attrs::USER_ID, self.config.max_unique_users),
        ] {
            let Some(value) = record.attr_text(key) else {
                continue;
            };
            if value == attrs::OVERFLOW_VALUE {
                continue;
            }
            let admission = breaker.observe_key_at(dimension, stable_hash(&[&value]), now);
            if let crate::tracking::KeyAdmission::Overflow { first } = admission {
                record.set_attr(key, attrs::OVERFLOW_VALUE);
                record.set_attr(attrs::CARDINALITY_OVERFLOW, true);
                self.stats.incr(Counter::OverflowCoalesced);
                overflow.push(dimension);
                if first {
                    warn!(resource = %resource, %dimension, limit, "cardinality limit reached, coalescing new keys");
                    self.emit(OutputRecord::CardinalityOverflow(OverflowEvent {
                        resource: resource.clone(),
                        dimension,
                        limit,
                        timestamp: SystemTime::now(),
                    }));
                }
            }
        }

        let state = breaker.state();
        if state != CircuitState::Closed {
            record.set_attr(attrs::CIRCUIT_STATE, state.to_string());
        }
        Admission {
            allowed: true,
            state,
            reason: None,
            overflow,
        }
    }

    /// Report the outcome of processing or exporting data for `resource`
    pub fn report_outcome(&self, resource: &ResourceId, success: bool, error_text: &str) -> OutcomeClass {
        self.report_outcome_at(resource, success, error_text, Instant::now())
    }

    /// Report an outcome at an explicit instant
    pub fn report_outcome_at(
        &self,
        resource: &ResourceId,
        success: bool,
        error_text: &str,
        now: Instant,
    ) -> OutcomeClass {
        if !success && !self.matcher.is_failure(error_text) {
            self.stats.incr(Counter::FailuresIgnored);
            debug!(resource = %resource, error = error_text, "error matched no failure pattern");
            return OutcomeClass::Ignored;
        }

        let handle = self.entry(resource, now);
        let mut breaker = handle.lock();
        if let Some(t) = breaker.poll_at(&self.config, now) {
            self.on_transition(resource, t);
        }

        let (class, transition) = if success {
            (OutcomeClass::Success, breaker.record_success_at(&self.config, now))
        } else {
            let category = ErrorCategory::classify(error_text);
            self.stats.incr(Counter::FailuresCounted);
            (
                OutcomeClass::Failure(category),
                breaker.record_failure_at(&self.config, category, now),
            )
        };
        if let Some(t) = transition {
            self.on_transition(resource, t);
        }
        class
    }

    fn on_transition(&self, resource: &ResourceId, t: Transition) {
        self.stats.incr(Counter::BreakerTransitions);
        match t.to {
            CircuitState::Open => warn!(
                resource = %resource,
                from = %t.from,
                failures = t.failures,
                backoff = ?t.backoff,
                "circuit opened"
            ),
            CircuitState::HalfOpen => info!(resource = %resource, "circuit half-open, admitting trial records"),
            CircuitState::Closed => info!(resource = %resource, "circuit closed"),
        }
        self.emit(OutputRecord::BreakerTransition(BreakerEvent {
            resource: resource.clone(),
            from: t.from,
            to: t.to,
            backoff_ms: duration_ms(t.backoff),
            failures: t.failures,
            timestamp: SystemTime::now(),
        }));
    }

    fn emit(&self, record: OutputRecord) {
        if let Some(queue) = &self.events {
            queue.try_emit(record);
        }
    }

    /// Current state of `resource`, if tracked
    pub fn state(&self, resource: &ResourceId) -> Option<CircuitState> {
        self.resources.get(resource).map(|b| b.value().lock().state())
    }

    /// Health view of one resource at `now`
    pub fn health_at(&self, resource: &ResourceId, now: Instant) -> Option<ResourceHealth> {
        let handle = Arc::clone(self.resources.get(resource)?.value());
        let breaker = handle.lock();
        Some(ResourceHealth {
            resource: resource.clone(),
            state: breaker.state(),
            failure_count: breaker.failure_count(),
            success_count: breaker.success_count(),
            backoff_ms: duration_ms(breaker.current_backoff()),
            open_for_ms: breaker
                .opened_at()
                .filter(|_| breaker.state() == CircuitState::Open)
                .map(|at| duration_ms(now.saturating_duration_since(at))),
            distinct_queries: breaker.distinct(Dimension::Queries),
            distinct_users: breaker.distinct(Dimension::Users),
            errors: breaker.error_counts(),
        })
    }

    /// Health of every tracked resource, sorted by resource id
    pub fn snapshot(&self) -> Vec<ResourceHealth> {
        let now = Instant::now();
        let ids: Vec<ResourceId> = self.resources.iter().map(|e| e.key().clone()).collect();
        let mut out: Vec<ResourceHealth> =
            ids.iter().filter_map(|id| self.health_at(id, now)).collect();
        out.sort_by(|a, b| a.resource.cmp(&b.resource));
        out
    }

    /// Number of tracked resources
    pub fn tracked(&self) -> usize {
        self.resources.len()
    }

    /// Number of resources not in Closed state
    pub fn not_closed(&self) -> usize {
        self.resources
            .iter()
            .filter(|e| e.value().lock().state() != CircuitState::Closed)
            .count()
    }
}

fn duration_ms(d: Duration) -> u64 {
    u64::try_from(d.as_millis()).unwrap_or(u64::MAX)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config() -> BreakerConfig {
        BreakerConfig {
            failure_threshold: 5,
            success_threshold: 2,
            timeout: Duration::from_secs(30),
            half_open_max_requests: 4,
            max_unique_queries: 3,
            max_unique_users: 2,
            ..BreakerConfig::default()
        }
    }

    fn id(name: &str) -> ResourceId {
        ResourceId::new(name).unwrap()
    }

    fn record(query: &str) -> TelemetryRecord {
        TelemetryRecord::new("db.query").with_attr(attrs::QUERY_ID, query)
    }

    #[test]
    fn test_custom_query_attribute_is_bounded() {
        let breaker = CircuitBreaker::new(&config()).unwrap().with_query_attribute("statement.hash");
        let db = id("db1");
        let now = Instant::now();

        let overflowed = (0..6)
            .filter(|i| {
                let mut r = TelemetryRecord::new("db.query").with_attr("statement.hash", format!("h{i}"));
                !breaker.admit_at(&db, &mut r, now).overflow.is_empty()
            })
            .count();
        assert_eq!(overflowed, 3);
        assert_eq!(breaker.health_at(&db, now).unwrap().distinct_queries, 3);
    }

    #[test]
    fn test_five_failures_open_only_that_resource() {
        let breaker = CircuitBreaker::new(&config()).unwrap();
        let now = Instant::now();
        let (db1, db2) = (id("db1"), id("db2"));

        assert!(breaker.admit_at(&db2, &mut record("q"), now).allowed);
        for _ in 0..5 {
            breaker.report_outcome_at(&db1, false, "NrIntegrationError: too many series", now);
        }

        assert_eq!(breaker.state(&db1), Some(CircuitState::Open));
        assert_eq!(breaker.state(&db2), Some(CircuitState::Closed));
        let rejected = breaker.admit_at(&db1, &mut record("q"), now);
        assert!(!rejected.allowed);
        assert_eq!(rejected.reason, Some(RejectReason::CircuitOpen));
        assert!(breaker.admit_at(&db2, &mut record("q"), now).allowed);
    }

    #[test]
    fn test_unmatched_errors_are_ignored() {
        let breaker = CircuitBreaker::new(&config()).unwrap();
        let now = Instant::now();
        let db = id("db1");
        for _ in 0..20 {
            assert_eq!(
                breaker.report_outcome_at(&db, false, "syntax error at or near FROM", now),
                OutcomeClass::Ignored
            );
        }
        assert!(breaker.state(&db).is_none());
    }

    #[test]
    fn test_rejected_until_timeout_then_recovers() {
        let cfg = config();
        let breaker = CircuitBreaker::new(&cfg).unwrap();
        let now = Instant::now();
        let db = id("db1");
        for _ in 0..5 {
            breaker.report_outcome_at(&db, false, "connection refused", now);
        }

        let almost = now + cfg.timeout - Duration::from_millis(1);
        assert!(!breaker.admit_at(&db, &mut record("q"), almost).allowed);

        let after = now + cfg.timeout;
        let trial = breaker.admit_at(&db, &mut record("q"), after);
        assert!(trial.allowed);
        assert_eq!(trial.state, CircuitState::HalfOpen);

        breaker.report_outcome_at(&db, true, "", after);
        breaker.report_outcome_at(&db, true, "", after);
        assert_eq!(breaker.state(&db), Some(CircuitState::Closed));
        let health = breaker.health_at(&db, after).unwrap();
        assert_eq!(health.failure_count, 0);
        assert_eq!(health.success_count, 0);
    }

    #[test]
    fn test_query_cardinality_overflow_is_coalesced() {
        let breaker = CircuitBreaker::new(&config()).unwrap();
        let now = Instant::now();
        let db = id("db1");

        for q in ["a", "b", "c"] {
            let admission = breaker.admit_at(&db, &mut record(q), now);
            assert!(admission.overflow.is_empty());
        }
        let mut fourth = record("d");
        let admission = breaker.admit_at(&db, &mut fourth, now);
        assert!(admission.allowed);
        assert_eq!(admission.overflow, vec![Dimension::Queries]);
        assert_eq!(fourth.attr_text(attrs::QUERY_ID).as_deref(), Some(attrs::OVERFLOW_VALUE));
        assert_eq!(breaker.health_at(&db, now).unwrap().distinct_queries, 3);
    }

    #[tokio::test]
    async fn test_transitions_and_overflow_are_emitted() {
        let stats = Arc::new(GuardStats::new());
        let (queue, mut rx) = OutputQueue::bounded(16, Arc::clone(&stats));
        let breaker = CircuitBreaker::with_stats(&config(), Arc::clone(&stats))
            .unwrap()
            .with_events(queue);
        let now = Instant::now();
        let db = id("db1");

        for q in ["a", "b", "c", "d", "e"] {
            breaker.admit_at(&db, &mut record(q), now);
        }
        for _ in 0..5 {
            breaker.report_outcome_at(&db, false, "timeout", now);
        }

        match rx.recv().await.unwrap() {
            OutputRecord::CardinalityOverflow(e) => assert_eq!(e.dimension, Dimension::Queries),
            other => panic!("unexpected record {other:?}"),
        }
        match rx.recv().await.unwrap() {
            OutputRecord::BreakerTransition(e) => {
                assert_eq!((e.from, e.to), (CircuitState::Closed, CircuitState::Open));
                assert_eq!(e.backoff_ms, 30_000);
            },
            other => panic!("unexpected record {other:?}"),
        }
        assert!(rx.try_recv().is_err(), "overflow is reported once per window");
        assert_eq!(stats.get(Counter::OverflowCoalesced), 2);
        assert_eq!(stats.get(Counter::BreakerTransitions), 1);
    }

    #[test]
    fn test_registry_is_bounded() {
        let cfg = BreakerConfig {
            max_resources: 2,
            ..config()
        };
        let breaker = CircuitBreaker::new(&cfg).unwrap();
        let now = Instant::now();
        breaker.admit_at(&id("a"), &mut record("q"), now);
        breaker.admit_at(&id("b"), &mut record("q"), now + Duration::from_secs(1));
        breaker.admit_at(&id("c"), &mut record("q"), now + Duration::from_secs(2));

        assert_eq!(breaker.tracked(), 2);
        assert!(breaker.state(&id("a")).is_none());
    }
}
