//! Compiled sampling rules and per-rule rate limits.

use crate::core::{Result, RuleConfig, TelemetryRecord};
use crate::expr::{compile_rule_condition, Condition};
use parking_lot::Mutex;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::warn;

const MINUTE: Duration = Duration::from_secs(60);

/// Fixed-window counter allowing `max` acquisitions per minute
#[derive(Debug)]
pub struct MinuteLimiter {
    max: u32,
    state: Mutex<(Instant, u32)>,
}

impl MinuteLimiter {
    /// Create a limiter whose first window starts at `now`
    pub fn new(max: u32, now: Instant) -> Self {
        Self {
            max,
            state: Mutex::new((now, 0)),
        }
    }

    /// Take one slot if the current minute has room
    pub fn try_acquire_at(&self, now: Instant) -> bool {
        let mut state = self.state.lock();
        if now.saturating_duration_since(state.0) >= MINUTE {
            *state = (now, 0);
        }
        if state.1 < self.max {
            state.1 += 1;
            true
        } else {
            false
        }
    }
}

/// A rule ready for evaluation
#[derive(Debug)]
pub struct CompiledRule {
    /// Rule name, reported in `sampling.rule`
    pub name: Arc<str>,
    /// Expression AND structured conditions
    pub condition: Condition,
    /// Keep probability
    pub rate: f64,
    /// Higher is evaluated first
    pub priority: i32,
    /// Set when the rule has `max_per_minute`
    pub limiter: Option<MinuteLimiter>,
}

impl CompiledRule {
    /// Compile a configured rule. The rate is clamped to [0, 1].
    pub fn compile(config: &RuleConfig, now: Instant) -> Result<Self> {
        let rate = config.rate.clamp(0.0, 1.0);
        if rate == 0.0 {
            warn!(rule = %config.name, "sampling rule has rate 0; every matching record will be dropped");
        }
        Ok(Self {
            name: Arc::from(config.name.as_str()),
            condition: compile_rule_condition(config)?,
            rate,
            priority: config.priority,
            limiter: config.max_per_minute.map(|max| MinuteLimiter::new(max, now)),
        })
    }

    /// True when the record satisfies the rule's condition
    #[inline]
    pub fn matches(&self, record: &TelemetryRecord) -> bool {
        self.condition.matches(record)
    }
}

/// Rules in evaluation order: descending priority, ties in declaration order
#[derive(Debug, Default)]
pub struct RuleSet {
    rules: Vec<CompiledRule>,
}

impl RuleSet {
    /// Compile and order configured rules
    pub fn compile(configs: &[RuleConfig]) -> Result<Self> {
        let now = Instant::now();
        let mut rules = configs
            .iter()
            .map(|c| CompiledRule::compile(c, now))
            .collect::<Result<Vec<_>>>()?;
        // Stable sort keeps declaration order among equal priorities.
        rules.sort_by(|a, b| b.priority.cmp(&a.priority));
        Ok(Self { rules })
    }

    /// First rule whose condition matches
    pub fn first_match(&self, record: &TelemetryRecord) -> Option<&CompiledRule> {
        self.rules.iter().find(|r| r.matches(record))
    }

    /// Rules in evaluation order
    pub fn rules(&self) -> &[CompiledRule] {
        &self.rules
    }

    /// Number of rules
    pub fn len(&self) -> usize {
        self.rules.len()
    }

    /// True when no rule is configured
    pub fn is_empty(&self) -> bool {
        self.rules.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn rule(name: &str, condition: &str, rate: f64, priority: i32) -> RuleConfig {
        RuleConfig {
            name: name.to_string(),
            condition: Some(condition.to_string()),
            conditions: Vec::new(),
            rate,
            priority,
            max_per_minute: None,
        }
    }

    #[test]
    fn test_priority_order_with_stable_ties() {
        let set = RuleSet::compile(&[
            rule("low", "x > 0", 0.1, 1),
            rule("first_tie", "x > 0", 0.2, 50),
            rule("high", "x > 100", 1.0, 100),
            rule("second_tie", "x > 0", 0.3, 50),
        ])
        .unwrap();

        let names: Vec<&str> = set.rules().iter().map(|r| r.name.as_ref()).collect();
        assert_eq!(names, vec!["high", "first_tie", "second_tie", "low"]);

        let record = TelemetryRecord::new("q").with_attr("x", 5);
        assert_eq!(set.first_match(&record).unwrap().name.as_ref(), "first_tie");
        let record = TelemetryRecord::new("q").with_attr("x", 500);
        assert_eq!(set.first_match(&record).unwrap().name.as_ref(), "high");
        let record = TelemetryRecord::new("q");
        assert!(set.first_match(&record).is_none());
    }

    #[test]
    fn test_rate_is_clamped() {
        let compiled = CompiledRule::compile(&rule("r", "x > 0", 3.0, 0), Instant::now()).unwrap();
        assert_eq!(compiled.rate, 1.0);
        let compiled = CompiledRule::compile(&rule("r", "x > 0", -1.0, 0), Instant::now()).unwrap();
        assert_eq!(compiled.rate, 0.0);
    }

    #[test]
    fn test_minute_limiter() {
        let start = Instant::now();
        let limiter = MinuteLimiter::new(2, start);
        assert!(limiter.try_acquire_at(start));
        assert!(limiter.try_acquire_at(start + Duration::from_secs(1)));
        assert!(!limiter.try_acquire_at(start + Duration::from_secs(59)));
        assert!(limiter.try_acquire_at(start + Duration::from_secs(60)));
    }
}
