//! Per-resource breaker state machine.
//!
//! `ResourceBreaker` holds no locks of its own; the registry in the parent
//! module wraps each instance in a mutex so that unrelated resources never
//! serialize on each other.

use super::classify::{ErrorCategory, CATEGORY_COUNT};
use crate::core::BreakerConfig;
use crate::tracking::{CardinalityWindow, Dimension, KeyAdmission};
use serde::Serialize;
use std::collections::VecDeque;
use std::fmt;
use std::time::{Duration, Instant};

/// Breaker state for one resource
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CircuitState {
    /// Records flow
    Closed,
    /// Records rejected until the backoff elapses
    Open,
    /// A limited number of trial records flow
    HalfOpen,
}

impl fmt::Display for CircuitState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CircuitState::Closed => write!(f, "closed"),
            CircuitState::Open => write!(f, "open"),
            CircuitState::HalfOpen => write!(f, "half_open"),
        }
    }
}

/// Why a record was rejected
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum RejectReason {
    /// Resource is isolated until its backoff elapses
    CircuitOpen,
    /// Half-open trial budget is used up
    HalfOpenSaturated,
}

/// A state change, reported upward for logging and emission
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Transition {
    /// State before the transition
    pub from: CircuitState,
    /// State after the transition
    pub to: CircuitState,
    /// Open duration in force after the change
    pub backoff: Duration,
    /// Failures counted in the window at the time of change
    pub failures: u32,
}

/// State machine and bounded key tracking for one resource
#[derive(Debug)]
pub struct ResourceBreaker {
    state: CircuitState,
    failures: VecDeque<Instant>,
    success_count: u32,
    opened_at: Option<Instant>,
    half_open_since: Option<Instant>,
    half_open_admitted: u32,
    current_backoff: Duration,
    trips: u32,
    queries: CardinalityWindow,
    users: CardinalityWindow,
    error_counts: [u64; CATEGORY_COUNT],
    last_seen: Instant,
}

impl ResourceBreaker {
    /// Fresh Closed breaker
    pub fn new(config: &BreakerConfig, now: Instant) -> Self {
        Self {
            state: CircuitState::Closed,
            failures: VecDeque::with_capacity(config.failure_threshold as usize),
            success_count: 0,
            opened_at: None,
            half_open_since: None,
            half_open_admitted: 0,
            current_backoff: config.timeout,
            trips: 0,
            queries: CardinalityWindow::new(config.max_unique_queries, config.window_duration, now),
            users: CardinalityWindow::new(config.max_unique_users, config.window_duration, now),
            error_counts: [0; CATEGORY_COUNT],
            last_seen: now,
        }
    }

    /// Apply time-driven transitions: Open to HalfOpen once the backoff has
    /// elapsed, and a fresh trial window when a HalfOpen window times out.
    pub fn poll_at(&mut self, config: &BreakerConfig, now: Instant) -> Option<Transition> {
        match self.state {
            CircuitState::Open => {
                let opened = self.opened_at.unwrap_or(now);
                if now.saturating_duration_since(opened) >= self.current_backoff {
                    self.state = CircuitState::HalfOpen;
                    self.half_open_since = Some(now);
                    self.half_open_admitted = 0;
                    self.success_count = 0;
                    return Some(self.transition(CircuitState::Open, CircuitState::HalfOpen));
                }
                None
            },
            CircuitState::HalfOpen => {
                let since = self.half_open_since.unwrap_or(now);
                if now.saturating_duration_since(since) >= config.timeout {
                    self.half_open_since = Some(now);
                    self.half_open_admitted = 0;
                    self.success_count = 0;
                }
                None
            },
            CircuitState::Closed => None,
        }
    }

    /// Gate one record. Returns the rejection reason, if any.
    pub fn admit_at(&mut self, config: &BreakerConfig, now: Instant) -> Result<(), RejectReason> {
        self.last_seen = now;
        match self.state {
            CircuitState::Closed => Ok(()),
            CircuitState::Open => Err(RejectReason::CircuitOpen),
            CircuitState::HalfOpen => {
                if self.half_open_admitted < config.half_open_max_requests {
                    self.half_open_admitted += 1;
                    Ok(())
                } else {
                    Err(RejectReason::HalfOpenSaturated)
                }
            },
        }
    }

    /// Count a success. Closes the circuit after enough half-open successes.
    pub fn record_success_at(&mut self, config: &BreakerConfig, now: Instant) -> Option<Transition> {
        self.last_seen = now;
        if self.state != CircuitState::HalfOpen {
            return None;
        }
        self.success_count += 1;
        if self.success_count < config.success_threshold {
            return None;
        }

        self.state = CircuitState::Closed;
        self.failures.clear();
        self.success_count = 0;
        self.opened_at = None;
        self.half_open_since = None;
        self.half_open_admitted = 0;
        self.trips = 0;
        self.current_backoff = config.timeout;
        Some(self.transition(CircuitState::HalfOpen, CircuitState::Closed))
    }

    /// Count a matched failure. May open the circuit.
    pub fn record_failure_at(
        &mut self,
        config: &BreakerConfig,
        category: ErrorCategory,
        now: Instant,
    ) -> Option<Transition> {
        self.last_seen = now;
        self.error_counts[category.index()] += 1;
        match self.state {
            CircuitState::Open => None,
            CircuitState::HalfOpen => Some(self.trip(config, now)),
            CircuitState::Closed => {
                self.failures.push_back(now);
                while let Some(oldest) = self.failures.front() {
                    if now.saturating_duration_since(*oldest) >= config.window_duration {
                        self.failures.pop_front();
                    } else {
                        break;
                    }
                }
                if self.failures.len() >= config.failure_threshold as usize {
                    Some(self.trip(config, now))
                } else {
                    None
                }
            },
        }
    }

    fn trip(&mut self, config: &BreakerConfig, now: Instant) -> Transition {
        let from = self.state;
        let failures = self.failure_count();
        self.current_backoff = if self.trips == 0 {
            config.timeout
        } else {
            self.current_backoff
                .mul_f64(config.backoff_multiplier)
                .min(config.max_backoff)
        };
        self.trips += 1;
        self.state = CircuitState::Open;
        self.opened_at = Some(now);
        self.half_open_since = None;
        self.half_open_admitted = 0;
        self.success_count = 0;
        self.failures.clear();

        Transition {
            from,
            to: CircuitState::Open,
            backoff: self.current_backoff,
            failures,
        }
    }

    fn transition(&self, from: CircuitState, to: CircuitState) -> Transition {
        Transition {
            from,
            to,
            backoff: self.current_backoff,
            failures: self.failure_count(),
        }
    }

    /// Observe a key in one of the bounded dimensions
    pub fn observe_key_at(&mut self, dimension: Dimension, key: u64, now: Instant) -> KeyAdmission {
        match dimension {
            Dimension::Queries => self.queries.observe_at(key, now),
            Dimension::Users => self.users.observe_at(key, now),
        }
    }

    /// Current state
    pub fn state(&self) -> CircuitState {
        self.state
    }

    /// Failures inside the current window
    pub fn failure_count(&self) -> u32 {
        u32::try_from(self.failures.len()).unwrap_or(u32::MAX)
    }

    /// Consecutive successes while half-open
    pub fn success_count(&self) -> u32 {
        self.success_count
    }

    /// How long the next open period lasts
    pub fn current_backoff(&self) -> Duration {
        self.current_backoff
    }

    /// When the breaker last opened
    pub fn opened_at(&self) -> Option<Instant> {
        self.opened_at
    }

    /// Last admission or outcome
    pub fn last_seen(&self) -> Instant {
        self.last_seen
    }

    /// Distinct keys tracked in `dimension` for the current window
    pub fn distinct(&self, dimension: Dimension) -> usize {
        match dimension {
            Dimension::Queries => self.queries.len(),
            Dimension::Users => self.users.len(),
        }
    }

    /// Failures seen per category since creation
    pub fn error_counts(&self) -> Vec<(ErrorCategory, u64)> {
        ErrorCategory::ALL
            .iter()
            .map(|c| (*c, self.error_counts[c.index()]))
            .filter(|(_, n)| *n > 0)
            .collect()
    }
}
