//! Operational counters for the admission layer.
//!
//! Dropped records are invisible by construction, so the rate of dropping
//! and the breaker activity are exposed here instead. Counters are plain
//! atomics updated on the hot path; [`GuardStats::snapshot`] produces a
//! serializable copy for emission downstream.

use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::SystemTime;

/// Lock-free counters shared by every component
#[derive(Debug, Default)]
pub struct GuardStats {
    records_in: AtomicU64,
    kept: AtomicU64,
    sampled_out: AtomicU64,
    rate_limited: AtomicU64,
    deduplicated: AtomicU64,
    circuit_rejected: AtomicU64,
    overflow_coalesced: AtomicU64,
    breaker_transitions: AtomicU64,
    failures_counted: AtomicU64,
    failures_ignored: AtomicU64,
    ash_cycles: AtomicU64,
    ash_cycles_skipped: AtomicU64,
    ash_samples: AtomicU64,
    anomalies: AtomicU64,
    output_dropped: AtomicU64,
}

/// Counter identifiers
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Counter {
    /// Records entering the pipeline
    RecordsIn,
    /// Records passed downstream
    Kept,
    /// Records dropped by the sampling draw
    SampledOut,
    /// Records dropped by a rule's per-minute limit
    RateLimited,
    /// Records dropped as plan-hash duplicates
    Deduplicated,
    /// Records rejected by an open or saturated breaker
    CircuitRejected,
    /// Keys coalesced into an overflow bucket
    OverflowCoalesced,
    /// Breaker state changes
    BreakerTransitions,
    /// Reported errors matching a failure pattern
    FailuresCounted,
    /// Reported errors that matched no pattern
    FailuresIgnored,
    /// Completed ASH capture cycles
    AshCycles,
    /// ASH cycles skipped on error or timeout
    AshCyclesSkipped,
    /// Session samples written to the ring buffer
    AshSamples,
    /// Anomaly flags raised
    Anomalies,
    /// Output records dropped because the queue was full
    OutputDropped,
}

impl GuardStats {
    /// Create zeroed counters
    pub fn new() -> Self {
        Self::default()
    }

    fn slot(&self, counter: Counter) -> &AtomicU64 {
        match counter {
            Counter::RecordsIn => &self.records_in,
            Counter::Kept => &self.kept,
            Counter::SampledOut => &self.sampled_out,
            Counter::RateLimited => &self.rate_limited,
            Counter::Deduplicated => &self.deduplicated,
            Counter::CircuitRejected => &self.circuit_rejected,
            Counter::OverflowCoalesced => &self.overflow_coalesced,
            Counter::BreakerTransitions => &self.breaker_transitions,
            Counter::FailuresCounted => &self.failures_counted,
            Counter::FailuresIgnored => &self.failures_ignored,
            Counter::AshCycles => &self.ash_cycles,
            Counter::AshCyclesSkipped => &self.ash_cycles_skipped,
            Counter::AshSamples => &self.ash_samples,
            Counter::Anomalies => &self.anomalies,
            Counter::OutputDropped => &self.output_dropped,
        }
    }

    /// Increment a counter by one
    #[inline]
    pub fn incr(&self, counter: Counter) {
        self.slot(counter).fetch_add(1, Ordering::Relaxed);
    }

    /// Increment a counter by `n`
    #[inline]
    pub fn add(&self, counter: Counter, n: u64) {
        self.slot(counter).fetch_add(n, Ordering::Relaxed);
    }

    /// Current value of a counter
    pub fn get(&self, counter: Counter) -> u64 {
        self.slot(counter).load(Ordering::Relaxed)
    }

    /// Serializable copy of every counter
    pub fn snapshot(&self) -> StatsSnapshot {
        let records_in = self.get(Counter::RecordsIn);
        let kept = self.get(Counter::Kept);
        StatsSnapshot {
            taken_at: SystemTime::now(),
            records_in,
            kept,
            sampled_out: self.get(Counter::SampledOut),
            rate_limited: self.get(Counter::RateLimited),
            deduplicated: self.get(Counter::Deduplicated),
            circuit_rejected: self.get(Counter::CircuitRejected),
            overflow_coalesced: self.get(Counter::OverflowCoalesced),
            breaker_transitions: self.get(Counter::BreakerTransitions),
            failures_counted: self.get(Counter::FailuresCounted),
            failures_ignored: self.get(Counter::FailuresIgnored),
            ash_cycles: self.get(Counter::AshCycles),
            ash_cycles_skipped: self.get(Counter::AshCyclesSkipped),
            ash_samples: self.get(Counter::AshSamples),
            anomalies: self.get(Counter::Anomalies),
            output_dropped: self.get(Counter::OutputDropped),
            drop_ratio: if records_in == 0 {
                0.0
            } else {
                1.0 - kept as f64 / records_in as f64
            },
        }
    }
}

/// Point-in-time copy of [`GuardStats`]
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StatsSnapshot {
    /// When the snapshot was taken
    pub taken_at: SystemTime,
    /// Records offered to the pipeline
    pub records_in: u64,
    /// Records passed downstream
    pub kept: u64,
    /// Records dropped by the sampling draw
    pub sampled_out: u64,
    /// Keep verdicts turned into drops by a rule limit
    pub rate_limited: u64,
    /// Records dropped as duplicates
    pub deduplicated: u64,
    /// Records rejected by an open or saturated breaker
    pub circuit_rejected: u64,
    /// Keys replaced by the overflow marker
    pub overflow_coalesced: u64,
    /// Breaker state changes
    pub breaker_transitions: u64,
    /// Outcomes that matched a failure pattern
    pub failures_counted: u64,
    /// Errors that matched no pattern
    pub failures_ignored: u64,
    /// Completed ASH capture cycles
    pub ash_cycles: u64,
    /// Cycles lost to capture errors or timeouts
    pub ash_cycles_skipped: u64,
    /// Session samples buffered
    pub ash_samples: u64,
    /// Anomaly flags raised
    pub anomalies: u64,
    /// Records lost to a full output queue
    pub output_dropped: u64,
    /// Share of incoming records that did not survive
    pub drop_ratio: f64,
}

/// Coarse health derived from breaker and capture state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum SystemHealth {
    /// All resources closed and capture working.
    Healthy,
    /// Some resources isolated or capture failing.
    Degraded,
    /// Every tracked resource is isolated.
    Critical,
}

impl SystemHealth {
    /// Derive health from breaker counts and capture status
    pub fn assess(tracked: usize, not_closed: usize, capture_failing: bool) -> Self {
        if tracked > 0 && not_closed == tracked {
            SystemHealth::Critical
        } else if not_closed > 0 || capture_failing {
            SystemHealth::Degraded
        } else {
            SystemHealth::Healthy
        }
    }
}
