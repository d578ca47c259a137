//! Rolling wait-event aggregates, maintained incrementally.
//!
//! Each window keeps its own ordered list of contributions so that expiry
//! and buffer eviction subtract exactly what was added.

use super::buffer::BufferedSample;
use super::types::SessionState;
use rustc_hash::FxHashMap;
use serde::Serialize;
use std::collections::{BTreeMap, VecDeque};
use std::sync::Arc;
use std::time::{Duration, Instant, SystemTime};

/// Bucket that absorbs new wait keys once `max_wait_keys` is reached
pub const OTHER_WAIT_KEY: &str = "other";

/// Wait events reported per aggregate record
const TOP_WAITS: usize = 10;

/// Counts and durations for one wait key
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct WaitStats {
    /// Samples attributed to the wait event
    pub count: u64,
    total_duration_ms: u64,
    timed: u64,
}

impl WaitStats {
    fn add(&mut self, duration_ms: Option<u64>) {
        self.count += 1;
        if let Some(ms) = duration_ms {
            self.total_duration_ms = self.total_duration_ms.saturating_add(ms);
            self.timed += 1;
        }
    }

    fn remove(&mut self, duration_ms: Option<u64>) {
        self.count = self.count.saturating_sub(1);
        if let Some(ms) = duration_ms {
            self.total_duration_ms = self.total_duration_ms.saturating_sub(ms);
            self.timed = self.timed.saturating_sub(1);
        }
    }

    /// Mean query duration of timed samples
    pub fn mean_duration_ms(&self) -> f64 {
        if self.timed == 0 {
            0.0
        } else {
            self.total_duration_ms as f64 / self.timed as f64
        }
    }
}

#[derive(Debug)]
struct Contribution {
    seq: u64,
    captured: Instant,
    wait: Arc<str>,
    state: SessionState,
    duration_ms: Option<u64>,
}

/// One wait event in an aggregate record
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct WaitSummary {
    /// `type:event` key, or `CPU` when not waiting
    pub wait_event: String,
    /// Samples in the window
    pub count: u64,
    /// Mean query duration of those samples
    pub mean_duration_ms: f64,
}

/// Emitted view of one aggregation window
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct WindowAggregate {
    /// Window length
    pub window_secs: u64,
    /// Samples inside the window
    pub sample_count: u64,
    /// Distinct wait keys, including ones outside the top list
    pub distinct_waits: usize,
    /// Busiest wait events, descending
    pub top_waits: Vec<WaitSummary>,
    /// Sample count per session state
    pub states: BTreeMap<String, u64>,
    /// When the snapshot was taken
    pub timestamp: SystemTime,
}

/// Rolling aggregate over one window length
#[derive(Debug)]
pub struct WindowAggregator {
    window: Duration,
    max_wait_keys: usize,
    entries: VecDeque<Contribution>,
    by_wait: FxHashMap<Arc<str>, WaitStats>,
    by_state: FxHashMap<SessionState, u64>,
}

impl WindowAggregator {
    /// Empty aggregator over `window`, tracking at most `max_wait_keys` keys
    pub fn new(window: Duration, max_wait_keys: usize) -> Self {
        Self {
            window,
            max_wait_keys: max_wait_keys.max(1),
            entries: VecDeque::new(),
            by_wait: FxHashMap::default(),
            by_state: FxHashMap::default(),
        }
    }

    /// Length of the window
    pub fn window(&self) -> Duration {
        self.window
    }

    /// Fold a newly buffered sample into the window
    pub fn add(&mut self, entry: &BufferedSample) {
        let key = entry.sample.wait_key();
        let wait: Arc<str> = match self.by_wait.get_key_value(key.as_str()) {
            Some((existing, _)) => Arc::clone(existing),
            None if self.by_wait.len() >= self.max_wait_keys => Arc::from(OTHER_WAIT_KEY),
            None => Arc::from(key),
        };
        let duration_ms = entry.sample.duration_ms;
        self.by_wait.entry(Arc::clone(&wait)).or_default().add(duration_ms);
        *self.by_state.entry(entry.sample.state).or_default() += 1;
        self.entries.push_back(Contribution {
            seq: entry.seq,
            captured: entry.captured,
            wait,
            state: entry.sample.state,
            duration_ms,
        });
    }

    /// Drop contributions that fell out of the window
    pub fn expire_at(&mut self, now: Instant) {
        while self
            .entries
            .front()
            .is_some_and(|c| now.saturating_duration_since(c.captured) >= self.window)
        {
            self.pop_front();
        }
    }

    /// Drop contributions for samples evicted from the buffer
    pub fn evict_through(&mut self, seq: u64) {
        while self.entries.front().is_some_and(|c| c.seq <= seq) {
            self.pop_front();
        }
    }

    fn pop_front(&mut self) {
        let Some(c) = self.entries.pop_front() else {
            return;
        };
        if let Some(stats) = self.by_wait.get_mut(&c.wait) {
            stats.remove(c.duration_ms);
            if stats.count == 0 {
                self.by_wait.remove(&c.wait);
            }
        }
        if let Some(n) = self.by_state.get_mut(&c.state) {
            *n = n.saturating_sub(1);
            if *n == 0 {
                self.by_state.remove(&c.state);
            }
        }
    }

    /// Samples currently inside the window
    pub fn sample_count(&self) -> u64 {
        self.entries.len() as u64
    }

    /// Stats for one wait key, if it has samples
    pub fn wait_stats(&self, wait: &str) -> Option<WaitStats> {
        self.by_wait.get(wait).copied()
    }

    /// All wait keys currently in the window
    pub fn waits(&self) -> impl Iterator<Item = (&str, &WaitStats)> {
        self.by_wait.iter().map(|(k, v)| (k.as_ref(), v))
    }

    /// Record view, top waits first
    pub fn snapshot(&self, timestamp: SystemTime) -> WindowAggregate {
        let mut top: Vec<WaitSummary> = self
            .by_wait
            .iter()
            .map(|(wait, stats)| WaitSummary {
                wait_event: wait.to_string(),
                count: stats.count,
                mean_duration_ms: stats.mean_duration_ms(),
            })
            .collect();
        top.sort_by(|a, b| b.count.cmp(&a.count).then_with(|| a.wait_event.cmp(&b.wait_event)));
        top.truncate(TOP_WAITS);

        WindowAggregate {
            window_secs: self.window.as_secs(),
            sample_count: self.sample_count(),
            distinct_waits: self.by_wait.len(),
            top_waits: top,
            states: self
                .by_state
                .iter()
                .map(|(state, n)| (state.as_str().to_string(), *n))
                .collect(),
            timestamp,
        }
    }
}
