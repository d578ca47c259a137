//! Bounded, time-limited sample history.

use super::types::SessionSample;
use std::collections::VecDeque;
use std::sync::Arc;
use std::time::{Duration, Instant};

/// A sample with its position in the history
#[derive(Debug, Clone)]
pub struct BufferedSample {
    /// Monotonic insertion sequence
    pub seq: u64,
    /// Monotonic capture instant, used for retention
    pub captured: Instant,
    /// The immutable sample
    pub sample: Arc<SessionSample>,
}

/// Ring buffer holding at most `capacity` samples no older than `retention`.
/// Eviction is oldest-first and reports the highest evicted sequence number
/// so that derived aggregates can drop the same samples.
#[derive(Debug)]
pub struct SampleBuffer {
    samples: VecDeque<BufferedSample>,
    capacity: usize,
    retention: Duration,
    next_seq: u64,
    evicted: u64,
}

impl SampleBuffer {
    /// Buffer holding at most `capacity` samples for `retention`
    pub fn new(capacity: usize, retention: Duration) -> Self {
        Self {
            samples: VecDeque::with_capacity(capacity.min(4096)),
            capacity: capacity.max(1),
            retention,
            next_seq: 0,
            evicted: 0,
        }
    }

    /// Append a sample. Returns the buffered entry and the highest sequence
    /// number evicted to make room, if any.
    pub fn push_at(&mut self, sample: SessionSample, now: Instant) -> (BufferedSample, Option<u64>) {
        let mut evicted_through = self.expire_at(now);
        while self.samples.len() >= self.capacity {
            if let Some(old) = self.samples.pop_front() {
                self.evicted += 1;
                evicted_through = Some(old.seq);
            }
        }

        let entry = BufferedSample {
            seq: self.next_seq,
            captured: now,
            sample: Arc::new(sample),
        };
        self.next_seq += 1;
        self.samples.push_back(entry.clone());
        (entry, evicted_through)
    }

    /// Drop samples older than the retention period
    pub fn expire_at(&mut self, now: Instant) -> Option<u64> {
        let mut evicted_through = None;
        while let Some(front) = self.samples.front() {
            if now.saturating_duration_since(front.captured) < self.retention {
                break;
            }
            evicted_through = Some(front.seq);
            self.samples.pop_front();
            self.evicted += 1;
        }
        evicted_through
    }

    /// Samples captured at or after `since`, oldest first
    pub fn since(&self, since: Instant) -> impl Iterator<Item = &BufferedSample> {
        self.samples.iter().filter(move |s| s.captured >= since)
    }

    /// Oldest first
    pub fn iter(&self) -> impl Iterator<Item = &BufferedSample> {
        self.samples.iter()
    }

    /// Number of buffered samples
    pub fn len(&self) -> usize {
        self.samples.len()
    }

    /// True when nothing is buffered
    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }

    /// Total samples evicted since creation
    pub fn evicted(&self) -> u64 {
        self.evicted
    }
}
