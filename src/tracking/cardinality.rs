//! Distinct-key tracking within a tumbling time window.

use dashmap::DashMap;
use rustc_hash::FxHashSet;
use serde::Serialize;
use std::fmt;
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Tracked key dimension
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Dimension {
    /// Distinct query identifiers
    Queries,
    /// Distinct database users
    Users,
}

impl fmt::Display for Dimension {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Dimension::Queries => write!(f, "queries"),
            Dimension::Users => write!(f, "users"),
        }
    }
}

/// Outcome of observing a key
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KeyAdmission {
    /// Key already tracked in this window
    Known,
    /// Key newly tracked
    Added,
    /// Limit reached; the key belongs to the overflow bucket.
    /// `first` is set for the first overflow in the window.
    Overflow {
        /// First overflow in the current window
        first: bool,
    },
}

impl KeyAdmission {
    /// True when the key was coalesced
    pub fn is_overflow(&self) -> bool {
        matches!(self, KeyAdmission::Overflow { .. })
    }
}

/// Bounded set of key hashes for one resource and dimension
#[derive(Debug)]
pub struct CardinalityWindow {
    window_start: Instant,
    window: Duration,
    keys: FxHashSet<u64>,
    limit: usize,
    overflow_count: u64,
}

impl CardinalityWindow {
    /// Create an empty window starting at `now`
    pub fn new(limit: usize, window: Duration, now: Instant) -> Self {
        Self {
            window_start: now,
            window,
            keys: FxHashSet::default(),
            limit,
            overflow_count: 0,
        }
    }

    /// Observe a key hash, rolling the window first if it has expired
    pub fn observe_at(&mut self, key: u64, now: Instant) -> KeyAdmission {
        self.roll(now);
        if self.keys.contains(&key) {
            return KeyAdmission::Known;
        }
        if self.keys.len() < self.limit {
            self.keys.insert(key);
            return KeyAdmission::Added;
        }
        self.overflow_count += 1;
        KeyAdmission::Overflow {
            first: self.overflow_count == 1,
        }
    }

    fn roll(&mut self, now: Instant) {
        if now.saturating_duration_since(self.window_start) >= self.window {
            self.window_start = now;
            self.keys.clear();
            self.overflow_count = 0;
        }
    }

    /// Distinct keys tracked in the current window
    pub fn len(&self) -> usize {
        self.keys.len()
    }

    /// True when no key is tracked
    pub fn is_empty(&self) -> bool {
        self.keys.is_empty()
    }

    /// Keys coalesced into overflow in the current window
    pub fn overflow_count(&self) -> u64 {
        self.overflow_count
    }

    /// Start of the current window
    pub fn window_start(&self) -> Instant {
        self.window_start
    }
}

/// Per-dimension windows of one resource
#[derive(Debug, Default)]
struct ResourceWindows {
    queries: Option<CardinalityWindow>,
    users: Option<CardinalityWindow>,
}

impl ResourceWindows {
    fn slot(&mut self, dimension: Dimension) -> &mut Option<CardinalityWindow> {
        match dimension {
            Dimension::Queries => &mut self.queries,
            Dimension::Users => &mut self.users,
        }
    }

    fn get(&self, dimension: Dimension) -> Option<&CardinalityWindow> {
        match dimension {
            Dimension::Queries => self.queries.as_ref(),
            Dimension::Users => self.users.as_ref(),
        }
    }

    fn count(&self) -> usize {
        usize::from(self.queries.is_some()) + usize::from(self.users.is_some())
    }
}

/// Cardinality windows keyed by resource and dimension
pub struct CardinalityTracker {
    windows: DashMap<Arc<str>, ResourceWindows>,
    limit: usize,
    window: Duration,
}

impl CardinalityTracker {
    /// Create a tracker with a per-window key limit
    pub fn new(limit: usize, window: Duration) -> Self {
        Self {
            windows: DashMap::new(),
            limit,
            window,
        }
    }

    /// Observe `key` for `resource` in `dimension`. The resource name is
    /// only copied the first time it is seen.
    pub fn observe_at(
        &self,
        resource: &str,
        dimension: Dimension,
        key: u64,
        now: Instant,
    ) -> KeyAdmission {
        let observe = |windows: &mut ResourceWindows| {
            windows
                .slot(dimension)
                .get_or_insert_with(|| CardinalityWindow::new(self.limit, self.window, now))
                .observe_at(key, now)
        };
        if let Some(mut existing) = self.windows.get_mut(resource) {
            return observe(&mut existing);
        }
        let mut created = self.windows.entry(Arc::from(resource)).or_default();
        observe(&mut created)
    }

    /// Distinct keys currently tracked for `resource` in `dimension`
    pub fn distinct(&self, resource: &str, dimension: Dimension) -> usize {
        self.windows
            .get(resource)
            .and_then(|w| w.get(dimension).map(CardinalityWindow::len))
            .unwrap_or(0)
    }

    /// Drop windows idle for more than two window lengths
    pub fn purge_idle_at(&self, now: Instant) -> usize {
        let before = self.len();
        let horizon = self.window * 2;
        self.windows.retain(|_, windows| {
            for dimension in [Dimension::Queries, Dimension::Users] {
                let slot = windows.slot(dimension);
                if slot
                    .as_ref()
                    .is_some_and(|w| now.saturating_duration_since(w.window_start()) >= horizon)
                {
                    *slot = None;
                }
            }
            windows.count() > 0
        });
        before - self.len()
    }

    /// Number of tracked resource/dimension windows
    pub fn len(&self) -> usize {
        self.windows.iter().map(|w| w.count()).sum()
    }

    /// True when nothing is tracked
    pub fn is_empty(&self) -> bool {
        self.windows.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_window_caps_distinct_keys() {
        let now = Instant::now();
        let mut window = CardinalityWindow::new(3, Duration::from_secs(60), now);

        assert_eq!(window.observe_at(1, now), KeyAdmission::Added);
        assert_eq!(window.observe_at(2, now), KeyAdmission::Added);
        assert_eq!(window.observe_at(1, now), KeyAdmission::Known);
        assert_eq!(window.observe_at(3, now), KeyAdmission::Added);
        assert_eq!(window.observe_at(4, now), KeyAdmission::Overflow { first: true });
        assert_eq!(window.observe_at(5, now), KeyAdmission::Overflow { first: false });
        assert_eq!(window.observe_at(2, now), KeyAdmission::Known);
        assert_eq!(window.len(), 3);
        assert_eq!(window.overflow_count(), 2);
    }

    #[test]
    fn test_window_resets_after_duration() {
        let start = Instant::now();
        let mut window = CardinalityWindow::new(1, Duration::from_secs(10), start);
        window.observe_at(1, start);
        assert!(window.observe_at(2, start).is_overflow());

        let later = start + Duration::from_secs(10);
        assert_eq!(window.observe_at(2, later), KeyAdmission::Added);
        assert_eq!(window.len(), 1);
        assert_eq!(window.overflow_count(), 0);
    }

    #[test]
    fn test_tracker_separates_resources_and_dimensions() {
        let now = Instant::now();
        let tracker = CardinalityTracker::new(2, Duration::from_secs(60));

        for key in 0..5 {
            tracker.observe_at("db1", Dimension::Queries, key, now);
        }
        assert_eq!(tracker.distinct("db1", Dimension::Queries), 2);
        assert_eq!(tracker.distinct("db1", Dimension::Users), 0);
        assert_eq!(
            tracker.observe_at("db2", Dimension::Queries, 4, now),
            KeyAdmission::Added
        );
    }

    #[test]
    fn test_tracker_reuses_resource_entry() {
        let now = Instant::now();
        let tracker = CardinalityTracker::new(10, Duration::from_secs(60));
        for key in 0..50 {
            tracker.observe_at("db1", Dimension::Queries, key % 7, now);
            tracker.observe_at("db1", Dimension::Users, key % 3, now);
        }
        assert_eq!(tracker.windows.len(), 1);
        assert_eq!(tracker.len(), 2);
        assert_eq!(tracker.distinct("db1", Dimension::Queries), 7);
        assert_eq!(tracker.distinct("db1", Dimension::Users), 3);
    }

    #[test]
    fn test_purge_idle_windows() {
        let now = Instant::now();
        let tracker = CardinalityTracker::new(2, Duration::from_secs(10));
        tracker.observe_at("db1", Dimension::Queries, 1, now);
        tracker.observe_at("db2", Dimension::Queries, 1, now + Duration::from_secs(15));

        let removed = tracker.purge_idle_at(now + Duration::from_secs(25));
        assert_eq!(removed, 1);
        assert_eq!(tracker.len(), 1);
    }
}
