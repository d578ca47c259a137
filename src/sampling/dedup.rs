//! Plan-hash deduplication of kept records.

use crate::core::{DeduplicationConfig, TelemetryRecord};
use crate::tracking::{stable_hash, DecisionCache};
use std::time::Instant;

/// Drops a record whose plan hash was already kept within the window
pub struct Deduplicator {
    attribute: String,
    seen: DecisionCache<()>,
}

impl Deduplicator {
    /// Build from configuration; returns `None` when disabled
    pub fn from_config(config: &DeduplicationConfig) -> Option<Self> {
        config.enabled.then(|| Self {
            attribute: config.hash_attribute.clone(),
            seen: DecisionCache::new(config.max_entries, 8, config.window).without_refresh(),
        })
    }

    /// True when the record repeats a hash seen within the window.
    /// Records without the hash attribute are never duplicates.
    pub fn is_duplicate_at(&self, record: &TelemetryRecord, now: Instant) -> bool {
        let Some(hash) = record.attr_text(&self.attribute) else {
            return false;
        };
        let key = stable_hash(&[&self.attribute, &hash]);
        self.seen.get_or_insert_at(key, (), now).is_some()
    }

    /// Hashes currently remembered
    pub fn len(&self) -> usize {
        self.seen.len()
    }

    /// True when no hash is tracked
    pub fn is_empty(&self) -> bool {
        self.seen.is_empty()
    }
}
