//! Bounded state shared by the breaker and the sampler.
//!
//! Both structures are safe to use from many pipeline workers at once:
//! cardinality windows live behind sharded map entries and the decision
//! cache is split into independently locked LRU shards.

pub mod cardinality;
pub mod decision_cache;

pub use cardinality::{CardinalityTracker, CardinalityWindow, Dimension, KeyAdmission};
pub use decision_cache::{CacheStats, DecisionCache};

use rustc_hash::FxHasher;
use std::hash::{Hash, Hasher};

/// Stable 64-bit hash over a sequence of string parts.
///
/// Parts are length-delimited so `("ab", "c")` and `("a", "bc")` differ.
/// The result is passed through a 64-bit finalizer so that the high bits
/// are usable as a uniform draw.
pub fn stable_hash(parts: &[&str]) -> u64 {
    let mut hasher = FxHasher::default();
    for part in parts {
        part.len().hash(&mut hasher);
        part.hash(&mut hasher);
    }
    mix64(hasher.finish())
}

/// splitmix64 finalizer
fn mix64(mut z: u64) -> u64 {
    z = (z ^ (z >> 30)).wrapping_mul(0xbf58_476d_1ce4_e5b9);
    z = (z ^ (z >> 27)).wrapping_mul(0x94d0_49bb_1331_11eb);
    z ^ (z >> 31)
}

/// Map a hash onto [0, 1) using its top 53 bits
pub fn unit_interval(hash: u64) -> f64 {
    (hash >> 11) as f64 / (1u64 << 53) as f64
}
