//! xxHash-based lane routing.
//!
//! Events are assigned to a worker lane by a deterministic 64-bit hash of
//! their aggregate key, so every event of one aggregate instance lands on
//! the same lane.

use xxhash_rust::xxh64;

use crate::event::AggregateKey;

/// Fixed seed so routing is stable across processes and restarts.
const SEED: u64 = 0x517cc1b727220a95;

/// Hash the parts of a composite key.
///
/// Parts are joined with a record separator so that `("ab", "c")` and
/// `("a", "bc")` hash differently.
pub fn hash_parts(parts: &[&str]) -> u64 {
    let mut combined = String::new();
    for (i, part) in parts.iter().enumerate() {
        if i > 0 {
            combined.push('\x1E'); // record separator
        }
        combined.push_str(part);
    }
    xxh64::xxh64(combined.as_bytes(), SEED)
}

pub fn aggregate_hash(key: &AggregateKey) -> u64 {
    hash_parts(&[
        &key.instance_id,
        key.aggregate_type.as_str(),
        &key.aggregate_id,
    ])
}

/// Lane index in `0..lanes` for an aggregate. `lanes` must be non-zero.
pub fn lane_for(key: &AggregateKey, lanes: usize) -> usize {
    (aggregate_hash(key) % lanes.max(1) as u64) as usize
}
