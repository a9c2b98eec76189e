//! Stable key-to-partition routing.

use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};

/// Map `key` onto one of `partitions` slots.
///
/// The same key always maps to the same slot within a process, which is what keeps
/// events about one resource on one worker. Returns 0 when `partitions` is 0.
///
/// ```
/// use eventing_core::partition::partition_for;
///
/// assert_eq!(partition_for("cust-123", 8), partition_for("cust-123", 8));
/// assert!(partition_for("cust-123", 8) < 8);
/// ```
#[must_use]
pub fn partition_for(key: &str, partitions: usize) -> usize {
    if partitions == 0 {
        return 0;
    }
    let mut hasher = DefaultHasher::new();
    key.hash(&mut hasher);
    #[allow(clippy::cast_possible_truncation)] // Reduced modulo a usize below
    let hash = hasher.finish() as usize;
    hash % partitions
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn zero_partitions_maps_to_zero() {
        assert_eq!(partition_for("anything", 0), 0);
    }

    #[test]
    fn keys_spread_over_slots() {
        let used: std::collections::HashSet<_> = (0..200)
            .map(|i| partition_for(&format!("cust-{i}"), 4))
            .collect();
        assert_eq!(used.len(), 4);
    }

    proptest! {
        #[test]
        fn same_key_same_slot(key in ".{0,40}", partitions in 1usize..64) {
            let slot = partition_for(&key, partitions);
            prop_assert!(slot < partitions);
            prop_assert_eq!(slot, partition_for(&key, partitions));
        }
    }
}
