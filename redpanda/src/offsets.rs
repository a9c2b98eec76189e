//! Commit-position tracking for out-of-order acknowledgements.
//!
//! The dispatcher acknowledges messages from parallel workers, so offsets within a
//! partition are acked out of order. Kafka commits are a single position per
//! partition ("everything before this is done"), so committing a later ack directly
//! would skip an earlier message that is still in flight. [`OffsetTracker`] only
//! advances a partition's commit position past offsets that are acked and have no
//! unacked offset before them.
//!
//! ```text
//! delivered: 10 11 12 13
//! acked:        11    13      -> nothing committable (10 in flight)
//! ack 10                      -> commit 12 (10, 11 done; 12 in flight)
//! ack 12                      -> commit 14
//! ```

use std::collections::{BTreeSet, HashMap};

#[derive(Debug, Default)]
struct PartitionState {
    in_flight: BTreeSet<i64>,
    acked: BTreeSet<i64>,
    committed: Option<i64>,
}

/// Tracks delivered and acknowledged offsets per topic partition.
#[derive(Debug, Default)]
pub struct OffsetTracker {
    partitions: HashMap<(String, i32), PartitionState>,
}

impl OffsetTracker {
    /// Create an empty tracker.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Record that `offset` was handed to a consumer.
    pub fn delivered(&mut self, topic: &str, partition: i32, offset: i64) {
        self.partitions
            .entry((topic.to_string(), partition))
            .or_default()
            .in_flight
            .insert(offset);
    }

    /// Record an acknowledgement.
    ///
    /// Returns the new commit position (the next offset to consume) if it advanced.
    /// Acks for offsets that were never delivered are ignored.
    pub fn acked(&mut self, topic: &str, partition: i32, offset: i64) -> Option<i64> {
        let state = self.partitions.get_mut(&(topic.to_string(), partition))?;
        if !state.in_flight.remove(&offset) {
            return None;
        }
        state.acked.insert(offset);

        let blocked_at = state.in_flight.first().copied();
        let mut highest = None;
        while let Some(&next) = state.acked.first() {
            if blocked_at.is_some_and(|blocked| next > blocked) {
                break;
            }
            state.acked.pop_first();
            highest = Some(next);
        }

        let position = highest? + 1;
        if state.committed.is_some_and(|committed| committed >= position) {
            return None;
        }
        state.committed = Some(position);
        Some(position)
    }

    /// Last commit position handed out for a partition.
    #[must_use]
    pub fn committed(&self, topic: &str, partition: i32) -> Option<i64> {
        self.partitions
            .get(&(topic.to_string(), partition))
            .and_then(|state| state.committed)
    }

    /// Number of delivered but unacknowledged offsets across all partitions.
    #[must_use]
    pub fn in_flight(&self) -> usize {
        self.partitions.values().map(|s| s.in_flight.len()).sum()
    }
}
