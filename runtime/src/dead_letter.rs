//! In-memory dead letter queue.
//!
//! Bounded and thread-safe. Unlike a ring buffer it never drops an entry to make
//! room: a full queue rejects the write, and the dispatcher leaves the message
//! unacknowledged so the broker keeps it.

use eventing_core::dead_letter::{DeadLetter, DeadLetterError, DeadLetterSink};
use std::collections::VecDeque;
use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, Mutex, PoisonError};
use uuid::Uuid;

/// Dead Letter Queue held in process memory.
///
/// # Example
///
/// ```
/// use eventing_runtime::dead_letter::InMemoryDeadLetterQueue;
///
/// let dlq = InMemoryDeadLetterQueue::new(1000);
/// assert!(dlq.is_empty());
/// assert_eq!(dlq.max_size(), 1000);
/// ```
#[derive(Debug, Clone)]
pub struct InMemoryDeadLetterQueue {
    queue: Arc<Mutex<VecDeque<DeadLetter>>>,
    max_size: usize,
}

impl InMemoryDeadLetterQueue {
    /// Create a new dead letter queue with the given max size
    #[must_use]
    pub fn new(max_size: usize) -> Self {
        Self {
            queue: Arc::new(Mutex::new(VecDeque::new())),
            max_size,
        }
    }

    /// Append a dead letter.
    ///
    /// # Errors
    ///
    /// Returns [`DeadLetterError::CapacityExceeded`] when the queue is full.
    pub fn push(&self, letter: DeadLetter) -> Result<(), DeadLetterError> {
        let mut queue = self.queue.lock().unwrap_or_else(PoisonError::into_inner);

        if queue.len() >= self.max_size {
            tracing::error!(
                max_size = self.max_size,
                event_id = ?letter.event_id,
                topic = %letter.topic,
                "Dead letter queue at capacity, rejecting entry"
            );
            return Err(DeadLetterError::CapacityExceeded {
                capacity: self.max_size,
            });
        }

        tracing::warn!(
            event_id = ?letter.event_id,
            event_type = ?letter.event_type,
            topic = %letter.topic,
            stage = %letter.stage,
            attempts = letter.attempts,
            error = %letter.error,
            "Message added to dead letter queue"
        );
        queue.push_back(letter);

        #[allow(clippy::cast_precision_loss)] // Bounded by max_size
        metrics::gauge!("eventing_dead_letter_queue_size").set(queue.len() as f64);
        metrics::counter!("eventing_dead_letters_recorded_total").increment(1);
        Ok(())
    }

    /// Get the current queue size
    #[must_use]
    pub fn len(&self) -> usize {
        self.queue
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    /// Check if the queue is empty
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Copy of all entries, oldest first.
    #[must_use]
    pub fn entries(&self) -> Vec<DeadLetter> {
        self.queue
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .cloned()
            .collect()
    }

    /// Remove and return one entry, e.g. after it was reprocessed by hand.
    ///
    /// # Errors
    ///
    /// Returns [`DeadLetterError::NotFound`] for an unknown id.
    pub fn take(&self, id: Uuid) -> Result<DeadLetter, DeadLetterError> {
        let mut queue = self.queue.lock().unwrap_or_else(PoisonError::into_inner);
        let position = queue
            .iter()
            .position(|letter| letter.id == id)
            .ok_or(DeadLetterError::NotFound(id))?;
        let letter = queue.remove(position).ok_or(DeadLetterError::NotFound(id))?;

        #[allow(clippy::cast_precision_loss)]
        metrics::gauge!("eventing_dead_letter_queue_size").set(queue.len() as f64);
        Ok(letter)
    }

    /// Drain all entries from the queue
    pub fn drain(&self) -> Vec<DeadLetter> {
        let mut queue = self.queue.lock().unwrap_or_else(PoisonError::into_inner);
        let entries: Vec<_> = queue.drain(..).collect();

        metrics::gauge!("eventing_dead_letter_queue_size").set(0.0);
        tracing::info!(count = entries.len(), "Drained dead letter queue");

        entries
    }

    /// Get the maximum queue size
    #[must_use]
    pub const fn max_size(&self) -> usize {
        self.max_size
    }
}

impl Default for InMemoryDeadLetterQueue {
    fn default() -> Self {
        Self::new(1000)
    }
}

impl DeadLetterSink for InMemoryDeadLetterQueue {
    fn record(
        &self,
        letter: DeadLetter,
    ) -> Pin<Box<dyn Future<Output = Result<(), DeadLetterError>> + Send + '_>> {
        let result = self.push(letter);
        Box::pin(async move { result })
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)] // Test code can use unwrap
mod tests {
    use super::*;
    use chrono::Utc;
    use eventing_core::dead_letter::FailureStage;
    use eventing_core::event_bus::Delivery;

    fn letter(n: u8) -> DeadLetter {
        let delivery = Delivery::unacknowledged("customer-events", None, vec![n]);
        DeadLetter::from_delivery(&delivery, None, FailureStage::Decode, "bad bytes", 1, Utc::now())
    }

    #[tokio::test]
    async fn full_queue_rejects_instead_of_dropping() {
        let dlq = InMemoryDeadLetterQueue::new(2);
        dlq.record(letter(1)).await.unwrap();
        dlq.record(letter(2)).await.unwrap();

        let err = dlq.record(letter(3)).await.unwrap_err();
        assert_eq!(err, DeadLetterError::CapacityExceeded { capacity: 2 });

        let payloads: Vec<_> = dlq.entries().into_iter().map(|l| l.payload).collect();
        assert_eq!(payloads, vec![vec![1], vec![2]]);
    }

    #[test]
    fn take_removes_one_entry() {
        let dlq = InMemoryDeadLetterQueue::default();
        let first = letter(1);
        let id = first.id;
        dlq.push(first).unwrap();
        dlq.push(letter(2)).unwrap();

        assert_eq!(dlq.take(id).unwrap().payload, vec![1]);
        assert_eq!(dlq.len(), 1);
        assert_eq!(dlq.take(id).unwrap_err(), DeadLetterError::NotFound(id));
    }

    #[test]
    fn clones_share_storage() {
        let dlq = InMemoryDeadLetterQueue::new(10);
        let other = dlq.clone();
        dlq.push(letter(1)).unwrap();

        assert_eq!(other.len(), 1);
        assert_eq!(other.drain().len(), 1);
        assert!(dlq.is_empty());
    }
}
