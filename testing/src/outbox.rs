//! In-memory outbox store.
//!
//! Behaves like the Postgres outbox: records are claimed oldest first under a lease,
//! and a claim that is neither published nor failed before the lease runs out makes
//! the record claimable again. Only the oldest pending record of a resource is
//! claimable. Time comes from the configured [`Clock`], so tests
//! can drive scheduling with a [`MockClock`](crate::mocks::MockClock).

use chrono::{DateTime, TimeDelta, Utc};
use eventing_core::environment::{Clock, SystemClock};
use eventing_core::event::{Event, EventEnvelope};
use eventing_core::outbox::{OutboxError, OutboxFuture, OutboxRecord, OutboxStatus, OutboxStore};
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use uuid::Uuid;

struct Entry {
    record: OutboxRecord,
    claimed_until: Option<DateTime<Utc>>,
    seq: u64,
}

#[derive(Default)]
struct State {
    entries: HashMap<Uuid, Entry>,
    next_seq: u64,
}

/// In-memory [`OutboxStore`]. Clones share the same records.
#[derive(Clone)]
pub struct InMemoryOutboxStore {
    state: Arc<Mutex<State>>,
    clock: Arc<dyn Clock>,
}

impl Default for InMemoryOutboxStore {
    fn default() -> Self {
        Self::new()
    }
}

impl InMemoryOutboxStore {
    /// Create an empty store on the system clock.
    #[must_use]
    pub fn new() -> Self {
        Self {
            state: Arc::new(Mutex::new(State::default())),
            clock: Arc::new(SystemClock),
        }
    }

    /// Use `clock` for due checks, leases and timestamps.
    #[must_use]
    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    fn lock(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Write an envelope as a pending record and return its id.
    pub fn enqueue(&self, envelope: EventEnvelope) -> Uuid {
        let now = self.clock.now();
        let record = OutboxRecord::new(envelope, now);
        let id = record.id;

        let mut state = self.lock();
        let seq = state.next_seq;
        state.next_seq += 1;
        state.entries.insert(
            id,
            Entry {
                record,
                claimed_until: None,
                seq,
            },
        );
        id
    }

    /// Wrap `event` in an envelope and enqueue it.
    ///
    /// # Errors
    ///
    /// Returns [`OutboxError::Serialization`] if the event cannot be serialized.
    pub fn publish_event<E: Event>(&self, event: &E) -> Result<Uuid, OutboxError> {
        let envelope = EventEnvelope::from_event(event)
            .map_err(|err| OutboxError::Serialization(err.to_string()))?;
        Ok(self.enqueue(envelope))
    }

    /// All records in insertion order.
    #[must_use]
    pub fn records(&self) -> Vec<OutboxRecord> {
        let state = self.lock();
        let mut entries: Vec<&Entry> = state.entries.values().collect();
        entries.sort_by_key(|e| e.seq);
        entries.into_iter().map(|e| e.record.clone()).collect()
    }

    /// Look up one record.
    #[must_use]
    pub fn get(&self, id: Uuid) -> Option<OutboxRecord> {
        self.lock().entries.get(&id).map(|e| e.record.clone())
    }

    fn update(
        &self,
        id: Uuid,
        apply: impl FnOnce(&mut OutboxRecord, DateTime<Utc>),
    ) -> Result<(), OutboxError> {
        let now = self.clock.now();
        let mut state = self.lock();
        let entry = state.entries.get_mut(&id).ok_or(OutboxError::NotFound(id))?;
        apply(&mut entry.record, now);
        entry.claimed_until = None;
        Ok(())
    }
}

impl OutboxStore for InMemoryOutboxStore {
    fn claim_due(&self, limit: usize, lease: Duration) -> OutboxFuture<'_, Vec<OutboxRecord>> {
        Box::pin(async move {
            let now = self.clock.now();
            let lease = TimeDelta::from_std(lease)
                .map_err(|err| OutboxError::Storage(format!("invalid lease: {err}")))?;
            let claimed_until = now + lease;

            let mut state = self.lock();
            let mut heads: HashMap<String, (DateTime<Utc>, u64)> = HashMap::new();
            for entry in state.entries.values() {
                if entry.record.status != OutboxStatus::Pending {
                    continue;
                }
                let position = (entry.record.created_at, entry.seq);
                heads
                    .entry(entry.record.envelope.resource_id.clone())
                    .and_modify(|head| *head = (*head).min(position))
                    .or_insert(position);
            }

            let mut due: Vec<&mut Entry> = state
                .entries
                .values_mut()
                .filter(|e| {
                    heads.get(&e.record.envelope.resource_id)
                        == Some(&(e.record.created_at, e.seq))
                })
                .filter(|e| e.record.is_due(now))
                .filter(|e| e.claimed_until.is_none_or(|until| until <= now))
                .collect();
            due.sort_by_key(|e| (e.record.created_at, e.seq));

            Ok(due
                .into_iter()
                .take(limit)
                .map(|entry| {
                    entry.claimed_until = Some(claimed_until);
                    entry.record.clone()
                })
                .collect())
        })
    }

    fn mark_published(&self, id: Uuid) -> OutboxFuture<'_, ()> {
        Box::pin(async move {
            self.update(id, |record, now| {
                record.status = OutboxStatus::Published;
                record.published_at = Some(now);
            })
        })
    }

    fn mark_failed(
        &self,
        id: Uuid,
        error: String,
        next_attempt_at: DateTime<Utc>,
    ) -> OutboxFuture<'_, ()> {
        Box::pin(async move {
            self.update(id, |record, _| {
                record.attempts = record.attempts.saturating_add(1);
                record.last_error = Some(error);
                record.next_attempt_at = Some(next_attempt_at);
            })
        })
    }

    fn mark_dead_lettered(&self, id: Uuid, error: String) -> OutboxFuture<'_, ()> {
        Box::pin(async move {
            self.update(id, |record, _| {
                record.attempts = record.attempts.saturating_add(1);
                record.last_error = Some(error);
                record.status = OutboxStatus::DeadLettered;
            })
        })
    }

    fn pending_count(&self) -> OutboxFuture<'_, u64> {
        Box::pin(async move {
            let state = self.lock();
            Ok(state
                .entries
                .values()
                .filter(|e| e.record.status == OutboxStatus::Pending)
                .count() as u64)
        })
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)] // Test code can use unwrap
mod tests {
    use super::*;
    use crate::fixtures::{CustomerCreated, CustomerRenamed};
    use crate::mocks::MockClock;

    const LEASE: Duration = Duration::from_secs(30);

    #[tokio::test]
    async fn claims_oldest_first_up_to_limit() {
        let store = InMemoryOutboxStore::new();
        let first = store
            .publish_event(&CustomerCreated::new("cust-1", "Alice"))
            .unwrap();
        let second = store
            .publish_event(&CustomerCreated::new("cust-2", "Bob"))
            .unwrap();
        store
            .publish_event(&CustomerCreated::new("cust-3", "Carol"))
            .unwrap();

        let claimed = store.claim_due(2, LEASE).await.unwrap();
        let ids: Vec<_> = claimed.iter().map(|r| r.id).collect();
        assert_eq!(ids, vec![first, second]);
    }

    #[tokio::test]
    async fn claimed_records_are_leased() {
        let clock = Arc::new(MockClock::new(Utc::now()));
        let store = InMemoryOutboxStore::new().with_clock(clock.clone());
        store
            .publish_event(&CustomerCreated::new("cust-1", "Alice"))
            .unwrap();

        assert_eq!(store.claim_due(10, LEASE).await.unwrap().len(), 1);
        assert!(store.claim_due(10, LEASE).await.unwrap().is_empty());

        clock.advance(Duration::from_secs(31));
        assert_eq!(store.claim_due(10, LEASE).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn failed_records_wait_for_their_next_attempt() {
        let clock = Arc::new(MockClock::new(Utc::now()));
        let store = InMemoryOutboxStore::new().with_clock(clock.clone());
        let id = store
            .publish_event(&CustomerCreated::new("cust-1", "Alice"))
            .unwrap();

        store.claim_due(10, LEASE).await.unwrap();
        let retry_at = clock.now() + TimeDelta::seconds(5);
        store
            .mark_failed(id, "broker down".to_string(), retry_at)
            .await
            .unwrap();

        assert!(store.claim_due(10, LEASE).await.unwrap().is_empty());
        clock.advance(Duration::from_secs(5));

        let claimed = store.claim_due(10, LEASE).await.unwrap();
        assert_eq!(claimed[0].attempts, 1);
        assert_eq!(claimed[0].last_error.as_deref(), Some("broker down"));
    }

    #[tokio::test]
    async fn later_records_wait_behind_the_oldest_of_their_resource() {
        let clock = Arc::new(MockClock::new(Utc::now()));
        let store = InMemoryOutboxStore::new().with_clock(clock.clone());
        let created = store
            .publish_event(&CustomerCreated::new("cust-1", "Alice"))
            .unwrap();
        let renamed = store
            .publish_event(&CustomerRenamed::new("cust-1", "Alicia"))
            .unwrap();
        let other = store
            .publish_event(&CustomerCreated::new("cust-2", "Bob"))
            .unwrap();

        let ids: Vec<_> = store
            .claim_due(10, LEASE)
            .await
            .unwrap()
            .iter()
            .map(|r| r.id)
            .collect();
        assert_eq!(ids, vec![created, other]);

        // Backing off still holds the resource
        let retry_at = clock.now() + TimeDelta::seconds(5);
        store
            .mark_failed(created, "broker down".to_string(), retry_at)
            .await
            .unwrap();
        store.mark_published(other).await.unwrap();
        assert!(store.claim_due(10, LEASE).await.unwrap().is_empty());

        clock.advance(Duration::from_secs(5));
        let claimed = store.claim_due(10, LEASE).await.unwrap();
        assert_eq!(claimed.len(), 1);
        assert_eq!(claimed[0].id, created);

        store.mark_published(created).await.unwrap();
        let claimed = store.claim_due(10, LEASE).await.unwrap();
        assert_eq!(claimed[0].id, renamed);
    }

    #[tokio::test]
    async fn terminal_records_are_never_claimed() {
        let store = InMemoryOutboxStore::new();
        let published = store
            .publish_event(&CustomerCreated::new("cust-1", "Alice"))
            .unwrap();
        let dead = store
            .publish_event(&CustomerCreated::new("cust-2", "Bob"))
            .unwrap();

        store.mark_published(published).await.unwrap();
        store
            .mark_dead_lettered(dead, "gave up".to_string())
            .await
            .unwrap();

        assert!(store.claim_due(10, LEASE).await.unwrap().is_empty());
        assert_eq!(store.pending_count().await.unwrap(), 0);
        assert!(store.get(published).unwrap().published_at.is_some());
        assert_eq!(store.get(dead).unwrap().status, OutboxStatus::DeadLettered);
    }

    #[tokio::test]
    async fn unknown_ids_are_not_found() {
        let store = InMemoryOutboxStore::new();
        let id = Uuid::new_v4();
        assert_eq!(
            store.mark_published(id).await,
            Err(OutboxError::NotFound(id))
        );
    }
}
