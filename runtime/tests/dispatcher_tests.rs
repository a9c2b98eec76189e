//! Integration tests for the event dispatcher
//!
//! Covers the per-message pipeline (decode, validate, handle, retry, dead-letter,
//! acknowledge) and the spawned reader/worker pool against the in-memory bus.

#![allow(clippy::unwrap_used, clippy::expect_used)] // Test code can use unwrap/expect

use eventing_core::dead_letter::{DeadLetter, DeadLetterError, DeadLetterSink, FailureStage};
use eventing_core::event::{Event, EventEnvelope};
use eventing_core::event_bus::{Delivery, EventBus};
use eventing_core::handler::HandlerError;
use eventing_core::registry::EventRegistry;
use eventing_runtime::dead_letter::InMemoryDeadLetterQueue;
use eventing_runtime::dispatcher::{DispatchOutcome, Dispatcher, DispatcherConfig, DispatcherError};
use eventing_runtime::retry::RetryPolicy;
use eventing_testing::event_bus::InMemoryEventBus;
use eventing_testing::fixtures::{CUSTOMER_TOPIC, CustomerCreated, CustomerRenamed, OrderPlaced};
use futures::StreamExt;
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

// ============================================================================
// Test Fixtures
// ============================================================================

fn fast_retry(max_attempts: u32) -> RetryPolicy {
    RetryPolicy::builder()
        .max_attempts(max_attempts)
        .initial_delay(Duration::from_millis(1))
        .max_delay(Duration::from_millis(5))
        .jitter(false)
        .build()
}

fn config() -> DispatcherConfig {
    DispatcherConfig::default()
        .with_name("test-dispatcher")
        .with_retry(fast_retry(3))
        .with_resubscribe_delay(Duration::from_millis(10))
}

struct Harness {
    bus: InMemoryEventBus,
    dead_letters: InMemoryDeadLetterQueue,
    dispatcher: Dispatcher,
}

fn harness(registry: EventRegistry) -> Harness {
    let bus = InMemoryEventBus::new();
    let dead_letters = InMemoryDeadLetterQueue::new(100);
    let dispatcher = Dispatcher::new(
        Arc::new(registry),
        Arc::new(bus.clone()),
        Arc::new(dead_letters.clone()),
        config(),
    );
    Harness {
        bus,
        dead_letters,
        dispatcher,
    }
}

/// Publish `event` and read it back as a delivery.
async fn deliver<E: Event>(bus: &InMemoryEventBus, event: &E) -> Delivery {
    let envelope = EventEnvelope::from_event(event).unwrap();
    deliver_envelope(bus, &envelope).await
}

async fn deliver_envelope(bus: &InMemoryEventBus, envelope: &EventEnvelope) -> Delivery {
    bus.publish_envelope(envelope).await.unwrap();
    next_delivery(bus, &envelope.topic).await
}

async fn next_delivery(bus: &InMemoryEventBus, topic: &str) -> Delivery {
    let mut stream = bus.subscribe(&[topic]).await.unwrap();
    tokio::time::timeout(Duration::from_secs(1), stream.next())
        .await
        .expect("delivery within a second")
        .unwrap()
        .unwrap()
}

fn counting_registry(
    calls: &Arc<AtomicU32>,
    result: impl Fn(u32) -> Result<(), HandlerError> + Send + Sync + 'static,
) -> EventRegistry {
    let calls = Arc::clone(calls);
    let mut registry = EventRegistry::new();
    registry
        .register_fn::<CustomerCreated, _, _>(move |_event, _ctx| {
            let call = calls.fetch_add(1, Ordering::SeqCst) + 1;
            let outcome = result(call);
            async move { outcome }
        })
        .unwrap();
    registry
}

struct RejectingSink;

impl DeadLetterSink for RejectingSink {
    fn record(
        &self,
        _letter: DeadLetter,
    ) -> Pin<Box<dyn Future<Output = Result<(), DeadLetterError>> + Send + '_>> {
        Box::pin(async { Err(DeadLetterError::Storage("disk full".to_string())) })
    }
}

/// Rejects the first `failures` letters, then stores the rest.
struct FlakySink {
    failures: AtomicU32,
    calls: AtomicU32,
    stored: InMemoryDeadLetterQueue,
}

impl FlakySink {
    fn new(failures: u32) -> Self {
        Self {
            failures: AtomicU32::new(failures),
            calls: AtomicU32::new(0),
            stored: InMemoryDeadLetterQueue::new(10),
        }
    }
}

impl DeadLetterSink for FlakySink {
    fn record(
        &self,
        letter: DeadLetter,
    ) -> Pin<Box<dyn Future<Output = Result<(), DeadLetterError>> + Send + '_>> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let reject = self
            .failures
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |left| left.checked_sub(1))
            .is_ok();
        Box::pin(async move {
            if reject {
                return Err(DeadLetterError::Storage("connection reset".to_string()));
            }
            self.stored.record(letter).await
        })
    }
}

// ============================================================================
// Per-message pipeline
// ============================================================================

#[tokio::test]
async fn customer_created_is_handled_and_acknowledged() {
    let seen = Arc::new(Mutex::new(Vec::new()));
    let mut registry = EventRegistry::new();
    let sink = Arc::clone(&seen);
    registry
        .register_fn::<CustomerCreated, _, _>(move |event, ctx| {
            sink.lock()
                .unwrap()
                .push((event.customer_id, event.name, ctx.attempt));
            async { Ok(()) }
        })
        .unwrap();
    let h = harness(registry);

    let delivery = deliver(&h.bus, &CustomerCreated::new("cust-123", "Alice")).await;
    let outcome = h.dispatcher.process(delivery).await;

    assert_eq!(outcome, DispatchOutcome::Acknowledged { attempts: 1 });
    assert_eq!(
        *seen.lock().unwrap(),
        vec![("cust-123".to_string(), "Alice".to_string(), 1)]
    );
    assert!(h.bus.is_acked(CUSTOMER_TOPIC, 0));
    assert!(h.dead_letters.is_empty());

    let stats = h.dispatcher.stats().snapshot();
    assert_eq!(stats.received, 1);
    assert_eq!(stats.acknowledged, 1);
    assert_eq!(stats.retries, 0);
}

#[tokio::test]
async fn unknown_event_type_is_dead_lettered_without_running_a_handler() {
    let calls = Arc::new(AtomicU32::new(0));
    let h = harness(counting_registry(&calls, |_| Ok(())));

    let delivery = deliver(&h.bus, &CustomerRenamed::new("cust-1", "Bob")).await;
    let outcome = h.dispatcher.process(delivery).await;

    assert_eq!(
        outcome,
        DispatchOutcome::DeadLettered {
            stage: FailureStage::UnknownEventType,
            attempts: 0
        }
    );
    assert_eq!(calls.load(Ordering::SeqCst), 0);
    assert!(h.bus.is_acked(CUSTOMER_TOPIC, 0));

    let letters = h.dead_letters.entries();
    assert_eq!(letters.len(), 1);
    assert_eq!(letters[0].event_type.as_deref(), Some("CustomerRenamed"));
    assert_eq!(letters[0].resource_id.as_deref(), Some("cust-1"));
}

#[tokio::test]
async fn recoverable_failure_is_retried_then_succeeds() {
    let calls = Arc::new(AtomicU32::new(0));
    let h = harness(counting_registry(&calls, |call| {
        if call < 3 {
            Err(HandlerError::recoverable("database busy"))
        } else {
            Ok(())
        }
    }));

    let delivery = deliver(&h.bus, &CustomerCreated::new("cust-1", "Alice")).await;
    let outcome = h.dispatcher.process(delivery).await;

    assert_eq!(outcome, DispatchOutcome::Acknowledged { attempts: 3 });
    assert_eq!(calls.load(Ordering::SeqCst), 3);
    assert_eq!(h.dispatcher.stats().snapshot().retries, 2);
}

#[tokio::test]
async fn recoverable_failure_is_dead_lettered_once_retries_are_exhausted() {
    let calls = Arc::new(AtomicU32::new(0));
    let h = harness(counting_registry(&calls, |_| {
        Err(HandlerError::recoverable("database busy"))
    }));

    let delivery = deliver(&h.bus, &CustomerCreated::new("cust-1", "Alice")).await;
    let outcome = h.dispatcher.process(delivery).await;

    assert_eq!(
        outcome,
        DispatchOutcome::DeadLettered {
            stage: FailureStage::RetriesExhausted,
            attempts: 3
        }
    );
    assert_eq!(calls.load(Ordering::SeqCst), 3);

    let letter = &h.dead_letters.entries()[0];
    assert_eq!(letter.attempts, 3);
    assert!(letter.error.contains("database busy"));
    assert!(h.bus.is_acked(CUSTOMER_TOPIC, 0));
}

#[tokio::test]
async fn fatal_failure_is_dead_lettered_immediately() {
    let calls = Arc::new(AtomicU32::new(0));
    let h = harness(counting_registry(&calls, |_| {
        Err(HandlerError::fatal("name must not be blank"))
    }));

    let delivery = deliver(&h.bus, &CustomerCreated::new("cust-1", "")).await;
    let outcome = h.dispatcher.process(delivery).await;

    assert_eq!(
        outcome,
        DispatchOutcome::DeadLettered {
            stage: FailureStage::Handler,
            attempts: 1
        }
    );
    assert_eq!(calls.load(Ordering::SeqCst), 1);
    assert_eq!(h.dispatcher.stats().snapshot().retries, 0);
}

#[tokio::test]
async fn topic_mismatch_fails_validation_before_the_handler() {
    let calls = Arc::new(AtomicU32::new(0));
    let h = harness(counting_registry(&calls, |_| Ok(())));

    let mut envelope = EventEnvelope::from_event(&CustomerCreated::new("cust-1", "Alice")).unwrap();
    envelope.topic = "order-events".to_string();
    let delivery = deliver_envelope(&h.bus, &envelope).await;
    let outcome = h.dispatcher.process(delivery).await;

    assert_eq!(
        outcome,
        DispatchOutcome::DeadLettered {
            stage: FailureStage::Validation,
            attempts: 0
        }
    );
    assert_eq!(calls.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn malformed_bytes_are_dead_lettered_as_decode_failures() {
    let calls = Arc::new(AtomicU32::new(0));
    let h = harness(counting_registry(&calls, |_| Ok(())));

    h.bus
        .publish(CUSTOMER_TOPIC, "cust-1", b"not json")
        .await
        .unwrap();
    let delivery = next_delivery(&h.bus, CUSTOMER_TOPIC).await;
    let outcome = h.dispatcher.process(delivery).await;

    assert_eq!(
        outcome,
        DispatchOutcome::DeadLettered {
            stage: FailureStage::Decode,
            attempts: 0
        }
    );
    let letter = &h.dead_letters.entries()[0];
    assert_eq!(letter.payload, b"not json".to_vec());
    assert_eq!(letter.key.as_deref(), Some("cust-1"));
    assert!(letter.event_id.is_none());
}

#[tokio::test]
async fn payload_that_does_not_match_the_type_is_a_decode_failure() {
    let calls = Arc::new(AtomicU32::new(0));
    let h = harness(counting_registry(&calls, |_| Ok(())));

    let mut envelope = EventEnvelope::from_event(&CustomerCreated::new("cust-1", "Alice")).unwrap();
    envelope.payload = serde_json::json!({ "unexpected": true });
    let delivery = deliver_envelope(&h.bus, &envelope).await;

    let outcome = h.dispatcher.process(delivery).await;
    assert_eq!(
        outcome,
        DispatchOutcome::DeadLettered {
            stage: FailureStage::Decode,
            attempts: 0
        }
    );
    assert_eq!(calls.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn rejected_dead_letter_leaves_the_message_unacknowledged() {
    let calls = Arc::new(AtomicU32::new(0));
    let bus = InMemoryEventBus::new();
    let dispatcher = Dispatcher::new(
        Arc::new(counting_registry(&calls, |_| Err(HandlerError::fatal("boom")))),
        Arc::new(bus.clone()),
        Arc::new(RejectingSink),
        config(),
    );

    let delivery = deliver(&bus, &CustomerCreated::new("cust-1", "Alice")).await;
    let outcome = dispatcher.process(delivery).await;

    assert!(matches!(outcome, DispatchOutcome::Unacknowledged { .. }));
    assert!(!bus.is_acked(CUSTOMER_TOPIC, 0));
    assert_eq!(dispatcher.stats().snapshot().unacknowledged, 1);
}

// ============================================================================
// Spawned dispatcher
// ============================================================================

#[tokio::test]
async fn dead_letter_write_is_retried_until_the_sink_recovers() {
    let calls = Arc::new(AtomicU32::new(0));
    let bus = InMemoryEventBus::new();
    let sink = Arc::new(FlakySink::new(1));
    let handle = Dispatcher::new(
        Arc::new(counting_registry(&calls, |_| Err(HandlerError::fatal("boom")))),
        Arc::new(bus.clone()),
        sink.clone(),
        config(),
    )
    .spawn()
    .unwrap();

    bus.publish_envelope(&EventEnvelope::from_event(&CustomerCreated::new("cust-1", "Alice")).unwrap())
        .await
        .unwrap();

    assert!(bus.wait_for_acks(1, Duration::from_secs(5)).await);
    assert_eq!(sink.calls.load(Ordering::SeqCst), 2);
    assert_eq!(sink.stored.len(), 1);
    assert_eq!(calls.load(Ordering::SeqCst), 1, "the handler is not run again");

    let report = handle.shutdown(Duration::from_secs(1)).await.unwrap();
    assert_eq!(report.stats.dead_lettered, 1);
    assert_eq!(report.stats.unacknowledged, 0);
}

#[tokio::test]
async fn shutdown_interrupts_a_failing_dead_letter_write() {
    let calls = Arc::new(AtomicU32::new(0));
    let bus = InMemoryEventBus::new();
    let sink = Arc::new(FlakySink::new(u32::MAX));
    let handle = Dispatcher::new(
        Arc::new(counting_registry(&calls, |_| Err(HandlerError::fatal("boom")))),
        Arc::new(bus.clone()),
        sink.clone(),
        config(),
    )
    .spawn()
    .unwrap();

    bus.publish_envelope(&EventEnvelope::from_event(&CustomerCreated::new("cust-1", "Alice")).unwrap())
        .await
        .unwrap();

    // Keeps trying past the handler retry budget while the worker runs
    while sink.calls.load(Ordering::SeqCst) < 5 {
        tokio::time::sleep(Duration::from_millis(5)).await;
    }

    let report = handle.shutdown(Duration::from_secs(1)).await.unwrap();
    assert_eq!(report.stats.unacknowledged, 1);
    assert_eq!(report.stats.dead_lettered, 0);
    assert_eq!(bus.acked_count(), 0);
}

#[tokio::test]
async fn events_for_one_resource_are_handled_in_order() {
    let handled: Arc<Mutex<Vec<(String, String)>>> = Arc::new(Mutex::new(Vec::new()));
    let mut registry = EventRegistry::new();
    let sink = Arc::clone(&handled);
    registry
        .register_fn::<CustomerRenamed, _, _>(move |event, _ctx| {
            let sink = Arc::clone(&sink);
            async move {
                // Uneven handler latency would expose reordering
                let jitter = event.name.bytes().last().map_or(0, |b| u64::from(b) % 3);
                tokio::time::sleep(Duration::from_millis(jitter)).await;
                sink.lock().unwrap().push((event.customer_id, event.name));
                Ok(())
            }
        })
        .unwrap();
    let h = harness(registry);
    let handle = h.dispatcher.spawn().unwrap();

    for seq in 0..10 {
        for customer in ["cust-1", "cust-2", "cust-3"] {
            let event = CustomerRenamed::new(customer, format!("name-{seq}"));
            h.bus
                .publish_envelope(&EventEnvelope::from_event(&event).unwrap())
                .await
                .unwrap();
        }
    }

    assert!(h.bus.wait_for_acks(30, Duration::from_secs(5)).await);
    let report = handle.shutdown(Duration::from_secs(1)).await.unwrap();
    assert_eq!(report.stats.acknowledged, 30);

    let handled = handled.lock().unwrap();
    for customer in ["cust-1", "cust-2", "cust-3"] {
        let names: Vec<&str> = handled
            .iter()
            .filter(|(id, _)| id == customer)
            .map(|(_, name)| name.as_str())
            .collect();
        let expected: Vec<String> = (0..10).map(|seq| format!("name-{seq}")).collect();
        assert_eq!(names, expected, "order for {customer}");
    }
}

#[tokio::test]
async fn dispatcher_subscribes_to_every_registered_topic() {
    let mut registry = EventRegistry::new();
    registry
        .register_fn::<CustomerCreated, _, _>(|_, _| async { Ok(()) })
        .unwrap()
        .register_fn::<OrderPlaced, _, _>(|_, _| async { Ok(()) })
        .unwrap();
    let h = harness(registry);
    assert_eq!(h.dispatcher.topics(), vec!["customer-events", "order-events"]);

    let handle = h.dispatcher.spawn().unwrap();
    h.bus
        .publish_envelope(&EventEnvelope::from_event(&CustomerCreated::new("cust-1", "Alice")).unwrap())
        .await
        .unwrap();
    h.bus
        .publish_envelope(&EventEnvelope::from_event(&OrderPlaced::new("ord-1", "cust-1", 4200)).unwrap())
        .await
        .unwrap();

    assert!(h.bus.wait_for_acks(2, Duration::from_secs(5)).await);
    handle.shutdown(Duration::from_secs(1)).await.unwrap();
}

#[tokio::test]
async fn dispatcher_resubscribes_after_a_failed_subscribe() {
    let calls = Arc::new(AtomicU32::new(0));
    let h = harness(counting_registry(&calls, |_| Ok(())));
    h.bus.fail_next_subscribes(2);

    let handle = h.dispatcher.spawn().unwrap();
    h.bus
        .publish_envelope(&EventEnvelope::from_event(&CustomerCreated::new("cust-1", "Alice")).unwrap())
        .await
        .unwrap();

    assert!(h.bus.wait_for_acks(1, Duration::from_secs(5)).await);
    assert_eq!(calls.load(Ordering::SeqCst), 1);
    handle.shutdown(Duration::from_secs(1)).await.unwrap();
}

#[tokio::test]
async fn shutdown_leaves_queued_messages_unacknowledged() {
    let (started_tx, mut started_rx) = tokio::sync::mpsc::unbounded_channel();
    let mut registry = EventRegistry::new();
    registry
        .register_fn::<CustomerCreated, _, _>(move |_event, _ctx| {
            let started = started_tx.clone();
            async move {
                let _ = started.send(());
                tokio::time::sleep(Duration::from_millis(100)).await;
                Ok(())
            }
        })
        .unwrap();
    let h = harness(registry);
    let handle = h.dispatcher.spawn().unwrap();

    for name in ["Alice", "Bob", "Carol"] {
        // Same resource, so all three queue behind one worker
        let event = CustomerCreated::new("cust-1", name);
        h.bus
            .publish_envelope(&EventEnvelope::from_event(&event).unwrap())
            .await
            .unwrap();
    }

    started_rx.recv().await.unwrap();
    let report = handle.shutdown(Duration::from_secs(5)).await.unwrap();

    // The in-flight message finishes; nothing after it is started
    assert_eq!(report.stats.acknowledged, 1);
    assert_eq!(h.bus.acked_count(), 1);
    assert_eq!(h.bus.unacked().len(), 2);
}

#[tokio::test]
async fn shutdown_interrupts_retry_backoff() {
    let calls = Arc::new(AtomicU32::new(0));
    let bus = InMemoryEventBus::new();
    let slow_retry = RetryPolicy::builder()
        .max_attempts(5)
        .initial_delay(Duration::from_secs(60))
        .jitter(false)
        .build();
    let dispatcher = Dispatcher::new(
        Arc::new(counting_registry(&calls, |_| {
            Err(HandlerError::recoverable("database busy"))
        })),
        Arc::new(bus.clone()),
        Arc::new(InMemoryDeadLetterQueue::new(10)),
        config().with_retry(slow_retry),
    );
    let handle = dispatcher.spawn().unwrap();

    bus.publish_envelope(&EventEnvelope::from_event(&CustomerCreated::new("cust-1", "Alice")).unwrap())
        .await
        .unwrap();
    while calls.load(Ordering::SeqCst) == 0 {
        tokio::time::sleep(Duration::from_millis(5)).await;
    }

    let report = handle.shutdown(Duration::from_secs(1)).await.unwrap();
    assert_eq!(report.stats.unacknowledged, 1);
    assert_eq!(bus.acked_count(), 0);
}

#[tokio::test]
async fn empty_registry_cannot_be_spawned() {
    let h = harness(EventRegistry::new());
    assert!(matches!(h.dispatcher.spawn(), Err(DispatcherError::NoTopics)));
}
