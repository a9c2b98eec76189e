//! Integration tests for [`RedpandaEventBus`] with a real Kafka-compatible broker.
//!
//! These tests use testcontainers to spin up a Kafka instance and validate:
//! - Keyed publish/subscribe round-trip of event envelopes
//! - Redelivery of unacknowledged messages to the next consumer in the group
//! - Ordering of messages sharing a resource key
//!
//! # Running These Tests
//!
//! Marked `#[ignore]` because they need Docker and take 15-60 seconds each:
//! ```bash
//! cargo test -p eventing-redpanda --test integration_tests -- --ignored
//! ```

#![allow(clippy::unwrap_used, clippy::expect_used)] // Test code can use unwrap/expect

use eventing_core::event::EventEnvelope;
use eventing_core::event_bus::{Delivery, EventBus, MessageStream};
use eventing_redpanda::RedpandaEventBus;
use eventing_testing::fixtures::{CUSTOMER_TOPIC, CustomerCreated};
use futures::StreamExt;
use std::time::Duration;
use testcontainers::runners::AsyncRunner;
use testcontainers::{ContainerAsync, ImageExt};
use testcontainers_modules::kafka::{KAFKA_PORT, Kafka};

const WARMUP_KEY: &str = "warmup";

/// Start a broker with topic auto-creation and return it with its address.
async fn start_kafka() -> (ContainerAsync<Kafka>, String) {
    let kafka = Kafka::default()
        .with_env_var("KAFKA_AUTO_CREATE_TOPICS_ENABLE", "true")
        .start()
        .await
        .expect("Failed to start Kafka container");

    let host = kafka.get_host().await.expect("Failed to get host");
    let port = kafka
        .get_host_port_ipv4(KAFKA_PORT)
        .await
        .expect("Failed to get port");
    (kafka, format!("{host}:{port}"))
}

fn bus(brokers: &str, group: &str) -> RedpandaEventBus {
    RedpandaEventBus::builder()
        .brokers(brokers)
        .consumer_group(group)
        .auto_offset_reset("earliest")
        .build()
        .expect("Failed to create event bus")
}

/// Publish a warmup message until the topic exists and the broker accepts writes.
async fn ensure_topic_exists(event_bus: &RedpandaEventBus, topic: &str) {
    for attempt in 1..=60 {
        if event_bus.publish(topic, WARMUP_KEY, b"{}").await.is_ok() {
            // Let topic metadata propagate
            tokio::time::sleep(Duration::from_secs(2)).await;
            return;
        }
        tokio::time::sleep(Duration::from_millis(250)).await;
        assert!(attempt != 60, "Failed to create topic {topic}");
    }
}

/// Next non-warmup delivery. Warmup messages are acked and skipped.
async fn next_event(stream: &mut MessageStream) -> Delivery {
    tokio::time::timeout(Duration::from_secs(30), async {
        loop {
            let delivery = stream
                .next()
                .await
                .expect("stream ended")
                .expect("Failed to receive message");
            if delivery.key.as_deref() == Some(WARMUP_KEY) {
                delivery.ack().await.expect("Failed to ack warmup");
                continue;
            }
            return delivery;
        }
    })
    .await
    .expect("Timeout waiting for message")
}

async fn publish_customer(event_bus: &RedpandaEventBus, customer_id: &str, name: &str) {
    let envelope = EventEnvelope::from_event(&CustomerCreated::new(customer_id, name)).unwrap();
    event_bus
        .publish(CUSTOMER_TOPIC, &envelope.resource_id, &envelope.to_bytes().unwrap())
        .await
        .expect("Failed to publish");
}

#[tokio::test]
#[ignore = "requires Docker"]
async fn keyed_envelope_round_trip() {
    let (_kafka, brokers) = start_kafka().await;
    let event_bus = bus(&brokers, "round-trip");
    ensure_topic_exists(&event_bus, CUSTOMER_TOPIC).await;

    let mut stream = event_bus.subscribe(&[CUSTOMER_TOPIC]).await.unwrap();
    publish_customer(&event_bus, "cust-123", "Alice").await;

    let delivery = next_event(&mut stream).await;
    assert_eq!(delivery.topic, CUSTOMER_TOPIC);
    assert_eq!(delivery.key.as_deref(), Some("cust-123"));

    let envelope = EventEnvelope::from_bytes(&delivery.payload).unwrap();
    assert_eq!(envelope.event_type, "CustomerCreated");
    assert_eq!(envelope.resource_id, "cust-123");
    let event: CustomerCreated = envelope.decode().unwrap();
    assert_eq!(event.name, "Alice");

    delivery.ack().await.unwrap();
}

#[tokio::test]
#[ignore = "requires Docker"]
async fn unacknowledged_message_is_redelivered_to_the_group() {
    let (_kafka, brokers) = start_kafka().await;
    let first = bus(&brokers, "redelivery");
    ensure_topic_exists(&first, CUSTOMER_TOPIC).await;

    let mut stream = first.subscribe(&[CUSTOMER_TOPIC]).await.unwrap();
    publish_customer(&first, "cust-1", "Acked").await;
    publish_customer(&first, "cust-1", "Dropped").await;

    let acked = next_event(&mut stream).await;
    acked.ack().await.unwrap();
    let dropped = next_event(&mut stream).await;
    assert_eq!(dropped.key.as_deref(), Some("cust-1"));
    drop(dropped);

    // Give the consumer task time to commit, then leave the group
    tokio::time::sleep(Duration::from_secs(2)).await;
    drop(stream);
    tokio::time::sleep(Duration::from_secs(2)).await;

    let second = bus(&brokers, "redelivery");
    let mut stream = second.subscribe(&[CUSTOMER_TOPIC]).await.unwrap();
    let redelivered = next_event(&mut stream).await;
    let event: CustomerCreated = EventEnvelope::from_bytes(&redelivered.payload)
        .unwrap()
        .decode()
        .unwrap();
    assert_eq!(event.name, "Dropped");
}

#[tokio::test]
#[ignore = "requires Docker"]
async fn messages_for_one_resource_arrive_in_order() {
    let (_kafka, brokers) = start_kafka().await;
    let event_bus = bus(&brokers, "ordering");
    ensure_topic_exists(&event_bus, CUSTOMER_TOPIC).await;

    let mut stream = event_bus.subscribe(&[CUSTOMER_TOPIC]).await.unwrap();
    for i in 0..10 {
        publish_customer(&event_bus, "cust-42", &format!("name-{i}")).await;
    }

    for i in 0..10 {
        let delivery = next_event(&mut stream).await;
        let event: CustomerCreated = EventEnvelope::from_bytes(&delivery.payload)
            .unwrap()
            .decode()
            .unwrap();
        assert_eq!(event.name, format!("name-{i}"));
        delivery.ack().await.unwrap();
    }
}
