//! Unit tests for the in-process broker model.
//!
//! Validates:
//! - direct routing through the ready exchange
//! - TTL expiry and dead-lettering into the destination queue
//! - prefetch bounds unacknowledged deliveries
//! - reject-with-requeue and consumer loss redeliver at the head
//! - connection loss surfaces as `BrokerUnavailable`

use std::time::Duration;

use interaction_relay::broker::memory::MemoryBroker;
use interaction_relay::broker::{Broker, Topology};
use interaction_relay::config::BrokerConfig;
use interaction_relay::AppError;

const DESTINATION: &str = "interactions.scheduled";

async fn broker_with(tiers: Vec<u64>) -> (MemoryBroker, Topology) {
    let broker = MemoryBroker::new();
    let topology = Topology::from_config(&BrokerConfig {
        delay_tiers_seconds: tiers,
        ..BrokerConfig::default()
    });
    broker.ensure_topology(&topology).await.expect("topology");
    (broker, topology)
}

#[tokio::test]
async fn ensure_topology_is_idempotent() {
    let (broker, topology) = broker_with(vec![10, 60]).await;
    broker.ensure_topology(&topology).await.expect("second ensure");
    assert_eq!(broker.ready_count(DESTINATION).await, 0);
}

#[tokio::test]
async fn ready_exchange_routes_by_key() {
    let (broker, topology) = broker_with(vec![10]).await;

    broker
        .publish(&topology.ready_exchange, &topology.routing_key, b"one", None)
        .await
        .expect("publish");
    broker
        .publish(&topology.ready_exchange, "other-key", b"dropped", None)
        .await
        .expect("unroutable publish still succeeds");

    assert_eq!(broker.ready_count(DESTINATION).await, 1);
}

#[tokio::test(start_paused = true)]
async fn expired_messages_dead_letter_into_destination() {
    let (broker, _) = broker_with(vec![10]).await;

    broker
        .publish("", "interactions.delay.10s", b"later", Some(Duration::from_secs(5)))
        .await
        .expect("publish");
    assert_eq!(broker.ready_count(DESTINATION).await, 0);
    assert_eq!(broker.ready_count("interactions.delay.10s").await, 1);

    tokio::time::advance(Duration::from_secs(5)).await;
    assert_eq!(broker.ready_count(DESTINATION).await, 1);
    assert_eq!(broker.ready_count("interactions.delay.10s").await, 0);

    let mut subscription = broker.subscribe(DESTINATION, 1).await.expect("subscribe");
    let message = subscription
        .next_message()
        .await
        .expect("next")
        .expect("message");
    assert_eq!(message.payload, b"later");
    assert!(!message.redelivered);
}

#[tokio::test(start_paused = true)]
async fn subscription_wakes_when_a_delay_expires() {
    let (broker, _) = broker_with(vec![10]).await;
    let mut subscription = broker.subscribe(DESTINATION, 1).await.expect("subscribe");

    broker
        .publish("", "interactions.delay.10s", b"soon", Some(Duration::from_secs(3)))
        .await
        .expect("publish");

    let started = tokio::time::Instant::now();
    let message = subscription
        .next_message()
        .await
        .expect("next")
        .expect("message");
    assert_eq!(message.payload, b"soon");
    assert!(started.elapsed() >= Duration::from_secs(3));
}

#[tokio::test(start_paused = true)]
async fn prefetch_bounds_unacked_deliveries() {
    let (broker, topology) = broker_with(vec![10]).await;
    for payload in [b"a", b"b", b"c"] {
        broker
            .publish(&topology.ready_exchange, &topology.routing_key, payload, None)
            .await
            .expect("publish");
    }

    let mut subscription = broker.subscribe(DESTINATION, 2).await.expect("subscribe");
    let first = subscription.next_message().await.expect("next").expect("a");
    let _second = subscription.next_message().await.expect("next").expect("b");
    assert_eq!(broker.unacked_count(DESTINATION).await, 2);

    let third = tokio::time::timeout(Duration::from_secs(1), subscription.next_message()).await;
    assert!(third.is_err(), "third delivery must wait for an ack");

    first.ack().await.expect("ack");
    let third = subscription.next_message().await.expect("next").expect("c");
    assert_eq!(third.payload, b"c");
}

#[tokio::test]
async fn reject_with_requeue_redelivers_at_head() {
    let (broker, topology) = broker_with(vec![10]).await;
    for payload in [b"first".as_slice(), b"second".as_slice()] {
        broker
            .publish(&topology.ready_exchange, &topology.routing_key, payload, None)
            .await
            .expect("publish");
    }

    let mut subscription = broker.subscribe(DESTINATION, 1).await.expect("subscribe");
    let first = subscription.next_message().await.expect("next").expect("message");
    first.reject(true).await.expect("reject");

    let again = subscription.next_message().await.expect("next").expect("message");
    assert_eq!(again.payload, b"first");
    assert!(again.redelivered);

    again.reject(false).await.expect("drop");
    let second = subscription.next_message().await.expect("next").expect("message");
    assert_eq!(second.payload, b"second");
}

#[tokio::test]
async fn consumer_loss_requeues_unacked() {
    let (broker, topology) = broker_with(vec![10]).await;
    broker
        .publish(&topology.ready_exchange, &topology.routing_key, b"inflight", None)
        .await
        .expect("publish");

    let mut subscription = broker.subscribe(DESTINATION, 1).await.expect("subscribe");
    let _message = subscription.next_message().await.expect("next").expect("message");
    drop(subscription);

    assert_eq!(broker.requeue_unacked(DESTINATION).await, 1);
    assert_eq!(broker.unacked_count(DESTINATION).await, 0);
    assert_eq!(broker.ready_count(DESTINATION).await, 1);
}

#[tokio::test]
async fn offline_broker_is_unavailable() {
    let (broker, topology) = broker_with(vec![10]).await;
    broker.set_offline(true).await;

    let result = broker
        .publish(&topology.ready_exchange, &topology.routing_key, b"x", None)
        .await;
    assert!(matches!(result, Err(AppError::BrokerUnavailable(_))));
    assert!(matches!(
        broker.subscribe(DESTINATION, 1).await,
        Err(AppError::BrokerUnavailable(_))
    ));

    broker.set_offline(false).await;
    broker
        .publish(&topology.ready_exchange, &topology.routing_key, b"x", None)
        .await
        .expect("publish after reconnect");
}

#[tokio::test]
async fn closed_broker_ends_subscriptions() {
    let (broker, _) = broker_with(vec![10]).await;
    let mut subscription = broker.subscribe(DESTINATION, 1).await.expect("subscribe");
    broker.close().await;
    assert!(subscription.next_message().await.expect("clean end").is_none());
}

#[tokio::test]
async fn redeclaring_with_different_arguments_fails() {
    let broker = MemoryBroker::new();
    let config = BrokerConfig {
        delay_tiers_seconds: Vec::new(),
        ..BrokerConfig::default()
    };
    broker
        .ensure_topology(&Topology::from_config(&config))
        .await
        .expect("first");

    // Reusing the delay queue's name as the destination drops its
    // dead-letter arguments.
    let conflicting = BrokerConfig {
        destination_queue: "interactions.delay".into(),
        ..config
    };
    let result = broker.ensure_topology(&Topology::from_config(&conflicting)).await;
    assert!(matches!(result, Err(AppError::Broker(_))));
}

#[tokio::test]
async fn publishing_to_unknown_exchange_is_rejected() {
    let (broker, _) = broker_with(vec![10]).await;
    let result = broker.publish("missing.exchange", "key", b"x", None).await;
    assert!(matches!(result, Err(AppError::Broker(_))));
}
