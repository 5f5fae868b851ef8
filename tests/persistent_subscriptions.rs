//! Persistent subscription groups end to end.
//!
//! Run with: cargo test --test persistent_subscriptions --features test-utils

mod common;

use std::collections::HashSet;

use serde_json::json;

use kurrentdb::testing::InMemoryCluster;
use kurrentdb::{
    AppendToStreamOptions, CallOptions, Client, ConsumerStrategy, NackAction, NodePreference,
    PersistentSubscription, PersistentSubscriptionSettings, PersistentSubscriptionStats,
    PersistentTarget, StartFrom, SubscribeToPersistentOptions, SubscriptionEvent,
};

use common::{connect, eventually, init_tracing, json_event, names, within};

async fn next_event(subscription: &PersistentSubscription) -> kurrentdb::ResolvedEvent {
    match within(subscription.recv()).await {
        SubscriptionEvent::EventAppeared(event) => event,
        other => panic!("unexpected {other:?}"),
    }
}

async fn group_stats(
    client: &Client,
    target: &PersistentTarget,
    group: &str,
) -> PersistentSubscriptionStats {
    client
        .get_persistent_subscription_info(target, group, &CallOptions::default())
        .await
        .unwrap()
        .stats
}

#[tokio::test]
async fn test_round_robin_spreads_work() {
    let cluster = InMemoryCluster::single_node();
    let client = connect(&cluster);
    let stream = names("jobs").next();
    let target = PersistentTarget::stream(&stream);
    client
        .create_persistent_subscription(
            &target,
            "workers",
            &PersistentSubscriptionSettings::default()
                .start_from(StartFrom::Start)
                .with_consumer_strategy(ConsumerStrategy::RoundRobin),
            &CallOptions::default(),
        )
        .await
        .unwrap();

    let options = SubscribeToPersistentOptions::default().buffer_size(1);
    let a = client.subscribe_to_persistent(&target, "workers", &options).await.unwrap();
    let b = client.subscribe_to_persistent(&target, "workers", &options).await.unwrap();

    client
        .append_to_stream(
            &stream,
            &AppendToStreamOptions::default(),
            (0..2).map(|i| json_event("Job", json!({ "n": i }))).collect(),
        )
        .await
        .unwrap();

    let first = next_event(&a).await;
    let second = next_event(&b).await;
    assert_ne!(first.id(), second.id());
    a.ack(&first).await.unwrap();
    b.ack(&second).await.unwrap();

    let info = client
        .get_persistent_subscription_info(&target, "workers", &CallOptions::default())
        .await
        .unwrap();
    assert_eq!(info.connections.len(), 2);
    assert_eq!(info.stats.total_items, 2);
}

#[tokio::test]
async fn test_worker_crash_hands_events_over() {
    let cluster = InMemoryCluster::single_node();
    let client = connect(&cluster);
    let stream = names("orders").next();
    let target = PersistentTarget::stream(&stream);
    client
        .append_to_stream(
            &stream,
            &AppendToStreamOptions::default(),
            (0..3).map(|i| json_event("Order", json!({ "n": i }))).collect(),
        )
        .await
        .unwrap();
    client
        .create_persistent_subscription(
            &target,
            "billing",
            &PersistentSubscriptionSettings::default().start_from(StartFrom::Start),
            &CallOptions::default(),
        )
        .await
        .unwrap();

    let crashing = client
        .subscribe_to_persistent(&target, "billing", &SubscribeToPersistentOptions::default())
        .await
        .unwrap();
    let handled = next_event(&crashing).await;
    crashing.ack(&handled).await.unwrap();
    let lost = next_event(&crashing).await;
    let (admin, group) = (&client, &target);
    eventually("the ack to settle", move || async move {
        group_stats(admin, group, "billing").await.in_flight_messages == 2
    })
    .await;
    drop(crashing);

    let survivor = client
        .subscribe_to_persistent(&target, "billing", &SubscribeToPersistentOptions::default())
        .await
        .unwrap();
    let mut ids = HashSet::new();
    for _ in 0..2 {
        let event = next_event(&survivor).await;
        ids.insert(event.id());
        survivor.ack(&event).await.unwrap();
    }
    assert!(ids.contains(&lost.id()));
    assert!(!ids.contains(&handled.id()));
}

#[tokio::test]
async fn test_admin_from_follower_preference_reaches_leader() {
    let cluster = InMemoryCluster::three_node();
    init_tracing();
    let client = Client::with_connector(
        cluster.settings().with_node_preference(NodePreference::Follower),
        cluster.connector(),
    )
    .unwrap();
    let target = PersistentTarget::All;

    client
        .create_persistent_subscription(
            &target,
            "audit",
            &PersistentSubscriptionSettings::default(),
            &CallOptions::default(),
        )
        .await
        .unwrap();
    let groups = client
        .list_persistent_subscriptions(None, &CallOptions::default())
        .await
        .unwrap();
    assert_eq!(groups.len(), 1);
    assert_eq!(groups[0].event_source, "$all");
}

#[tokio::test]
async fn test_poison_message_is_parked_and_replayed() {
    let cluster = InMemoryCluster::single_node();
    let client = connect(&cluster);
    let stream = names("payments").next();
    let target = PersistentTarget::stream(&stream);
    client
        .create_persistent_subscription(
            &target,
            "settle",
            &PersistentSubscriptionSettings::default()
                .start_from(StartFrom::Start)
                .with_max_retry_count(1),
            &CallOptions::default(),
        )
        .await
        .unwrap();
    client
        .append_to_stream(&stream, &AppendToStreamOptions::default(), vec![json_event("Payment", json!({ "bad": true }))])
        .await
        .unwrap();

    let subscription = client
        .subscribe_to_persistent(&target, "settle", &SubscribeToPersistentOptions::default())
        .await
        .unwrap();
    for _ in 0..2 {
        let event = next_event(&subscription).await;
        subscription
            .nack(&event, NackAction::Retry, "downstream rejected")
            .await
            .unwrap();
    }

    let (admin, group) = (&client, &target);
    eventually("the event to be parked", move || async move {
        group_stats(admin, group, "settle").await.parked_message_count == 1
    })
    .await;

    client
        .replay_parked_messages(&target, "settle", Some(1), &CallOptions::default())
        .await
        .unwrap();
    let replayed = next_event(&subscription).await;
    subscription.ack(&replayed).await.unwrap();
}
