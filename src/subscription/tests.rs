use std::time::Duration;

use super::*;
use crate::streams::AppendToStreamOptions;
use crate::testing::InMemoryCluster;
use crate::types::EventData;

fn client(cluster: &InMemoryCluster) -> Client {
    Client::with_connector(cluster.settings(), cluster.connector()).unwrap()
}

fn event(event_type: &str) -> EventData {
    EventData::binary(event_type, bytes::Bytes::from_static(b"{}"))
}

async fn next(subscription: &Subscription) -> SubscriptionEvent {
    tokio::time::timeout(Duration::from_secs(5), subscription.recv())
        .await
        .expect("subscription stalled")
}

async fn next_event_type(subscription: &Subscription) -> String {
    match next(subscription).await {
        SubscriptionEvent::EventAppeared(event) => event.original_event().event_type.clone(),
        other => panic!("expected an event, got {other:?}"),
    }
}

async fn append(client: &Client, stream: &str, types: &[&str]) {
    client
        .append_to_stream(
            stream,
            &AppendToStreamOptions::default(),
            types.iter().map(|t| event(t)).collect(),
        )
        .await
        .unwrap();
}

#[tokio::test]
async fn test_stream_subscription_catches_up_then_goes_live() {
    let cluster = InMemoryCluster::single_node();
    let client = client(&cluster);
    append(&client, "sub-1", &["A", "B"]).await;

    let subscription = client
        .subscribe_to_stream("sub-1", &SubscribeToStreamOptions::default())
        .await
        .unwrap();
    assert!(!subscription.id().is_empty());

    assert_eq!(next_event_type(&subscription).await, "A");
    assert_eq!(next_event_type(&subscription).await, "B");
    match next(&subscription).await {
        SubscriptionEvent::CaughtUp(marker) => assert_eq!(marker.revision, Some(1)),
        other => panic!("expected caught-up, got {other:?}"),
    }

    append(&client, "sub-1", &["C"]).await;
    assert_eq!(next_event_type(&subscription).await, "C");
}

#[tokio::test]
async fn test_stream_subscription_resumes_after_revision() {
    let cluster = InMemoryCluster::single_node();
    let client = client(&cluster);
    append(&client, "sub-2", &["A", "B", "C"]).await;

    let subscription = client
        .subscribe_to_stream(
            "sub-2",
            &SubscribeToStreamOptions::default().from(StreamPosition::Position(0)),
        )
        .await
        .unwrap();
    assert_eq!(next_event_type(&subscription).await, "B");
    assert_eq!(next_event_type(&subscription).await, "C");
}

#[tokio::test]
async fn test_subscription_from_end_sees_only_new_events() {
    let cluster = InMemoryCluster::single_node();
    let client = client(&cluster);
    append(&client, "sub-3", &["Old"]).await;

    let subscription = client
        .subscribe_to_stream(
            "sub-3",
            &SubscribeToStreamOptions::default().from(StreamPosition::End),
        )
        .await
        .unwrap();
    assert!(matches!(next(&subscription).await, SubscriptionEvent::CaughtUp(_)));

    append(&client, "sub-3", &["New"]).await;
    assert_eq!(next_event_type(&subscription).await, "New");
}

#[tokio::test]
async fn test_all_subscription_applies_filter_and_checkpoints() {
    let cluster = InMemoryCluster::single_node();
    let client = client(&cluster);
    append(&client, "orders-1", &["OrderPlaced"]).await;
    append(&client, "audit-1", &["Audited"]).await;
    append(&client, "orders-2", &["OrderPlaced"]).await;

    let filter = SubscriptionFilter::on_stream_name()
        .add_prefix("orders-")
        .with_max_search_window(Some(2));
    let subscription = client
        .subscribe_to_all(&SubscribeToAllOptions::default().with_filter(filter))
        .await
        .unwrap();

    let mut streams = Vec::new();
    let mut checkpoints = 0;
    loop {
        match next(&subscription).await {
            SubscriptionEvent::EventAppeared(event) => streams.push(event.stream_id().to_string()),
            SubscriptionEvent::CheckPointReached(_) => checkpoints += 1,
            SubscriptionEvent::CaughtUp(_) => break,
            other => panic!("unexpected {other:?}"),
        }
    }
    assert_eq!(streams, vec!["orders-1", "orders-2"]);
    assert_eq!(checkpoints, 1);
}

#[tokio::test]
async fn test_missing_stream_subscription_waits_for_first_event() {
    let cluster = InMemoryCluster::single_node();
    let client = client(&cluster);

    let subscription = client
        .subscribe_to_stream("sub-later", &SubscribeToStreamOptions::default())
        .await
        .unwrap();
    assert!(matches!(next(&subscription).await, SubscriptionEvent::CaughtUp(_)));

    append(&client, "sub-later", &["First"]).await;
    assert_eq!(next_event_type(&subscription).await, "First");
}

#[tokio::test]
async fn test_close_is_idempotent_and_sticky() {
    let cluster = InMemoryCluster::single_node();
    let client = client(&cluster);
    let subscription = client
        .subscribe_to_stream("sub-close", &SubscribeToStreamOptions::default())
        .await
        .unwrap();

    subscription.close();
    subscription.close();
    assert!(subscription.is_dropped());

    for _ in 0..2 {
        match next(&subscription).await {
            SubscriptionEvent::SubscriptionDropped(dropped) => assert!(dropped.error.is_none()),
            other => panic!("expected dropped, got {other:?}"),
        }
    }
}

#[tokio::test]
async fn test_recv_with_cancel_drops_subscription() {
    let cluster = InMemoryCluster::single_node();
    let client = client(&cluster);
    let subscription = client
        .subscribe_to_stream(
            "sub-cancel",
            &SubscribeToStreamOptions::default().from(StreamPosition::End),
        )
        .await
        .unwrap();
    assert!(matches!(next(&subscription).await, SubscriptionEvent::CaughtUp(_)));

    let token = CancellationToken::new();
    let canceller = {
        let token = token.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            token.cancel();
        })
    };
    let event = subscription.recv_with_cancel(&token).await;
    canceller.await.unwrap();
    assert!(matches!(event, SubscriptionEvent::SubscriptionDropped(_)));
    assert!(subscription.is_dropped());
}

#[tokio::test]
async fn test_severed_connection_drops_and_invalidates() {
    let cluster = InMemoryCluster::single_node();
    let client = client(&cluster);
    let subscription = client
        .subscribe_to_stream("sub-sever", &SubscribeToStreamOptions::default())
        .await
        .unwrap();
    assert!(matches!(next(&subscription).await, SubscriptionEvent::CaughtUp(_)));
    let generation = client.connections().generation();

    cluster.sever_streams();

    match next(&subscription).await {
        SubscriptionEvent::SubscriptionDropped(dropped) => {
            let err = dropped.error.expect("drop carries the transport error");
            assert_eq!(err.code(), ErrorCode::Unavailable);
        }
        other => panic!("expected dropped, got {other:?}"),
    }
    assert!(subscription.is_dropped());

    append(&client, "sub-sever", &["After"]).await;
    assert!(client.connections().generation() > generation);
}

#[tokio::test]
async fn test_client_close_drops_subscription() {
    let cluster = InMemoryCluster::single_node();
    let client = client(&cluster);
    let subscription = client
        .subscribe_to_stream("sub-shutdown", &SubscribeToStreamOptions::default())
        .await
        .unwrap();
    assert!(matches!(next(&subscription).await, SubscriptionEvent::CaughtUp(_)));

    client.close();

    match next(&subscription).await {
        SubscriptionEvent::SubscriptionDropped(dropped) => {
            let err = dropped.error.expect("drop carries the close error");
            assert_eq!(err.code(), ErrorCode::ConnectionClosed);
        }
        other => panic!("expected dropped, got {other:?}"),
    }
}
