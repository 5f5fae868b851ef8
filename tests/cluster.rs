//! Cluster discovery, node preference and reconnection end to end.
//!
//! Run with: cargo test --test cluster --features test-utils

mod common;

use std::time::Duration;

use serde_json::json;

use kurrentdb::testing::InMemoryCluster;
use kurrentdb::{
    AppendToStreamOptions, CallOptions, Client, ClientSettings, ErrorCause, ErrorCode,
    NodePreference, ReadStreamOptions,
};

use common::{connect, init_tracing, json_event, names};

fn follower_client(cluster: &InMemoryCluster) -> Client {
    init_tracing();
    Client::with_connector(
        cluster.settings().with_node_preference(NodePreference::Follower),
        cluster.connector(),
    )
    .unwrap()
}

#[tokio::test]
async fn test_writes_reach_leader_from_follower_preference() {
    let cluster = InMemoryCluster::three_node();
    let client = follower_client(&cluster);
    let stream = names("routed").next();

    client
        .read_stream(&stream, &ReadStreamOptions::default())
        .await
        .unwrap();
    assert_eq!(cluster.connect_calls(), 1);

    client
        .append_to_stream(&stream, &AppendToStreamOptions::default(), vec![json_event("Routed", json!({}))])
        .await
        .unwrap();
    assert_eq!(cluster.connect_calls(), 2);

    // Now connected to the leader; later writes go straight through.
    client
        .append_to_stream(&stream, &AppendToStreamOptions::default(), vec![json_event("Routed", json!({}))])
        .await
        .unwrap();
    assert_eq!(cluster.connect_calls(), 2);
}

#[tokio::test]
async fn test_failover_to_new_leader() {
    let cluster = InMemoryCluster::three_node();
    let client = connect(&cluster);
    let stream = names("failover").next();
    let endpoints = cluster.endpoints();

    client
        .append_to_stream(&stream, &AppendToStreamOptions::default(), vec![json_event("Before", json!({}))])
        .await
        .unwrap();

    cluster.set_reachable(&endpoints[0], false);
    cluster.set_alive(&endpoints[0], false);
    cluster.elect(&endpoints[1]);

    let err = client
        .append_to_stream(&stream, &AppendToStreamOptions::default(), vec![json_event("Lost", json!({}))])
        .await
        .unwrap_err();
    assert_eq!(err.code(), ErrorCode::Unavailable);

    client
        .append_to_stream(&stream, &AppendToStreamOptions::default(), vec![json_event("After", json!({}))])
        .await
        .unwrap();
    assert_eq!(cluster.leader(), Some(endpoints[1].clone()));

    let events = client
        .read_stream(&stream, &ReadStreamOptions::default())
        .await
        .unwrap()
        .collect()
        .await
        .unwrap();
    let types: Vec<&str> = events
        .iter()
        .map(|e| e.original_event().event_type.as_str())
        .collect();
    assert_eq!(types, vec!["Before", "After"]);
}

#[tokio::test]
async fn test_concurrent_calls_share_one_connection() {
    let cluster = InMemoryCluster::three_node();
    cluster.set_connect_delay(Duration::from_millis(50));
    let client = connect(&cluster);
    let ids = names("burst");

    let calls: Vec<_> = (0..16)
        .map(|_| {
            let client = client.clone();
            let stream = ids.next();
            tokio::spawn(async move {
                client
                    .append_to_stream(&stream, &AppendToStreamOptions::default(), vec![json_event("Burst", json!({}))])
                    .await
            })
        })
        .collect();
    for call in calls {
        call.await.unwrap().unwrap();
    }
    assert_eq!(cluster.connect_calls(), 1);
}

#[tokio::test]
async fn test_discovery_gives_up_when_no_seed_answers() {
    let cluster = InMemoryCluster::three_node();
    for endpoint in cluster.endpoints() {
        cluster.set_reachable(&endpoint, false);
    }
    init_tracing();
    let client = Client::with_connector(
        ClientSettings {
            max_discover_attempts: 3,
            ..cluster.settings()
        },
        cluster.connector(),
    )
    .unwrap();

    let err = client
        .server_version(&CallOptions::default())
        .await
        .unwrap_err();
    assert_eq!(err.code(), ErrorCode::Unavailable);
    assert!(matches!(
        err.cause(),
        Some(ErrorCause::DiscoveryExhausted { attempts: 3 })
    ));
    assert_eq!(cluster.connect_calls(), 0);
}

#[tokio::test]
async fn test_close_stops_all_traffic() {
    let cluster = InMemoryCluster::three_node();
    let client = connect(&cluster);
    client.server_version(&CallOptions::default()).await.unwrap();
    let (gossip, connects) = (cluster.gossip_calls(), cluster.connect_calls());

    client.close();
    assert!(client.is_closed());

    let err = client
        .append_to_stream("closed", &AppendToStreamOptions::default(), vec![json_event("Never", json!({}))])
        .await
        .unwrap_err();
    assert_eq!(err.code(), ErrorCode::ConnectionClosed);
    assert_eq!(cluster.gossip_calls(), gossip);
    assert_eq!(cluster.connect_calls(), connects);
}
