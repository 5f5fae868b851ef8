//! Shared utilities for integration tests.
//!
//! Every test drives a real [`Client`] against an in-memory cluster.

#![allow(dead_code)]

use std::sync::Once;
use std::time::Duration;

use kurrentdb::testing::{IdGenerator, InMemoryCluster};
use kurrentdb::{Client, EventData, SubscriptionEvent};

static TRACING: Once = Once::new();

/// Routes client logs to the test output. Filter with `RUST_LOG`.
pub fn init_tracing() {
    TRACING.call_once(|| {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(
                tracing_subscriber::EnvFilter::try_from_default_env()
                    .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("warn")),
            )
            .with_test_writer()
            .try_init();
    });
}

pub fn connect(cluster: &InMemoryCluster) -> Client {
    init_tracing();
    Client::with_connector(cluster.settings(), cluster.connector()).expect("valid settings")
}

pub fn names(prefix: &str) -> IdGenerator {
    IdGenerator::random(prefix)
}

pub fn json_event(event_type: &str, payload: serde_json::Value) -> EventData {
    EventData::json(event_type, &payload).expect("json payload")
}

/// Waits for the next subscription item, failing the test after five seconds.
pub async fn within<F: std::future::Future<Output = SubscriptionEvent>>(recv: F) -> SubscriptionEvent {
    tokio::time::timeout(Duration::from_secs(5), recv)
        .await
        .expect("subscription stalled")
}

/// Polls `check` until it holds, failing the test after five seconds.
pub async fn eventually<F, Fut>(what: &str, mut check: F)
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = bool>,
{
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    while !check().await {
        assert!(tokio::time::Instant::now() < deadline, "timed out waiting for {what}");
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}
