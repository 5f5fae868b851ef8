//! Persistent subscription steps.

use std::time::Duration;

use cucumber::{given, then, when};
use kurrentdb::{
    CallOptions, NackAction, PersistentSubscriptionSettings, PersistentTarget, StartFrom,
    SubscribeToPersistentOptions, SubscriptionEvent,
};

use super::ClientWorld;

const DELIVERY_TIMEOUT: Duration = Duration::from_secs(5);
const QUIET_PERIOD: Duration = Duration::from_millis(100);

async fn create_group(world: &mut ClientWorld, group: &str, stream: &str) {
    let result = world
        .client()
        .create_persistent_subscription(
            &PersistentTarget::stream(stream),
            group,
            &PersistentSubscriptionSettings::default().start_from(StartFrom::Start),
            &CallOptions::default(),
        )
        .await;
    world.record(result);
}

// --- Given ---

#[given(expr = "a persistent group {string} on {string} from the start")]
async fn given_group(world: &mut ClientWorld, group: String, stream: String) {
    create_group(world, &group, &stream).await;
    assert!(world.last_error.is_none(), "create failed: {:?}", world.last_error);
}

// --- When ---

#[when(expr = "I create the persistent group {string} on {string} again")]
async fn when_create_again(world: &mut ClientWorld, group: String, stream: String) {
    create_group(world, &group, &stream).await;
}

#[when(expr = "I subscribe to {string} on {string} with a buffer of {int}")]
async fn when_subscribe(world: &mut ClientWorld, group: String, stream: String, buffer: usize) {
    let result = world
        .client()
        .subscribe_to_persistent(
            &PersistentTarget::stream(&stream),
            &group,
            &SubscribeToPersistentOptions::default().buffer_size(buffer),
        )
        .await;
    world.persistent = world.record(result);
}

#[when("I ack every delivered event")]
async fn when_ack_all(world: &mut ClientWorld) {
    let subscription = world.persistent.as_ref().expect("not subscribed");
    for event in world.delivered.drain(..) {
        subscription.ack(&event).await.expect("ack");
    }
}

#[when("I park every delivered event")]
async fn when_park_all(world: &mut ClientWorld) {
    let subscription = world.persistent.as_ref().expect("not subscribed");
    for event in world.delivered.drain(..) {
        subscription
            .nack(&event, NackAction::Park, "parked by scenario")
            .await
            .expect("nack");
    }
}

#[when(expr = "I replay parked events of {string} on {string}")]
async fn when_replay(world: &mut ClientWorld, group: String, stream: String) {
    let result = world
        .client()
        .replay_parked_messages(
            &PersistentTarget::stream(&stream),
            &group,
            None,
            &CallOptions::default(),
        )
        .await;
    world.record(result);
}

// --- Then ---

#[then(expr = "{int} event(s) is/are delivered")]
async fn then_delivered(world: &mut ClientWorld, count: usize) {
    let subscription = world.persistent.as_ref().expect("not subscribed");
    let mut delivered = Vec::with_capacity(count);
    while delivered.len() < count {
        match tokio::time::timeout(DELIVERY_TIMEOUT, subscription.recv()).await {
            Ok(SubscriptionEvent::EventAppeared(event)) => delivered.push(event),
            Ok(other) => panic!("unexpected {other:?}"),
            Err(_) => panic!("only {} of {count} events delivered", delivered.len()),
        }
    }
    world.delivered = delivered;
}

#[then("no further event is delivered")]
async fn then_nothing_more(world: &mut ClientWorld) {
    let subscription = world.persistent.as_ref().expect("not subscribed");
    if let Ok(item) = tokio::time::timeout(QUIET_PERIOD, subscription.recv()).await {
        panic!("unexpected delivery {item:?}");
    }
}

#[then(expr = "the group {string} on {string} has {int} parked event(s)")]
async fn then_parked(world: &mut ClientWorld, group: String, stream: String, count: u64) {
    let target = PersistentTarget::stream(&stream);
    let deadline = tokio::time::Instant::now() + DELIVERY_TIMEOUT;
    loop {
        let info = world
            .client()
            .get_persistent_subscription_info(&target, &group, &CallOptions::default())
            .await
            .expect("group info");
        if info.stats.parked_message_count == count {
            return;
        }
        assert!(
            tokio::time::Instant::now() < deadline,
            "parked count stayed at {}",
            info.stats.parked_message_count
        );
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}
