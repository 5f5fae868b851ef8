//! Append, read and delete steps.

use cucumber::{given, then, when};
use kurrentdb::{
    AppendToStreamOptions, DeleteStreamOptions, EventData, ReadStreamOptions, StreamState,
};

use super::ClientWorld;

fn events(count: usize) -> Vec<EventData> {
    (0..count)
        .map(|n| {
            EventData::json("ScenarioEvent", &serde_json::json!({ "n": n }))
                .expect("json payload")
        })
        .collect()
}

fn expected_state(phrase: &str) -> StreamState {
    match phrase {
        "no stream" => StreamState::NoStream,
        "an existing stream" => StreamState::StreamExists,
        "any state" => StreamState::Any,
        other => panic!("unknown expected state: {other}"),
    }
}

// --- Given ---

#[given(expr = "the stream {string} has {int} event(s)")]
async fn given_stream_has_events(world: &mut ClientWorld, stream: String, count: usize) {
    world
        .client()
        .append_to_stream(&stream, &AppendToStreamOptions::default(), events(count))
        .await
        .expect("seed append");
}

// --- When ---

#[when(regex = r#"^I append (\d+) events? to "([^"]+)" expecting (no stream|an existing stream|any state)$"#)]
async fn when_append(world: &mut ClientWorld, count: usize, stream: String, state: String) {
    let options = AppendToStreamOptions::expect(expected_state(&state));
    let result = world
        .client()
        .append_to_stream(&stream, &options, events(count))
        .await;
    world.last_write = world.record(result);
}

#[when(expr = "I read {string} forwards")]
async fn when_read_forwards(world: &mut ClientWorld, stream: String) {
    let result = match world
        .client()
        .read_stream(&stream, &ReadStreamOptions::forwards())
        .await
    {
        Ok(read) => read.collect().await,
        Err(err) => Err(err),
    };
    world.read = world.record(result).unwrap_or_default();
}

#[when(expr = "I tombstone {string}")]
async fn when_tombstone(world: &mut ClientWorld, stream: String) {
    let result = world
        .client()
        .tombstone_stream(&stream, &DeleteStreamOptions::default())
        .await;
    world.record(result);
}

#[when("I close the client")]
async fn when_close(world: &mut ClientWorld) {
    world.connects_at_close = world.cluster.connect_calls();
    world.client().close();
}

// --- Then ---

#[then(expr = "the append succeeds with next expected revision {int}")]
async fn then_append_succeeds(world: &mut ClientWorld, revision: u64) {
    assert!(world.last_error.is_none(), "append failed: {:?}", world.last_error);
    let write = world.last_write.expect("no write recorded");
    assert_eq!(write.next_expected_revision, revision);
}

#[then(expr = "I read {int} event(s)")]
async fn then_read_count(world: &mut ClientWorld, count: usize) {
    assert!(world.last_error.is_none(), "read failed: {:?}", world.last_error);
    assert_eq!(world.read.len(), count);
    let revisions: Vec<u64> = world
        .read
        .iter()
        .map(|event| event.original_event().revision)
        .collect();
    assert!(revisions.windows(2).all(|pair| pair[0] < pair[1]));
}

#[then("no new connection was opened")]
async fn then_no_new_connection(world: &mut ClientWorld) {
    assert_eq!(world.cluster.connect_calls(), world.connects_at_close);
}
