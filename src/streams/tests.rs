use super::*;
use crate::error::ErrorCause;
use crate::testing::InMemoryCluster;

fn client(cluster: &InMemoryCluster) -> Client {
    Client::with_connector(cluster.settings(), cluster.connector()).unwrap()
}

fn event(event_type: &str) -> EventData {
    EventData::binary(event_type, bytes::Bytes::from_static(b"{}"))
}

fn types(events: &[crate::types::ResolvedEvent]) -> Vec<String> {
    events
        .iter()
        .map(|e| e.original_event().event_type.clone())
        .collect()
}

// ============================================================================
// Append
// ============================================================================

#[tokio::test]
async fn test_append_then_read_forwards() {
    let cluster = InMemoryCluster::single_node();
    let client = client(&cluster);

    let first = client
        .append_to_stream(
            "order-1",
            &AppendToStreamOptions::expect(StreamState::NoStream),
            vec![event("Created"), event("Paid")],
        )
        .await
        .unwrap();
    assert_eq!(first.next_expected_revision, 1);

    let second = client
        .append_to_stream(
            "order-1",
            &AppendToStreamOptions::expect(StreamState::Revision(1)),
            vec![event("Shipped")],
        )
        .await
        .unwrap();
    assert_eq!(second.next_expected_revision, 2);
    assert!(second.position > first.position);

    let events = client
        .read_stream("order-1", &ReadStreamOptions::forwards())
        .await
        .unwrap()
        .collect()
        .await
        .unwrap();
    assert_eq!(types(&events), vec!["Created", "Paid", "Shipped"]);
    let revisions: Vec<u64> = events.iter().map(|e| e.original_event().revision).collect();
    assert_eq!(revisions, vec![0, 1, 2]);
}

#[tokio::test]
async fn test_stream_exists_on_fresh_stream_is_rejected() {
    let cluster = InMemoryCluster::single_node();
    let client = client(&cluster);

    let err = client
        .append_to_stream(
            "fresh-1",
            &AppendToStreamOptions::expect(StreamState::StreamExists),
            vec![event("Created")],
        )
        .await
        .unwrap_err();
    assert_eq!(err.code(), ErrorCode::WrongExpectedVersion);
    assert!(err.is_concurrency_conflict());
    match err.cause() {
        Some(ErrorCause::WrongExpectedVersion {
            stream,
            expected,
            actual,
        }) => {
            assert_eq!(stream, "fresh-1");
            assert_eq!(*expected, StreamState::StreamExists);
            assert_eq!(*actual, StreamState::NoStream);
        }
        other => panic!("unexpected cause: {other:?}"),
    }

    client
        .append_to_stream(
            "fresh-1",
            &AppendToStreamOptions::expect(StreamState::NoStream),
            vec![event("Created")],
        )
        .await
        .unwrap();
}

#[tokio::test]
async fn test_stale_revision_is_rejected() {
    let cluster = InMemoryCluster::single_node();
    let client = client(&cluster);
    for _ in 0..3 {
        client
            .append_to_stream("stale-1", &AppendToStreamOptions::default(), vec![event("Tick")])
            .await
            .unwrap();
    }

    let err = client
        .append_to_stream(
            "stale-1",
            &AppendToStreamOptions::expect(StreamState::Revision(0)),
            vec![event("Tick")],
        )
        .await
        .unwrap_err();
    assert_eq!(err.code(), ErrorCode::WrongExpectedVersion);
    match err.cause() {
        Some(ErrorCause::WrongExpectedVersion { actual, .. }) => {
            assert_eq!(*actual, StreamState::Revision(2));
        }
        other => panic!("unexpected cause: {other:?}"),
    }
}

#[tokio::test]
async fn test_revision_beyond_wire_range_is_rejected_before_sending() {
    let cluster = InMemoryCluster::single_node();
    let client = client(&cluster);
    let huge = StreamState::Revision(u64::MAX);

    let err = client
        .append_to_stream("huge-1", &AppendToStreamOptions::expect(huge), vec![event("Tick")])
        .await
        .unwrap_err();
    assert_eq!(err.code(), ErrorCode::InternalClient);

    let err = client
        .delete_stream("huge-1", &DeleteStreamOptions::expect(huge))
        .await
        .unwrap_err();
    assert_eq!(err.code(), ErrorCode::InternalClient);

    let err = client
        .multi_stream_append(
            vec![AppendStreamRequest::new("huge-1", huge, vec![event("Tick")])],
            &CallOptions::default(),
        )
        .await
        .unwrap_err();
    assert_eq!(err.code(), ErrorCode::InternalClient);
    assert_eq!(cluster.connect_calls(), 0);
}

// ============================================================================
// Read
// ============================================================================

#[tokio::test]
async fn test_read_backwards_with_limit() {
    let cluster = InMemoryCluster::single_node();
    let client = client(&cluster);
    client
        .append_to_stream(
            "backwards-1",
            &AppendToStreamOptions::default(),
            vec![event("A"), event("B"), event("C")],
        )
        .await
        .unwrap();

    let events = client
        .read_stream("backwards-1", &ReadStreamOptions::backwards().max_count(2))
        .await
        .unwrap()
        .collect()
        .await
        .unwrap();
    assert_eq!(types(&events), vec!["C", "B"]);
}

#[tokio::test]
async fn test_read_from_revision_is_inclusive() {
    let cluster = InMemoryCluster::single_node();
    let client = client(&cluster);
    client
        .append_to_stream(
            "from-1",
            &AppendToStreamOptions::default(),
            vec![event("A"), event("B"), event("C")],
        )
        .await
        .unwrap();

    let events = client
        .read_stream(
            "from-1",
            &ReadStreamOptions::forwards().from(StreamPosition::Position(1)),
        )
        .await
        .unwrap()
        .collect()
        .await
        .unwrap();
    assert_eq!(types(&events), vec!["B", "C"]);
}

#[tokio::test]
async fn test_read_missing_stream_is_not_found() {
    let cluster = InMemoryCluster::single_node();
    let client = client(&cluster);

    let mut stream = client
        .read_stream("missing-1", &ReadStreamOptions::default())
        .await
        .unwrap();
    let err = stream.next().await.unwrap_err();
    assert_eq!(err.code(), ErrorCode::ResourceNotFound);
    assert!(err.is_not_found());
    assert!(stream.next().await.unwrap().is_none());
}

#[tokio::test]
async fn test_read_all_spans_streams() {
    let cluster = InMemoryCluster::single_node();
    let client = client(&cluster);
    client
        .append_to_stream("all-a", &AppendToStreamOptions::default(), vec![event("A")])
        .await
        .unwrap();
    client
        .append_to_stream("all-b", &AppendToStreamOptions::default(), vec![event("B")])
        .await
        .unwrap();

    let events = client
        .read_all(&ReadAllOptions::default())
        .await
        .unwrap()
        .collect()
        .await
        .unwrap();
    assert_eq!(types(&events), vec!["A", "B"]);

    let latest = client
        .read_all(&ReadAllOptions::backwards().max_count(1))
        .await
        .unwrap()
        .collect()
        .await
        .unwrap();
    assert_eq!(types(&latest), vec!["B"]);
}

#[tokio::test]
async fn test_read_resolves_links() {
    let cluster = InMemoryCluster::single_node();
    let client = client(&cluster);
    client
        .append_to_stream("target-1", &AppendToStreamOptions::default(), vec![event("Real")])
        .await
        .unwrap();
    client
        .append_to_stream(
            "links-1",
            &AppendToStreamOptions::default(),
            vec![EventData::binary("$>", bytes::Bytes::from_static(b"0@target-1"))],
        )
        .await
        .unwrap();

    let events = client
        .read_stream("links-1", &ReadStreamOptions::default().resolve_link_tos())
        .await
        .unwrap()
        .collect()
        .await
        .unwrap();
    assert_eq!(events.len(), 1);
    let resolved = &events[0];
    assert_eq!(resolved.link().unwrap().stream_id, "links-1");
    assert_eq!(resolved.event().unwrap().event_type, "Real");
    assert_eq!(resolved.original_event().event_type, "$>");
}

// ============================================================================
// Delete
// ============================================================================

#[tokio::test]
async fn test_soft_delete_then_recreate() {
    let cluster = InMemoryCluster::single_node();
    let client = client(&cluster);
    client
        .append_to_stream("soft-1", &AppendToStreamOptions::default(), vec![event("A"), event("B")])
        .await
        .unwrap();

    client
        .delete_stream("soft-1", &DeleteStreamOptions::expect(StreamState::Revision(1)))
        .await
        .unwrap();

    let err = client
        .read_stream("soft-1", &ReadStreamOptions::default())
        .await
        .unwrap()
        .collect()
        .await
        .unwrap_err();
    assert_eq!(err.code(), ErrorCode::ResourceNotFound);

    let result = client
        .append_to_stream("soft-1", &AppendToStreamOptions::default(), vec![event("C")])
        .await
        .unwrap();
    assert_eq!(result.next_expected_revision, 2);

    let events = client
        .read_stream("soft-1", &ReadStreamOptions::default())
        .await
        .unwrap()
        .collect()
        .await
        .unwrap();
    assert_eq!(types(&events), vec!["C"]);
}

#[tokio::test]
async fn test_tombstone_is_terminal() {
    let cluster = InMemoryCluster::single_node();
    let client = client(&cluster);
    client
        .append_to_stream("tomb-1", &AppendToStreamOptions::default(), vec![event("A")])
        .await
        .unwrap();
    client
        .tombstone_stream("tomb-1", &DeleteStreamOptions::default())
        .await
        .unwrap();

    let err = client
        .append_to_stream("tomb-1", &AppendToStreamOptions::default(), vec![event("B")])
        .await
        .unwrap_err();
    assert_eq!(err.code(), ErrorCode::StreamDeleted);
    assert!(err.is_stream_terminal());

    let err = client
        .read_stream("tomb-1", &ReadStreamOptions::default())
        .await
        .unwrap()
        .collect()
        .await
        .unwrap_err();
    assert_eq!(err.code(), ErrorCode::StreamDeleted);

    let err = client
        .delete_stream("tomb-1", &DeleteStreamOptions::default())
        .await
        .unwrap_err();
    assert_eq!(err.code(), ErrorCode::StreamDeleted);
}

// ============================================================================
// Metadata
// ============================================================================

#[tokio::test]
async fn test_metadata_defaults_when_unset() {
    let cluster = InMemoryCluster::single_node();
    let client = client(&cluster);

    let metadata = client
        .get_stream_metadata("meta-none", &CallOptions::default())
        .await
        .unwrap();
    assert_eq!(metadata, VersionedMetadata::default());
}

#[tokio::test]
async fn test_metadata_round_trip_and_truncation() {
    let cluster = InMemoryCluster::single_node();
    let client = client(&cluster);
    client
        .append_to_stream(
            "meta-1",
            &AppendToStreamOptions::default(),
            vec![event("A"), event("B"), event("C")],
        )
        .await
        .unwrap();

    let metadata = StreamMetadata::default()
        .with_truncate_before(2)
        .with_custom("owner", serde_json::json!("billing"));
    client
        .set_stream_metadata("meta-1", &AppendToStreamOptions::default(), &metadata)
        .await
        .unwrap();

    let read = client
        .get_stream_metadata("meta-1", &CallOptions::default())
        .await
        .unwrap();
    assert_eq!(read.revision, Some(0));
    assert_eq!(read.metadata.truncate_before, Some(2));
    assert_eq!(read.metadata.custom["owner"], "billing");

    let events = client
        .read_stream("meta-1", &ReadStreamOptions::default())
        .await
        .unwrap()
        .collect()
        .await
        .unwrap();
    assert_eq!(types(&events), vec!["C"]);
}

#[tokio::test]
async fn test_metadata_max_count_hides_old_events() {
    let cluster = InMemoryCluster::single_node();
    let client = client(&cluster);
    client
        .set_stream_metadata(
            "meta-2",
            &AppendToStreamOptions::expect(StreamState::NoStream),
            &StreamMetadata::default().with_max_count(2),
        )
        .await
        .unwrap();
    client
        .append_to_stream(
            "meta-2",
            &AppendToStreamOptions::default(),
            vec![event("A"), event("B"), event("C")],
        )
        .await
        .unwrap();

    let events = client
        .read_stream("meta-2", &ReadStreamOptions::default())
        .await
        .unwrap()
        .collect()
        .await
        .unwrap();
    assert_eq!(types(&events), vec!["B", "C"]);
}

// ============================================================================
// Multi-stream append
// ============================================================================

#[tokio::test]
async fn test_multi_append_commits_every_stream() {
    let cluster = InMemoryCluster::single_node();
    let client = client(&cluster);

    let result = client
        .multi_stream_append(
            vec![
                AppendStreamRequest::new("multi-a", StreamState::NoStream, vec![event("A1"), event("A2")]),
                AppendStreamRequest::new("multi-b", StreamState::Any, vec![event("B1")]),
            ],
            &CallOptions::default(),
        )
        .await
        .unwrap();
    assert_eq!(
        result.responses,
        vec![("multi-a".to_string(), 1), ("multi-b".to_string(), 0)]
    );
    assert_eq!(result.position, 3);
}

#[tokio::test]
async fn test_multi_append_conflict_commits_nothing() {
    let cluster = InMemoryCluster::single_node();
    let client = client(&cluster);
    client
        .append_to_stream("multi-c", &AppendToStreamOptions::default(), vec![event("C1")])
        .await
        .unwrap();

    let err = client
        .multi_stream_append(
            vec![
                AppendStreamRequest::new("multi-d", StreamState::Any, vec![event("D1")]),
                AppendStreamRequest::new("multi-c", StreamState::NoStream, vec![event("C2")]),
            ],
            &CallOptions::default(),
        )
        .await
        .unwrap_err();
    assert_eq!(err.code(), ErrorCode::StreamRevisionConflict);
    match err.cause() {
        Some(ErrorCause::StreamRevisionConflict {
            stream,
            expected,
            actual,
        }) => {
            assert_eq!(stream, "multi-c");
            assert_eq!(*expected, StreamState::NoStream);
            assert_eq!(*actual, StreamState::Revision(0));
        }
        other => panic!("unexpected cause: {other:?}"),
    }

    let err = client
        .read_stream("multi-d", &ReadStreamOptions::default())
        .await
        .unwrap()
        .collect()
        .await
        .unwrap_err();
    assert_eq!(err.code(), ErrorCode::ResourceNotFound);
}

#[tokio::test]
async fn test_multi_append_record_too_large() {
    let cluster = InMemoryCluster::single_node();
    cluster.set_size_limits(4, 1024);
    let client = client(&cluster);

    let err = client
        .multi_stream_append(
            vec![AppendStreamRequest::new(
                "multi-big",
                StreamState::Any,
                vec![EventData::binary("Big", bytes::Bytes::from_static(b"0123456789"))],
            )],
            &CallOptions::default(),
        )
        .await
        .unwrap_err();
    assert_eq!(err.code(), ErrorCode::AppendRecordSizeExceeded);
    match err.cause() {
        Some(ErrorCause::AppendRecordSizeExceeded { stream, max_size, .. }) => {
            assert_eq!(stream, "multi-big");
            assert_eq!(*max_size, 4);
        }
        other => panic!("unexpected cause: {other:?}"),
    }
}

#[tokio::test]
async fn test_multi_append_rejects_empty_request() {
    let cluster = InMemoryCluster::single_node();
    let client = client(&cluster);

    let err = client
        .multi_stream_append(vec![], &CallOptions::default())
        .await
        .unwrap_err();
    assert_eq!(err.code(), ErrorCode::InternalClient);
    assert_eq!(cluster.connect_calls(), 0);
}

#[tokio::test]
async fn test_multi_append_needs_recent_server() {
    let cluster = InMemoryCluster::single_node();
    cluster.set_server_version(Some(ServerVersion {
        major: 24,
        minor: 10,
        patch: 0,
    }));
    let client = client(&cluster);

    let err = client
        .multi_stream_append(
            vec![AppendStreamRequest::new("multi-old", StreamState::Any, vec![event("A")])],
            &CallOptions::default(),
        )
        .await
        .unwrap_err();
    assert_eq!(err.code(), ErrorCode::UnsupportedFeature);
}

#[tokio::test]
async fn test_multi_append_without_version_endpoint() {
    let cluster = InMemoryCluster::single_node();
    cluster.set_server_version(None);
    let client = client(&cluster);

    let err = client
        .multi_stream_append(
            vec![AppendStreamRequest::new("multi-none", StreamState::Any, vec![event("A")])],
            &CallOptions::default(),
        )
        .await
        .unwrap_err();
    assert_eq!(err.code(), ErrorCode::UnsupportedFeature);
}

// ============================================================================
// Lifecycle
// ============================================================================

#[tokio::test]
async fn test_closed_client_rejects_calls_without_connecting() {
    let cluster = InMemoryCluster::single_node();
    let client = client(&cluster);
    client
        .append_to_stream("closed-1", &AppendToStreamOptions::default(), vec![event("A")])
        .await
        .unwrap();
    let connects = cluster.connect_calls();

    client.close();
    client.close();

    let err = client
        .append_to_stream("closed-1", &AppendToStreamOptions::default(), vec![event("B")])
        .await
        .unwrap_err();
    assert_eq!(err.code(), ErrorCode::ConnectionClosed);
    let err = client
        .read_stream("closed-1", &ReadStreamOptions::default())
        .await
        .err()
        .unwrap();
    assert_eq!(err.code(), ErrorCode::ConnectionClosed);
    assert_eq!(cluster.connect_calls(), connects);
}

#[tokio::test]
async fn test_server_version() {
    let cluster = InMemoryCluster::single_node();
    let client = client(&cluster);

    let version = client.server_version(&CallOptions::default()).await.unwrap();
    assert!(version.supports_multi_append());
}
