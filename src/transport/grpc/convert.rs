//! Conversions between generated protobuf messages and client types.

use std::collections::HashMap;
use std::time::Duration;

use bytes::Bytes;
use chrono::{DateTime, Utc};
use uuid::Uuid;

use crate::error::{ClientError, ErrorCode};
use crate::persistent::{
    ConsumerStrategy, NackAction, PersistentConnectionInfo, PersistentSubscriptionInfo,
    PersistentSubscriptionSettings, PersistentSubscriptionStats, PersistentTarget, StartFrom,
};
use crate::proto::event_store::client as shared;
use crate::proto::event_store::client::gossip::{member_info::VNodeState, MemberInfo};
use crate::proto::event_store::client::persistent_subscriptions as persistent;
use crate::proto::event_store::client::streams;
use crate::proto::kurrentdb::protocol::v2::streams as v2;
use crate::subscription::{FilterExpression, FilterTarget, SubscriptionFilter};
use crate::topology::{ClusterMember, MemberRole};
use crate::transport::{PersistentCommand, PersistentMessage, ReadMessage, ReadRequest, ReadTarget};
use crate::types::{
    AppendStreamRequest, ContentType, Direction, Endpoint, EventData, MultiAppendWriteResult,
    Position, RecordedEvent, ResolvedEvent, StreamPosition, StreamState, SubscriptionMarker,
    WriteResult,
};

/// System metadata keys of a recorded event.
mod keys {
    pub const TYPE: &str = "type";
    pub const CONTENT_TYPE: &str = "content-type";
    pub const CREATED: &str = "created";
}

fn parsing(message: impl Into<String>) -> ClientError {
    ClientError::new(ErrorCode::Parsing, message)
}

pub fn uuid(id: Uuid) -> shared::Uuid {
    shared::Uuid {
        value: id.to_string(),
    }
}

fn parse_uuid(id: Option<shared::Uuid>) -> Result<Uuid, ClientError> {
    let id = id.ok_or_else(|| parsing("event without id"))?;
    Uuid::parse_str(&id.value).map_err(|e| {
        ClientError::from_error(ErrorCode::Parsing, format!("invalid event id '{}'", id.value), e)
    })
}

pub fn stream_identifier(stream: &str) -> shared::StreamIdentifier {
    shared::StreamIdentifier {
        stream_name: Bytes::copy_from_slice(stream.as_bytes()),
    }
}

fn stream_name(identifier: Option<shared::StreamIdentifier>) -> String {
    identifier
        .map(|id| String::from_utf8_lossy(&id.stream_name).into_owned())
        .unwrap_or_default()
}

pub fn position(position: Position) -> shared::Position {
    shared::Position {
        commit_position: position.commit,
        prepare_position: position.prepare,
    }
}

fn from_position(position: shared::Position) -> Position {
    Position::new(position.commit_position, position.prepare_position)
}

/// `created` is in 100ns ticks since the unix epoch.
fn created_at(ticks: Option<&String>) -> DateTime<Utc> {
    ticks
        .and_then(|t| t.parse::<i64>().ok())
        .and_then(|t| DateTime::from_timestamp_micros(t / 10))
        .unwrap_or_default()
}

pub fn proposed_message(event: EventData) -> shared::ProposedMessage {
    let metadata = HashMap::from([
        (keys::TYPE.to_string(), event.event_type),
        (
            keys::CONTENT_TYPE.to_string(),
            event.content_type.as_str().to_string(),
        ),
    ]);
    shared::ProposedMessage {
        id: Some(uuid(event.id)),
        metadata,
        custom_metadata: event.metadata,
        data: event.data,
    }
}

pub fn recorded_event(event: shared::RecordedEvent) -> Result<RecordedEvent, ClientError> {
    let id = parse_uuid(event.id)?;
    let event_type = event
        .metadata
        .get(keys::TYPE)
        .cloned()
        .ok_or_else(|| parsing(format!("event {id} has no type")))?;
    let content_type = event
        .metadata
        .get(keys::CONTENT_TYPE)
        .map(|mime| ContentType::from_mime(mime))
        .unwrap_or(ContentType::Binary);

    Ok(RecordedEvent {
        id,
        stream_id: stream_name(event.stream_identifier),
        revision: event.stream_revision,
        event_type,
        content_type,
        created: created_at(event.metadata.get(keys::CREATED)),
        data: event.data,
        metadata: event.custom_metadata,
        position: Position::new(event.commit_position, event.prepare_position),
    })
}

fn resolved_event(
    event: Option<shared::RecordedEvent>,
    link: Option<shared::RecordedEvent>,
    commit_position: Option<u64>,
) -> Result<ResolvedEvent, ClientError> {
    let resolved = match (event, link) {
        (event, Some(link)) => {
            ResolvedEvent::from_link(recorded_event(link)?, event.map(recorded_event).transpose()?)
        }
        (Some(event), None) => ResolvedEvent::from_event(recorded_event(event)?),
        (None, None) => {
            return Err(ClientError::new(
                ErrorCode::InternalServer,
                "server sent an event without payload",
            ))
        }
    };
    Ok(resolved.with_commit_position(commit_position))
}

fn marker(marker: streams::SubscriptionMarker) -> SubscriptionMarker {
    SubscriptionMarker {
        timestamp: DateTime::from_timestamp_micros(marker.timestamp_micros).unwrap_or_default(),
        revision: marker.stream_revision,
        position: marker.position.map(from_position),
    }
}

pub fn read_req(request: &ReadRequest) -> streams::ReadReq {
    use streams::{all_target, read_req, stream_target};

    let target = match &request.target {
        ReadTarget::Stream { stream, from } => {
            let revision_option = match from {
                StreamPosition::Start => stream_target::RevisionOption::Start(shared::Empty {}),
                StreamPosition::End => stream_target::RevisionOption::End(shared::Empty {}),
                StreamPosition::Position(revision) => {
                    stream_target::RevisionOption::Revision(*revision)
                }
            };
            read_req::Target::Stream(streams::StreamTarget {
                stream_identifier: Some(stream_identifier(stream)),
                revision_option: Some(revision_option),
            })
        }
        ReadTarget::All { from } => {
            let position_option = match from {
                StreamPosition::Start => all_target::PositionOption::Start(shared::Empty {}),
                StreamPosition::End => all_target::PositionOption::End(shared::Empty {}),
                StreamPosition::Position(p) => all_target::PositionOption::Position(position(*p)),
            };
            read_req::Target::All(streams::AllTarget {
                position_option: Some(position_option),
            })
        }
    };

    let direction = match request.direction {
        Direction::Forwards => streams::ReadDirection::Forwards,
        Direction::Backwards => streams::ReadDirection::Backwards,
    };

    let mode = match request.max_count {
        Some(count) => read_req::Mode::Count(count),
        None => read_req::Mode::Subscription(shared::Empty {}),
    };

    streams::ReadReq {
        target: Some(target),
        direction: direction as i32,
        resolve_links: request.resolve_link_tos,
        mode: Some(mode),
        filter: request.filter.as_ref().map(filter),
    }
}

fn filter(filter: &SubscriptionFilter) -> streams::Filter {
    use streams::filter::{ExpressionOption, WindowOption};

    let expression = match filter.expression() {
        FilterExpression::Prefixes(prefixes) => streams::Expression {
            regex: String::new(),
            prefix: prefixes.clone(),
        },
        FilterExpression::Regex(regex) => streams::Expression {
            regex: regex.as_str().to_string(),
            prefix: Vec::new(),
        },
    };
    let expression_option = match filter.target() {
        FilterTarget::StreamName => ExpressionOption::StreamIdentifier(expression),
        FilterTarget::EventType => ExpressionOption::EventType(expression),
    };
    let window_option = match filter.max_search_window() {
        Some(max) => WindowOption::Max(max),
        None => WindowOption::Count(shared::Empty {}),
    };

    streams::Filter {
        expression_option: Some(expression_option),
        window_option: Some(window_option),
        checkpoint_interval_multiplier: filter.checkpoint_interval_multiplier(),
    }
}

pub fn read_message(response: streams::ReadResp) -> Result<ReadMessage, ClientError> {
    use streams::read_resp::Content;

    let message = match response.content {
        Some(Content::Event(event)) => ReadMessage::Event(resolved_event(
            event.event,
            event.link,
            event.commit_position,
        )?),
        Some(Content::Confirmation(confirmation)) => ReadMessage::Confirmation {
            subscription_id: confirmation.subscription_id,
        },
        Some(Content::Checkpoint(checkpoint)) => {
            ReadMessage::Checkpoint(from_position(checkpoint))
        }
        Some(Content::StreamNotFound(not_found)) => ReadMessage::StreamNotFound {
            stream: stream_name(not_found.stream_identifier),
        },
        Some(Content::CaughtUp(caught_up)) => ReadMessage::CaughtUp(marker(caught_up)),
        Some(Content::FellBehind(fell_behind)) => ReadMessage::FellBehind(marker(fell_behind)),
        None => ReadMessage::Unknown,
    };
    Ok(message)
}

pub fn append_options(
    stream: &str,
    expected: StreamState,
) -> Result<streams::AppendReq, ClientError> {
    Ok(streams::AppendReq {
        content: Some(streams::append_req::Content::Options(streams::AppendOptions {
            stream_identifier: Some(stream_identifier(stream)),
            expected_revision: expected.to_wire()?,
        })),
    })
}

/// Narrows a count for an `int64` field the server reads as signed.
pub fn signed(value: u64, field: &str) -> Result<i64, ClientError> {
    i64::try_from(value)
        .map_err(|_| ClientError::invalid_argument(format!("{field} {value} is out of range")))
}

pub fn append_event(event: EventData) -> streams::AppendReq {
    streams::AppendReq {
        content: Some(streams::append_req::Content::ProposedMessage(
            proposed_message(event),
        )),
    }
}

pub fn write_result(
    stream: &str,
    expected: StreamState,
    response: streams::AppendResp,
) -> Result<WriteResult, ClientError> {
    use streams::append_resp::Result as Outcome;

    match response.result {
        Some(Outcome::Success(success)) => Ok(WriteResult {
            next_expected_revision: success.current_revision,
            position: success.position.map(from_position).unwrap_or(Position::START),
        }),
        Some(Outcome::WrongExpectedVersion(wev)) => {
            let actual = StreamState::from_wire(wev.current_revision).unwrap_or(StreamState::NoStream);
            Err(ClientError::wrong_expected_version(stream, expected, actual))
        }
        None => Err(ClientError::new(
            ErrorCode::InternalServer,
            "append response without result",
        )),
    }
}

pub fn delete_position(position_value: Option<shared::Position>) -> Position {
    position_value.map(from_position).unwrap_or(Position::START)
}

pub fn multi_append_request(
    requests: Vec<AppendStreamRequest>,
) -> Result<v2::MultiStreamAppendRequest, ClientError> {
    let input = requests
        .into_iter()
        .map(|request| {
            Ok(v2::AppendStreamRequest {
                expected_revision: request.expected_state.to_wire()?,
                records: request
                    .events
                    .into_iter()
                    .map(|event| v2::AppendRecord {
                        record_id: event.id.to_string(),
                        content_type: event.content_type.as_str().to_string(),
                        event_type: event.event_type,
                        data: event.data,
                        metadata: event.metadata,
                    })
                    .collect(),
                stream: request.stream,
            })
        })
        .collect::<Result<Vec<_>, ClientError>>()?;
    Ok(v2::MultiStreamAppendRequest { input })
}

pub fn multi_append_result(response: v2::MultiStreamAppendResponse) -> MultiAppendWriteResult {
    MultiAppendWriteResult {
        position: response.position.max(0) as u64,
        responses: response
            .output
            .into_iter()
            .map(|success| (success.stream, success.stream_revision.max(0) as u64))
            .collect(),
    }
}

pub fn cluster_member(info: MemberInfo) -> Option<ClusterMember> {
    let endpoint = info.http_end_point?;
    let port = u16::try_from(endpoint.port).ok()?;
    let role = match VNodeState::try_from(info.state) {
        Ok(VNodeState::Leader) => MemberRole::Leader,
        Ok(VNodeState::Follower) => MemberRole::Follower,
        Ok(VNodeState::ReadOnlyReplica) => MemberRole::ReadOnlyReplica,
        _ => MemberRole::Unknown,
    };
    Some(ClusterMember::new(
        Endpoint::new(endpoint.address, port),
        role,
        info.is_alive,
    ))
}

pub fn subscription_target(target: &PersistentTarget) -> persistent::SubscriptionTarget {
    use persistent::subscription_target::Target;

    let target = match target {
        PersistentTarget::Stream(stream) => Target::Stream(stream_identifier(stream)),
        PersistentTarget::All => Target::All(shared::Empty {}),
    };
    persistent::SubscriptionTarget {
        target: Some(target),
    }
}

fn clamp_i32(value: u32) -> i32 {
    i32::try_from(value).unwrap_or(i32::MAX)
}

fn millis(duration: Duration) -> i64 {
    i64::try_from(duration.as_millis()).unwrap_or(i64::MAX)
}

pub fn settings(settings: &PersistentSubscriptionSettings) -> persistent::Settings {
    use persistent::start_from::Value;

    let start_from = match settings.start_from {
        StartFrom::Start => Value::Start(shared::Empty {}),
        StartFrom::End => Value::End(shared::Empty {}),
        StartFrom::Revision(revision) => Value::Revision(revision),
        StartFrom::Position(p) => Value::Position(position(p)),
    };

    persistent::Settings {
        resolve_links: settings.resolve_link_tos,
        extra_statistics: settings.extra_statistics,
        message_timeout_ms: millis(settings.message_timeout),
        max_retry_count: clamp_i32(settings.max_retry_count),
        live_buffer_size: clamp_i32(settings.live_buffer_size),
        read_batch_size: clamp_i32(settings.read_batch_size),
        history_buffer_size: clamp_i32(settings.history_buffer_size),
        checkpoint_lower_bound: clamp_i32(settings.checkpoint_lower_bound),
        checkpoint_upper_bound: clamp_i32(settings.checkpoint_upper_bound),
        checkpoint_after_ms: millis(settings.checkpoint_after),
        max_subscriber_count: clamp_i32(settings.max_subscriber_count),
        consumer_strategy: settings.consumer_strategy.as_str().to_string(),
        start_from: Some(persistent::StartFrom {
            value: Some(start_from),
        }),
    }
}

fn from_settings(settings: persistent::Settings) -> PersistentSubscriptionSettings {
    use persistent::start_from::Value;

    let start_from = match settings.start_from.and_then(|s| s.value) {
        Some(Value::Start(_)) => StartFrom::Start,
        Some(Value::Revision(revision)) => StartFrom::Revision(revision),
        Some(Value::Position(p)) => StartFrom::Position(from_position(p)),
        Some(Value::End(_)) | None => StartFrom::End,
    };
    let count = |value: i32| value.max(0) as u32;
    let duration = |ms: i64| Duration::from_millis(ms.max(0) as u64);

    PersistentSubscriptionSettings {
        resolve_link_tos: settings.resolve_links,
        extra_statistics: settings.extra_statistics,
        message_timeout: duration(settings.message_timeout_ms),
        max_retry_count: count(settings.max_retry_count),
        live_buffer_size: count(settings.live_buffer_size),
        read_batch_size: count(settings.read_batch_size),
        history_buffer_size: count(settings.history_buffer_size),
        checkpoint_lower_bound: count(settings.checkpoint_lower_bound),
        checkpoint_upper_bound: count(settings.checkpoint_upper_bound),
        checkpoint_after: duration(settings.checkpoint_after_ms),
        max_subscriber_count: count(settings.max_subscriber_count),
        consumer_strategy: settings
            .consumer_strategy
            .parse()
            .unwrap_or(ConsumerStrategy::RoundRobin),
        start_from,
    }
}

fn non_empty(value: String) -> Option<String> {
    (!value.is_empty()).then_some(value)
}

pub fn subscription_info(info: persistent::SubscriptionInfo) -> PersistentSubscriptionInfo {
    PersistentSubscriptionInfo {
        event_source: info.event_source,
        group_name: info.group_name,
        status: info.status,
        connections: info
            .connections
            .into_iter()
            .map(|c| PersistentConnectionInfo {
                from: c.from,
                username: c.username,
                in_flight_messages: c.in_flight_messages.max(0) as u32,
                total_items: c.total_items.max(0) as u64,
            })
            .collect(),
        settings: info.settings.map(from_settings),
        stats: PersistentSubscriptionStats {
            last_checkpointed_position: non_empty(info.last_checkpointed_position),
            last_known_position: non_empty(info.last_known_position),
            parked_message_count: info.parked_message_count.max(0) as u64,
            in_flight_messages: info.in_flight_messages.max(0) as u64,
            total_items: info.total_items.max(0) as u64,
        },
    }
}

pub fn persistent_options(
    target: &PersistentTarget,
    group: &str,
    buffer_size: usize,
) -> persistent::ReadReq {
    persistent::ReadReq {
        content: Some(persistent::read_req::Content::Options(
            persistent::ReadOptions {
                target: Some(subscription_target(target)),
                group_name: group.to_string(),
                buffer_size: i32::try_from(buffer_size).unwrap_or(i32::MAX),
            },
        )),
    }
}

pub fn persistent_command(command: PersistentCommand) -> persistent::ReadReq {
    use persistent::read_req::Content;

    let content = match command {
        PersistentCommand::Ack(ids) => Content::Ack(persistent::Ack {
            ids: ids.into_iter().map(uuid).collect(),
        }),
        PersistentCommand::Nack {
            ids,
            action,
            reason,
        } => {
            let action = match action {
                NackAction::Unknown => persistent::NackAction::Unknown,
                NackAction::Park => persistent::NackAction::Park,
                NackAction::Retry => persistent::NackAction::Retry,
                NackAction::Skip => persistent::NackAction::Skip,
                NackAction::Stop => persistent::NackAction::Stop,
            };
            Content::Nack(persistent::Nack {
                ids: ids.into_iter().map(uuid).collect(),
                action: action as i32,
                reason,
            })
        }
    };
    persistent::ReadReq {
        content: Some(content),
    }
}

pub fn persistent_message(response: persistent::ReadResp) -> Result<PersistentMessage, ClientError> {
    use persistent::read_resp::Content;

    let message = match response.content {
        Some(Content::Event(event)) => PersistentMessage::Event(
            resolved_event(event.event, event.link, event.commit_position)?
                .with_retry_count(event.retry_count.max(0) as u32),
        ),
        Some(Content::Confirmation(confirmation)) => PersistentMessage::Confirmation {
            subscription_id: confirmation.subscription_id,
        },
        None => PersistentMessage::Unknown,
    };
    Ok(message)
}
