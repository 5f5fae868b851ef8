//! Event storage shared by every node of the fake cluster.

use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard, PoisonError};

use chrono::Utc;
use tokio::sync::watch;
use tonic::Code;

use super::server_error;
use crate::error::{headers, pack_detail, status_with_details, ClientError};
use crate::persistent::{PersistentTarget, StartFrom};
use crate::proto::kurrentdb::protocol::v2::streams::errors::{
    AppendRecordSizeExceededErrorDetails, AppendTransactionSizeExceededErrorDetails,
    StreamRevisionConflictErrorDetails, StreamTombstonedErrorDetails,
};
use crate::streams::{metadata_stream_name, StreamMetadata};
use crate::transport::ReadMessage;
use crate::types::{
    AppendStreamRequest, DeleteResult, Direction, EventData, MultiAppendWriteResult, Position,
    RecordedEvent, ResolvedEvent, StreamPosition, StreamState, WriteResult,
};

/// Event type of link events; their payload is `<revision>@<stream>`.
pub const LINK_EVENT_TYPE: &str = "$>";

/// Default size limit of one record.
pub const DEFAULT_MAX_RECORD_SIZE: usize = 1024 * 1024;

#[derive(Default)]
struct StreamEntry {
    /// Every event ever written, indexed by revision.
    events: Vec<RecordedEvent>,
    /// Revisions below this were removed by a soft delete.
    hidden_before: u64,
    deleted: bool,
    tombstoned: bool,
}

impl StreamEntry {
    fn current_revision(&self) -> Option<u64> {
        if self.deleted || self.events.is_empty() {
            None
        } else {
            Some(self.events.len() as u64 - 1)
        }
    }
}

struct State {
    streams: HashMap<String, StreamEntry>,
    /// The global log, in commit order.
    log: Vec<RecordedEvent>,
    max_record_size: usize,
    max_transaction_size: usize,
}

impl State {
    fn next_position(&self) -> Position {
        let n = self.log.len() as u64 + 1;
        Position::new(n, n)
    }

    fn metadata(&self, stream: &str) -> Option<StreamMetadata> {
        let entry = self.streams.get(&metadata_stream_name(stream))?;
        let latest = entry.events.last()?;
        serde_json::from_slice(&latest.data).ok()
    }

    /// Events of `stream` not hidden by deletion, `$tb` or `$maxCount`.
    fn visible(&self, stream: &str) -> &[RecordedEvent] {
        let Some(entry) = self.streams.get(stream) else {
            return &[];
        };
        let len = entry.events.len();
        let mut start = entry.hidden_before as usize;
        if let Some(metadata) = self.metadata(stream) {
            if let Some(tb) = metadata.truncate_before {
                start = start.max(tb as usize);
            }
            if let Some(max_count) = metadata.max_count {
                start = start.max(len.saturating_sub(max_count as usize));
            }
        }
        &entry.events[start.min(len)..]
    }

    fn resolve(&self, event: RecordedEvent, resolve_link_tos: bool) -> ResolvedEvent {
        if !resolve_link_tos || event.event_type != LINK_EVENT_TYPE {
            return ResolvedEvent::from_event(event);
        }
        let target = std::str::from_utf8(&event.data)
            .ok()
            .and_then(|link| link.split_once('@'))
            .and_then(|(revision, stream)| {
                let revision = revision.parse::<u64>().ok()?;
                self.visible(stream)
                    .iter()
                    .find(|e| e.revision == revision)
                    .cloned()
            });
        ResolvedEvent::from_link(event, target)
    }

    fn check(&self, stream: &str, expected: StreamState) -> Result<(), ClientError> {
        let entry = self.streams.get(stream);
        if entry.is_some_and(|e| e.tombstoned) {
            return Err(stream_deleted(stream));
        }
        let current = entry.and_then(StreamEntry::current_revision);
        if expected.is_satisfied_by(current) {
            return Ok(());
        }
        let actual = current.map_or(StreamState::NoStream, StreamState::Revision);
        Err(server_error(
            Code::FailedPrecondition,
            headers::WRONG_EXPECTED_VERSION,
            format!("Append failed due to WrongExpectedVersion. Stream: {stream}, Expected version: {expected}, Actual version: {actual}"),
            &[
                (headers::STREAM_NAME, stream.to_string()),
                (headers::EXPECTED_VERSION, expected.to_wire()?.to_string()),
                (headers::ACTUAL_VERSION, actual.to_wire()?.to_string()),
            ],
        ))
    }

    fn write(&mut self, stream: &str, events: Vec<EventData>) -> u64 {
        let mut next_revision = 0;
        for event in events {
            let position = self.next_position();
            let entry = self.streams.entry(stream.to_string()).or_default();
            entry.deleted = false;
            let revision = entry.events.len() as u64;
            let recorded = RecordedEvent {
                id: event.id,
                stream_id: stream.to_string(),
                revision,
                event_type: event.event_type,
                content_type: event.content_type,
                data: event.data,
                metadata: event.metadata,
                position,
                created: Utc::now(),
            };
            entry.events.push(recorded.clone());
            self.log.push(recorded);
            next_revision = revision;
        }
        next_revision
    }
}

fn stream_deleted(stream: &str) -> ClientError {
    server_error(
        Code::FailedPrecondition,
        headers::STREAM_DELETED,
        format!("Event stream '{stream}' is deleted."),
        &[(headers::STREAM_NAME, stream.to_string())],
    )
}

/// Where a persistent group resumes reading its source.
pub type SourceCursor = u64;

pub struct Store {
    state: Mutex<State>,
    changes: watch::Sender<usize>,
}

impl Default for Store {
    fn default() -> Self {
        Self {
            state: Mutex::new(State {
                streams: HashMap::new(),
                log: Vec::new(),
                max_record_size: DEFAULT_MAX_RECORD_SIZE,
                max_transaction_size: DEFAULT_MAX_RECORD_SIZE * 3,
            }),
            changes: watch::channel(0).0,
        }
    }
}

impl Store {
    fn lock(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn notify(&self, state: &State) {
        self.changes.send_replace(state.log.len());
    }

    /// Fires after every write or delete.
    pub fn changes(&self) -> watch::Receiver<usize> {
        self.changes.subscribe()
    }

    pub fn set_size_limits(&self, max_record_size: usize, max_transaction_size: usize) {
        let mut state = self.lock();
        state.max_record_size = max_record_size;
        state.max_transaction_size = max_transaction_size;
    }

    pub fn append(
        &self,
        stream: &str,
        expected: StreamState,
        events: Vec<EventData>,
    ) -> Result<WriteResult, ClientError> {
        let mut state = self.lock();
        state.check(stream, expected)?;
        let current = state
            .streams
            .get(stream)
            .and_then(StreamEntry::current_revision);
        let next_expected_revision = if events.is_empty() {
            current.unwrap_or_default()
        } else {
            state.write(stream, events)
        };
        let position = state
            .log
            .last()
            .map_or(Position::START, |event| event.position);
        self.notify(&state);
        Ok(WriteResult {
            next_expected_revision,
            position,
        })
    }

    /// Commits every request or none.
    pub fn multi_append(
        &self,
        requests: Vec<AppendStreamRequest>,
    ) -> Result<MultiAppendWriteResult, ClientError> {
        let mut state = self.lock();
        let mut total = 0usize;
        for request in &requests {
            if state.streams.get(&request.stream).is_some_and(|e| e.tombstoned) {
                let detail = StreamTombstonedErrorDetails {
                    stream: request.stream.clone(),
                };
                return Err(ClientError::from_status(status_with_details(
                    Code::FailedPrecondition,
                    "stream tombstoned",
                    vec![pack_detail("StreamTombstonedErrorDetails", &detail)],
                )));
            }
            let current = state
                .streams
                .get(&request.stream)
                .and_then(StreamEntry::current_revision);
            if !request.expected_state.is_satisfied_by(current) {
                let detail = StreamRevisionConflictErrorDetails {
                    stream: request.stream.clone(),
                    expected_revision: request.expected_state.to_wire()?,
                    actual_revision: current
                        .map_or(StreamState::NoStream, StreamState::Revision)
                        .to_wire()?,
                };
                return Err(ClientError::from_status(status_with_details(
                    Code::FailedPrecondition,
                    "stream revision conflict",
                    vec![pack_detail("StreamRevisionConflictErrorDetails", &detail)],
                )));
            }
            for event in &request.events {
                let size = event.size();
                if size > state.max_record_size {
                    let detail = AppendRecordSizeExceededErrorDetails {
                        stream: request.stream.clone(),
                        record_id: event.id.to_string(),
                        size: size as i32,
                        max_size: state.max_record_size as i32,
                    };
                    return Err(ClientError::from_status(status_with_details(
                        Code::InvalidArgument,
                        "record too large",
                        vec![pack_detail("AppendRecordSizeExceededErrorDetails", &detail)],
                    )));
                }
                total += size;
            }
        }
        if total > state.max_transaction_size {
            let detail = AppendTransactionSizeExceededErrorDetails {
                size: total as i32,
                max_size: state.max_transaction_size as i32,
            };
            return Err(ClientError::from_status(status_with_details(
                Code::InvalidArgument,
                "transaction too large",
                vec![pack_detail("AppendTransactionSizeExceededErrorDetails", &detail)],
            )));
        }

        let mut responses = Vec::with_capacity(requests.len());
        for request in requests {
            let revision = state.write(&request.stream, request.events);
            responses.push((request.stream, revision));
        }
        let position = state.log.last().map_or(0, |event| event.position.commit);
        self.notify(&state);
        Ok(MultiAppendWriteResult {
            position,
            responses,
        })
    }

    pub fn delete(
        &self,
        stream: &str,
        expected: StreamState,
        tombstone: bool,
    ) -> Result<DeleteResult, ClientError> {
        let mut state = self.lock();
        state.check(stream, expected)?;
        let position = state.next_position();
        let entry = state.streams.entry(stream.to_string()).or_default();
        if tombstone {
            entry.tombstoned = true;
        } else {
            entry.deleted = true;
            entry.hidden_before = entry.events.len() as u64;
        }
        self.notify(&state);
        Ok(DeleteResult { position })
    }

    /// A bounded read of one stream.
    pub fn read_stream(
        &self,
        stream: &str,
        from: StreamPosition<u64>,
        direction: Direction,
        max_count: u64,
        resolve_link_tos: bool,
    ) -> Result<Vec<ReadMessage>, ClientError> {
        let state = self.lock();
        let Some(entry) = state.streams.get(stream) else {
            return Ok(vec![not_found(stream)]);
        };
        if entry.tombstoned {
            return Err(stream_deleted(stream));
        }
        let visible = state.visible(stream);
        if entry.deleted && visible.is_empty() {
            return Ok(vec![not_found(stream)]);
        }

        let selected: Vec<RecordedEvent> = match (direction, from) {
            (Direction::Forwards, StreamPosition::Start) => visible.to_vec(),
            (Direction::Forwards, StreamPosition::End) => Vec::new(),
            (Direction::Forwards, StreamPosition::Position(n)) => {
                visible.iter().filter(|e| e.revision >= n).cloned().collect()
            }
            (Direction::Backwards, StreamPosition::Start) => {
                visible.iter().take(1).cloned().collect()
            }
            (Direction::Backwards, StreamPosition::End) => visible.iter().rev().cloned().collect(),
            (Direction::Backwards, StreamPosition::Position(n)) => visible
                .iter()
                .rev()
                .filter(|e| e.revision <= n)
                .cloned()
                .collect(),
        };

        Ok(selected
            .into_iter()
            .take(usize::try_from(max_count).unwrap_or(usize::MAX))
            .map(|event| ReadMessage::Event(state.resolve(event, resolve_link_tos)))
            .collect())
    }

    /// A bounded read of the global log.
    pub fn read_all(
        &self,
        from: StreamPosition<Position>,
        direction: Direction,
        max_count: u64,
        resolve_link_tos: bool,
    ) -> Vec<ReadMessage> {
        let state = self.lock();
        let selected: Vec<RecordedEvent> = match (direction, from) {
            (Direction::Forwards, StreamPosition::Start) => state.log.clone(),
            (Direction::Forwards, StreamPosition::End) => Vec::new(),
            (Direction::Forwards, StreamPosition::Position(p)) => {
                state.log.iter().filter(|e| e.position >= p).cloned().collect()
            }
            (Direction::Backwards, StreamPosition::Start) => Vec::new(),
            (Direction::Backwards, StreamPosition::End) => state.log.iter().rev().cloned().collect(),
            (Direction::Backwards, StreamPosition::Position(p)) => state
                .log
                .iter()
                .rev()
                .filter(|e| e.position < p)
                .cloned()
                .collect(),
        };
        selected
            .into_iter()
            .take(usize::try_from(max_count).unwrap_or(usize::MAX))
            .map(|event| ReadMessage::Event(state.resolve(event, resolve_link_tos)))
            .collect()
    }

    /// Visible events of `stream` after revision `after`.
    pub fn stream_after(
        &self,
        stream: &str,
        after: Option<u64>,
        resolve_link_tos: bool,
    ) -> Result<Vec<ResolvedEvent>, ClientError> {
        let state = self.lock();
        if state.streams.get(stream).is_some_and(|e| e.tombstoned) {
            return Err(stream_deleted(stream));
        }
        Ok(state
            .visible(stream)
            .iter()
            .filter(|e| after.map_or(true, |after| e.revision > after))
            .cloned()
            .map(|event| state.resolve(event, resolve_link_tos))
            .collect())
    }

    /// Log entries after `after`.
    pub fn all_after(&self, after: Option<Position>, resolve_link_tos: bool) -> Vec<ResolvedEvent> {
        let state = self.lock();
        state
            .log
            .iter()
            .filter(|e| after.map_or(true, |after| e.position > after))
            .cloned()
            .map(|event| state.resolve(event, resolve_link_tos))
            .collect()
    }

    pub fn last_revision(&self, stream: &str) -> Option<u64> {
        let state = self.lock();
        state.visible(stream).last().map(|e| e.revision)
    }

    pub fn last_position(&self) -> Option<Position> {
        self.lock().log.last().map(|e| e.position)
    }

    /// First cursor of a persistent group reading `target`.
    pub fn source_start(&self, target: &PersistentTarget, start: StartFrom) -> SourceCursor {
        let state = self.lock();
        match (target, start) {
            (_, StartFrom::Start) => 0,
            (PersistentTarget::Stream(stream), StartFrom::End) => state
                .streams
                .get(stream)
                .map_or(0, |e| e.events.len() as u64),
            (PersistentTarget::Stream(_), StartFrom::Revision(n)) => n,
            (PersistentTarget::All, StartFrom::End) => state.log.len() as u64,
            (PersistentTarget::All, StartFrom::Position(p)) => state
                .log
                .iter()
                .position(|e| e.position >= p)
                .unwrap_or(state.log.len()) as u64,
            // Rejected by settings validation.
            (PersistentTarget::Stream(_), StartFrom::Position(_))
            | (PersistentTarget::All, StartFrom::Revision(_)) => 0,
        }
    }

    /// Next event of a group's source at or after `cursor`, with the cursor
    /// that follows it.
    pub fn source_next(
        &self,
        target: &PersistentTarget,
        cursor: SourceCursor,
        resolve_link_tos: bool,
    ) -> Option<(ResolvedEvent, SourceCursor)> {
        let state = self.lock();
        let event = match target {
            PersistentTarget::Stream(stream) => state
                .visible(stream)
                .iter()
                .find(|e| e.revision >= cursor)
                .cloned()?,
            PersistentTarget::All => state.log.get(usize::try_from(cursor).ok()?)?.clone(),
        };
        let next = match target {
            PersistentTarget::Stream(_) => event.revision + 1,
            PersistentTarget::All => cursor + 1,
        };
        Some((state.resolve(event, resolve_link_tos), next))
    }

    pub fn source_last(&self, target: &PersistentTarget) -> Option<String> {
        match target {
            PersistentTarget::Stream(stream) => self.last_revision(stream).map(|r| r.to_string()),
            PersistentTarget::All => self.last_position().map(|p| p.to_string()),
        }
    }
}

fn not_found(stream: &str) -> ReadMessage {
    ReadMessage::StreamNotFound {
        stream: stream.to_string(),
    }
}
