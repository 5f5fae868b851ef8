use bytes::Bytes;
use chrono::{DateTime, Utc};
use serde::Serialize;
use uuid::Uuid;

use super::Position;
use crate::error::{ClientError, ErrorCode};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ContentType {
    #[default]
    Json,
    Binary,
}

impl ContentType {
    pub fn as_str(&self) -> &'static str {
        match self {
            ContentType::Json => "application/json",
            ContentType::Binary => "application/octet-stream",
        }
    }

    pub fn from_mime(mime: &str) -> Self {
        if mime == "application/json" {
            ContentType::Json
        } else {
            ContentType::Binary
        }
    }
}

/// An event proposed for appending.
#[derive(Debug, Clone, PartialEq)]
pub struct EventData {
    pub id: Uuid,
    pub event_type: String,
    pub content_type: ContentType,
    pub data: Bytes,
    pub metadata: Bytes,
}

impl EventData {
    /// Serializes `payload` as a JSON event with a fresh id.
    pub fn json<T: Serialize>(event_type: impl Into<String>, payload: &T) -> Result<Self, ClientError> {
        let data = serde_json::to_vec(payload).map_err(|e| {
            ClientError::from_error(ErrorCode::Parsing, "failed to serialize event payload", e)
        })?;
        Ok(Self {
            id: Uuid::new_v4(),
            event_type: event_type.into(),
            content_type: ContentType::Json,
            data: Bytes::from(data),
            metadata: Bytes::new(),
        })
    }

    pub fn binary(event_type: impl Into<String>, data: impl Into<Bytes>) -> Self {
        Self {
            id: Uuid::new_v4(),
            event_type: event_type.into(),
            content_type: ContentType::Binary,
            data: data.into(),
            metadata: Bytes::new(),
        }
    }

    pub fn with_id(mut self, id: Uuid) -> Self {
        self.id = id;
        self
    }

    pub fn with_metadata(mut self, metadata: impl Into<Bytes>) -> Self {
        self.metadata = metadata.into();
        self
    }

    /// Payload size as counted against the server's record size limit.
    pub fn size(&self) -> usize {
        self.data.len() + self.metadata.len() + self.event_type.len()
    }
}

/// An event as stored by the server.
#[derive(Debug, Clone, PartialEq)]
pub struct RecordedEvent {
    pub id: Uuid,
    pub stream_id: String,
    pub revision: u64,
    pub event_type: String,
    pub content_type: ContentType,
    pub data: Bytes,
    pub metadata: Bytes,
    pub position: Position,
    pub created: DateTime<Utc>,
}

impl RecordedEvent {
    pub fn as_json<T: serde::de::DeserializeOwned>(&self) -> Result<T, ClientError> {
        serde_json::from_slice(&self.data).map_err(|e| {
            ClientError::from_error(
                ErrorCode::Parsing,
                format!("event {} is not valid json", self.id),
                e,
            )
        })
    }
}

/// The stream entry behind a delivered event.
#[derive(Debug, Clone, PartialEq)]
enum Entry {
    Event(RecordedEvent),
    /// A link entry and the event it points to, when that event still exists.
    Link {
        link: RecordedEvent,
        event: Option<RecordedEvent>,
    },
}

/// A delivered event, with the link it was reached through when the stream
/// entry was a link.
#[derive(Debug, Clone, PartialEq)]
pub struct ResolvedEvent {
    entry: Entry,
    pub commit_position: Option<u64>,
    /// Number of earlier deliveries of this event to a persistent subscription group.
    pub retry_count: u32,
}

impl ResolvedEvent {
    pub fn from_event(event: RecordedEvent) -> Self {
        Self {
            commit_position: Some(event.position.commit),
            entry: Entry::Event(event),
            retry_count: 0,
        }
    }

    pub fn from_link(link: RecordedEvent, event: Option<RecordedEvent>) -> Self {
        Self {
            commit_position: Some(link.position.commit),
            entry: Entry::Link { link, event },
            retry_count: 0,
        }
    }

    pub fn with_retry_count(mut self, retry_count: u32) -> Self {
        self.retry_count = retry_count;
        self
    }

    pub fn with_commit_position(mut self, commit_position: Option<u64>) -> Self {
        self.commit_position = commit_position;
        self
    }

    /// The resolved event. `None` when a link points to an event that no longer exists.
    pub fn event(&self) -> Option<&RecordedEvent> {
        match &self.entry {
            Entry::Event(event) => Some(event),
            Entry::Link { event, .. } => event.as_ref(),
        }
    }

    pub fn link(&self) -> Option<&RecordedEvent> {
        match &self.entry {
            Entry::Event(_) => None,
            Entry::Link { link, .. } => Some(link),
        }
    }

    /// The entry read from the stream: the link if there is one, the event otherwise.
    pub fn original_event(&self) -> &RecordedEvent {
        match &self.entry {
            Entry::Event(event) => event,
            Entry::Link { link, .. } => link,
        }
    }

    /// Id to acknowledge on a persistent subscription.
    pub fn id(&self) -> Uuid {
        self.original_event().id
    }

    pub fn stream_id(&self) -> &str {
        &self.original_event().stream_id
    }
}

/// Progress marker attached to caught-up and fell-behind signals.
#[derive(Debug, Clone, PartialEq)]
pub struct SubscriptionMarker {
    pub timestamp: DateTime<Utc>,
    pub revision: Option<u64>,
    pub position: Option<Position>,
}

/// Why a subscription stopped delivering.
#[derive(Debug, Clone)]
pub struct Dropped {
    pub reason: String,
    pub error: Option<ClientError>,
}

impl Dropped {
    pub fn closed() -> Self {
        Self {
            reason: "subscription has been dropped".to_string(),
            error: None,
        }
    }

    pub fn from_error(error: ClientError) -> Self {
        Self {
            reason: error.to_string(),
            error: Some(error),
        }
    }
}

/// One item delivered by a catch-up or persistent subscription.
#[derive(Debug, Clone)]
pub enum SubscriptionEvent {
    EventAppeared(ResolvedEvent),
    CheckPointReached(Position),
    CaughtUp(SubscriptionMarker),
    FellBehind(SubscriptionMarker),
    SubscriptionDropped(Dropped),
}

impl SubscriptionEvent {
    pub fn is_dropped(&self) -> bool {
        matches!(self, SubscriptionEvent::SubscriptionDropped(_))
    }

    pub fn into_event(self) -> Option<ResolvedEvent> {
        match self {
            SubscriptionEvent::EventAppeared(event) => Some(event),
            _ => None,
        }
    }
}
