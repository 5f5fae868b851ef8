//! Value types shared by every client component.

mod event;
mod position;

pub use event::{
    ContentType, Dropped, EventData, RecordedEvent, ResolvedEvent, SubscriptionEvent,
    SubscriptionMarker,
};
pub use position::{Position, StreamPosition};

use std::fmt;
use std::str::FromStr;

use serde::Deserialize;

use crate::error::{ClientError, ErrorCode};

/// Default port of a KurrentDB node.
pub const DEFAULT_PORT: u16 = 2113;

/// A node address.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Deserialize)]
#[serde(try_from = "String")]
pub struct Endpoint {
    pub host: String,
    pub port: u16,
}

impl Endpoint {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
        }
    }
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.host, self.port)
    }
}

impl FromStr for Endpoint {
    type Err = ClientError;

    /// Parses `host:port`, or a bare host on the default port.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        if s.is_empty() {
            return Err(ClientError::new(ErrorCode::Parsing, "empty endpoint"));
        }
        match s.rsplit_once(':') {
            Some((host, port)) => {
                let port = port.parse::<u16>().map_err(|e| {
                    ClientError::new(
                        ErrorCode::Parsing,
                        format!("invalid port in endpoint '{s}': {e}"),
                    )
                })?;
                if host.is_empty() {
                    return Err(ClientError::new(
                        ErrorCode::Parsing,
                        format!("missing host in endpoint '{s}'"),
                    ));
                }
                Ok(Endpoint::new(host, port))
            }
            None => Ok(Endpoint::new(s, DEFAULT_PORT)),
        }
    }
}

impl TryFrom<String> for Endpoint {
    type Error = ClientError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

/// Expected state of a stream for optimistic concurrency checks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum StreamState {
    /// No concurrency check. Retried appends are not guaranteed to be idempotent.
    #[default]
    Any,
    /// The stream must not exist.
    NoStream,
    /// The stream must exist, at any revision.
    StreamExists,
    /// The stream's last event must be at exactly this revision.
    Revision(u64),
}

const NO_STREAM_SENTINEL: i64 = -1;
const ANY_SENTINEL: i64 = -2;
const STREAM_EXISTS_SENTINEL: i64 = -4;

impl StreamState {
    /// Signed sentinel carried on the wire. Revisions past `i64::MAX` have
    /// no wire form and are rejected.
    pub fn to_wire(self) -> Result<i64, ClientError> {
        match self {
            StreamState::NoStream => Ok(NO_STREAM_SENTINEL),
            StreamState::Any => Ok(ANY_SENTINEL),
            StreamState::StreamExists => Ok(STREAM_EXISTS_SENTINEL),
            StreamState::Revision(n) => i64::try_from(n).map_err(|_| {
                ClientError::invalid_argument(format!(
                    "expected revision {n} exceeds the largest revision a server accepts"
                ))
            }),
        }
    }

    pub fn from_wire(value: i64) -> Result<Self, ClientError> {
        match value {
            NO_STREAM_SENTINEL => Ok(StreamState::NoStream),
            ANY_SENTINEL => Ok(StreamState::Any),
            STREAM_EXISTS_SENTINEL => Ok(StreamState::StreamExists),
            n if n >= 0 => Ok(StreamState::Revision(n as u64)),
            n => Err(ClientError::new(
                ErrorCode::Parsing,
                format!("invalid stream state sentinel {n}"),
            )),
        }
    }

    /// Whether a stream whose last revision is `current` (None when absent)
    /// satisfies this expectation.
    pub fn is_satisfied_by(self, current: Option<u64>) -> bool {
        match (self, current) {
            (StreamState::Any, _) => true,
            (StreamState::NoStream, current) => current.is_none(),
            (StreamState::StreamExists, current) => current.is_some(),
            (StreamState::Revision(n), Some(current)) => n == current,
            (StreamState::Revision(_), None) => false,
        }
    }
}

impl fmt::Display for StreamState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StreamState::Any => f.write_str("Any"),
            StreamState::NoStream => f.write_str("NoStream"),
            StreamState::StreamExists => f.write_str("StreamExists"),
            StreamState::Revision(n) => write!(f, "{n}"),
        }
    }
}

/// Read direction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Direction {
    #[default]
    Forwards,
    Backwards,
}

/// Outcome of a successful append.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WriteResult {
    /// Revision of the last event written; pass it as `StreamState::Revision`
    /// on the next append.
    pub next_expected_revision: u64,
    pub position: Position,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DeleteResult {
    pub position: Position,
}

/// One stream's share of a multi-stream append.
#[derive(Debug, Clone)]
pub struct AppendStreamRequest {
    pub stream: String,
    pub expected_state: StreamState,
    pub events: Vec<EventData>,
}

impl AppendStreamRequest {
    pub fn new(stream: impl Into<String>, expected_state: StreamState, events: Vec<EventData>) -> Self {
        Self {
            stream: stream.into(),
            expected_state,
            events,
        }
    }
}

/// Per-stream revisions produced by a committed multi-stream append.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MultiAppendWriteResult {
    pub position: u64,
    pub responses: Vec<(String, u64)>,
}

/// Server build version.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct ServerVersion {
    pub major: u32,
    pub minor: u32,
    pub patch: u32,
}

impl ServerVersion {
    /// First release serving multi-stream appends.
    pub const MULTI_APPEND: u32 = 25;

    pub fn supports_multi_append(&self) -> bool {
        self.major >= Self::MULTI_APPEND
    }
}

impl FromStr for ServerVersion {
    type Err = ClientError;

    /// Accepts `major.minor.patch`, ignoring any pre-release suffix such as
    /// `25.1.0-prerelease`.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let mut parts = [0u32; 3];
        for (idx, value) in s.trim().split('.').take(3).enumerate() {
            let value = value.split_once('-').map_or(value, |(num, _)| num);
            parts[idx] = value.parse().map_err(|e| {
                ClientError::new(
                    ErrorCode::Parsing,
                    format!("invalid server version component '{value}' in '{s}': {e}"),
                )
            })?;
        }
        Ok(ServerVersion {
            major: parts[0],
            minor: parts[1],
            patch: parts[2],
        })
    }
}

impl fmt::Display for ServerVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}.{}", self.major, self.minor, self.patch)
    }
}
