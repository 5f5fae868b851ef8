use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use crate::error::{ClientError, ErrorCode};
use crate::types::Position;

/// What a persistent subscription group reads from.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum PersistentTarget {
    Stream(String),
    All,
}

impl PersistentTarget {
    pub fn stream(name: impl Into<String>) -> Self {
        PersistentTarget::Stream(name.into())
    }

    /// Name the server reports as the group's event source.
    pub fn event_source(&self) -> &str {
        match self {
            PersistentTarget::Stream(stream) => stream,
            PersistentTarget::All => "$all",
        }
    }
}

impl fmt::Display for PersistentTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.event_source())
    }
}

/// How events are spread across the members of a group.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ConsumerStrategy {
    #[default]
    RoundRobin,
    DispatchToSingle,
    PinnedByCorrelation,
}

impl ConsumerStrategy {
    pub fn as_str(&self) -> &'static str {
        match self {
            ConsumerStrategy::RoundRobin => "RoundRobin",
            ConsumerStrategy::DispatchToSingle => "DispatchToSingle",
            ConsumerStrategy::PinnedByCorrelation => "PinnedByCorrelation",
        }
    }
}

impl FromStr for ConsumerStrategy {
    type Err = ClientError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "RoundRobin" => Ok(ConsumerStrategy::RoundRobin),
            "DispatchToSingle" => Ok(ConsumerStrategy::DispatchToSingle),
            "PinnedByCorrelation" | "Pinned" => Ok(ConsumerStrategy::PinnedByCorrelation),
            other => Err(ClientError::new(
                ErrorCode::Parsing,
                format!("unknown consumer strategy '{other}'"),
            )),
        }
    }
}

/// Where a new group starts reading.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum StartFrom {
    Start,
    #[default]
    End,
    /// Stream targets only.
    Revision(u64),
    /// `$all` targets only.
    Position(Position),
}

/// Server-side settings of a persistent subscription group.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PersistentSubscriptionSettings {
    pub resolve_link_tos: bool,
    pub extra_statistics: bool,
    /// How long an event may stay in flight before it is retried.
    pub message_timeout: Duration,
    /// Deliveries before an event is parked.
    pub max_retry_count: u32,
    pub live_buffer_size: u32,
    pub read_batch_size: u32,
    pub history_buffer_size: u32,
    pub checkpoint_lower_bound: u32,
    pub checkpoint_upper_bound: u32,
    pub checkpoint_after: Duration,
    /// 0 means unlimited.
    pub max_subscriber_count: u32,
    pub consumer_strategy: ConsumerStrategy,
    pub start_from: StartFrom,
}

impl Default for PersistentSubscriptionSettings {
    fn default() -> Self {
        Self {
            resolve_link_tos: false,
            extra_statistics: false,
            message_timeout: Duration::from_secs(30),
            max_retry_count: 10,
            live_buffer_size: 500,
            read_batch_size: 20,
            history_buffer_size: 500,
            checkpoint_lower_bound: 10,
            checkpoint_upper_bound: 1_000,
            checkpoint_after: Duration::from_secs(2),
            max_subscriber_count: 0,
            consumer_strategy: ConsumerStrategy::RoundRobin,
            start_from: StartFrom::End,
        }
    }
}

impl PersistentSubscriptionSettings {
    pub fn start_from(mut self, start_from: StartFrom) -> Self {
        self.start_from = start_from;
        self
    }

    pub fn with_max_retry_count(mut self, max_retry_count: u32) -> Self {
        self.max_retry_count = max_retry_count;
        self
    }

    pub fn with_consumer_strategy(mut self, strategy: ConsumerStrategy) -> Self {
        self.consumer_strategy = strategy;
        self
    }

    /// Rejects settings no server accepts for `target`.
    pub fn validate(&self, target: &PersistentTarget) -> Result<(), ClientError> {
        if self.checkpoint_lower_bound > self.checkpoint_upper_bound {
            return Err(ClientError::invalid_argument(format!(
                "checkpoint_lower_bound ({}) must not exceed checkpoint_upper_bound ({})",
                self.checkpoint_lower_bound, self.checkpoint_upper_bound
            )));
        }
        if self.read_batch_size == 0 || self.live_buffer_size == 0 || self.history_buffer_size == 0 {
            return Err(ClientError::invalid_argument(
                "buffer and batch sizes must be positive",
            ));
        }
        match (target, self.start_from) {
            (PersistentTarget::All, StartFrom::Revision(_)) => Err(ClientError::invalid_argument(
                "a $all group cannot start from a stream revision",
            )),
            (PersistentTarget::Stream(_), StartFrom::Position(_)) => {
                Err(ClientError::invalid_argument(
                    "a stream group cannot start from a log position",
                ))
            }
            _ => Ok(()),
        }
    }
}

/// A client attached to a group, as reported by the server.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct PersistentConnectionInfo {
    pub from: String,
    pub username: String,
    pub in_flight_messages: u32,
    pub total_items: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct PersistentSubscriptionStats {
    pub last_checkpointed_position: Option<String>,
    pub last_known_position: Option<String>,
    pub parked_message_count: u64,
    pub in_flight_messages: u64,
    pub total_items: u64,
}

/// Description of one persistent subscription group.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PersistentSubscriptionInfo {
    pub event_source: String,
    pub group_name: String,
    pub status: String,
    pub connections: Vec<PersistentConnectionInfo>,
    pub settings: Option<PersistentSubscriptionSettings>,
    pub stats: PersistentSubscriptionStats,
}
