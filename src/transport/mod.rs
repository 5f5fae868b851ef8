//! Transport seam.
//!
//! Client logic talks to nodes only through [`NodeConnector`] and
//! [`NodeChannel`], expressed in domain types. [`grpc`] implements them over
//! tonic; `testing::InMemoryCluster` implements them in memory.

pub mod grpc;

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures::stream::BoxStream;
use uuid::Uuid;

use crate::config::Credentials;
use crate::error::ClientError;
use crate::persistent::{
    NackAction, PersistentSubscriptionInfo, PersistentSubscriptionSettings, PersistentTarget,
};
use crate::subscription::SubscriptionFilter;
use crate::topology::ClusterMember;
use crate::types::{
    AppendStreamRequest, DeleteResult, Direction, Endpoint, EventData, MultiAppendWriteResult,
    Position, ResolvedEvent, ServerVersion, StreamPosition, StreamState, SubscriptionMarker,
    WriteResult,
};

/// Inbound half of a streaming call.
pub type MessageStream<T> = BoxStream<'static, Result<T, ClientError>>;

/// Call options after client defaults have been applied.
#[derive(Debug, Clone, Default)]
pub struct CallContext {
    pub deadline: Option<Duration>,
    pub requires_leader: bool,
    pub credentials: Option<Credentials>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum ReadTarget {
    Stream {
        stream: String,
        from: StreamPosition<u64>,
    },
    All {
        from: StreamPosition<Position>,
    },
}

/// A bounded read (`max_count` set) or an open-ended subscription.
#[derive(Debug, Clone)]
pub struct ReadRequest {
    pub target: ReadTarget,
    pub direction: Direction,
    pub resolve_link_tos: bool,
    pub max_count: Option<u64>,
    pub filter: Option<SubscriptionFilter>,
}

impl ReadRequest {
    pub fn is_subscription(&self) -> bool {
        self.max_count.is_none()
    }
}

/// Messages of the server-streaming read call.
#[derive(Debug, Clone)]
pub enum ReadMessage {
    Confirmation { subscription_id: String },
    Event(ResolvedEvent),
    Checkpoint(Position),
    CaughtUp(SubscriptionMarker),
    FellBehind(SubscriptionMarker),
    StreamNotFound { stream: String },
    /// A message this client does not understand.
    Unknown,
}

/// Outbound messages of a persistent subscription session.
#[derive(Debug, Clone, PartialEq)]
pub enum PersistentCommand {
    Ack(Vec<Uuid>),
    Nack {
        ids: Vec<Uuid>,
        action: NackAction,
        reason: String,
    },
}

/// Inbound messages of a persistent subscription session.
#[derive(Debug, Clone)]
pub enum PersistentMessage {
    Confirmation { subscription_id: String },
    Event(ResolvedEvent),
    Unknown,
}

/// Opens gossip queries and node connections.
#[async_trait]
pub trait NodeConnector: Send + Sync {
    /// Membership as seen by `seed`.
    async fn gossip(
        &self,
        seed: &Endpoint,
        timeout: Duration,
    ) -> Result<Vec<ClusterMember>, ClientError>;

    async fn connect(&self, endpoint: &Endpoint) -> Result<Arc<dyn NodeChannel>, ClientError>;
}

/// Remote calls against one connected node.
#[async_trait]
pub trait NodeChannel: Send + Sync {
    async fn server_version(&self, ctx: &CallContext) -> Result<ServerVersion, ClientError>;

    async fn append(
        &self,
        ctx: &CallContext,
        stream: &str,
        expected: StreamState,
        events: Vec<EventData>,
    ) -> Result<WriteResult, ClientError>;

    async fn multi_append(
        &self,
        ctx: &CallContext,
        requests: Vec<AppendStreamRequest>,
    ) -> Result<MultiAppendWriteResult, ClientError>;

    async fn delete(
        &self,
        ctx: &CallContext,
        stream: &str,
        expected: StreamState,
        tombstone: bool,
    ) -> Result<DeleteResult, ClientError>;

    async fn read(
        &self,
        ctx: &CallContext,
        request: ReadRequest,
    ) -> Result<MessageStream<ReadMessage>, ClientError>;

    async fn create_persistent(
        &self,
        ctx: &CallContext,
        target: &PersistentTarget,
        group: &str,
        settings: &PersistentSubscriptionSettings,
    ) -> Result<(), ClientError>;

    async fn update_persistent(
        &self,
        ctx: &CallContext,
        target: &PersistentTarget,
        group: &str,
        settings: &PersistentSubscriptionSettings,
    ) -> Result<(), ClientError>;

    async fn delete_persistent(
        &self,
        ctx: &CallContext,
        target: &PersistentTarget,
        group: &str,
    ) -> Result<(), ClientError>;

    async fn persistent_info(
        &self,
        ctx: &CallContext,
        target: &PersistentTarget,
        group: &str,
    ) -> Result<PersistentSubscriptionInfo, ClientError>;

    /// Groups on `target`, or every group when `target` is `None`.
    async fn list_persistent(
        &self,
        ctx: &CallContext,
        target: Option<&PersistentTarget>,
    ) -> Result<Vec<PersistentSubscriptionInfo>, ClientError>;

    async fn replay_parked(
        &self,
        ctx: &CallContext,
        target: &PersistentTarget,
        group: &str,
        stop_at: Option<u64>,
    ) -> Result<(), ClientError>;

    async fn restart_persistent_subsystem(&self, ctx: &CallContext) -> Result<(), ClientError>;

    /// Opens a read session announcing `buffer_size` as delivery credit.
    /// `commands` is the outbound half; the session ends when it does.
    async fn read_persistent(
        &self,
        ctx: &CallContext,
        target: &PersistentTarget,
        group: &str,
        buffer_size: usize,
        commands: BoxStream<'static, PersistentCommand>,
    ) -> Result<MessageStream<PersistentMessage>, ClientError>;
}
