//! The fake cluster and its transport.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use futures::stream::{self, BoxStream};
use futures::StreamExt;
use tokio::sync::{mpsc, watch};
use tokio_stream::wrappers::UnboundedReceiverStream;
use tokio_util::sync::CancellationToken;
use tonic::{Code, Status};
use tracing::debug;

use super::persistent::{Flow, PersistentEngine};
use super::store::Store;
use super::{catchup, server_error};
use crate::config::{ClientSettings, TlsSettings};
use crate::error::{headers, ClientError};
use crate::persistent::{PersistentSubscriptionInfo, PersistentSubscriptionSettings, PersistentTarget};
use crate::topology::{ClusterMember, MemberRole};
use crate::transport::{
    CallContext, MessageStream, NodeChannel, NodeConnector, PersistentCommand, PersistentMessage,
    ReadMessage, ReadRequest, ReadTarget,
};
use crate::types::{
    AppendStreamRequest, DeleteResult, EventData, MultiAppendWriteResult, ServerVersion,
    StreamState, WriteResult,
};
use crate::types::Endpoint;

struct Node {
    endpoint: Endpoint,
    role: MemberRole,
    alive: bool,
    reachable: bool,
}

struct Control {
    nodes: Vec<Node>,
    connect_delay: Duration,
    call_delay: Duration,
    server_version: Option<ServerVersion>,
    /// Deliveries a session gets beyond the credit it announced.
    overdelivery: usize,
    severed: CancellationToken,
}

struct Shared {
    control: Mutex<Control>,
    store: Arc<Store>,
    persistent: PersistentEngine,
    connect_calls: AtomicUsize,
    gossip_calls: AtomicUsize,
}

impl Shared {
    fn control(&self) -> MutexGuard<'_, Control> {
        self.control.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Cluster of in-memory nodes sharing one replicated store.
///
/// Nodes have roles and liveness that tests flip at will. Writes sent to a
/// node that is not the leader fail with a not-leader status naming the
/// leader, the way a real node answers.
#[derive(Clone)]
pub struct InMemoryCluster {
    shared: Arc<Shared>,
}

impl InMemoryCluster {
    fn with_nodes(nodes: Vec<(Endpoint, MemberRole)>) -> Self {
        let nodes = nodes
            .into_iter()
            .map(|(endpoint, role)| Node {
                endpoint,
                role,
                alive: true,
                reachable: true,
            })
            .collect();
        Self {
            shared: Arc::new(Shared {
                control: Mutex::new(Control {
                    nodes,
                    connect_delay: Duration::ZERO,
                    call_delay: Duration::ZERO,
                    overdelivery: 0,
                    server_version: Some(ServerVersion {
                        major: 25,
                        minor: 1,
                        patch: 0,
                    }),
                    severed: CancellationToken::new(),
                }),
                store: Arc::new(Store::default()),
                persistent: PersistentEngine::default(),
                connect_calls: AtomicUsize::new(0),
                gossip_calls: AtomicUsize::new(0),
            }),
        }
    }

    /// One leader node reached directly.
    pub fn single_node() -> Self {
        Self::with_nodes(vec![(Endpoint::new("node1", 2113), MemberRole::Leader)])
    }

    /// A leader and two followers, discovered through gossip.
    pub fn three_node() -> Self {
        Self::with_nodes(vec![
            (Endpoint::new("node1", 2113), MemberRole::Leader),
            (Endpoint::new("node2", 2113), MemberRole::Follower),
            (Endpoint::new("node3", 2113), MemberRole::Follower),
        ])
    }

    /// Client settings pointing at this cluster, with TLS off and short
    /// discovery intervals.
    pub fn settings(&self) -> ClientSettings {
        let endpoints = self.endpoints();
        let settings = if endpoints.len() == 1 {
            ClientSettings::single_node(endpoints[0].clone())
        } else {
            ClientSettings::cluster(endpoints)
        };
        ClientSettings {
            discovery_interval_ms: 10,
            gossip_timeout_ms: 500,
            ..settings.with_tls(TlsSettings::disabled())
        }
    }

    pub fn connector(&self) -> Arc<dyn NodeConnector> {
        Arc::new(InMemoryConnector {
            shared: self.shared.clone(),
        })
    }

    pub fn endpoints(&self) -> Vec<Endpoint> {
        self.shared
            .control()
            .nodes
            .iter()
            .map(|node| node.endpoint.clone())
            .collect()
    }

    /// The alive leader, if any.
    pub fn leader(&self) -> Option<Endpoint> {
        leader_of(&self.shared.control())
    }

    fn update_node(&self, endpoint: &Endpoint, update: impl FnOnce(&mut Node)) {
        let mut control = self.shared.control();
        if let Some(node) = control.nodes.iter_mut().find(|n| &n.endpoint == endpoint) {
            update(node);
        }
    }

    /// An unreachable node refuses connections and gossip.
    pub fn set_reachable(&self, endpoint: &Endpoint, reachable: bool) {
        self.update_node(endpoint, |node| node.reachable = reachable);
    }

    /// Liveness as reported through gossip.
    pub fn set_alive(&self, endpoint: &Endpoint, alive: bool) {
        self.update_node(endpoint, |node| node.alive = alive);
    }

    pub fn set_role(&self, endpoint: &Endpoint, role: MemberRole) {
        self.update_node(endpoint, |node| node.role = role);
    }

    /// Makes `endpoint` the leader and every other leader a follower.
    pub fn elect(&self, endpoint: &Endpoint) {
        let mut control = self.shared.control();
        for node in &mut control.nodes {
            node.role = if &node.endpoint == endpoint {
                MemberRole::Leader
            } else if node.role == MemberRole::Leader {
                MemberRole::Follower
            } else {
                node.role
            };
        }
    }

    pub fn set_connect_delay(&self, delay: Duration) {
        self.shared.control().connect_delay = delay;
    }

    /// Delay applied before every call on a connected channel.
    pub fn set_call_delay(&self, delay: Duration) {
        self.shared.control().call_delay = delay;
    }

    /// Lets every new persistent session receive `extra` events beyond its
    /// buffer size, as a server redelivering timed-out events would.
    pub fn set_overdelivery(&self, extra: usize) {
        self.shared.control().overdelivery = extra;
    }

    /// `None` makes the version call unimplemented, like servers before 21.
    pub fn set_server_version(&self, version: Option<ServerVersion>) {
        self.shared.control().server_version = version;
    }

    pub fn set_size_limits(&self, max_record_size: usize, max_transaction_size: usize) {
        self.shared
            .store
            .set_size_limits(max_record_size, max_transaction_size);
    }

    /// Fails every open read, subscription and persistent session with an
    /// unavailable status.
    pub fn sever_streams(&self) {
        let mut control = self.shared.control();
        control.severed.cancel();
        control.severed = CancellationToken::new();
    }

    pub fn connect_calls(&self) -> usize {
        self.shared.connect_calls.load(Ordering::SeqCst)
    }

    pub fn gossip_calls(&self) -> usize {
        self.shared.gossip_calls.load(Ordering::SeqCst)
    }

    /// Writes events directly, bypassing any client.
    pub fn seed_events(&self, stream: &str, events: Vec<EventData>) -> Result<WriteResult, ClientError> {
        self.shared.store.append(stream, StreamState::Any, events)
    }
}

fn leader_of(control: &Control) -> Option<Endpoint> {
    control
        .nodes
        .iter()
        .find(|node| node.alive && node.role == MemberRole::Leader)
        .map(|node| node.endpoint.clone())
}

fn unreachable(endpoint: &Endpoint) -> ClientError {
    ClientError::from_status(Status::unavailable(format!("node {endpoint} is unreachable")))
}

struct InMemoryConnector {
    shared: Arc<Shared>,
}

#[async_trait]
impl NodeConnector for InMemoryConnector {
    async fn gossip(
        &self,
        seed: &Endpoint,
        _timeout: Duration,
    ) -> Result<Vec<ClusterMember>, ClientError> {
        self.shared.gossip_calls.fetch_add(1, Ordering::SeqCst);
        let control = self.shared.control();
        if !control.nodes.iter().any(|n| &n.endpoint == seed && n.reachable) {
            return Err(unreachable(seed));
        }
        Ok(control
            .nodes
            .iter()
            .map(|node| ClusterMember::new(node.endpoint.clone(), node.role, node.alive))
            .collect())
    }

    async fn connect(&self, endpoint: &Endpoint) -> Result<Arc<dyn NodeChannel>, ClientError> {
        self.shared.connect_calls.fetch_add(1, Ordering::SeqCst);
        let delay = self.shared.control().connect_delay;
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
        let reachable = self
            .shared
            .control()
            .nodes
            .iter()
            .any(|n| &n.endpoint == endpoint && n.reachable);
        if !reachable {
            return Err(unreachable(endpoint));
        }
        debug!(%endpoint, "in-memory connection opened");
        Ok(Arc::new(InMemoryChannel {
            shared: self.shared.clone(),
            endpoint: endpoint.clone(),
        }))
    }
}

struct InMemoryChannel {
    shared: Arc<Shared>,
    endpoint: Endpoint,
}

impl InMemoryChannel {
    /// Applies the call delay and the node's current state to a call.
    async fn enter(&self, ctx: &CallContext) -> Result<CancellationToken, ClientError> {
        let delay = self.shared.control().call_delay;
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
        let control = self.shared.control();
        let node = control
            .nodes
            .iter()
            .find(|n| n.endpoint == self.endpoint)
            .filter(|n| n.reachable && n.alive)
            .ok_or_else(|| unreachable(&self.endpoint))?;
        if ctx.requires_leader && node.role != MemberRole::Leader {
            let mut hint = Vec::new();
            if let Some(leader) = leader_of(&control) {
                hint.push((headers::LEADER_HOST, leader.host));
                hint.push((headers::LEADER_PORT, leader.port.to_string()));
            }
            return Err(server_error(
                Code::NotFound,
                headers::NOT_LEADER,
                "Leader info available",
                &hint,
            ));
        }
        Ok(control.severed.clone())
    }

    fn username(ctx: &CallContext) -> String {
        ctx.credentials
            .as_ref()
            .map_or_else(|| "anonymous".to_string(), |c| c.username.clone())
    }
}

#[async_trait]
impl NodeChannel for InMemoryChannel {
    async fn server_version(&self, ctx: &CallContext) -> Result<ServerVersion, ClientError> {
        self.enter(ctx).await?;
        self.shared.control().server_version.ok_or_else(|| {
            ClientError::from_status(Status::unimplemented("server features are not available"))
        })
    }

    async fn append(
        &self,
        ctx: &CallContext,
        stream: &str,
        expected: StreamState,
        events: Vec<EventData>,
    ) -> Result<WriteResult, ClientError> {
        self.enter(ctx).await?;
        self.shared.store.append(stream, expected, events)
    }

    async fn multi_append(
        &self,
        ctx: &CallContext,
        requests: Vec<AppendStreamRequest>,
    ) -> Result<MultiAppendWriteResult, ClientError> {
        self.enter(ctx).await?;
        self.shared.store.multi_append(requests)
    }

    async fn delete(
        &self,
        ctx: &CallContext,
        stream: &str,
        expected: StreamState,
        tombstone: bool,
    ) -> Result<DeleteResult, ClientError> {
        self.enter(ctx).await?;
        self.shared.store.delete(stream, expected, tombstone)
    }

    async fn read(
        &self,
        ctx: &CallContext,
        request: ReadRequest,
    ) -> Result<MessageStream<ReadMessage>, ClientError> {
        let severed = self.enter(ctx).await?;
        let store = &self.shared.store;

        let Some(max_count) = request.max_count else {
            return Ok(catchup::subscribe(store.clone(), request, severed));
        };
        let messages = match request.target {
            ReadTarget::Stream { stream, from } => store.read_stream(
                &stream,
                from,
                request.direction,
                max_count,
                request.resolve_link_tos,
            ),
            ReadTarget::All { from } => Ok(store.read_all(
                from,
                request.direction,
                max_count,
                request.resolve_link_tos,
            )),
        };
        let items: Vec<Result<ReadMessage, ClientError>> = match messages {
            Ok(messages) => messages.into_iter().map(Ok).collect(),
            Err(err) => vec![Err(err)],
        };
        Ok(stream::iter(items).boxed())
    }

    async fn create_persistent(
        &self,
        ctx: &CallContext,
        target: &PersistentTarget,
        group: &str,
        settings: &PersistentSubscriptionSettings,
    ) -> Result<(), ClientError> {
        self.enter(ctx).await?;
        self.shared
            .persistent
            .create(&self.shared.store, target, group, settings)
    }

    async fn update_persistent(
        &self,
        ctx: &CallContext,
        target: &PersistentTarget,
        group: &str,
        settings: &PersistentSubscriptionSettings,
    ) -> Result<(), ClientError> {
        self.enter(ctx).await?;
        self.shared
            .persistent
            .update(&self.shared.store, target, group, settings)
    }

    async fn delete_persistent(
        &self,
        ctx: &CallContext,
        target: &PersistentTarget,
        group: &str,
    ) -> Result<(), ClientError> {
        self.enter(ctx).await?;
        self.shared.persistent.delete(target, group)
    }

    async fn persistent_info(
        &self,
        ctx: &CallContext,
        target: &PersistentTarget,
        group: &str,
    ) -> Result<PersistentSubscriptionInfo, ClientError> {
        self.enter(ctx).await?;
        self.shared
            .persistent
            .info(&self.shared.store, target, group)
    }

    async fn list_persistent(
        &self,
        ctx: &CallContext,
        target: Option<&PersistentTarget>,
    ) -> Result<Vec<PersistentSubscriptionInfo>, ClientError> {
        self.enter(ctx).await?;
        Ok(self.shared.persistent.list(&self.shared.store, target))
    }

    async fn replay_parked(
        &self,
        ctx: &CallContext,
        target: &PersistentTarget,
        group: &str,
        stop_at: Option<u64>,
    ) -> Result<(), ClientError> {
        self.enter(ctx).await?;
        self.shared
            .persistent
            .replay_parked(&self.shared.store, target, group, stop_at)
    }

    async fn restart_persistent_subsystem(&self, ctx: &CallContext) -> Result<(), ClientError> {
        self.enter(ctx).await?;
        self.shared.persistent.restart();
        Ok(())
    }

    async fn read_persistent(
        &self,
        ctx: &CallContext,
        target: &PersistentTarget,
        group: &str,
        buffer_size: usize,
        commands: BoxStream<'static, PersistentCommand>,
    ) -> Result<MessageStream<PersistentMessage>, ClientError> {
        let severed = self.enter(ctx).await?;
        let credit = buffer_size + self.shared.control().overdelivery;
        let changes = self.shared.store.changes();
        let (tx, rx) = mpsc::unbounded_channel();
        let (consumer, evicted) = self.shared.persistent.join(
            &self.shared.store,
            target,
            group,
            credit,
            &Self::username(ctx),
            tx.clone(),
        )?;

        let session = Session {
            shared: self.shared.clone(),
            target: target.clone(),
            group: group.to_string(),
            consumer,
        };
        tokio::spawn(session.run(commands, changes, tx, severed, evicted));
        Ok(UnboundedReceiverStream::new(rx).boxed())
    }
}

/// One consumer's read session on a group.
struct Session {
    shared: Arc<Shared>,
    target: PersistentTarget,
    group: String,
    consumer: u64,
}

impl Session {
    async fn run(
        self,
        mut commands: BoxStream<'static, PersistentCommand>,
        mut changes: watch::Receiver<usize>,
        outbound: mpsc::UnboundedSender<Result<PersistentMessage, ClientError>>,
        severed: CancellationToken,
        evicted: CancellationToken,
    ) {
        let store = &self.shared.store;
        let engine = &self.shared.persistent;
        // Appends made before the session was first polled.
        engine.dispatch(store);

        loop {
            tokio::select! {
                command = commands.next() => {
                    let Some(command) = command else { break };
                    if engine.apply(store, &self.target, &self.group, command) == Flow::Stop {
                        break;
                    }
                }
                changed = changes.changed() => {
                    if changed.is_err() {
                        break;
                    }
                    engine.dispatch(store);
                }
                _ = severed.cancelled() => {
                    let _ = outbound.send(Err(ClientError::from_status(Status::unavailable(
                        "connection severed",
                    ))));
                    break;
                }
                _ = evicted.cancelled() => break,
                _ = outbound.closed() => break,
            }
        }

        engine.leave(store, &self.target, &self.group, self.consumer);
        debug!(group = %self.group, consumer = self.consumer, "persistent session ended");
    }
}
