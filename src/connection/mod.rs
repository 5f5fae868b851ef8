//! The client's single logical connection.
//!
//! [`ConnectionManager`] hands out the current [`Connection`] and replaces it
//! when callers report it broken. Replacement is single-flight: however many
//! callers ask while a resolution is running, they all await the same one.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use backon::Retryable;
use futures::future::{BoxFuture, FutureExt, Shared};
use tokio::sync::OnceCell;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::ClientSettings;
use crate::error::ClientError;
use crate::topology::{discovery_exhausted, TopologyResolver};
use crate::transport::{CallContext, NodeChannel, NodeConnector};
use crate::types::{Endpoint, ServerVersion};
use crate::utils::retry::{discovery_backoff, is_transient};

/// A connected node, stamped with the generation it was established in.
#[derive(Clone)]
pub struct Connection {
    endpoint: Endpoint,
    channel: Arc<dyn NodeChannel>,
    generation: u64,
    server_version: Arc<OnceCell<ServerVersion>>,
}

impl Connection {
    pub fn new(endpoint: Endpoint, channel: Arc<dyn NodeChannel>, generation: u64) -> Self {
        Self {
            endpoint,
            channel,
            generation,
            server_version: Arc::new(OnceCell::new()),
        }
    }

    pub fn endpoint(&self) -> &Endpoint {
        &self.endpoint
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    pub fn channel(&self) -> &Arc<dyn NodeChannel> {
        &self.channel
    }

    /// Version of the connected node, asked once per connection.
    pub async fn server_version(&self, ctx: &CallContext) -> Result<ServerVersion, ClientError> {
        self.server_version
            .get_or_try_init(|| self.channel.server_version(ctx))
            .await
            .copied()
    }
}

impl std::fmt::Debug for Connection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connection")
            .field("endpoint", &self.endpoint)
            .field("generation", &self.generation)
            .finish()
    }
}

type PendingConnection = Shared<BoxFuture<'static, Result<Connection, ClientError>>>;

#[derive(Default)]
struct State {
    generation: u64,
    current: Option<Connection>,
    /// Resolution in flight, with the generation it resolves for.
    pending: Option<(u64, PendingConnection)>,
    closed: bool,
    leader_hint: Option<Endpoint>,
}

pub struct ConnectionManager {
    state: Mutex<State>,
    resolver: Arc<TopologyResolver>,
    connector: Arc<dyn NodeConnector>,
    settings: Arc<ClientSettings>,
    shutdown: CancellationToken,
}

impl ConnectionManager {
    pub fn new(connector: Arc<dyn NodeConnector>, settings: Arc<ClientSettings>) -> Self {
        Self {
            state: Mutex::new(State::default()),
            resolver: Arc::new(TopologyResolver::new(connector.clone(), settings.clone())),
            connector,
            settings,
            shutdown: CancellationToken::new(),
        }
    }

    fn lock(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Returns the current connection, resolving a new one if needed.
    pub async fn get_handle(&self) -> Result<Connection, ClientError> {
        let (generation, pending) = {
            let mut state = self.lock();
            if state.closed {
                return Err(ClientError::connection_closed());
            }
            if let Some(current) = &state.current {
                return Ok(current.clone());
            }
            match &state.pending {
                Some((generation, pending)) if *generation == state.generation => {
                    debug!(generation, "joining in-flight resolution");
                    (*generation, pending.clone())
                }
                _ => {
                    let generation = state.generation;
                    let pending = establish(
                        self.resolver.clone(),
                        self.connector.clone(),
                        self.settings.clone(),
                        generation,
                        state.leader_hint.take(),
                    )
                    .boxed()
                    .shared();
                    state.pending = Some((generation, pending.clone()));
                    (generation, pending)
                }
            }
        };

        let result = tokio::select! {
            result = pending => result,
            _ = self.shutdown.cancelled() => Err(ClientError::connection_closed()),
        };

        let mut state = self.lock();
        if state.closed {
            return Err(ClientError::connection_closed());
        }
        if matches!(&state.pending, Some((pending, _)) if *pending == generation) {
            state.pending = None;
        }
        if let Ok(connection) = &result {
            if state.generation == generation && state.current.is_none() {
                info!(generation, endpoint = %connection.endpoint, "connection established");
                state.current = Some(connection.clone());
            }
        }
        result
    }

    /// Marks the connection of `stale_generation` as broken. Calls carrying a
    /// generation that was already replaced are ignored. Returns whether the
    /// connection was invalidated.
    pub fn invalidate(&self, stale_generation: u64, leader_hint: Option<Endpoint>) -> bool {
        let mut state = self.lock();
        if state.closed || stale_generation != state.generation {
            debug!(
                stale_generation,
                generation = state.generation,
                "ignoring stale invalidation"
            );
            return false;
        }
        state.generation += 1;
        state.current = None;
        state.leader_hint = leader_hint;
        info!(
            stale_generation,
            generation = state.generation,
            leader_hint = ?state.leader_hint,
            "connection invalidated"
        );
        true
    }

    /// Terminal. Pending resolutions and open streams are cancelled.
    pub fn close(&self) {
        {
            let mut state = self.lock();
            if state.closed {
                return;
            }
            state.closed = true;
            state.current = None;
            state.pending = None;
            state.leader_hint = None;
        }
        self.shutdown.cancel();
        info!("connection manager closed");
    }

    pub fn is_closed(&self) -> bool {
        self.lock().closed
    }

    pub fn generation(&self) -> u64 {
        self.lock().generation
    }

    /// Token cancelled when the manager closes.
    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown.child_token()
    }
}

/// Picks a node and connects to it, retrying transient failures on the
/// discovery interval.
async fn establish(
    resolver: Arc<TopologyResolver>,
    connector: Arc<dyn NodeConnector>,
    settings: Arc<ClientSettings>,
    generation: u64,
    leader_hint: Option<Endpoint>,
) -> Result<Connection, ClientError> {
    if let Some(leader) = leader_hint {
        match connector.connect(&leader).await {
            Ok(channel) => {
                info!(generation, endpoint = %leader, "connected to advertised leader");
                return Ok(Connection::new(leader, channel, generation));
            }
            Err(err) => {
                warn!(generation, endpoint = %leader, error = %err, "advertised leader unreachable, falling back to discovery");
            }
        }
    }

    let attempts = AtomicU32::new(0);
    let result = (|| async {
        let attempt = attempts.fetch_add(1, Ordering::Relaxed) + 1;
        let endpoint = if settings.is_cluster() {
            resolver.discover_round(attempt).await?.endpoint
        } else {
            settings
                .endpoints
                .first()
                .cloned()
                .ok_or_else(|| ClientError::invalid_argument("no endpoint configured"))?
        };
        let channel = connector.connect(&endpoint).await?;
        Ok::<_, ClientError>(Connection::new(endpoint, channel, generation))
    })
    .retry(discovery_backoff(&settings))
    .when(is_transient)
    .notify(|err, delay| {
        warn!(generation, error = %err, retry_in = ?delay, "connection attempt failed, retrying");
    })
    .await;

    result.map_err(|err| {
        if is_transient(&err) {
            discovery_exhausted(attempts.load(Ordering::Relaxed), &err)
        } else {
            err
        }
    })
}
