//! Client facade.
//!
//! [`Client`] is cheap to clone; clones share one connection manager. The
//! operations themselves live next to their domain: `streams`,
//! `subscription` and `persistent` each add an `impl Client` block.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::config::{ClientSettings, Credentials, NodePreference};
use crate::connection::{Connection, ConnectionManager};
use crate::error::{ClientError, ErrorCode};
use crate::transport::grpc::GrpcConnector;
use crate::transport::{CallContext, NodeConnector};

/// Per-call overrides of the client settings.
#[derive(Debug, Clone, Default)]
pub struct CallOptions {
    /// Overrides the default deadline.
    pub deadline: Option<Duration>,
    /// Overrides leader routing for reads. Writes always go to the leader.
    pub requires_leader: Option<bool>,
    pub credentials: Option<Credentials>,
    /// Aborts the call when cancelled.
    pub cancellation: Option<CancellationToken>,
}

impl CallOptions {
    pub fn with_deadline(mut self, deadline: Duration) -> Self {
        self.deadline = Some(deadline);
        self
    }

    pub fn requires_leader(mut self, requires_leader: bool) -> Self {
        self.requires_leader = Some(requires_leader);
        self
    }

    pub fn with_credentials(mut self, credentials: Credentials) -> Self {
        self.credentials = Some(credentials);
        self
    }

    pub fn with_cancellation(mut self, token: CancellationToken) -> Self {
        self.cancellation = Some(token);
        self
    }
}

/// Which node role a call must reach.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Route {
    /// Writes and administration.
    Leader,
    /// Reads, routed by node preference.
    Preferred,
}

struct Inner {
    settings: Arc<ClientSettings>,
    connections: ConnectionManager,
}

/// A KurrentDB client.
#[derive(Clone)]
pub struct Client {
    inner: Arc<Inner>,
}

impl Client {
    /// Builds a client reaching the nodes over gRPC. No connection is made
    /// until the first operation.
    pub fn new(settings: ClientSettings) -> Result<Self, ClientError> {
        settings.validate()?;
        let settings = Arc::new(settings);
        let connector = Arc::new(GrpcConnector::new(settings.clone())?);
        Ok(Self::build(settings, connector))
    }

    /// Builds a client over any transport.
    pub fn with_connector(
        settings: ClientSettings,
        connector: Arc<dyn NodeConnector>,
    ) -> Result<Self, ClientError> {
        settings.validate()?;
        Ok(Self::build(Arc::new(settings), connector))
    }

    fn build(settings: Arc<ClientSettings>, connector: Arc<dyn NodeConnector>) -> Self {
        Self {
            inner: Arc::new(Inner {
                connections: ConnectionManager::new(connector, settings.clone()),
                settings,
            }),
        }
    }

    pub fn settings(&self) -> &ClientSettings {
        &self.inner.settings
    }

    /// Closes the client. Every later call fails with `ConnectionClosed`
    /// and open reads and subscriptions are dropped.
    pub fn close(&self) {
        self.inner.connections.close();
    }

    pub fn is_closed(&self) -> bool {
        self.inner.connections.is_closed()
    }

    pub(crate) fn connections(&self) -> &ConnectionManager {
        &self.inner.connections
    }

    pub(crate) fn context(&self, call: &CallOptions, route: Route) -> CallContext {
        let requires_leader = match route {
            Route::Leader => true,
            Route::Preferred => call
                .requires_leader
                .unwrap_or(self.inner.settings.node_preference == NodePreference::Leader),
        };
        CallContext {
            deadline: call.deadline.or(self.inner.settings.default_deadline()),
            requires_leader,
            credentials: call.credentials.clone(),
        }
    }

    /// Runs `op` against the current connection.
    ///
    /// Connection-level failures invalidate the connection they came from. A
    /// not-leader answer is retried once against the newly resolved node.
    pub(crate) async fn execute<T, F, Fut>(
        &self,
        name: &'static str,
        call: &CallOptions,
        route: Route,
        op: F,
    ) -> Result<T, ClientError>
    where
        F: Fn(Connection, CallContext) -> Fut,
        Fut: Future<Output = Result<T, ClientError>>,
    {
        let ctx = self.context(call, route);
        let deadline = ctx.deadline;

        let attempt = async {
            let mut redirected = false;
            loop {
                let connection = self.inner.connections.get_handle().await?;
                let generation = connection.generation();
                match op(connection, ctx.clone()).await {
                    Ok(value) => return Ok(value),
                    Err(err) => {
                        self.report(generation, &err);
                        if err.is_code(ErrorCode::NotLeader) && !redirected {
                            redirected = true;
                            debug!(operation = name, "retrying on the new leader");
                            continue;
                        }
                        return Err(err);
                    }
                }
            }
        };

        self.guard(call, deadline, attempt).await
    }

    /// Invalidates the connection of `generation` when `err` says it is broken.
    pub(crate) fn report(&self, generation: u64, err: &ClientError) {
        if err.invalidates_connection() {
            self.inner
                .connections
                .invalidate(generation, err.leader_hint().cloned());
        }
    }

    /// Bounds `fut` by the deadline, the caller's cancellation token and
    /// client shutdown.
    pub(crate) async fn guard<T>(
        &self,
        call: &CallOptions,
        deadline: Option<Duration>,
        fut: impl Future<Output = Result<T, ClientError>>,
    ) -> Result<T, ClientError> {
        let cancellation = call.cancellation.clone().unwrap_or_default();
        let shutdown = self.inner.connections.shutdown_token();

        let bounded = async {
            match deadline {
                Some(deadline) => tokio::time::timeout(deadline, fut)
                    .await
                    .map_err(|_| ClientError::from_code(ErrorCode::DeadlineExceeded))?,
                None => fut.await,
            }
        };

        tokio::select! {
            result = bounded => result,
            _ = cancellation.cancelled() => Err(ClientError::new(ErrorCode::Aborted, "operation cancelled by caller")),
            _ = shutdown.cancelled() => Err(ClientError::connection_closed()),
        }
    }
}
