//! Shared world and step definitions.

pub mod cluster;
pub mod persistent;
pub mod streams;

use std::fmt;

use cucumber::{given, then, World};
use kurrentdb::testing::InMemoryCluster;
use kurrentdb::{
    Client, ClientError, ClientSettings, PersistentSubscription, ResolvedEvent, WriteResult,
};

/// State carried through one scenario.
#[derive(World)]
#[world(init = Self::new)]
pub struct ClientWorld {
    pub cluster: InMemoryCluster,
    pub client: Option<Client>,
    pub last_write: Option<WriteResult>,
    pub last_error: Option<ClientError>,
    pub read: Vec<ResolvedEvent>,
    pub persistent: Option<PersistentSubscription>,
    pub delivered: Vec<ResolvedEvent>,
    pub connects_at_close: usize,
}

impl fmt::Debug for ClientWorld {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ClientWorld")
            .field("connected", &self.client.is_some())
            .field("last_write", &self.last_write)
            .field("last_error", &self.last_error)
            .field("read", &self.read.len())
            .field("delivered", &self.delivered.len())
            .finish()
    }
}

impl ClientWorld {
    fn new() -> Self {
        Self {
            cluster: InMemoryCluster::single_node(),
            client: None,
            last_write: None,
            last_error: None,
            read: Vec::new(),
            persistent: None,
            delivered: Vec::new(),
            connects_at_close: 0,
        }
    }

    pub fn client(&self) -> &Client {
        self.client.as_ref().expect("client not connected")
    }

    fn connect_with(&mut self, settings: ClientSettings) {
        let client = Client::with_connector(settings, self.cluster.connector())
            .expect("valid settings");
        self.client = Some(client);
    }

    /// Records the outcome of a call, keeping the error for later steps.
    pub fn record<T>(&mut self, result: Result<T, ClientError>) -> Option<T> {
        match result {
            Ok(value) => {
                self.last_error = None;
                Some(value)
            }
            Err(err) => {
                self.last_error = Some(err);
                None
            }
        }
    }
}

// --- Background ---

#[given("a single node cluster")]
async fn given_single_node(world: &mut ClientWorld) {
    world.cluster = InMemoryCluster::single_node();
}

#[given("a three node cluster")]
async fn given_three_node(world: &mut ClientWorld) {
    world.cluster = InMemoryCluster::three_node();
}

#[given("a connected client")]
async fn given_connected_client(world: &mut ClientWorld) {
    let settings = world.cluster.settings();
    world.connect_with(settings);
}

#[given("a client preferring followers")]
async fn given_follower_client(world: &mut ClientWorld) {
    let settings = world
        .cluster
        .settings()
        .with_node_preference(kurrentdb::NodePreference::Follower);
    world.connect_with(settings);
}

// --- Outcomes shared by every feature ---

#[then(expr = "the call fails with {string}")]
async fn then_call_fails(world: &mut ClientWorld, code: String) {
    let err = world
        .last_error
        .as_ref()
        .expect("expected the last call to fail");
    assert_eq!(err.code().as_str(), code, "unexpected error: {err}");
}

#[then(expr = "{int} connection(s) was/were opened")]
async fn then_connections_opened(world: &mut ClientWorld, count: usize) {
    assert_eq!(world.cluster.connect_calls(), count);
}
