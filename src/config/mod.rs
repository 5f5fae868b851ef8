//! Client configuration.
//!
//! Settings are immutable once a client is built. They can be constructed in
//! code or loaded from a YAML file overridden by `KURRENTDB__*` environment
//! variables, mirroring the query parameters of a connection string.

use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use serde::Deserialize;

use crate::error::{ClientError, ErrorCode};
use crate::types::{Endpoint, DEFAULT_PORT};

/// Environment variable for configuration file path.
pub const CONFIG_ENV_VAR: &str = "KURRENTDB_CONFIG";
/// Prefix for configuration environment variables.
pub const CONFIG_ENV_PREFIX: &str = "KURRENTDB";
/// Environment variable for logging configuration.
pub const LOG_ENV_VAR: &str = "KURRENTDB_LOG";

pub const DEFAULT_MAX_DISCOVER_ATTEMPTS: u32 = 10;
pub const DEFAULT_DISCOVERY_INTERVAL_MS: u64 = 100;
pub const DEFAULT_GOSSIP_TIMEOUT_MS: u64 = 5_000;
pub const DEFAULT_KEEP_ALIVE_INTERVAL_MS: i64 = 10_000;
pub const DEFAULT_KEEP_ALIVE_TIMEOUT_MS: i64 = 10_000;
/// Keep-alive value that turns keep-alive pings off.
pub const KEEP_ALIVE_DISABLED: i64 = -1;

/// Which cluster role operations are routed to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NodePreference {
    #[default]
    Leader,
    Follower,
    Random,
    ReadOnlyReplica,
}

impl FromStr for NodePreference {
    type Err = ClientError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "leader" => Ok(NodePreference::Leader),
            "follower" => Ok(NodePreference::Follower),
            "random" => Ok(NodePreference::Random),
            "readonlyreplica" => Ok(NodePreference::ReadOnlyReplica),
            other => Err(ClientError::invalid_argument(format!(
                "invalid node preference '{other}'"
            ))),
        }
    }
}

impl fmt::Display for NodePreference {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            NodePreference::Leader => "leader",
            NodePreference::Follower => "follower",
            NodePreference::Random => "random",
            NodePreference::ReadOnlyReplica => "readonlyreplica",
        };
        f.write_str(name)
    }
}

/// Basic-auth credentials.
#[derive(Clone, PartialEq, Eq, Deserialize)]
pub struct Credentials {
    pub username: String,
    pub password: String,
}

impl Credentials {
    pub fn new(username: impl Into<String>, password: impl Into<String>) -> Self {
        Self {
            username: username.into(),
            password: password.into(),
        }
    }
}

impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credentials")
            .field("username", &self.username)
            .field("password", &"***")
            .finish()
    }
}

/// TLS settings. Files are PEM encoded and read when the transport is built.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct TlsSettings {
    pub enabled: bool,
    pub verify_cert: bool,
    pub ca_file: Option<String>,
    pub user_cert_file: Option<String>,
    pub user_key_file: Option<String>,
}

impl Default for TlsSettings {
    fn default() -> Self {
        Self {
            enabled: true,
            verify_cert: true,
            ca_file: None,
            user_cert_file: None,
            user_key_file: None,
        }
    }
}

impl TlsSettings {
    pub fn disabled() -> Self {
        Self {
            enabled: false,
            ..Default::default()
        }
    }
}

/// Resolved client settings.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct ClientSettings {
    /// Single node address, or gossip seeds for a cluster.
    pub endpoints: Vec<Endpoint>,
    /// Expand the single seed through DNS before gossiping.
    pub dns_discover: bool,
    pub node_preference: NodePreference,
    pub max_discover_attempts: u32,
    pub discovery_interval_ms: u64,
    pub gossip_timeout_ms: u64,
    /// Milliseconds, or -1 to disable.
    pub keep_alive_interval_ms: i64,
    /// Milliseconds, or -1 to disable.
    pub keep_alive_timeout_ms: i64,
    /// Deadline applied to calls that do not set their own.
    pub default_deadline_ms: Option<u64>,
    pub tls: TlsSettings,
    pub credentials: Option<Credentials>,
}

impl Default for ClientSettings {
    fn default() -> Self {
        Self {
            endpoints: vec![Endpoint::new("localhost", DEFAULT_PORT)],
            dns_discover: false,
            node_preference: NodePreference::Leader,
            max_discover_attempts: DEFAULT_MAX_DISCOVER_ATTEMPTS,
            discovery_interval_ms: DEFAULT_DISCOVERY_INTERVAL_MS,
            gossip_timeout_ms: DEFAULT_GOSSIP_TIMEOUT_MS,
            keep_alive_interval_ms: DEFAULT_KEEP_ALIVE_INTERVAL_MS,
            keep_alive_timeout_ms: DEFAULT_KEEP_ALIVE_TIMEOUT_MS,
            default_deadline_ms: None,
            tls: TlsSettings::default(),
            credentials: None,
        }
    }
}

impl ClientSettings {
    /// Settings for one node reached directly, without gossip.
    pub fn single_node(endpoint: Endpoint) -> Self {
        Self {
            endpoints: vec![endpoint],
            ..Default::default()
        }
    }

    /// Settings for a cluster discovered through the given gossip seeds.
    pub fn cluster(seeds: Vec<Endpoint>) -> Self {
        Self {
            endpoints: seeds,
            ..Default::default()
        }
    }

    pub fn with_node_preference(mut self, preference: NodePreference) -> Self {
        self.node_preference = preference;
        self
    }

    pub fn with_tls(mut self, tls: TlsSettings) -> Self {
        self.tls = tls;
        self
    }

    pub fn with_credentials(mut self, credentials: Credentials) -> Self {
        self.credentials = Some(credentials);
        self
    }

    pub fn with_default_deadline(mut self, deadline: Duration) -> Self {
        self.default_deadline_ms = Some(deadline.as_millis() as u64);
        self
    }

    /// Load settings from file and environment.
    ///
    /// Configuration sources (in order of priority, later overrides earlier):
    /// 1. File specified by `path` argument (if provided)
    /// 2. File specified by `CONFIG_ENV_VAR` environment variable (if set)
    /// 3. Environment variables with `CONFIG_ENV_PREFIX` prefix, e.g.
    ///    `KURRENTDB__NODE_PREFERENCE=follower` or
    ///    `KURRENTDB__ENDPOINTS=node1:2113,node2:2113`
    pub fn load(path: Option<&str>) -> Result<Self, ClientError> {
        use ::config::{Config as ConfigLib, Environment, File, FileFormat};

        let mut builder = ConfigLib::builder();

        if let Some(config_path) = path {
            builder = builder.add_source(File::new(config_path, FileFormat::Yaml).required(true));
        }

        if let Ok(config_path) = std::env::var(CONFIG_ENV_VAR) {
            builder = builder.add_source(File::new(&config_path, FileFormat::Yaml).required(true));
        }

        let settings: ClientSettings = builder
            .add_source(
                Environment::with_prefix(CONFIG_ENV_PREFIX)
                    .separator("__")
                    .try_parsing(true)
                    .list_separator(",")
                    .with_list_parse_key("endpoints"),
            )
            .build()
            .and_then(|config| config.try_deserialize())
            .map_err(|e| {
                ClientError::from_error(
                    ErrorCode::InternalClient,
                    format!("invalid client configuration: {e}"),
                    e,
                )
            })?;

        settings.validate()?;
        Ok(settings)
    }

    /// Rejects settings that can never work. Called when a client is built.
    pub fn validate(&self) -> Result<(), ClientError> {
        if self.endpoints.is_empty() {
            return Err(ClientError::invalid_argument(
                "at least one endpoint is required",
            ));
        }
        if self.dns_discover && self.endpoints.len() != 1 {
            return Err(ClientError::invalid_argument(
                "dns discovery requires exactly one seed host",
            ));
        }
        if self.max_discover_attempts == 0 {
            return Err(ClientError::invalid_argument(
                "max_discover_attempts must be at least 1",
            ));
        }
        if self.gossip_timeout_ms == 0 {
            return Err(ClientError::invalid_argument(
                "gossip_timeout_ms must be positive",
            ));
        }
        validate_keep_alive("keep_alive_interval_ms", self.keep_alive_interval_ms)?;
        validate_keep_alive("keep_alive_timeout_ms", self.keep_alive_timeout_ms)?;
        if self.tls.user_cert_file.is_some() != self.tls.user_key_file.is_some() {
            return Err(ClientError::invalid_argument(
                "missing TLS material: user certificate and key must be provided together",
            ));
        }
        if let Some(credentials) = &self.credentials {
            if credentials.username.is_empty() {
                return Err(ClientError::invalid_argument(
                    "credentials require a username",
                ));
            }
        }
        Ok(())
    }

    /// Whether the endpoints are gossip seeds rather than a single node.
    pub fn is_cluster(&self) -> bool {
        self.dns_discover || self.endpoints.len() > 1
    }

    pub fn discovery_interval(&self) -> Duration {
        Duration::from_millis(self.discovery_interval_ms)
    }

    pub fn gossip_timeout(&self) -> Duration {
        Duration::from_millis(self.gossip_timeout_ms)
    }

    pub fn keep_alive_interval(&self) -> Option<Duration> {
        keep_alive_duration(self.keep_alive_interval_ms)
    }

    pub fn keep_alive_timeout(&self) -> Option<Duration> {
        keep_alive_duration(self.keep_alive_timeout_ms)
    }

    pub fn default_deadline(&self) -> Option<Duration> {
        self.default_deadline_ms.map(Duration::from_millis)
    }
}

fn validate_keep_alive(name: &str, value: i64) -> Result<(), ClientError> {
    if value == KEEP_ALIVE_DISABLED || value > 0 {
        return Ok(());
    }
    Err(ClientError::invalid_argument(format!(
        "invalid {name} value ({value}): must be a positive number of milliseconds or -1 to disable"
    )))
}

fn keep_alive_duration(value: i64) -> Option<Duration> {
    (value > 0).then(|| Duration::from_millis(value as u64))
}
