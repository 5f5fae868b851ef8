//! Cluster topology discovery.
//!
//! A discovery round asks each gossip seed in turn for the membership list
//! and ranks the first answer against the configured [`NodePreference`].
//! Rounds are repeated on a fixed interval until a candidate is found or the
//! attempt budget is spent.

use std::fmt;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

use backon::Retryable;
use rand::seq::{IndexedRandom, SliceRandom};
use rand::Rng;
use tracing::{debug, info, warn};

use crate::config::{ClientSettings, NodePreference};
use crate::error::{ClientError, ErrorCause, ErrorCode};
use crate::transport::NodeConnector;
use crate::types::Endpoint;
use crate::utils::retry::{discovery_backoff, is_transient};

/// Role a member reports through gossip.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MemberRole {
    Leader,
    Follower,
    ReadOnlyReplica,
    /// Any state in which the node does not serve clients.
    Unknown,
}

impl fmt::Display for MemberRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            MemberRole::Leader => "leader",
            MemberRole::Follower => "follower",
            MemberRole::ReadOnlyReplica => "readonlyreplica",
            MemberRole::Unknown => "unknown",
        };
        f.write_str(name)
    }
}

/// One entry of a gossip answer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClusterMember {
    pub endpoint: Endpoint,
    pub role: MemberRole,
    pub is_alive: bool,
}

impl ClusterMember {
    pub fn new(endpoint: Endpoint, role: MemberRole, is_alive: bool) -> Self {
        Self {
            endpoint,
            role,
            is_alive,
        }
    }

    fn is_candidate(&self) -> bool {
        self.is_alive && self.role != MemberRole::Unknown
    }
}

/// Roles tried for `preference`, most preferred first. Empty for
/// [`NodePreference::Random`], which ignores roles.
pub fn preference_tiers(preference: NodePreference) -> &'static [MemberRole] {
    match preference {
        NodePreference::Leader => &[
            MemberRole::Leader,
            MemberRole::Follower,
            MemberRole::ReadOnlyReplica,
        ],
        NodePreference::Follower => &[
            MemberRole::Follower,
            MemberRole::Leader,
            MemberRole::ReadOnlyReplica,
        ],
        NodePreference::ReadOnlyReplica => &[
            MemberRole::ReadOnlyReplica,
            MemberRole::Follower,
            MemberRole::Leader,
        ],
        NodePreference::Random => &[],
    }
}

/// Picks the member to connect to. Dead members and members in a
/// non-serving state are never returned.
pub fn select_member<'a, R>(
    members: &'a [ClusterMember],
    preference: NodePreference,
    rng: &mut R,
) -> Option<&'a ClusterMember>
where
    R: Rng + ?Sized,
{
    let candidates: Vec<&ClusterMember> = members.iter().filter(|m| m.is_candidate()).collect();

    if preference == NodePreference::Random {
        return candidates.choose(rng).copied();
    }

    preference_tiers(preference).iter().find_map(|role| {
        let tier: Vec<&ClusterMember> = candidates
            .iter()
            .copied()
            .filter(|m| m.role == *role)
            .collect();
        tier.choose(rng).copied()
    })
}

/// Error returned once every discovery attempt has failed.
pub fn discovery_exhausted(attempts: u32, last: &ClientError) -> ClientError {
    ClientError::with_cause(
        ErrorCode::Unavailable,
        format!("failed to discover a suitable node after {attempts} attempts: {last}"),
        ErrorCause::DiscoveryExhausted { attempts },
    )
}

/// Resolves which node the client should talk to.
pub struct TopologyResolver {
    connector: Arc<dyn NodeConnector>,
    settings: Arc<ClientSettings>,
}

impl TopologyResolver {
    pub fn new(connector: Arc<dyn NodeConnector>, settings: Arc<ClientSettings>) -> Self {
        Self {
            connector,
            settings,
        }
    }

    /// Runs discovery rounds until a member matches the node preference.
    ///
    /// Transient failures (no seed answered, no alive candidate) are retried
    /// every `discovery_interval` up to `max_discover_attempts` rounds; other
    /// errors are returned at once.
    #[tracing::instrument(skip_all, fields(preference = %self.settings.node_preference))]
    pub async fn discover(&self) -> Result<ClusterMember, ClientError> {
        let attempts = AtomicU32::new(0);

        let result = (|| async {
            let attempt = attempts.fetch_add(1, Ordering::Relaxed) + 1;
            self.discover_round(attempt).await
        })
        .retry(discovery_backoff(&self.settings))
        .when(is_transient)
        .notify(|err, delay| {
            warn!(error = %err, retry_in = ?delay, "discovery round failed, retrying");
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

    /// One discovery round: the first seed that answers decides.
    pub async fn discover_round(&self, attempt: u32) -> Result<ClusterMember, ClientError> {
        let preference = self.settings.node_preference;
        let timeout = self.settings.gossip_timeout();

        let mut seeds = self.seeds().await?;
        seeds.shuffle(&mut rand::rng());

        for seed in &seeds {
            let members = match tokio::time::timeout(timeout, self.connector.gossip(seed, timeout))
                .await
            {
                Ok(Ok(members)) => members,
                Ok(Err(err)) => {
                    warn!(attempt, %seed, error = %err, "gossip query failed");
                    continue;
                }
                Err(_) => {
                    warn!(attempt, %seed, ?timeout, "gossip query timed out");
                    continue;
                }
            };

            debug!(attempt, %seed, members = members.len(), "gossip received");
            let selected = select_member(&members, preference, &mut rand::rng()).cloned();
            return match selected {
                Some(member) => {
                    info!(attempt, endpoint = %member.endpoint, role = %member.role, "selected cluster member");
                    Ok(member)
                }
                None => Err(ClientError::new(
                    ErrorCode::Unavailable,
                    format!("no alive member matches node preference {preference}"),
                )),
            };
        }

        Err(ClientError::new(
            ErrorCode::Unavailable,
            "no gossip seed answered",
        ))
    }

    /// Gossip seeds for this round, expanded through DNS when enabled.
    async fn seeds(&self) -> Result<Vec<Endpoint>, ClientError> {
        if !self.settings.dns_discover {
            return Ok(self.settings.endpoints.clone());
        }

        let seed = self
            .settings
            .endpoints
            .first()
            .ok_or_else(|| ClientError::invalid_argument("dns discovery requires a seed host"))?;

        let addrs = tokio::net::lookup_host((seed.host.as_str(), seed.port))
            .await
            .map_err(|e| {
                ClientError::from_error(
                    ErrorCode::Unavailable,
                    format!("dns lookup of {seed} failed"),
                    e,
                )
            })?;

        let mut seeds: Vec<Endpoint> = Vec::new();
        for addr in addrs {
            let endpoint = Endpoint::new(addr.ip().to_string(), addr.port());
            if !seeds.contains(&endpoint) {
                seeds.push(endpoint);
            }
        }
        debug!(%seed, resolved = seeds.len(), "expanded gossip seeds through dns");
        Ok(seeds)
    }
}
