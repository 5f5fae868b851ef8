//! In-memory cluster for exercising the client without a server.
//!
//! [`InMemoryCluster`] implements the transport traits over a shared store,
//! a catch-up subscription feed and a persistent subscription engine. Tests
//! control node roles, reachability and latency directly.

mod catchup;
mod cluster;
mod persistent;
mod store;

pub use cluster::InMemoryCluster;

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use tonic::metadata::MetadataMap;
use tonic::{Code, Status};
use uuid::Uuid;

use crate::error::{headers, ClientError};

/// A failure the way a server reports it: a status code plus the
/// `exception` header and any extra headers.
pub(crate) fn server_error(
    code: Code,
    exception: &'static str,
    message: impl Into<String>,
    extra: &[(&'static str, String)],
) -> ClientError {
    let mut metadata = MetadataMap::new();
    if let Ok(value) = exception.parse() {
        metadata.insert(headers::EXCEPTION, value);
    }
    for (key, value) in extra {
        if let Ok(value) = value.parse() {
            metadata.insert(*key, value);
        }
    }
    ClientError::from_status(Status::with_metadata(code, message, metadata))
}

/// Produces unique stream and group names so tests sharing a cluster do not
/// collide.
#[derive(Clone)]
pub struct IdGenerator {
    next: Arc<dyn Fn() -> String + Send + Sync>,
}

impl IdGenerator {
    /// `prefix-<uuid>` names.
    pub fn random(prefix: impl Into<String>) -> Self {
        let prefix = prefix.into();
        Self::from_fn(move || format!("{prefix}-{}", Uuid::new_v4().simple()))
    }

    /// `prefix-1`, `prefix-2`, ...
    pub fn sequential(prefix: impl Into<String>) -> Self {
        let prefix = prefix.into();
        let counter = AtomicU64::new(0);
        Self::from_fn(move || format!("{prefix}-{}", counter.fetch_add(1, Ordering::Relaxed) + 1))
    }

    pub fn from_fn(next: impl Fn() -> String + Send + Sync + 'static) -> Self {
        Self {
            next: Arc::new(next),
        }
    }

    pub fn next(&self) -> String {
        (self.next)()
    }
}

impl Default for IdGenerator {
    fn default() -> Self {
        Self::random("test")
    }
}

impl std::fmt::Debug for IdGenerator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("IdGenerator").finish_non_exhaustive()
    }
}
