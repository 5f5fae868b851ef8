//! KurrentDB client driver.
//!
//! A cluster-aware client for an append-only event-log database. It resolves
//! the cluster topology through gossip, keeps a single logical connection to
//! the preferred node and reconnects transparently when that node stops being
//! the right one.
//!
//! # Quick Start
//!
//! ```rust,ignore
//! use kurrentdb::{AppendToStreamOptions, Client, ClientSettings, EventData, ReadStreamOptions, StreamState};
//!
//! async fn example() -> kurrentdb::Result<()> {
//!     let client = Client::new(ClientSettings::load(None)?)?;
//!
//!     let event = EventData::json("OrderPlaced", &serde_json::json!({ "total": 42 }))?;
//!     client
//!         .append_to_stream("order-1", &AppendToStreamOptions::expect(StreamState::NoStream), vec![event])
//!         .await?;
//!
//!     let mut stream = client.read_stream("order-1", &ReadStreamOptions::default()).await?;
//!     while let Some(event) = stream.next().await? {
//!         println!("{}", event.original_event().event_type);
//!     }
//!     Ok(())
//! }
//! ```
//!
//! # Testing
//!
//! With the `test-utils` feature, [`testing::InMemoryCluster`] implements the
//! transport traits in memory, so the whole client can be exercised without a
//! server:
//!
//! ```rust,ignore
//! let cluster = kurrentdb::testing::InMemoryCluster::single_node();
//! let client = kurrentdb::Client::with_connector(cluster.settings(), cluster.connector())?;
//! ```

pub mod client;
pub mod config;
pub mod connection;
pub mod error;
pub mod persistent;
pub mod streams;
pub mod subscription;
pub mod topology;
pub mod transport;
pub mod types;
pub mod utils;

#[cfg(any(test, feature = "test-utils"))]
pub mod testing;

/// Generated gRPC stubs, nested to mirror the protobuf packages.
pub mod proto {
    pub mod event_store {
        pub mod client {
            tonic::include_proto!("event_store.client");

            pub mod streams {
                tonic::include_proto!("event_store.client.streams");
            }

            pub mod persistent_subscriptions {
                tonic::include_proto!("event_store.client.persistent_subscriptions");
            }

            pub mod gossip {
                tonic::include_proto!("event_store.client.gossip");
            }

            pub mod server_features {
                tonic::include_proto!("event_store.client.server_features");
            }
        }
    }

    pub mod kurrentdb {
        pub mod protocol {
            pub mod v2 {
                pub mod streams {
                    tonic::include_proto!("kurrentdb.protocol.v2.streams");

                    pub mod errors {
                        tonic::include_proto!("kurrentdb.protocol.v2.streams.errors");
                    }
                }
            }
        }
    }
}

pub use client::{CallOptions, Client};
pub use config::{ClientSettings, Credentials, NodePreference, TlsSettings};
pub use error::{ClientError, ErrorCause, ErrorCode, Result};
pub use persistent::{
    ConsumerStrategy, NackAction, PersistentConnectionInfo, PersistentSubscription,
    PersistentSubscriptionInfo, PersistentSubscriptionSettings, PersistentSubscriptionStats,
    PersistentTarget, StartFrom, SubscribeToPersistentOptions,
};
pub use streams::{
    Acl, AppendToStreamOptions, DeleteStreamOptions, ReadAllOptions, ReadStream,
    ReadStreamOptions, StreamAcl, StreamMetadata, VersionedMetadata,
};
pub use subscription::{
    FilterTarget, SubscribeToAllOptions, SubscribeToStreamOptions, Subscription,
    SubscriptionFilter,
};
pub use types::{
    AppendStreamRequest, ContentType, DeleteResult, Direction, Dropped, Endpoint, EventData,
    MultiAppendWriteResult, Position, RecordedEvent, ResolvedEvent, ServerVersion,
    StreamPosition, StreamState, SubscriptionEvent, SubscriptionMarker, WriteResult,
};
