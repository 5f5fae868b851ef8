//! tonic implementation of the transport traits.

mod convert;

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use base64::{engine::general_purpose::STANDARD, Engine as _};
use futures::stream::{self, BoxStream, StreamExt};
use tonic::metadata::{MetadataMap, MetadataValue};
use tonic::transport::{Certificate, Channel, ClientTlsConfig, Identity};
use tonic::Request;
use tracing::{debug, warn};

use super::{
    CallContext, MessageStream, NodeChannel, NodeConnector, PersistentCommand, PersistentMessage,
    ReadMessage, ReadRequest,
};
use crate::config::{ClientSettings, Credentials, TlsSettings};
use crate::error::{ClientError, ErrorCode};
use crate::persistent::{PersistentSubscriptionInfo, PersistentSubscriptionSettings, PersistentTarget};
use crate::proto::event_store::client::gossip::gossip_client::GossipClient;
use crate::proto::event_store::client::persistent_subscriptions::{
    self as persistent, persistent_subscriptions_client::PersistentSubscriptionsClient,
};
use crate::proto::event_store::client::server_features::server_features_client::ServerFeaturesClient;
use crate::proto::event_store::client::streams::{self, streams_client::StreamsClient};
use crate::proto::event_store::client::Empty;
use crate::proto::kurrentdb::protocol::v2::streams::streams_service_client::StreamsServiceClient;
use crate::topology::ClusterMember;
use crate::types::{
    AppendStreamRequest, DeleteResult, Endpoint, EventData, MultiAppendWriteResult,
    ServerVersion, StreamState, WriteResult,
};

const AUTHORIZATION: &str = "authorization";
const REQUIRES_LEADER: &str = "requires-leader";

/// Opens tonic channels configured from [`ClientSettings`].
pub struct GrpcConnector {
    settings: Arc<ClientSettings>,
    tls: Option<ClientTlsConfig>,
}

impl GrpcConnector {
    /// Reads any TLS material named by the settings.
    pub fn new(settings: Arc<ClientSettings>) -> Result<Self, ClientError> {
        let tls = tls_config(&settings.tls)?;
        Ok(Self { settings, tls })
    }

    async fn channel(&self, endpoint: &Endpoint, connect_timeout: Duration) -> Result<Channel, ClientError> {
        let scheme = if self.tls.is_some() { "https" } else { "http" };
        let mut builder = Channel::from_shared(format!("{scheme}://{endpoint}"))
            .map_err(|e| {
                ClientError::from_error(
                    ErrorCode::InternalClient,
                    format!("invalid endpoint {endpoint}"),
                    e,
                )
            })?
            .connect_timeout(connect_timeout)
            .keep_alive_while_idle(true);

        if let Some(interval) = self.settings.keep_alive_interval() {
            builder = builder.http2_keep_alive_interval(interval);
        }
        if let Some(timeout) = self.settings.keep_alive_timeout() {
            builder = builder.keep_alive_timeout(timeout);
        }
        if let Some(tls) = &self.tls {
            builder = builder
                .tls_config(tls.clone().domain_name(endpoint.host.clone()))
                .map_err(|e| {
                    ClientError::from_error(ErrorCode::InternalClient, "invalid TLS configuration", e)
                })?;
        }

        Ok(builder.connect().await?)
    }
}

fn read_pem(path: &str) -> Result<Vec<u8>, ClientError> {
    std::fs::read(path).map_err(|e| {
        ClientError::from_error(
            ErrorCode::InternalClient,
            format!("failed to read TLS file {path}"),
            e,
        )
    })
}

fn tls_config(tls: &TlsSettings) -> Result<Option<ClientTlsConfig>, ClientError> {
    if !tls.enabled {
        return Ok(None);
    }
    if !tls.verify_cert {
        warn!("tls verify_cert=false is not supported by this transport; server certificates will be verified");
    }

    let mut config = ClientTlsConfig::new().with_native_roots();
    if let Some(ca_file) = &tls.ca_file {
        config = config.ca_certificate(Certificate::from_pem(read_pem(ca_file)?));
    }
    if let (Some(cert), Some(key)) = (&tls.user_cert_file, &tls.user_key_file) {
        config = config.identity(Identity::from_pem(read_pem(cert)?, read_pem(key)?));
    }
    Ok(Some(config))
}

#[async_trait]
impl NodeConnector for GrpcConnector {
    async fn gossip(
        &self,
        seed: &Endpoint,
        timeout: Duration,
    ) -> Result<Vec<ClusterMember>, ClientError> {
        let channel = self.channel(seed, timeout).await?;
        let mut request = Request::new(Empty {});
        request.set_timeout(timeout);
        authorize(request.metadata_mut(), self.settings.credentials.as_ref())?;

        let info = GossipClient::new(channel).read(request).await?.into_inner();
        Ok(info
            .members
            .into_iter()
            .filter_map(convert::cluster_member)
            .collect())
    }

    async fn connect(&self, endpoint: &Endpoint) -> Result<Arc<dyn NodeChannel>, ClientError> {
        let channel = self.channel(endpoint, self.settings.gossip_timeout()).await?;
        debug!(%endpoint, "grpc channel established");
        Ok(Arc::new(GrpcChannel {
            channel,
            credentials: self.settings.credentials.clone(),
        }))
    }
}

fn authorize(metadata: &mut MetadataMap, credentials: Option<&Credentials>) -> Result<(), ClientError> {
    let Some(credentials) = credentials else {
        return Ok(());
    };
    let token = STANDARD.encode(format!("{}:{}", credentials.username, credentials.password));
    let value = MetadataValue::try_from(format!("Basic {token}")).map_err(|e| {
        ClientError::from_error(ErrorCode::InternalClient, "credentials are not valid header text", e)
    })?;
    metadata.insert(AUTHORIZATION, value);
    Ok(())
}

/// Calls against one node over a shared tonic channel.
struct GrpcChannel {
    channel: Channel,
    credentials: Option<Credentials>,
}

impl GrpcChannel {
    fn request<T>(&self, message: T, ctx: &CallContext) -> Result<Request<T>, ClientError> {
        let mut request = Request::new(message);
        if let Some(deadline) = ctx.deadline {
            request.set_timeout(deadline);
        }
        let metadata = request.metadata_mut();
        metadata.insert(
            REQUIRES_LEADER,
            MetadataValue::from_static(if ctx.requires_leader { "true" } else { "false" }),
        );
        authorize(metadata, ctx.credentials.as_ref().or(self.credentials.as_ref()))?;
        Ok(request)
    }

    fn streams(&self) -> StreamsClient<Channel> {
        StreamsClient::new(self.channel.clone())
    }

    fn persistent(&self) -> PersistentSubscriptionsClient<Channel> {
        PersistentSubscriptionsClient::new(self.channel.clone())
    }
}

#[async_trait]
impl NodeChannel for GrpcChannel {
    async fn server_version(&self, ctx: &CallContext) -> Result<ServerVersion, ClientError> {
        let request = self.request(Empty {}, ctx)?;
        let methods = ServerFeaturesClient::new(self.channel.clone())
            .get_supported_methods(request)
            .await?
            .into_inner();
        methods.event_store_server_version.parse()
    }

    async fn append(
        &self,
        ctx: &CallContext,
        stream: &str,
        expected: StreamState,
        events: Vec<EventData>,
    ) -> Result<WriteResult, ClientError> {
        let mut messages = Vec::with_capacity(events.len() + 1);
        messages.push(convert::append_options(stream, expected)?);
        messages.extend(events.into_iter().map(convert::append_event));

        let request = self.request(stream::iter(messages), ctx)?;
        let response = self.streams().append(request).await?.into_inner();
        convert::write_result(stream, expected, response)
    }

    async fn multi_append(
        &self,
        ctx: &CallContext,
        requests: Vec<AppendStreamRequest>,
    ) -> Result<MultiAppendWriteResult, ClientError> {
        let request = self.request(convert::multi_append_request(requests)?, ctx)?;
        let response = StreamsServiceClient::new(self.channel.clone())
            .multi_stream_append(request)
            .await?
            .into_inner();
        Ok(convert::multi_append_result(response))
    }

    async fn delete(
        &self,
        ctx: &CallContext,
        stream: &str,
        expected: StreamState,
        tombstone: bool,
    ) -> Result<DeleteResult, ClientError> {
        let stream_identifier = Some(convert::stream_identifier(stream));
        let expected_revision = expected.to_wire()?;
        let position = if tombstone {
            let request = self.request(
                streams::TombstoneReq {
                    stream_identifier,
                    expected_revision,
                },
                ctx,
            )?;
            self.streams().tombstone(request).await?.into_inner().position
        } else {
            let request = self.request(
                streams::DeleteReq {
                    stream_identifier,
                    expected_revision,
                },
                ctx,
            )?;
            self.streams().delete(request).await?.into_inner().position
        };
        Ok(DeleteResult {
            position: convert::delete_position(position),
        })
    }

    async fn read(
        &self,
        ctx: &CallContext,
        request: ReadRequest,
    ) -> Result<MessageStream<ReadMessage>, ClientError> {
        let request = self.request(convert::read_req(&request), ctx)?;
        let inbound = self.streams().read(request).await?.into_inner();
        Ok(inbound
            .map(|item| {
                item.map_err(ClientError::from_status)
                    .and_then(convert::read_message)
            })
            .boxed())
    }

    async fn create_persistent(
        &self,
        ctx: &CallContext,
        target: &PersistentTarget,
        group: &str,
        settings: &PersistentSubscriptionSettings,
    ) -> Result<(), ClientError> {
        let request = self.request(
            persistent::CreateReq {
                target: Some(convert::subscription_target(target)),
                group_name: group.to_string(),
                settings: Some(convert::settings(settings)),
            },
            ctx,
        )?;
        self.persistent().create(request).await?;
        Ok(())
    }

    async fn update_persistent(
        &self,
        ctx: &CallContext,
        target: &PersistentTarget,
        group: &str,
        settings: &PersistentSubscriptionSettings,
    ) -> Result<(), ClientError> {
        let request = self.request(
            persistent::UpdateReq {
                target: Some(convert::subscription_target(target)),
                group_name: group.to_string(),
                settings: Some(convert::settings(settings)),
            },
            ctx,
        )?;
        self.persistent().update(request).await?;
        Ok(())
    }

    async fn delete_persistent(
        &self,
        ctx: &CallContext,
        target: &PersistentTarget,
        group: &str,
    ) -> Result<(), ClientError> {
        let request = self.request(
            persistent::DeleteReq {
                target: Some(convert::subscription_target(target)),
                group_name: group.to_string(),
            },
            ctx,
        )?;
        self.persistent().delete(request).await?;
        Ok(())
    }

    async fn persistent_info(
        &self,
        ctx: &CallContext,
        target: &PersistentTarget,
        group: &str,
    ) -> Result<PersistentSubscriptionInfo, ClientError> {
        let request = self.request(
            persistent::GetInfoReq {
                target: Some(convert::subscription_target(target)),
                group_name: group.to_string(),
            },
            ctx,
        )?;
        let info = self
            .persistent()
            .get_info(request)
            .await?
            .into_inner()
            .subscription_info
            .ok_or_else(|| {
                ClientError::new(ErrorCode::InternalServer, "info response without subscription")
            })?;
        Ok(convert::subscription_info(info))
    }

    async fn list_persistent(
        &self,
        ctx: &CallContext,
        target: Option<&PersistentTarget>,
    ) -> Result<Vec<PersistentSubscriptionInfo>, ClientError> {
        let request = self.request(
            persistent::ListReq {
                target: target.map(convert::subscription_target),
            },
            ctx,
        )?;
        let response = self.persistent().list(request).await?.into_inner();
        Ok(response
            .subscriptions
            .into_iter()
            .map(convert::subscription_info)
            .collect())
    }

    async fn replay_parked(
        &self,
        ctx: &CallContext,
        target: &PersistentTarget,
        group: &str,
        stop_at: Option<u64>,
    ) -> Result<(), ClientError> {
        let request = self.request(
            persistent::ReplayParkedReq {
                target: Some(convert::subscription_target(target)),
                group_name: group.to_string(),
                stop_at: stop_at.map(|n| convert::signed(n, "stop_at")).transpose()?,
            },
            ctx,
        )?;
        self.persistent().replay_parked(request).await?;
        Ok(())
    }

    async fn restart_persistent_subsystem(&self, ctx: &CallContext) -> Result<(), ClientError> {
        let request = self.request(Empty {}, ctx)?;
        self.persistent().restart_subsystem(request).await?;
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
        let options = convert::persistent_options(target, group, buffer_size);
        let outbound: BoxStream<'static, _> = stream::once(futures::future::ready(options))
            .chain(commands.map(convert::persistent_command))
            .boxed();

        let request = self.request(outbound, ctx)?;
        let mut client = self.persistent();
        let response: futures::future::BoxFuture<'_, _> = Box::pin(client.read(request));
        let inbound = response.await?.into_inner();
        Ok(inbound
            .map(|item| {
                item.map_err(ClientError::from_status)
                    .and_then(convert::persistent_message)
            })
            .boxed())
    }
}
