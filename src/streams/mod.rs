//! Stream operations: append, read, delete and stream metadata.

mod metadata;
mod read;

pub use metadata::{
    metadata_stream_name, Acl, StreamAcl, StreamMetadata, VersionedMetadata, METADATA_EVENT_TYPE,
};
pub use read::ReadStream;

use tracing::debug;

use crate::client::{CallOptions, Client, Route};
use crate::error::{ClientError, ErrorCode};
use crate::transport::{ReadRequest, ReadTarget};
use crate::types::{
    AppendStreamRequest, DeleteResult, Direction, EventData, MultiAppendWriteResult, Position,
    ServerVersion, StreamPosition, StreamState, WriteResult,
};

#[derive(Debug, Clone, Default)]
pub struct AppendToStreamOptions {
    pub expected_state: StreamState,
    pub call: CallOptions,
}

impl AppendToStreamOptions {
    pub fn expect(expected_state: StreamState) -> Self {
        Self {
            expected_state,
            ..Default::default()
        }
    }

    pub fn with_call(mut self, call: CallOptions) -> Self {
        self.call = call;
        self
    }
}

#[derive(Debug, Clone, Default)]
pub struct DeleteStreamOptions {
    pub expected_state: StreamState,
    pub call: CallOptions,
}

impl DeleteStreamOptions {
    pub fn expect(expected_state: StreamState) -> Self {
        Self {
            expected_state,
            ..Default::default()
        }
    }
}

#[derive(Debug, Clone)]
pub struct ReadStreamOptions {
    pub direction: Direction,
    pub from: StreamPosition<u64>,
    pub max_count: u64,
    pub resolve_link_tos: bool,
    pub call: CallOptions,
}

impl Default for ReadStreamOptions {
    fn default() -> Self {
        Self {
            direction: Direction::Forwards,
            from: StreamPosition::Start,
            max_count: u64::MAX,
            resolve_link_tos: false,
            call: CallOptions::default(),
        }
    }
}

impl ReadStreamOptions {
    pub fn forwards() -> Self {
        Self::default()
    }

    /// Reads from the end of the stream towards its start.
    pub fn backwards() -> Self {
        Self {
            direction: Direction::Backwards,
            from: StreamPosition::End,
            ..Default::default()
        }
    }

    pub fn from(mut self, from: StreamPosition<u64>) -> Self {
        self.from = from;
        self
    }

    pub fn max_count(mut self, max_count: u64) -> Self {
        self.max_count = max_count;
        self
    }

    pub fn resolve_link_tos(mut self) -> Self {
        self.resolve_link_tos = true;
        self
    }
}

#[derive(Debug, Clone)]
pub struct ReadAllOptions {
    pub direction: Direction,
    pub from: StreamPosition<Position>,
    pub max_count: u64,
    pub resolve_link_tos: bool,
    pub call: CallOptions,
}

impl Default for ReadAllOptions {
    fn default() -> Self {
        Self {
            direction: Direction::Forwards,
            from: StreamPosition::Start,
            max_count: u64::MAX,
            resolve_link_tos: false,
            call: CallOptions::default(),
        }
    }
}

impl ReadAllOptions {
    pub fn backwards() -> Self {
        Self {
            direction: Direction::Backwards,
            from: StreamPosition::End,
            ..Default::default()
        }
    }

    pub fn from(mut self, from: StreamPosition<Position>) -> Self {
        self.from = from;
        self
    }

    pub fn max_count(mut self, max_count: u64) -> Self {
        self.max_count = max_count;
        self
    }
}

impl Client {
    /// Appends `events` atomically, checking the stream against
    /// `options.expected_state` first.
    #[tracing::instrument(skip_all, fields(stream = %stream, expected = %options.expected_state, events = events.len()))]
    pub async fn append_to_stream(
        &self,
        stream: &str,
        options: &AppendToStreamOptions,
        events: Vec<EventData>,
    ) -> Result<WriteResult, ClientError> {
        let expected = options.expected_state;
        expected.to_wire()?;
        let events = &events;
        self.execute("append", &options.call, Route::Leader, |conn, ctx| async move {
            conn.channel()
                .append(&ctx, stream, expected, events.clone())
                .await
        })
        .await
    }

    /// Appends to several streams in one transaction: either every request
    /// commits or none does. Needs a server of version 25 or later.
    #[tracing::instrument(skip_all, fields(streams = requests.len()))]
    pub async fn multi_stream_append(
        &self,
        requests: Vec<AppendStreamRequest>,
        call: &CallOptions,
    ) -> Result<MultiAppendWriteResult, ClientError> {
        if requests.is_empty() {
            return Err(ClientError::invalid_argument(
                "multi-stream append needs at least one stream",
            ));
        }
        for request in &requests {
            request.expected_state.to_wire()?;
        }
        let requests = &requests;
        self.execute("multi_append", call, Route::Leader, |conn, ctx| async move {
            let version = conn.server_version(&ctx).await.map_err(|err| {
                if err.is_code(ErrorCode::UnsupportedFeature) {
                    ClientError::new(
                        ErrorCode::UnsupportedFeature,
                        "multi-stream append is not supported by the connected node",
                    )
                } else {
                    err
                }
            })?;
            if !version.supports_multi_append() {
                return Err(ClientError::new(
                    ErrorCode::UnsupportedFeature,
                    format!(
                        "multi-stream append requires server version {} or later, node runs {version}",
                        ServerVersion::MULTI_APPEND
                    ),
                ));
            }
            conn.channel().multi_append(&ctx, requests.clone()).await
        })
        .await
    }

    /// Soft-deletes a stream. Appending again re-creates it.
    #[tracing::instrument(skip_all, fields(stream = %stream))]
    pub async fn delete_stream(
        &self,
        stream: &str,
        options: &DeleteStreamOptions,
    ) -> Result<DeleteResult, ClientError> {
        self.remove_stream(stream, options, false).await
    }

    /// Deletes a stream permanently. It can never be written or read again.
    #[tracing::instrument(skip_all, fields(stream = %stream))]
    pub async fn tombstone_stream(
        &self,
        stream: &str,
        options: &DeleteStreamOptions,
    ) -> Result<DeleteResult, ClientError> {
        self.remove_stream(stream, options, true).await
    }

    async fn remove_stream(
        &self,
        stream: &str,
        options: &DeleteStreamOptions,
        tombstone: bool,
    ) -> Result<DeleteResult, ClientError> {
        let expected = options.expected_state;
        expected.to_wire()?;
        self.execute("delete", &options.call, Route::Leader, |conn, ctx| async move {
            conn.channel().delete(&ctx, stream, expected, tombstone).await
        })
        .await
    }

    /// Version of the node the client is connected to.
    pub async fn server_version(&self, call: &CallOptions) -> Result<ServerVersion, ClientError> {
        self.execute("server_version", call, Route::Preferred, |conn, ctx| async move {
            conn.server_version(&ctx).await
        })
        .await
    }

    /// Reads events of one stream.
    #[tracing::instrument(skip_all, fields(stream = %stream, direction = ?options.direction))]
    pub async fn read_stream(
        &self,
        stream: &str,
        options: &ReadStreamOptions,
    ) -> Result<ReadStream, ClientError> {
        let request = ReadRequest {
            target: ReadTarget::Stream {
                stream: stream.to_string(),
                from: options.from,
            },
            direction: options.direction,
            resolve_link_tos: options.resolve_link_tos,
            max_count: Some(options.max_count),
            filter: None,
        };
        self.open_read(request, &options.call).await
    }

    /// Reads the global log.
    #[tracing::instrument(skip_all, fields(direction = ?options.direction))]
    pub async fn read_all(&self, options: &ReadAllOptions) -> Result<ReadStream, ClientError> {
        let request = ReadRequest {
            target: ReadTarget::All { from: options.from },
            direction: options.direction,
            resolve_link_tos: options.resolve_link_tos,
            max_count: Some(options.max_count),
            filter: None,
        };
        self.open_read(request, &options.call).await
    }

    async fn open_read(
        &self,
        request: ReadRequest,
        call: &CallOptions,
    ) -> Result<ReadStream, ClientError> {
        let request = &request;
        let (generation, inbound) = self
            .execute("read", call, Route::Preferred, |conn, ctx| async move {
                let inbound = conn.channel().read(&ctx, request.clone()).await?;
                Ok((conn.generation(), inbound))
            })
            .await?;
        debug!(generation, "read opened");
        Ok(ReadStream::new(
            inbound,
            self.clone(),
            generation,
            self.connections().shutdown_token(),
        ))
    }
}

#[cfg(test)]
mod tests;
