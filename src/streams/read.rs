use futures::StreamExt;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::client::Client;
use crate::error::{ClientError, ErrorCode};
use crate::transport::{MessageStream, ReadMessage};
use crate::types::ResolvedEvent;

/// Events of a bounded read, pulled lazily from the server.
pub struct ReadStream {
    inbound: MessageStream<ReadMessage>,
    client: Client,
    generation: u64,
    shutdown: CancellationToken,
    finished: bool,
}

impl ReadStream {
    pub(crate) fn new(
        inbound: MessageStream<ReadMessage>,
        client: Client,
        generation: u64,
        shutdown: CancellationToken,
    ) -> Self {
        Self {
            inbound,
            client,
            generation,
            shutdown,
            finished: false,
        }
    }

    /// Next event, or `None` once the read is exhausted.
    ///
    /// A stream that never existed fails with `ResourceNotFound`; a
    /// tombstoned one with `StreamDeleted`.
    pub async fn next(&mut self) -> Result<Option<ResolvedEvent>, ClientError> {
        if self.finished {
            return Ok(None);
        }
        loop {
            let message = tokio::select! {
                message = self.inbound.next() => message,
                _ = self.shutdown.cancelled() => {
                    self.finished = true;
                    return Err(ClientError::connection_closed());
                }
            };

            match message {
                None => {
                    self.finished = true;
                    return Ok(None);
                }
                Some(Ok(ReadMessage::Event(event))) => return Ok(Some(event)),
                Some(Ok(ReadMessage::StreamNotFound { stream })) => {
                    self.finished = true;
                    return Err(ClientError::new(
                        ErrorCode::ResourceNotFound,
                        format!("stream '{stream}' not found"),
                    ));
                }
                Some(Ok(ReadMessage::Unknown)) => {
                    warn!("skipping unknown read message");
                }
                Some(Ok(other)) => {
                    debug!(message = ?other, "skipping non-event read message");
                }
                Some(Err(err)) => {
                    self.finished = true;
                    self.client.report(self.generation, &err);
                    return Err(err);
                }
            }
        }
    }

    /// Drains the remaining events.
    pub async fn collect(mut self) -> Result<Vec<ResolvedEvent>, ClientError> {
        let mut events = Vec::new();
        while let Some(event) = self.next().await? {
            events.push(event);
        }
        Ok(events)
    }
}
