//! Catch-up subscriptions.
//!
//! A subscription first replays history, then tails the log live. A worker
//! task owns the inbound stream and feeds a bounded queue; [`Subscription`]
//! dequeues from it. Once dropped, a subscription stays dropped.

mod filter;

pub use filter::{FilterExpression, FilterTarget, SubscriptionFilter, DEFAULT_MAX_SEARCH_WINDOW};

use std::sync::{Mutex, PoisonError};

use futures::StreamExt;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::client::{CallOptions, Client, Route};
use crate::error::{ClientError, ErrorCode};
use crate::transport::{CallContext, MessageStream, ReadMessage, ReadRequest, ReadTarget};
use crate::types::{Direction, Dropped, Position, StreamPosition, SubscriptionEvent};

/// Capacity of the queue between the worker and [`Subscription::recv`].
pub const SUBSCRIPTION_QUEUE_CAPACITY: usize = 500;

#[derive(Debug, Clone, Default)]
pub struct SubscribeToStreamOptions {
    /// `Position(n)` resumes after revision `n`.
    pub from: StreamPosition<u64>,
    pub resolve_link_tos: bool,
    pub call: CallOptions,
}

impl SubscribeToStreamOptions {
    pub fn from(mut self, from: StreamPosition<u64>) -> Self {
        self.from = from;
        self
    }

    pub fn resolve_link_tos(mut self) -> Self {
        self.resolve_link_tos = true;
        self
    }
}

#[derive(Debug, Clone, Default)]
pub struct SubscribeToAllOptions {
    /// `Position(p)` resumes after position `p`.
    pub from: StreamPosition<Position>,
    pub resolve_link_tos: bool,
    pub filter: Option<SubscriptionFilter>,
    pub call: CallOptions,
}

impl SubscribeToAllOptions {
    pub fn from(mut self, from: StreamPosition<Position>) -> Self {
        self.from = from;
        self
    }

    pub fn with_filter(mut self, filter: SubscriptionFilter) -> Self {
        self.filter = Some(filter);
        self
    }
}

/// A live catch-up subscription.
pub struct Subscription {
    id: String,
    events: tokio::sync::Mutex<mpsc::Receiver<SubscriptionEvent>>,
    cancel: CancellationToken,
    /// Fires when the client closes.
    shutdown: CancellationToken,
    dropped: Mutex<Option<Dropped>>,
}

impl Subscription {
    /// Server-assigned subscription id.
    pub fn id(&self) -> &str {
        &self.id
    }

    /// Waits for the next item. After the subscription is dropped every call
    /// returns `SubscriptionDropped` at once.
    pub async fn recv(&self) -> SubscriptionEvent {
        self.recv_with_cancel(&CancellationToken::new()).await
    }

    /// Like [`recv`](Self::recv), but firing `token` drops the subscription.
    pub async fn recv_with_cancel(&self, token: &CancellationToken) -> SubscriptionEvent {
        if let Some(dropped) = self.dropped() {
            return SubscriptionEvent::SubscriptionDropped(dropped);
        }

        let mut events = tokio::select! {
            events = self.events.lock() => events,
            _ = self.cancel.cancelled() => return self.mark_dropped(Dropped::closed()),
            _ = self.shutdown.cancelled() => return self.client_closed(),
            _ = token.cancelled() => {
                self.close();
                return self.mark_dropped(Dropped::closed());
            }
        };

        tokio::select! {
            event = events.recv() => match event {
                Some(SubscriptionEvent::SubscriptionDropped(dropped)) => self.mark_dropped(dropped),
                Some(event) => event,
                None => self.mark_dropped(Dropped::closed()),
            },
            _ = self.cancel.cancelled() => self.mark_dropped(Dropped::closed()),
            _ = self.shutdown.cancelled() => self.client_closed(),
            _ = token.cancelled() => {
                self.close();
                self.mark_dropped(Dropped::closed())
            }
        }
    }

    /// Drops the subscription. Never blocks; safe to call while another
    /// task is inside [`recv`](Self::recv).
    pub fn close(&self) {
        self.mark_dropped(Dropped::closed());
        self.cancel.cancel();
    }

    pub fn is_dropped(&self) -> bool {
        self.dropped().is_some()
    }

    fn dropped(&self) -> Option<Dropped> {
        self.dropped
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    fn client_closed(&self) -> SubscriptionEvent {
        self.cancel.cancel();
        self.mark_dropped(Dropped::from_error(ClientError::connection_closed()))
    }

    /// Records the first drop reason and reports it.
    fn mark_dropped(&self, dropped: Dropped) -> SubscriptionEvent {
        let mut state = self.dropped.lock().unwrap_or_else(PoisonError::into_inner);
        let dropped = state.get_or_insert(dropped).clone();
        SubscriptionEvent::SubscriptionDropped(dropped)
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

impl Client {
    /// Subscribes to one stream.
    #[tracing::instrument(skip_all, fields(stream = %stream))]
    pub async fn subscribe_to_stream(
        &self,
        stream: &str,
        options: &SubscribeToStreamOptions,
    ) -> Result<Subscription, ClientError> {
        let request = ReadRequest {
            target: ReadTarget::Stream {
                stream: stream.to_string(),
                from: options.from,
            },
            direction: Direction::Forwards,
            resolve_link_tos: options.resolve_link_tos,
            max_count: None,
            filter: None,
        };
        self.subscribe(request, &options.call).await
    }

    /// Subscribes to the global log, optionally filtered.
    #[tracing::instrument(skip_all, fields(filtered = options.filter.is_some()))]
    pub async fn subscribe_to_all(
        &self,
        options: &SubscribeToAllOptions,
    ) -> Result<Subscription, ClientError> {
        let request = ReadRequest {
            target: ReadTarget::All { from: options.from },
            direction: Direction::Forwards,
            resolve_link_tos: options.resolve_link_tos,
            max_count: None,
            filter: options.filter.clone(),
        };
        self.subscribe(request, &options.call).await
    }

    /// Opens the stream and waits for the server to confirm it.
    async fn subscribe(
        &self,
        request: ReadRequest,
        call: &CallOptions,
    ) -> Result<Subscription, ClientError> {
        let request = &request;
        let (generation, id, inbound) = self
            .execute("subscribe", call, Route::Preferred, |conn, ctx| async move {
                // The stream outlives any deadline; only confirmation is bounded.
                let ctx = CallContext {
                    deadline: None,
                    ..ctx
                };
                let mut inbound = conn.channel().read(&ctx, request.clone()).await?;
                let id = await_confirmation(&mut inbound).await?;
                Ok((conn.generation(), id, inbound))
            })
            .await?;

        info!(subscription_id = %id, generation, "subscription confirmed");

        let (tx, rx) = mpsc::channel(SUBSCRIPTION_QUEUE_CAPACITY);
        let cancel = CancellationToken::new();
        let shutdown = self.connections().shutdown_token();
        let worker = Worker {
            subscription_id: id.clone(),
            client: self.clone(),
            generation,
            tx,
            cancel: cancel.clone(),
            shutdown: shutdown.clone(),
        };
        tokio::spawn(worker.run(inbound));

        Ok(Subscription {
            id,
            events: tokio::sync::Mutex::new(rx),
            cancel,
            shutdown,
            dropped: Mutex::new(None),
        })
    }
}

async fn await_confirmation(
    inbound: &mut MessageStream<ReadMessage>,
) -> Result<String, ClientError> {
    loop {
        match inbound.next().await {
            Some(Ok(ReadMessage::Confirmation { subscription_id })) => return Ok(subscription_id),
            Some(Ok(ReadMessage::StreamNotFound { stream })) => {
                return Err(ClientError::new(
                    ErrorCode::ResourceNotFound,
                    format!("stream '{stream}' not found"),
                ))
            }
            Some(Ok(other)) => {
                warn!(message = ?other, "message before subscription confirmation, skipping");
            }
            Some(Err(err)) => return Err(err),
            None => {
                return Err(ClientError::new(
                    ErrorCode::Unavailable,
                    "subscription ended before it was confirmed",
                ))
            }
        }
    }
}

/// Owns the inbound stream of one subscription.
struct Worker {
    subscription_id: String,
    client: Client,
    generation: u64,
    tx: mpsc::Sender<SubscriptionEvent>,
    cancel: CancellationToken,
    shutdown: CancellationToken,
}

impl Worker {
    async fn run(self, mut inbound: MessageStream<ReadMessage>) {
        loop {
            let message = tokio::select! {
                _ = self.cancel.cancelled() => {
                    debug!(subscription_id = %self.subscription_id, "subscription closed by caller");
                    return;
                }
                _ = self.shutdown.cancelled() => {
                    self.drop_with(ClientError::connection_closed()).await;
                    return;
                }
                _ = self.tx.closed() => return,
                message = inbound.next() => message,
            };

            let event = match message {
                Some(Ok(ReadMessage::Event(event))) => SubscriptionEvent::EventAppeared(event),
                Some(Ok(ReadMessage::Checkpoint(position))) => {
                    SubscriptionEvent::CheckPointReached(position)
                }
                Some(Ok(ReadMessage::CaughtUp(marker))) => SubscriptionEvent::CaughtUp(marker),
                Some(Ok(ReadMessage::FellBehind(marker))) => SubscriptionEvent::FellBehind(marker),
                Some(Ok(ReadMessage::Unknown)) => {
                    warn!(subscription_id = %self.subscription_id, "skipping unknown subscription message");
                    continue;
                }
                Some(Ok(other)) => {
                    debug!(subscription_id = %self.subscription_id, message = ?other, "skipping subscription message");
                    continue;
                }
                Some(Err(err)) => {
                    self.client.report(self.generation, &err);
                    self.drop_with(err).await;
                    return;
                }
                None => {
                    self.drop_with(ClientError::new(
                        ErrorCode::Unavailable,
                        "subscription ended by the server",
                    ))
                    .await;
                    return;
                }
            };

            if !self.deliver(event).await {
                return;
            }
        }
    }

    async fn deliver(&self, event: SubscriptionEvent) -> bool {
        tokio::select! {
            sent = self.tx.send(event) => sent.is_ok(),
            _ = self.cancel.cancelled() => false,
        }
    }

    async fn drop_with(&self, err: ClientError) {
        warn!(subscription_id = %self.subscription_id, error = %err, "subscription dropped");
        self.deliver(SubscriptionEvent::SubscriptionDropped(Dropped::from_error(err)))
            .await;
    }
}

#[cfg(test)]
mod tests;
