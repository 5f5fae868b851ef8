//! Persistent (server-managed) subscriptions.
//!
//! A read session announces a delivery credit of `buffer_size` events. Each
//! delivered event holds one unit of credit until it is acked or nacked; the
//! client mirrors the server's bound with a semaphore so that no more than
//! `buffer_size` events are ever outstanding on its side either.

mod admin;
mod settings;

pub use settings::{
    ConsumerStrategy, PersistentConnectionInfo, PersistentSubscriptionInfo,
    PersistentSubscriptionSettings, PersistentSubscriptionStats, PersistentTarget, StartFrom,
};

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use futures::StreamExt;
use tokio::sync::{mpsc, Semaphore};
use tokio_stream::wrappers::ReceiverStream;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::client::{CallOptions, Client, Route};
use crate::error::{ClientError, ErrorCode};
use crate::transport::{CallContext, MessageStream, PersistentCommand, PersistentMessage};
use crate::types::{Dropped, ResolvedEvent, SubscriptionEvent};

/// Default delivery credit of a read session.
pub const DEFAULT_BUFFER_SIZE: usize = 10;

const MIN_QUEUE_CAPACITY: usize = 32;

/// What the server does with a negatively acknowledged event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum NackAction {
    /// Left to the server's configured behavior.
    #[default]
    Unknown,
    /// Moved to the parked queue until parked messages are replayed.
    Park,
    /// Redelivered, up to the group's `max_retry_count`.
    Retry,
    /// Discarded.
    Skip,
    /// Ends the subscription.
    Stop,
}

#[derive(Debug, Clone)]
pub struct SubscribeToPersistentOptions {
    /// Events the server may deliver without a matching ack or nack.
    pub buffer_size: usize,
    pub call: CallOptions,
}

impl Default for SubscribeToPersistentOptions {
    fn default() -> Self {
        Self {
            buffer_size: DEFAULT_BUFFER_SIZE,
            call: CallOptions::default(),
        }
    }
}

impl SubscribeToPersistentOptions {
    pub fn buffer_size(mut self, buffer_size: usize) -> Self {
        self.buffer_size = buffer_size;
        self
    }
}

/// Delivery credit and the events holding it.
struct Credit {
    permits: Semaphore,
    /// Outstanding deliveries per event id. An event redelivered before it
    /// was acked holds one unit per delivery.
    in_flight: Mutex<HashMap<Uuid, usize>>,
}

impl Credit {
    fn new(buffer_size: usize) -> Self {
        Self {
            permits: Semaphore::new(buffer_size),
            in_flight: Mutex::new(HashMap::new()),
        }
    }

    fn in_flight(&self) -> MutexGuard<'_, HashMap<Uuid, usize>> {
        self.in_flight.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Waits for one unit of credit and charges it to `id`.
    async fn take(&self, id: Uuid) -> bool {
        match self.permits.acquire().await {
            Ok(permit) => {
                permit.forget();
                *self.in_flight().entry(id).or_default() += 1;
                true
            }
            Err(_) => false,
        }
    }

    /// Returns the credit held by `ids`. Runs before the settling command is
    /// sent, so a redelivery of the same id is charged afresh.
    fn release(&self, ids: &[Uuid]) {
        let released: usize = {
            let mut in_flight = self.in_flight();
            ids.iter().filter_map(|id| in_flight.remove(id)).sum()
        };
        if released > 0 {
            self.permits.add_permits(released);
        }
    }

    fn outstanding(&self) -> usize {
        self.in_flight().values().sum()
    }
}

/// An open read session on a persistent subscription group.
pub struct PersistentSubscription {
    id: String,
    events: tokio::sync::Mutex<mpsc::Receiver<SubscriptionEvent>>,
    /// Outbound half. Acks and nacks are written one at a time.
    commands: tokio::sync::Mutex<mpsc::Sender<PersistentCommand>>,
    credit: Arc<Credit>,
    cancel: CancellationToken,
    /// Fires when the client closes.
    shutdown: CancellationToken,
    dropped: Mutex<Option<Dropped>>,
}

impl PersistentSubscription {
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

    /// Acknowledges `event`, returning its credit.
    pub async fn ack(&self, event: &ResolvedEvent) -> Result<(), ClientError> {
        self.ack_ids(vec![event.id()]).await
    }

    pub async fn ack_ids(&self, ids: Vec<Uuid>) -> Result<(), ClientError> {
        if ids.is_empty() {
            return Ok(());
        }
        self.credit.release(&ids);
        self.send(PersistentCommand::Ack(ids)).await
    }

    /// Negatively acknowledges `event`, returning its credit.
    pub async fn nack(
        &self,
        event: &ResolvedEvent,
        action: NackAction,
        reason: impl Into<String>,
    ) -> Result<(), ClientError> {
        self.nack_ids(vec![event.id()], action, reason).await
    }

    pub async fn nack_ids(
        &self,
        ids: Vec<Uuid>,
        action: NackAction,
        reason: impl Into<String>,
    ) -> Result<(), ClientError> {
        if ids.is_empty() {
            return Ok(());
        }
        self.credit.release(&ids);
        self.send(PersistentCommand::Nack {
            ids,
            action,
            reason: reason.into(),
        })
        .await
    }

    /// Events delivered to this session and not yet acked or nacked.
    pub fn in_flight(&self) -> usize {
        self.credit.outstanding()
    }

    /// Drops the subscription and ends the session. Never waits for
    /// outstanding acks; safe to call while another task is inside
    /// [`recv`](Self::recv).
    pub fn close(&self) {
        self.mark_dropped(Dropped::closed());
        self.cancel.cancel();
    }

    pub fn is_dropped(&self) -> bool {
        self.dropped().is_some()
    }

    async fn send(&self, command: PersistentCommand) -> Result<(), ClientError> {
        if self.cancel.is_cancelled() || self.shutdown.is_cancelled() {
            return Err(ClientError::connection_closed());
        }
        let commands = tokio::select! {
            commands = self.commands.lock() => commands,
            _ = self.cancel.cancelled() => return Err(ClientError::connection_closed()),
            _ = self.shutdown.cancelled() => return Err(ClientError::connection_closed()),
        };
        tokio::select! {
            sent = commands.send(command) => sent.map_err(|_| ClientError::new(
                ErrorCode::ConnectionClosed,
                "persistent subscription session has ended",
            )),
            _ = self.cancel.cancelled() => Err(ClientError::connection_closed()),
            _ = self.shutdown.cancelled() => Err(ClientError::connection_closed()),
        }
    }

    /// Drops the subscription after [`Client::close`], ending the session.
    fn client_closed(&self) -> SubscriptionEvent {
        self.cancel.cancel();
        self.mark_dropped(Dropped::from_error(ClientError::connection_closed()))
    }

    fn dropped(&self) -> Option<Dropped> {
        self.dropped
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    fn mark_dropped(&self, dropped: Dropped) -> SubscriptionEvent {
        let mut state = self.dropped.lock().unwrap_or_else(PoisonError::into_inner);
        let dropped = state.get_or_insert(dropped).clone();
        SubscriptionEvent::SubscriptionDropped(dropped)
    }
}

impl Drop for PersistentSubscription {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

impl Client {
    /// Opens a read session on `group`.
    #[tracing::instrument(skip_all, fields(target = %target, group = %group, buffer_size = options.buffer_size))]
    pub async fn subscribe_to_persistent(
        &self,
        target: &PersistentTarget,
        group: &str,
        options: &SubscribeToPersistentOptions,
    ) -> Result<PersistentSubscription, ClientError> {
        if options.buffer_size == 0 {
            return Err(ClientError::invalid_argument("buffer_size must be positive"));
        }
        let buffer_size = options.buffer_size;
        let cancel = CancellationToken::new();
        let commands_tx = tokio::sync::Mutex::new(None);
        let commands_slot = &commands_tx;
        let session_cancel = &cancel;

        let (generation, id, inbound) = self
            .execute("subscribe_persistent", &options.call, Route::Leader, |conn, ctx| async move {
                let ctx = CallContext {
                    deadline: None,
                    ..ctx
                };
                let (tx, rx) = mpsc::channel(buffer_size.max(MIN_QUEUE_CAPACITY));
                let commands = ReceiverStream::new(rx)
                    .take_until(session_cancel.clone().cancelled_owned())
                    .boxed();
                let mut inbound = conn
                    .channel()
                    .read_persistent(&ctx, target, group, buffer_size, commands)
                    .await?;
                let id = await_confirmation(&mut inbound).await?;
                *commands_slot.lock().await = Some(tx);
                Ok((conn.generation(), id, inbound))
            })
            .await?;

        let commands = commands_tx.into_inner().ok_or_else(|| {
            ClientError::new(ErrorCode::InternalClient, "persistent session opened without an outbound half")
        })?;

        info!(subscription_id = %id, generation, "persistent subscription confirmed");

        let credit = Arc::new(Credit::new(buffer_size));
        let shutdown = self.connections().shutdown_token();
        let (tx, rx) = mpsc::channel(buffer_size.max(MIN_QUEUE_CAPACITY));
        let worker = Worker {
            subscription_id: id.clone(),
            client: self.clone(),
            generation,
            tx,
            credit: credit.clone(),
            cancel: cancel.clone(),
            shutdown: shutdown.clone(),
        };
        tokio::spawn(worker.run(inbound));

        Ok(PersistentSubscription {
            id,
            events: tokio::sync::Mutex::new(rx),
            commands: tokio::sync::Mutex::new(commands),
            credit,
            cancel,
            shutdown,
            dropped: Mutex::new(None),
        })
    }
}

async fn await_confirmation(
    inbound: &mut MessageStream<PersistentMessage>,
) -> Result<String, ClientError> {
    loop {
        match inbound.next().await {
            Some(Ok(PersistentMessage::Confirmation { subscription_id })) => {
                return Ok(subscription_id)
            }
            Some(Ok(other)) => {
                warn!(message = ?other, "message before persistent subscription confirmation, skipping");
            }
            Some(Err(err)) => return Err(err),
            None => {
                return Err(ClientError::new(
                    ErrorCode::Unavailable,
                    "persistent subscription ended before it was confirmed",
                ))
            }
        }
    }
}

/// Owns the inbound half of one read session.
struct Worker {
    subscription_id: String,
    client: Client,
    generation: u64,
    tx: mpsc::Sender<SubscriptionEvent>,
    credit: Arc<Credit>,
    cancel: CancellationToken,
    shutdown: CancellationToken,
}

impl Worker {
    async fn run(self, mut inbound: MessageStream<PersistentMessage>) {
        loop {
            let message = tokio::select! {
                _ = self.cancel.cancelled() => {
                    debug!(subscription_id = %self.subscription_id, "persistent subscription closed by caller");
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
                Some(Ok(PersistentMessage::Event(event))) => event,
                Some(Ok(PersistentMessage::Confirmation { .. })) => continue,
                Some(Ok(PersistentMessage::Unknown)) => {
                    warn!(subscription_id = %self.subscription_id, "skipping unknown persistent subscription message");
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
                        "persistent subscription ended by the server",
                    ))
                    .await;
                    return;
                }
            };

            let charged = tokio::select! {
                charged = self.credit.take(event.id()) => charged,
                _ = self.cancel.cancelled() => return,
                _ = self.shutdown.cancelled() => {
                    self.drop_with(ClientError::connection_closed()).await;
                    return;
                }
            };
            if !charged || !self.deliver(SubscriptionEvent::EventAppeared(event)).await {
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
        warn!(subscription_id = %self.subscription_id, error = %err, "persistent subscription dropped");
        self.deliver(SubscriptionEvent::SubscriptionDropped(Dropped::from_error(err)))
            .await;
    }
}
