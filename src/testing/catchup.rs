//! Server side of catch-up subscriptions.

use std::sync::Arc;

use chrono::Utc;
use futures::StreamExt;
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use tokio_util::sync::CancellationToken;
use tonic::Status;
use uuid::Uuid;

use super::store::Store;
use crate::error::ClientError;
use crate::subscription::{SubscriptionFilter, DEFAULT_MAX_SEARCH_WINDOW};
use crate::transport::{MessageStream, ReadMessage, ReadRequest, ReadTarget};
use crate::types::{Position, ResolvedEvent, StreamPosition, SubscriptionMarker};

type Outbound = mpsc::Sender<Result<ReadMessage, ClientError>>;

enum Cursor {
    Stream { stream: String, after: Option<u64> },
    All { after: Option<Position> },
}

impl Cursor {
    fn start(store: &Store, target: ReadTarget) -> Self {
        match target {
            ReadTarget::Stream { stream, from } => {
                let after = match from {
                    StreamPosition::Start => None,
                    StreamPosition::End => store.last_revision(&stream),
                    StreamPosition::Position(revision) => Some(revision),
                };
                Cursor::Stream { stream, after }
            }
            ReadTarget::All { from } => {
                let after = match from {
                    StreamPosition::Start => None,
                    StreamPosition::End => store.last_position(),
                    StreamPosition::Position(position) => Some(position),
                };
                Cursor::All { after }
            }
        }
    }

    fn pending(&self, store: &Store, resolve_link_tos: bool) -> Result<Vec<ResolvedEvent>, ClientError> {
        match self {
            Cursor::Stream { stream, after } => store.stream_after(stream, *after, resolve_link_tos),
            Cursor::All { after } => Ok(store.all_after(*after, resolve_link_tos)),
        }
    }

    fn advance(&mut self, event: &ResolvedEvent) {
        let original = event.original_event();
        match self {
            Cursor::Stream { after, .. } => *after = Some(original.revision),
            Cursor::All { after } => *after = Some(original.position),
        }
    }

    fn marker(&self) -> SubscriptionMarker {
        let (revision, position) = match self {
            Cursor::Stream { after, .. } => (*after, None),
            Cursor::All { after } => (None, *after),
        };
        SubscriptionMarker {
            timestamp: Utc::now(),
            revision,
            position,
        }
    }
}

/// Opens a subscription feed: confirmation, backlog, caught-up, then live
/// events until the client goes away or the connection is severed.
pub fn subscribe(
    store: Arc<Store>,
    request: ReadRequest,
    severed: CancellationToken,
) -> MessageStream<ReadMessage> {
    let (tx, rx) = mpsc::channel(64);
    tokio::spawn(feed(store, request, severed, tx));
    ReceiverStream::new(rx).boxed()
}

async fn feed(store: Arc<Store>, request: ReadRequest, severed: CancellationToken, tx: Outbound) {
    let mut changes = store.changes();
    let confirmation = ReadMessage::Confirmation {
        subscription_id: Uuid::new_v4().to_string(),
    };
    if tx.send(Ok(confirmation)).await.is_err() {
        return;
    }

    let filter: Option<SubscriptionFilter> = request.filter.clone();
    let checkpoint_interval = filter.as_ref().map(|filter| {
        let window = filter.max_search_window().unwrap_or(DEFAULT_MAX_SEARCH_WINDOW);
        (window * filter.checkpoint_interval_multiplier()).max(1) as usize
    });
    let mut cursor = Cursor::start(&store, request.target);
    let mut scanned = 0usize;
    let mut caught_up = false;

    loop {
        changes.borrow_and_update();
        let pending = match cursor.pending(&store, request.resolve_link_tos) {
            Ok(pending) => pending,
            Err(err) => {
                let _ = tx.send(Err(err)).await;
                return;
            }
        };

        for event in pending {
            cursor.advance(&event);
            let original = event.original_event();
            let position = original.position;
            let matches = filter
                .as_ref()
                .map_or(true, |filter| filter.matches(&original.stream_id, &original.event_type));
            if matches && tx.send(Ok(ReadMessage::Event(event))).await.is_err() {
                return;
            }
            if let Some(interval) = checkpoint_interval {
                scanned += 1;
                if scanned % interval == 0
                    && tx.send(Ok(ReadMessage::Checkpoint(position))).await.is_err()
                {
                    return;
                }
            }
        }

        if !caught_up {
            caught_up = true;
            if tx.send(Ok(ReadMessage::CaughtUp(cursor.marker()))).await.is_err() {
                return;
            }
        }

        tokio::select! {
            changed = changes.changed() => {
                if changed.is_err() {
                    return;
                }
            }
            _ = severed.cancelled() => {
                let _ = tx
                    .send(Err(ClientError::from_status(Status::unavailable("connection severed"))))
                    .await;
                return;
            }
            _ = tx.closed() => return,
        }
    }
}
