//! Server side of persistent subscription groups.

use std::collections::{HashMap, VecDeque};
use std::sync::{Mutex, MutexGuard, PoisonError};

use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tonic::{Code, Status};
use tracing::debug;
use uuid::Uuid;

use super::server_error;
use super::store::{SourceCursor, Store};
use crate::error::{headers, ClientError};
use crate::persistent::{
    ConsumerStrategy, NackAction, PersistentConnectionInfo, PersistentSubscriptionInfo,
    PersistentSubscriptionSettings, PersistentSubscriptionStats, PersistentTarget,
};
use crate::transport::{PersistentCommand, PersistentMessage};
use crate::types::ResolvedEvent;

pub type Outbound = mpsc::UnboundedSender<Result<PersistentMessage, ClientError>>;

/// What a session should do after a command was applied.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Flow {
    Continue,
    Stop,
}

struct Consumer {
    id: u64,
    username: String,
    credit: usize,
    delivered: u64,
    outbound: Outbound,
    evicted: CancellationToken,
}

struct InFlight {
    event: ResolvedEvent,
    consumer: u64,
}

struct Group {
    target: PersistentTarget,
    name: String,
    settings: PersistentSubscriptionSettings,
    cursor: SourceCursor,
    /// Events due for redelivery, ahead of the source.
    retry: VecDeque<ResolvedEvent>,
    parked: Vec<ResolvedEvent>,
    in_flight: HashMap<Uuid, InFlight>,
    consumers: Vec<Consumer>,
    next_consumer: usize,
    delivered: u64,
}

impl Group {
    fn pick_consumer(&mut self) -> Option<usize> {
        let n = self.consumers.len();
        match self.settings.consumer_strategy {
            ConsumerStrategy::DispatchToSingle => self.consumers.iter().position(|c| c.credit > 0),
            // Pinning is approximated by rotation.
            ConsumerStrategy::RoundRobin | ConsumerStrategy::PinnedByCorrelation => {
                let index = (0..n)
                    .map(|offset| (self.next_consumer + offset) % n)
                    .find(|&index| self.consumers[index].credit > 0)?;
                self.next_consumer = index + 1;
                Some(index)
            }
        }
    }

    fn next_event(&mut self, store: &Store) -> Option<ResolvedEvent> {
        if let Some(event) = self.retry.pop_front() {
            return Some(event);
        }
        let (event, cursor) =
            store.source_next(&self.target, self.cursor, self.settings.resolve_link_tos)?;
        self.cursor = cursor;
        Some(event)
    }

    /// Delivers while any consumer has credit and events are pending.
    fn dispatch(&mut self, store: &Store) {
        while let Some(index) = self.pick_consumer() {
            let Some(event) = self.next_event(store) else {
                return;
            };
            let consumer = &mut self.consumers[index];
            consumer.credit -= 1;
            consumer.delivered += 1;
            self.delivered += 1;
            self.in_flight.insert(
                event.id(),
                InFlight {
                    event: event.clone(),
                    consumer: consumer.id,
                },
            );
            let _ = consumer.outbound.send(Ok(PersistentMessage::Event(event)));
        }
    }

    fn release(&mut self, consumer: u64) {
        if let Some(consumer) = self.consumers.iter_mut().find(|c| c.id == consumer) {
            consumer.credit += 1;
        }
    }

    fn settle(&mut self, ids: &[Uuid], action: Option<NackAction>) {
        for id in ids {
            let Some(InFlight { event, consumer }) = self.in_flight.remove(id) else {
                continue;
            };
            self.release(consumer);
            match action {
                None | Some(NackAction::Skip) | Some(NackAction::Stop) => {}
                Some(NackAction::Park) => self.parked.push(event),
                Some(NackAction::Retry) | Some(NackAction::Unknown) => {
                    if event.retry_count >= self.settings.max_retry_count {
                        debug!(group = %self.name, event_id = %id, "retry budget spent, parking");
                        self.parked.push(event);
                    } else {
                        let retry_count = event.retry_count + 1;
                        self.retry.push_back(event.with_retry_count(retry_count));
                    }
                }
            }
        }
    }

    /// Removes a consumer, queueing its unsettled events for redelivery.
    fn remove(&mut self, consumer: u64) -> Option<Consumer> {
        let index = self.consumers.iter().position(|c| c.id == consumer)?;
        let removed = self.consumers.remove(index);
        let mut orphaned: Vec<Uuid> = self
            .in_flight
            .iter()
            .filter(|(_, flight)| flight.consumer == consumer)
            .map(|(id, _)| *id)
            .collect();
        orphaned.sort_by_key(|id| {
            self.in_flight
                .get(id)
                .map(|flight| flight.event.original_event().position)
        });
        for id in orphaned.into_iter().rev() {
            if let Some(flight) = self.in_flight.remove(&id) {
                let retry_count = flight.event.retry_count + 1;
                self.retry.push_front(flight.event.with_retry_count(retry_count));
            }
        }
        Some(removed)
    }

    fn info(&self, store: &Store) -> PersistentSubscriptionInfo {
        let connections = self
            .consumers
            .iter()
            .map(|consumer| PersistentConnectionInfo {
                from: format!("in-memory-consumer-{}", consumer.id),
                username: consumer.username.clone(),
                in_flight_messages: self
                    .in_flight
                    .values()
                    .filter(|flight| flight.consumer == consumer.id)
                    .count() as u32,
                total_items: consumer.delivered,
            })
            .collect();
        PersistentSubscriptionInfo {
            event_source: self.target.event_source().to_string(),
            group_name: self.name.clone(),
            status: "Live".to_string(),
            connections,
            settings: Some(self.settings.clone()),
            stats: PersistentSubscriptionStats {
                last_checkpointed_position: None,
                last_known_position: store.source_last(&self.target),
                parked_message_count: self.parked.len() as u64,
                in_flight_messages: self.in_flight.len() as u64,
                total_items: self.delivered,
            },
        }
    }
}

fn group_not_found(target: &PersistentTarget, group: &str) -> ClientError {
    server_error(
        Code::NotFound,
        headers::PERSISTENT_SUBSCRIPTION_DOES_NOT_EXIST,
        format!("Subscription group '{group}' on stream '{target}' does not exist."),
        &[],
    )
}

type GroupKey = (String, String);

fn key(target: &PersistentTarget, group: &str) -> GroupKey {
    (target.event_source().to_string(), group.to_string())
}

#[derive(Default)]
struct State {
    groups: HashMap<GroupKey, Group>,
    next_consumer_id: u64,
}

impl State {
    fn group(&mut self, target: &PersistentTarget, group: &str) -> Result<&mut Group, ClientError> {
        self.groups
            .get_mut(&key(target, group))
            .ok_or_else(|| group_not_found(target, group))
    }
}

/// Every persistent subscription group of the fake cluster.
#[derive(Default)]
pub struct PersistentEngine {
    state: Mutex<State>,
}

impl PersistentEngine {
    fn lock(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn create(
        &self,
        store: &Store,
        target: &PersistentTarget,
        group: &str,
        settings: &PersistentSubscriptionSettings,
    ) -> Result<(), ClientError> {
        let mut state = self.lock();
        let key = key(target, group);
        if state.groups.contains_key(&key) {
            return Err(server_error(
                Code::AlreadyExists,
                headers::PERSISTENT_SUBSCRIPTION_EXISTS,
                format!("Subscription group '{group}' on stream '{target}' exists."),
                &[],
            ));
        }
        let cursor = store.source_start(target, settings.start_from);
        state.groups.insert(
            key,
            Group {
                target: target.clone(),
                name: group.to_string(),
                settings: settings.clone(),
                cursor,
                retry: VecDeque::new(),
                parked: Vec::new(),
                in_flight: HashMap::new(),
                consumers: Vec::new(),
                next_consumer: 0,
                delivered: 0,
            },
        );
        Ok(())
    }

    pub fn update(
        &self,
        store: &Store,
        target: &PersistentTarget,
        group: &str,
        settings: &PersistentSubscriptionSettings,
    ) -> Result<(), ClientError> {
        let mut state = self.lock();
        let existing = state.group(target, group)?;
        existing.settings = settings.clone();
        existing.dispatch(store);
        Ok(())
    }

    pub fn delete(&self, target: &PersistentTarget, group: &str) -> Result<(), ClientError> {
        let removed = self
            .lock()
            .groups
            .remove(&key(target, group))
            .ok_or_else(|| group_not_found(target, group))?;
        for consumer in removed.consumers {
            let _ = consumer.outbound.send(Err(ClientError::from_status(Status::aborted(
                "persistent subscription group was deleted",
            ))));
            consumer.evicted.cancel();
        }
        Ok(())
    }

    pub fn info(
        &self,
        store: &Store,
        target: &PersistentTarget,
        group: &str,
    ) -> Result<PersistentSubscriptionInfo, ClientError> {
        let mut state = self.lock();
        Ok(state.group(target, group)?.info(store))
    }

    pub fn list(
        &self,
        store: &Store,
        target: Option<&PersistentTarget>,
    ) -> Vec<PersistentSubscriptionInfo> {
        let state = self.lock();
        let mut infos: Vec<PersistentSubscriptionInfo> = state
            .groups
            .values()
            .filter(|group| target.map_or(true, |target| &group.target == target))
            .map(|group| group.info(store))
            .collect();
        infos.sort_by(|a, b| {
            (&a.event_source, &a.group_name).cmp(&(&b.event_source, &b.group_name))
        });
        infos
    }

    pub fn replay_parked(
        &self,
        store: &Store,
        target: &PersistentTarget,
        group: &str,
        stop_at: Option<u64>,
    ) -> Result<(), ClientError> {
        let mut state = self.lock();
        let group = state.group(target, group)?;
        let count = stop_at.map_or(group.parked.len(), |n| {
            usize::try_from(n).unwrap_or(usize::MAX).min(group.parked.len())
        });
        let replayed: Vec<ResolvedEvent> = group.parked.drain(..count).collect();
        debug!(group = %group.name, replayed = replayed.len(), "replaying parked events");
        group.retry.extend(replayed);
        group.dispatch(store);
        Ok(())
    }

    /// Drops every consumer; groups keep their state.
    pub fn restart(&self) {
        let mut state = self.lock();
        for group in state.groups.values_mut() {
            let ids: Vec<u64> = group.consumers.iter().map(|c| c.id).collect();
            for id in ids {
                if let Some(consumer) = group.remove(id) {
                    let _ = consumer.outbound.send(Err(ClientError::from_status(
                        Status::aborted("persistent subscription subsystem is restarting"),
                    )));
                    consumer.evicted.cancel();
                }
            }
        }
    }

    /// Attaches a consumer with `credit` units of delivery credit. The
    /// confirmation is queued before any event.
    pub fn join(
        &self,
        store: &Store,
        target: &PersistentTarget,
        group: &str,
        credit: usize,
        username: &str,
        outbound: Outbound,
    ) -> Result<(u64, CancellationToken), ClientError> {
        let mut state = self.lock();
        state.next_consumer_id += 1;
        let id = state.next_consumer_id;
        let existing = state.group(target, group)?;
        let max = existing.settings.max_subscriber_count as usize;
        if max > 0 && existing.consumers.len() >= max {
            return Err(ClientError::from_status(Status::failed_precondition(
                "maximum subscriber count reached",
            )));
        }

        let _ = outbound.send(Ok(PersistentMessage::Confirmation {
            subscription_id: format!("{target}::{group}"),
        }));
        let evicted = CancellationToken::new();
        existing.consumers.push(Consumer {
            id,
            username: username.to_string(),
            credit,
            delivered: 0,
            outbound,
            evicted: evicted.clone(),
        });
        existing.dispatch(store);
        Ok((id, evicted))
    }

    /// Applies an ack or nack sent by `consumer`.
    pub fn apply(
        &self,
        store: &Store,
        target: &PersistentTarget,
        group: &str,
        command: PersistentCommand,
    ) -> Flow {
        let mut state = self.lock();
        let Ok(group) = state.group(target, group) else {
            return Flow::Stop;
        };
        let flow = match command {
            PersistentCommand::Ack(ids) => {
                group.settle(&ids, None);
                Flow::Continue
            }
            PersistentCommand::Nack { ids, action, .. } => {
                group.settle(&ids, Some(action));
                if action == NackAction::Stop {
                    Flow::Stop
                } else {
                    Flow::Continue
                }
            }
        };
        group.dispatch(store);
        flow
    }

    pub fn leave(&self, store: &Store, target: &PersistentTarget, group: &str, consumer: u64) {
        let mut state = self.lock();
        if let Ok(group) = state.group(target, group) {
            group.remove(consumer);
            group.dispatch(store);
        }
    }

    /// Offers pending events to every group.
    pub fn dispatch(&self, store: &Store) {
        let mut state = self.lock();
        for group in state.groups.values_mut() {
            group.dispatch(store);
        }
    }
}
