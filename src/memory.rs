// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # In-Memory Broker
//!
//! A process-local [`Broker`] with the queue semantics the dispatch protocol
//! relies on, for embedded deployments and tests:
//!
//! - a delivered message is invisible to every other channel until acked;
//! - closing or dropping a channel puts its unacked messages back at the head
//!   of their queues, flagged as redelivered;
//! - rejecting a message follows the queue's dead-letter routing, bumping the
//!   message's death count. Retry queues hand the message straight back
//!   instead of waiting out their TTL;
//! - redeclaring a queue with different parameters fails;
//! - publishing to an undeclared queue drops the message, like the default
//!   exchange does.

use crate::{
    broker::{Broker, BrokerChannel, Envelope, EnvelopeStream, MessageProperties},
    errors::AmqpError,
    queue::QueueDefinition,
};
use async_trait::async_trait;
use futures_util::{stream, StreamExt};
use std::{
    collections::{HashMap, HashSet, VecDeque},
    sync::{
        atomic::{AtomicBool, AtomicU64, Ordering},
        Arc, Mutex, MutexGuard,
    },
};
use tokio::sync::Notify;
use tracing::{debug, warn};

#[derive(Debug, Clone)]
struct StoredMessage {
    data: Vec<u8>,
    properties: MessageProperties,
    redelivered: bool,
    death_count: i64,
}

#[derive(Debug)]
struct MemoryQueue {
    def: QueueDefinition,
    ready: VecDeque<StoredMessage>,
}

#[derive(Debug, Default)]
struct Shared {
    queues: Mutex<HashMap<String, MemoryQueue>>,
    notify: Notify,
}

impl Shared {
    fn queues(&self) -> MutexGuard<'_, HashMap<String, MemoryQueue>> {
        // a panic while holding the lock cannot leave a queue half-updated
        self.queues.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn pop(&self, queue: &str) -> Option<StoredMessage> {
        self.queues().get_mut(queue)?.ready.pop_front()
    }

    fn push_back(&self, queue: &str, msg: StoredMessage) {
        match self.queues().get_mut(queue) {
            Some(q) => q.ready.push_back(msg),
            None => debug!(queue, "dropping message routed to an undeclared queue"),
        }
        self.notify.notify_waiters();
    }
}

/// In-memory implementation of [`Broker`].
#[derive(Debug, Clone, Default)]
pub struct InMemoryBroker {
    shared: Arc<Shared>,
}

impl InMemoryBroker {
    /// Creates a broker with no queues.
    pub fn new() -> InMemoryBroker {
        InMemoryBroker::default()
    }

    /// Opens a channel with its concrete type, e.g. to drop it without
    /// closing.
    pub fn channel(&self) -> InMemoryChannel {
        InMemoryChannel {
            shared: self.shared.clone(),
            state: Arc::new(ChannelState::default()),
        }
    }

    /// Number of messages ready for delivery on `queue`.
    pub fn ready_count(&self, queue: &str) -> usize {
        self.shared
            .queues()
            .get(queue)
            .map(|q| q.ready.len())
            .unwrap_or_default()
    }

    /// Bodies of the messages ready for delivery on `queue`, head first.
    pub fn ready_messages(&self, queue: &str) -> Vec<Vec<u8>> {
        self.shared
            .queues()
            .get(queue)
            .map(|q| q.ready.iter().map(|m| m.data.clone()).collect())
            .unwrap_or_default()
    }
}

#[async_trait]
impl Broker for InMemoryBroker {
    async fn open_channel(&self) -> Result<Arc<dyn BrokerChannel>, AmqpError> {
        Ok(Arc::new(self.channel()))
    }
}

#[derive(Debug, Default)]
struct ChannelState {
    unacked: Mutex<HashMap<u64, (String, StoredMessage)>>,
    cancelled: Mutex<HashSet<String>>,
    next_tag: AtomicU64,
    closed: AtomicBool,
}

impl ChannelState {
    fn unacked(&self) -> MutexGuard<'_, HashMap<u64, (String, StoredMessage)>> {
        self.unacked.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn is_cancelled(&self, consumer_tag: &str) -> bool {
        self.cancelled
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .contains(consumer_tag)
    }

    fn deliver(&self, queue: &str, msg: StoredMessage) -> Envelope {
        let delivery_tag = self.next_tag.fetch_add(1, Ordering::SeqCst) + 1;

        let envelope = Envelope {
            delivery_tag,
            data: msg.data.clone(),
            properties: msg.properties.clone(),
            redelivered: msg.redelivered,
            death_count: msg.death_count,
        };

        self.unacked().insert(delivery_tag, (queue.to_owned(), msg));
        envelope
    }

    fn take(&self, delivery_tag: u64) -> Option<(String, StoredMessage)> {
        self.unacked().remove(&delivery_tag)
    }

    /// Returns every unacked message to the head of its queue, oldest first.
    fn release(&self, shared: &Shared) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }

        let mut pending: Vec<(u64, (String, StoredMessage))> = self.unacked().drain().collect();
        pending.sort_by_key(|(tag, _)| std::cmp::Reverse(*tag));

        {
            let mut queues = shared.queues();
            for (_, (queue, mut msg)) in pending {
                msg.redelivered = true;
                if let Some(q) = queues.get_mut(&queue) {
                    q.ready.push_front(msg);
                }
            }
        }

        shared.notify.notify_waiters();
    }
}

/// A channel on an [`InMemoryBroker`]. Dropping it without closing behaves
/// like a lost connection: unacked messages are requeued.
#[derive(Debug)]
pub struct InMemoryChannel {
    shared: Arc<Shared>,
    state: Arc<ChannelState>,
}

impl InMemoryChannel {
    fn ensure_open(&self) -> Result<(), AmqpError> {
        if self.state.closed.load(Ordering::SeqCst) {
            return Err(AmqpError::ChannelError);
        }
        Ok(())
    }
}

impl Drop for InMemoryChannel {
    fn drop(&mut self) {
        self.state.release(&self.shared);
    }
}

#[async_trait]
impl BrokerChannel for InMemoryChannel {
    async fn declare_queue(&self, def: &QueueDefinition) -> Result<(), AmqpError> {
        self.ensure_open()?;

        let mut queues = self.shared.queues();
        match queues.get(def.name()) {
            Some(existing) if !existing.def.is_compatible(def) => {
                warn!(name = def.name(), "queue exists with different properties");
                Err(AmqpError::DeclareQueueError(def.name().to_owned()))
            }
            Some(_) => Ok(()),
            None => {
                queues.insert(
                    def.name().to_owned(),
                    MemoryQueue {
                        def: def.clone(),
                        ready: VecDeque::new(),
                    },
                );
                Ok(())
            }
        }
    }

    async fn publish(
        &self,
        queue: &str,
        data: &[u8],
        properties: &MessageProperties,
    ) -> Result<(), AmqpError> {
        self.ensure_open().map_err(|_| AmqpError::PublishingError)?;

        self.shared.push_back(
            queue,
            StoredMessage {
                data: data.to_vec(),
                properties: properties.clone(),
                redelivered: false,
                death_count: 0,
            },
        );
        Ok(())
    }

    async fn get(&self, queue: &str) -> Result<Option<Envelope>, AmqpError> {
        self.ensure_open()
            .map_err(|_| AmqpError::ConsumerError("channel closed".to_owned()))?;

        let mut queues = self.shared.queues();
        let Some(q) = queues.get_mut(queue) else {
            return Err(AmqpError::ConsumerError(format!("no queue `{queue}`")));
        };

        let msg = q.ready.pop_front();
        drop(queues);

        Ok(msg.map(|msg| self.state.deliver(queue, msg)))
    }

    async fn consume(
        &self,
        queue: &str,
        consumer_tag: &str,
        prefetch: u16,
    ) -> Result<EnvelopeStream, AmqpError> {
        self.ensure_open()
            .map_err(|_| AmqpError::ConsumerError("channel closed".to_owned()))?;

        if !self.shared.queues().contains_key(queue) {
            return Err(AmqpError::ConsumerError(format!("no queue `{queue}`")));
        }

        let seed = (
            self.shared.clone(),
            self.state.clone(),
            queue.to_owned(),
            consumer_tag.to_owned(),
        );

        let deliveries = stream::unfold(seed, move |(shared, state, queue, tag)| async move {
            loop {
                let waker = shared.clone();
                let notified = waker.notify.notified();

                if state.closed.load(Ordering::SeqCst) || state.is_cancelled(&tag) {
                    return None;
                }

                if prefetch == 0 || state.unacked().len() < prefetch as usize {
                    if let Some(msg) = shared.pop(&queue) {
                        let envelope = state.deliver(&queue, msg);
                        return Some((Ok::<_, AmqpError>(envelope), (shared, state, queue, tag)));
                    }
                }

                notified.await;
            }
        });

        Ok(deliveries.boxed())
    }

    async fn ack(&self, delivery_tag: u64) -> Result<(), AmqpError> {
        self.state
            .take(delivery_tag)
            .ok_or(AmqpError::AckMessageError)?;

        self.shared.notify.notify_waiters();
        Ok(())
    }

    async fn reject(&self, delivery_tag: u64) -> Result<(), AmqpError> {
        let (queue, mut msg) = self
            .state
            .take(delivery_tag)
            .ok_or(AmqpError::NackMessageError)?;

        let def = self.shared.queues().get(&queue).map(|q| q.def.clone());
        msg.redelivered = false;

        match def.and_then(|def| def.dead_letter_to.map(|to| (def.retry_name, to))) {
            // the retry queue's TTL elapses immediately
            Some((Some(_), _)) => {
                msg.death_count += 1;
                self.shared.push_back(&queue, msg);
            }
            Some((None, target)) => {
                msg.death_count += 1;
                self.shared.push_back(&target, msg);
            }
            None => {
                debug!(queue, "rejected message discarded");
                self.shared.notify.notify_waiters();
            }
        }

        Ok(())
    }

    async fn cancel(&self, consumer_tag: &str) -> Result<(), AmqpError> {
        self.state
            .cancelled
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .insert(consumer_tag.to_owned());

        self.shared.notify.notify_waiters();
        Ok(())
    }

    async fn close(&self) -> Result<(), AmqpError> {
        self.state.release(&self.shared);
        Ok(())
    }
}
