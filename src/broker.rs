// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Broker Abstraction
//!
//! The operations the dispatch protocol needs from a message broker. Every
//! logical operation (a submission, a poll call, a worker session) acquires
//! its own channel through [`Broker::open_channel`] and closes it when done,
//! so no channel is ever shared between unrelated operations.
//!
//! Channel semantics follow AMQP 0-9-1: a fetched message stays invisible to
//! other consumers until it is acknowledged, and is returned to its queue if
//! the channel closes first.

use crate::{errors::AmqpError, queue::QueueDefinition};
use async_trait::async_trait;
use futures_util::stream::BoxStream;
use std::{collections::BTreeMap, sync::Arc};

#[cfg(test)]
use mockall::automock;

/// Stream of deliveries produced by [`BrokerChannel::consume`].
pub type EnvelopeStream = BoxStream<'static, Result<Envelope, AmqpError>>;

/// Properties carried alongside a message body.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MessageProperties {
    pub message_id: Option<String>,
    pub content_type: Option<String>,
    pub reply_to: Option<String>,
    pub headers: BTreeMap<String, String>,
    pub persistent: bool,
}

/// A message fetched from a queue and not yet acknowledged.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Envelope {
    pub delivery_tag: u64,
    pub data: Vec<u8>,
    pub properties: MessageProperties,
    pub redelivered: bool,
    /// How many times the broker dead-lettered this message out of its queue.
    pub death_count: i64,
}

/// Source of channels. Implementations own (and may reuse) the underlying
/// connection.
#[cfg_attr(test, automock)]
#[async_trait]
pub trait Broker: Send + Sync {
    async fn open_channel(&self) -> Result<Arc<dyn BrokerChannel>, AmqpError>;
}

/// A single channel to the broker.
#[cfg_attr(test, automock)]
#[async_trait]
pub trait BrokerChannel: Send + Sync {
    /// Declares a queue. Redeclaring with identical parameters succeeds,
    /// redeclaring with different ones fails with `DeclareQueueError`.
    async fn declare_queue(&self, def: &QueueDefinition) -> Result<(), AmqpError>;

    /// Publishes `data` to `queue` through the default exchange.
    async fn publish(
        &self,
        queue: &str,
        data: &[u8],
        properties: &MessageProperties,
    ) -> Result<(), AmqpError>;

    /// Fetches one message without blocking. `None` when the queue is empty.
    async fn get(&self, queue: &str) -> Result<Option<Envelope>, AmqpError>;

    /// Starts a consumer with at most `prefetch` unacknowledged deliveries.
    async fn consume(
        &self,
        queue: &str,
        consumer_tag: &str,
        prefetch: u16,
    ) -> Result<EnvelopeStream, AmqpError>;

    async fn ack(&self, delivery_tag: u64) -> Result<(), AmqpError>;

    /// Negative-acknowledges without requeue; the message follows its
    /// queue's dead-letter routing.
    async fn reject(&self, delivery_tag: u64) -> Result<(), AmqpError>;

    /// Stops the consumer registered under `consumer_tag`.
    async fn cancel(&self, consumer_tag: &str) -> Result<(), AmqpError>;

    /// Closes the channel, returning unacknowledged messages to their queues.
    /// Closing an already closed channel succeeds.
    async fn close(&self) -> Result<(), AmqpError>;
}
