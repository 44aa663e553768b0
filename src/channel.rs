// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # AMQP Connection and Channel Management
//!
//! `AmqpConnectionManager` owns one RabbitMQ connection, establishes it lazily
//! and re-establishes it when it drops. Every caller gets its own channel on
//! top of that connection through the [`Broker`] trait; `AmqpChannel` adapts
//! a lapin channel to [`BrokerChannel`].

use crate::{
    broker::{Broker, BrokerChannel, Envelope, EnvelopeStream, MessageProperties},
    configs::RabbitMQConfigs,
    errors::AmqpError,
    queue::QueueDefinition,
};
use async_trait::async_trait;
use futures_util::StreamExt;
use lapin::{
    message::Delivery,
    options::{
        BasicAckOptions, BasicCancelOptions, BasicConsumeOptions, BasicGetOptions,
        BasicNackOptions, BasicPublishOptions, BasicQosOptions, QueueDeclareOptions,
    },
    protocol::basic::AMQPProperties,
    types::{AMQPValue, FieldTable, LongString, ShortString},
    BasicProperties, Channel, Connection, ConnectionProperties,
};
use std::{collections::BTreeMap, sync::Arc};
use tokio::{sync::Mutex, time::sleep};
use tracing::{debug, error, warn};

/// Content type of every message this crate publishes.
pub const JSON_CONTENT_TYPE: &str = "application/json";
/// Constant for the x-death header used in RabbitMQ's dead-lettering mechanism
pub const AMQP_HEADERS_X_DEATH: &str = "x-death";
/// Constant for the count field in the x-death header
pub const AMQP_HEADERS_COUNT: &str = "count";

const DELIVERY_MODE_PERSISTENT: u8 = 2;
const REPLY_SUCCESS: u16 = 200;

/// Owns the broker connection shared by every channel this process opens.
///
/// Connection establishment is serialized behind a mutex so concurrent
/// callers never perform duplicate handshakes.
pub struct AmqpConnectionManager {
    cfg: RabbitMQConfigs,
    connection: Mutex<Option<Arc<Connection>>>,
}

impl AmqpConnectionManager {
    /// Creates a manager. No connection is made until the first channel is
    /// requested.
    ///
    /// # Parameters
    /// * `cfg` - Broker url, connection name and handshake retry settings
    ///
    /// # Returns
    /// The manager, shared by every component of the process
    pub fn new(cfg: RabbitMQConfigs) -> Arc<AmqpConnectionManager> {
        Arc::new(AmqpConnectionManager {
            cfg,
            connection: Mutex::new(None),
        })
    }

    /// Returns the open connection, establishing a new one if there is none
    /// or the previous one dropped.
    pub async fn connection(&self) -> Result<Arc<Connection>, AmqpError> {
        let mut guard = self.connection.lock().await;

        if let Some(conn) = guard.as_ref() {
            if conn.status().connected() {
                return Ok(conn.clone());
            }
            warn!("amqp connection lost, reconnecting");
        }

        let conn = Arc::new(self.connect_with_retry().await?);
        *guard = Some(conn.clone());

        Ok(conn)
    }

    /// Attempts the handshake up to `connect_attempts` times with a fixed
    /// delay between attempts.
    async fn connect_with_retry(&self) -> Result<Connection, AmqpError> {
        let attempts = self.cfg.connect_attempts.max(1);

        for attempt in 1..=attempts {
            debug!(attempt, "creating amqp connection...");
            let options = ConnectionProperties::default()
                .with_connection_name(LongString::from(self.cfg.connection_name.clone()));

            match Connection::connect(&self.cfg.url, options).await {
                Ok(conn) => {
                    debug!("amqp connected");
                    return Ok(conn);
                }
                Err(err) if attempt < attempts => {
                    warn!(
                        error = err.to_string(),
                        attempt,
                        attempts,
                        "failure to connect, retrying in {:?}",
                        self.cfg.connect_delay()
                    );
                    sleep(self.cfg.connect_delay()).await;
                }
                Err(err) => {
                    error!(error = err.to_string(), attempts, "failure to connect");
                }
            }
        }

        Err(AmqpError::ConnectionError)
    }

    /// Closes the connection if one is open. Errors from a connection that
    /// is already closing are swallowed.
    pub async fn close(&self) {
        let Some(conn) = self.connection.lock().await.take() else {
            return;
        };

        if !conn.status().connected() {
            return;
        }

        if let Err(err) = conn.close(REPLY_SUCCESS, "closing").await {
            debug!(error = err.to_string(), "connection was already closed");
        }
    }
}

#[async_trait]
impl Broker for AmqpConnectionManager {
    async fn open_channel(&self) -> Result<Arc<dyn BrokerChannel>, AmqpError> {
        let conn = self.connection().await?;

        debug!("creating amqp channel...");
        match conn.create_channel().await {
            Ok(channel) => {
                debug!("channel created");
                Ok(Arc::new(AmqpChannel::new(channel)))
            }
            Err(err) => {
                error!(error = err.to_string(), "error to create the channel");
                Err(AmqpError::ChannelError)
            }
        }
    }
}

/// A lapin channel seen through [`BrokerChannel`].
pub struct AmqpChannel {
    channel: Channel,
}

impl AmqpChannel {
    pub fn new(channel: Channel) -> AmqpChannel {
        AmqpChannel { channel }
    }
}

#[async_trait]
impl BrokerChannel for AmqpChannel {
    async fn declare_queue(&self, def: &QueueDefinition) -> Result<(), AmqpError> {
        debug!("creating queue: {}", def.name);

        match self
            .channel
            .queue_declare(
                &def.name,
                QueueDeclareOptions {
                    passive: false,
                    durable: def.durable,
                    exclusive: false,
                    auto_delete: false,
                    nowait: false,
                },
                FieldTable::from(def.arguments()),
            )
            .await
        {
            Err(err) => {
                error!(error = err.to_string(), name = %def.name, "error to declare the queue");
                Err(AmqpError::DeclareQueueError(def.name.clone()))
            }
            _ => {
                debug!("queue: {} was created", def.name);
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
        match self
            .channel
            .basic_publish(
                "",
                queue,
                BasicPublishOptions {
                    immediate: false,
                    mandatory: false,
                },
                data,
                basic_properties(properties),
            )
            .await
        {
            Err(err) => {
                error!(error = err.to_string(), queue, "error publishing message");
                Err(AmqpError::PublishingError)
            }
            _ => Ok(()),
        }
    }

    async fn get(&self, queue: &str) -> Result<Option<Envelope>, AmqpError> {
        match self
            .channel
            .basic_get(queue, BasicGetOptions { no_ack: false })
            .await
        {
            Ok(Some(message)) => Ok(Some(envelope(message.delivery))),
            Ok(None) => Ok(None),
            Err(err) => {
                error!(error = err.to_string(), queue, "error fetching message");
                Err(AmqpError::ConsumerError(err.to_string()))
            }
        }
    }

    async fn consume(
        &self,
        queue: &str,
        consumer_tag: &str,
        prefetch: u16,
    ) -> Result<EnvelopeStream, AmqpError> {
        if let Err(err) = self
            .channel
            .basic_qos(prefetch, BasicQosOptions { global: false })
            .await
        {
            error!(error = err.to_string(), "error to configure qos");
            return Err(AmqpError::QoSDeclarationError(err.to_string()));
        }

        let consumer = match self
            .channel
            .basic_consume(
                queue,
                consumer_tag,
                BasicConsumeOptions {
                    no_local: false,
                    no_ack: false,
                    exclusive: false,
                    nowait: false,
                },
                FieldTable::default(),
            )
            .await
        {
            Err(err) => {
                error!(error = err.to_string(), "error to create the consumer");
                Err(AmqpError::ConsumerError(err.to_string()))
            }
            Ok(c) => Ok(c),
        }?;

        Ok(consumer
            .map(|result| {
                result
                    .map(envelope)
                    .map_err(|err| AmqpError::ConsumerError(err.to_string()))
            })
            .boxed())
    }

    async fn ack(&self, delivery_tag: u64) -> Result<(), AmqpError> {
        self.channel
            .basic_ack(delivery_tag, BasicAckOptions { multiple: false })
            .await
            .map_err(|err| {
                error!(error = err.to_string(), "error whiling ack msg");
                AmqpError::AckMessageError
            })
    }

    async fn reject(&self, delivery_tag: u64) -> Result<(), AmqpError> {
        self.channel
            .basic_nack(
                delivery_tag,
                BasicNackOptions {
                    multiple: false,
                    requeue: false,
                },
            )
            .await
            .map_err(|err| {
                error!(error = err.to_string(), "error whiling nack msg");
                AmqpError::NackMessageError
            })
    }

    async fn cancel(&self, consumer_tag: &str) -> Result<(), AmqpError> {
        self.channel
            .basic_cancel(consumer_tag, BasicCancelOptions { nowait: false })
            .await
            .map_err(|err| {
                error!(error = err.to_string(), consumer_tag, "error to cancel the consumer");
                AmqpError::ConsumerError(err.to_string())
            })
    }

    async fn close(&self) -> Result<(), AmqpError> {
        if !self.channel.status().connected() {
            return Ok(());
        }

        match self.channel.close(REPLY_SUCCESS, "closing").await {
            Ok(_) => Ok(()),
            // lost a race with the broker or the connection closing underneath us
            Err(_) if !self.channel.status().connected() => Ok(()),
            Err(err) => {
                error!(error = err.to_string(), "error to close the channel");
                Err(AmqpError::CloseError("channel".to_owned()))
            }
        }
    }
}

fn basic_properties(properties: &MessageProperties) -> BasicProperties {
    let headers: BTreeMap<ShortString, AMQPValue> = properties
        .headers
        .iter()
        .map(|(key, value)| {
            (
                ShortString::from(key.clone()),
                AMQPValue::LongString(LongString::from(value.clone())),
            )
        })
        .collect();

    let mut props = BasicProperties::default()
        .with_content_type(ShortString::from(
            properties
                .content_type
                .clone()
                .unwrap_or_else(|| JSON_CONTENT_TYPE.to_owned()),
        ))
        .with_headers(FieldTable::from(headers));

    if let Some(id) = &properties.message_id {
        props = props.with_message_id(ShortString::from(id.clone()));
    }

    if let Some(reply_to) = &properties.reply_to {
        props = props.with_reply_to(ShortString::from(reply_to.clone()));
    }

    if properties.persistent {
        props = props.with_delivery_mode(DELIVERY_MODE_PERSISTENT);
    }

    props
}

fn envelope(delivery: Delivery) -> Envelope {
    Envelope {
        delivery_tag: delivery.delivery_tag,
        death_count: death_count(&delivery.properties),
        properties: message_properties(&delivery.properties),
        redelivered: delivery.redelivered,
        data: delivery.data,
    }
}

fn message_properties(props: &AMQPProperties) -> MessageProperties {
    let headers = props
        .headers()
        .as_ref()
        .map(|table| {
            table
                .inner()
                .iter()
                .filter_map(|(key, value)| {
                    let AMQPValue::LongString(value) = value else {
                        return None;
                    };
                    let value = std::str::from_utf8(value.as_bytes()).ok()?;
                    Some((key.to_string(), value.to_owned()))
                })
                .collect()
        })
        .unwrap_or_default();

    MessageProperties {
        message_id: props.message_id().as_ref().map(|v| v.to_string()),
        content_type: props.content_type().as_ref().map(|v| v.to_string()),
        reply_to: props.reply_to().as_ref().map(|v| v.to_string()),
        headers,
        persistent: *props.delivery_mode() == Some(DELIVERY_MODE_PERSISTENT),
    }
}

/// Reads the dead-letter count of the most recent `x-death` entry.
fn death_count(props: &AMQPProperties) -> i64 {
    props
        .headers()
        .as_ref()
        .and_then(|headers| headers.inner().get(AMQP_HEADERS_X_DEATH))
        .and_then(|value| value.as_array())
        .and_then(|arr| arr.as_slice().first())
        .and_then(|value| value.as_field_table())
        .and_then(|table| table.inner().get(AMQP_HEADERS_COUNT))
        .and_then(|value| value.as_long_long_int())
        .unwrap_or_default()
}
