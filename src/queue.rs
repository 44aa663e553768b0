// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Queue Definitions
//!
//! The two durable queues of the dispatch protocol and the builder used to
//! describe them. The jobs queue carries a retry queue and a Dead Letter
//! Queue (DLQ) so that a job whose solve keeps failing is parked for
//! inspection instead of being redelivered forever.

use crate::configs::RabbitMQConfigs;
use lapin::types::{AMQPValue, LongInt, LongString, ShortString};
use std::collections::BTreeMap;

/// Queue of submitted problems. Part of the wire contract.
pub const JOBS_QUEUE: &str = "problems";
/// Queue of computed solutions. Part of the wire contract.
pub const RESULTS_QUEUE: &str = "solutions";

/// Constant for the header field used to specify a dead letter exchange
pub const AMQP_HEADERS_DEAD_LETTER_EXCHANGE: &str = "x-dead-letter-exchange";
/// Constant for the header field used to specify a dead letter routing key
pub const AMQP_HEADERS_DEAD_LETTER_ROUTING_KEY: &str = "x-dead-letter-routing-key";
/// Constant for the header field used to specify message TTL
pub const AMQP_HEADERS_MESSAGE_TTL: &str = "x-message-ttl";
/// Constant for the header field used to expire an unused queue
pub const AMQP_HEADERS_EXPIRES: &str = "x-expires";

/// Definition of a RabbitMQ queue with its configuration parameters.
///
/// Built with chained setters. Besides what is declared on the broker, a
/// definition carries the retry bound consumers enforce; use
/// [`QueueDefinition::is_compatible`] to decide whether two definitions may
/// be declared over each other.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct QueueDefinition {
    pub(crate) name: String,
    pub(crate) durable: bool,
    pub(crate) ttl: Option<i32>,
    pub(crate) expires: Option<i32>,
    pub(crate) dead_letter_to: Option<String>,
    pub(crate) dlq_name: Option<String>,
    pub(crate) retry_name: Option<String>,
    pub(crate) retry_ttl: Option<i32>,
    pub(crate) retries: Option<i32>,
}

impl QueueDefinition {
    /// Creates a new, non-durable queue definition with the given name.
    pub fn new(name: &str) -> QueueDefinition {
        QueueDefinition {
            name: name.to_owned(),
            ..Default::default()
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Makes the queue durable, persisting across broker restarts.
    pub fn durable(mut self) -> Self {
        self.durable = true;
        self
    }

    /// Deletes the queue after it has gone unused for `expires` milliseconds.
    pub fn expires(mut self, expires: i32) -> Self {
        self.expires = Some(expires);
        self
    }

    /// Adds a Dead Letter Queue named `<queue>-dlq`.
    ///
    /// Consumers publish messages that exhausted their retries there.
    pub fn with_dlq(mut self) -> Self {
        self.dlq_name = Some(format!("{}-dlq", self.name));
        self
    }

    /// Adds a retry queue named `<queue>-retry`.
    ///
    /// Messages rejected from this queue dead-letter into the retry queue,
    /// wait `ttl` milliseconds and dead-letter back. The broker's `x-death`
    /// count tells consumers how many times that happened; `retries` is the
    /// bound they enforce.
    pub fn with_retry(mut self, ttl: i32, retries: i32) -> Self {
        self.retry_name = Some(format!("{}-retry", self.name));
        self.retries = Some(retries);
        self.retry_ttl = Some(ttl);
        self.dead_letter_to = self.retry_name.clone();
        self
    }

    /// Definition of the retry queue, if one is configured.
    pub fn retry_definition(&self) -> Option<QueueDefinition> {
        let name = self.retry_name.as_ref()?;

        Some(QueueDefinition {
            name: name.clone(),
            durable: self.durable,
            ttl: self.retry_ttl,
            dead_letter_to: Some(self.name.clone()),
            ..Default::default()
        })
    }

    /// Definition of the DLQ, if one is configured.
    pub fn dlq_definition(&self) -> Option<QueueDefinition> {
        let name = self.dlq_name.as_ref()?;

        Some(QueueDefinition {
            name: name.clone(),
            durable: self.durable,
            ..Default::default()
        })
    }

    /// Number of redeliveries consumers allow before dead-lettering.
    pub fn max_retries(&self) -> i64 {
        self.retries.unwrap_or_default() as i64
    }

    /// Whether the broker accepts declaring `other` over an existing queue
    /// declared as `self`: same name, durability and arguments. Consumer-side
    /// settings such as the retry bound are not part of the declaration.
    pub fn is_compatible(&self, other: &QueueDefinition) -> bool {
        self.name == other.name
            && self.durable == other.durable
            && self.arguments() == other.arguments()
    }

    /// Queue arguments as sent with `queue.declare`.
    pub(crate) fn arguments(&self) -> BTreeMap<ShortString, AMQPValue> {
        let mut args = BTreeMap::new();

        if let Some(target) = &self.dead_letter_to {
            args.insert(
                ShortString::from(AMQP_HEADERS_DEAD_LETTER_EXCHANGE),
                AMQPValue::LongString(LongString::from("")),
            );
            args.insert(
                ShortString::from(AMQP_HEADERS_DEAD_LETTER_ROUTING_KEY),
                AMQPValue::LongString(LongString::from(target.clone())),
            );
        }

        if let Some(ttl) = self.ttl {
            args.insert(
                ShortString::from(AMQP_HEADERS_MESSAGE_TTL),
                AMQPValue::LongInt(LongInt::from(ttl)),
            );
        }

        if let Some(expires) = self.expires {
            args.insert(
                ShortString::from(AMQP_HEADERS_EXPIRES),
                AMQPValue::LongInt(LongInt::from(expires)),
            );
        }

        args
    }
}

/// The jobs queue with its retry queue and DLQ.
pub fn jobs_queue(cfg: &RabbitMQConfigs) -> QueueDefinition {
    QueueDefinition::new(JOBS_QUEUE)
        .durable()
        .with_retry(cfg.retry_ttl_ms, cfg.max_redeliveries)
        .with_dlq()
}

/// The shared results queue.
pub fn results_queue() -> QueueDefinition {
    QueueDefinition::new(RESULTS_QUEUE).durable()
}

/// Name of the reply queue dedicated to one job.
pub fn reply_queue_name(job_id: &str) -> String {
    format!("{RESULTS_QUEUE}.{job_id}")
}

/// A reply queue dedicated to one job, removed by the broker once unused.
pub fn reply_queue(job_id: &str, cfg: &RabbitMQConfigs) -> QueueDefinition {
    QueueDefinition::new(&reply_queue_name(job_id))
        .durable()
        .expires(cfg.reply_queue_expires_ms)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn jobs_queue_routes_rejections_through_retry_queue() {
        let def = jobs_queue(&RabbitMQConfigs::default());
        assert_eq!(def.name(), "problems");
        assert!(def.durable);

        let args = def.arguments();
        assert_eq!(
            args.get(AMQP_HEADERS_DEAD_LETTER_ROUTING_KEY),
            Some(&AMQPValue::LongString(LongString::from("problems-retry")))
        );

        let retry = def.retry_definition().unwrap();
        assert_eq!(retry.name(), "problems-retry");
        assert_eq!(retry.ttl, Some(5000));
        assert_eq!(retry.dead_letter_to.as_deref(), Some("problems"));

        let dlq = def.dlq_definition().unwrap();
        assert_eq!(dlq.name(), "problems-dlq");
        assert!(dlq.arguments().is_empty());
    }

    #[test]
    fn results_queue_is_plain_durable() {
        let def = results_queue();
        assert_eq!(def.name(), "solutions");
        assert!(def.durable);
        assert!(def.arguments().is_empty());
        assert!(def.retry_definition().is_none());
    }

    #[test]
    fn retry_bound_does_not_affect_compatibility() {
        let lenient = jobs_queue(&RabbitMQConfigs {
            max_redeliveries: 7,
            ..Default::default()
        });
        let strict = jobs_queue(&RabbitMQConfigs::default());
        assert_ne!(lenient, strict);
        assert!(lenient.is_compatible(&strict));

        let slower = jobs_queue(&RabbitMQConfigs {
            retry_ttl_ms: 60_000,
            ..Default::default()
        });
        assert!(slower.is_compatible(&strict));
        assert!(!slower
            .retry_definition()
            .unwrap()
            .is_compatible(&strict.retry_definition().unwrap()));
    }

    #[test]
    fn plain_and_dead_lettered_queues_are_incompatible() {
        let plain = QueueDefinition::new(JOBS_QUEUE).durable();
        let jobs = jobs_queue(&RabbitMQConfigs::default());
        assert!(!plain.is_compatible(&jobs));
        assert!(!results_queue().is_compatible(&QueueDefinition::new(RESULTS_QUEUE)));
    }

    #[test]
    fn reply_queue_expires() {
        let def = reply_queue("abc", &RabbitMQConfigs::default());
        assert_eq!(def.name(), "solutions.abc");
        assert_eq!(
            def.arguments().get(AMQP_HEADERS_EXPIRES),
            Some(&AMQPValue::LongInt(600_000))
        );
    }
}
