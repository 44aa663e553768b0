// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # RabbitMQ Topology Management
//!
//! Declares the queues of the dispatch protocol. Declaration is idempotent:
//! every producer, worker and poller installs the topology on startup, and a
//! redeclaration only fails when an existing queue was declared with
//! incompatible properties.

use crate::{
    broker::BrokerChannel,
    configs::RabbitMQConfigs,
    errors::AmqpError,
    queue::{jobs_queue, results_queue, QueueDefinition},
};
use async_trait::async_trait;
use tracing::debug;

/// Trait defining the interface for topology management.
#[async_trait]
pub trait Topology<'tp> {
    /// Adds a queue definition to the topology.
    fn queue(self, def: &'tp QueueDefinition) -> Self;

    /// Declares every registered queue on the broker.
    async fn install(&self) -> Result<(), AmqpError>;
}

/// Topology installed over a [`BrokerChannel`].
pub struct AmqpTopology<'tp> {
    channel: &'tp dyn BrokerChannel,
    pub(crate) queues: Vec<&'tp QueueDefinition>,
}

impl<'tp> AmqpTopology<'tp> {
    pub fn new(channel: &'tp dyn BrokerChannel) -> AmqpTopology<'tp> {
        AmqpTopology {
            channel,
            queues: vec![],
        }
    }
}

#[async_trait]
impl<'tp> Topology<'tp> for AmqpTopology<'tp> {
    fn queue(mut self, def: &'tp QueueDefinition) -> Self {
        self.queues.push(def);
        self
    }

    /// Declares each queue after its retry queue and DLQ, so dead-letter
    /// targets exist before anything can be routed to them.
    async fn install(&self) -> Result<(), AmqpError> {
        for def in &self.queues {
            if let Some(retry) = def.retry_definition() {
                self.channel.declare_queue(&retry).await?;
            }

            if let Some(dlq) = def.dlq_definition() {
                self.channel.declare_queue(&dlq).await?;
            }

            self.channel.declare_queue(def).await?;
        }

        debug!(queues = self.queues.len(), "topology installed");

        Ok(())
    }
}

/// Declares the jobs and results queues.
pub async fn ensure_topology(
    channel: &dyn BrokerChannel,
    cfg: &RabbitMQConfigs,
) -> Result<(), AmqpError> {
    let jobs = jobs_queue(cfg);
    let results = results_queue();

    AmqpTopology::new(channel)
        .queue(&jobs)
        .queue(&results)
        .install()
        .await
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::broker::MockBrokerChannel;
    use mockall::Sequence;

    #[tokio::test]
    async fn installs_dead_letter_targets_before_their_source() {
        let mut channel = MockBrokerChannel::new();
        let mut seq = Sequence::new();

        for name in ["problems-retry", "problems-dlq", "problems", "solutions"] {
            channel
                .expect_declare_queue()
                .withf(move |def| def.name() == name)
                .times(1)
                .in_sequence(&mut seq)
                .returning(|_| Ok(()));
        }

        ensure_topology(&channel, &RabbitMQConfigs::default())
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn stops_at_the_first_failed_declaration() {
        let mut channel = MockBrokerChannel::new();
        channel
            .expect_declare_queue()
            .times(1)
            .returning(|def| Err(AmqpError::DeclareQueueError(def.name().to_owned())));

        let err = ensure_topology(&channel, &RabbitMQConfigs::default())
            .await
            .unwrap_err();
        assert_eq!(err, AmqpError::DeclareQueueError("problems-retry".to_owned()));
    }
}
