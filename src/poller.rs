// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Result Poller
//!
//! Picks the result of one job out of a results queue without blocking.
//!
//! Each call opens a dedicated channel, performs a bounded number of
//! non-blocking fetches and closes the channel on every exit path. Results
//! that belong to other jobs are never acknowledged: they stay held by this
//! channel until it closes, then become visible to other pollers again.
//!
//! On the shared `solutions` queue any concurrent poller can hold another
//! caller's result for the duration of its own call, so under concurrency a
//! result may take several retrieval calls to surface. Per-job reply queues
//! ([`crate::configs::ReplyMode::PerJob`]) avoid the scan entirely.

use crate::{
    broker::{Broker, BrokerChannel},
    errors::AmqpError,
    message::JobResult,
    queue::{results_queue, QueueDefinition},
};
use std::{sync::Arc, time::Duration};
use tokio::time::sleep;
use tracing::{debug, warn};

/// Budget of one retrieval call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PollSettings {
    /// Number of fetches per call.
    pub attempts: u32,
    /// Sleep after a fetch that found the queue empty.
    pub interval: Duration,
}

impl Default for PollSettings {
    fn default() -> Self {
        PollSettings {
            attempts: 5,
            interval: Duration::from_millis(100),
        }
    }
}

/// Non-blocking lookup of job results.
pub struct ResultPoller {
    broker: Arc<dyn Broker>,
}

impl ResultPoller {
    /// Creates a poller opening one channel per call on `broker`.
    pub fn new(broker: Arc<dyn Broker>) -> ResultPoller {
        ResultPoller { broker }
    }

    /// Looks for the result of `job_id` on the shared results queue.
    ///
    /// `Ok(None)` means not yet available; callers retry later.
    pub async fn await_result(
        &self,
        job_id: &str,
        settings: &PollSettings,
    ) -> Result<Option<JobResult>, AmqpError> {
        self.await_on(&results_queue(), job_id, settings).await
    }

    /// Looks for the result of `job_id` on `queue`, declaring it first.
    ///
    /// # Parameters
    /// * `queue` - Results queue to scan, shared or dedicated to the job
    /// * `job_id` - Id of the job whose result is wanted
    /// * `settings` - Number of fetches and the pause after an empty one
    ///
    /// # Returns
    /// The claimed result, `None` if it did not show up within the budget, or
    /// the broker error that ended the scan
    pub async fn await_on(
        &self,
        queue: &QueueDefinition,
        job_id: &str,
        settings: &PollSettings,
    ) -> Result<Option<JobResult>, AmqpError> {
        let channel = self.broker.open_channel().await?;

        let outcome = self.scan(channel.as_ref(), queue, job_id, settings).await;

        if let Err(err) = channel.close().await {
            warn!(error = err.to_string(), "failure to close poller channel");
        }

        outcome
    }

    async fn scan(
        &self,
        channel: &dyn BrokerChannel,
        queue: &QueueDefinition,
        job_id: &str,
        settings: &PollSettings,
    ) -> Result<Option<JobResult>, AmqpError> {
        channel.declare_queue(queue).await?;

        for attempt in 1..=settings.attempts {
            let Some(envelope) = channel.get(queue.name()).await? else {
                debug!(attempt, job_id, "no result available");
                sleep(settings.interval).await;
                continue;
            };

            match JobResult::decode(&envelope.data) {
                Ok(result) if result.id == job_id => {
                    channel.ack(envelope.delivery_tag).await?;
                    debug!(attempt, job_id, "result claimed");
                    return Ok(Some(result));
                }
                Ok(result) => {
                    debug!(attempt, job_id, other = %result.id, "skipping foreign result");
                }
                Err(err) => {
                    warn!(error = err.to_string(), "skipping undecodable result");
                }
            }
        }

        Ok(None)
    }
}
