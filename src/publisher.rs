// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Job and Result Publisher
//!
//! Enqueues jobs on the jobs queue and results on a results queue. Publishing
//! is fire-and-forget: a successful return means the broker accepted the
//! frame, not that the message reached disk.

use crate::{
    broker::{BrokerChannel, MessageProperties},
    channel::JSON_CONTENT_TYPE,
    errors::AmqpError,
    message::{Job, JobResult},
    otel,
    queue::JOBS_QUEUE,
};
use opentelemetry::Context;
use std::{collections::BTreeMap, sync::Arc};
use tracing::debug;
use uuid::Uuid;

/// Publishes protocol messages over one channel.
pub struct RabbitMQPublisher {
    channel: Arc<dyn BrokerChannel>,
}

impl RabbitMQPublisher {
    /// Creates a publisher on `channel`. The caller keeps ownership of the
    /// channel's lifecycle.
    pub fn new(channel: Arc<dyn BrokerChannel>) -> RabbitMQPublisher {
        RabbitMQPublisher { channel }
    }

    /// Publishes raw bytes to the tail of `queue`.
    ///
    /// The message is persistent, carries a fresh message id, and the trace
    /// context of `ctx` in its headers.
    pub async fn publish(&self, ctx: &Context, queue: &str, data: &[u8]) -> Result<(), AmqpError> {
        self.publish_with(ctx, queue, data, None).await
    }

    /// Enqueues a job. Workers publish its result to `reply_to` when set.
    pub async fn enqueue_job(
        &self,
        ctx: &Context,
        job: &Job,
        reply_to: Option<&str>,
    ) -> Result<(), AmqpError> {
        self.publish_with(ctx, JOBS_QUEUE, &job.encode()?, reply_to)
            .await?;

        debug!(job_id = %job.id, "job enqueued");
        Ok(())
    }

    /// Enqueues a result on `queue`.
    pub async fn enqueue_result(
        &self,
        ctx: &Context,
        queue: &str,
        result: &JobResult,
    ) -> Result<(), AmqpError> {
        self.publish(ctx, queue, &result.encode()?).await?;

        debug!(job_id = %result.id, queue, "result enqueued");
        Ok(())
    }

    async fn publish_with(
        &self,
        ctx: &Context,
        queue: &str,
        data: &[u8],
        reply_to: Option<&str>,
    ) -> Result<(), AmqpError> {
        let mut headers = BTreeMap::new();
        otel::inject(ctx, &mut headers);

        let properties = MessageProperties {
            message_id: Some(Uuid::new_v4().to_string()),
            content_type: Some(JSON_CONTENT_TYPE.to_owned()),
            reply_to: reply_to.map(str::to_owned),
            headers,
            persistent: true,
        };

        self.channel.publish(queue, data, &properties).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{broker::MockBrokerChannel, queue::RESULTS_QUEUE};
    use serde_json::json;
    use std::sync::Mutex;

    #[tokio::test]
    async fn job_goes_to_jobs_queue_with_reply_to() {
        let mut channel = MockBrokerChannel::new();
        channel
            .expect_publish()
            .withf(|queue, data, props| {
                let job = Job::decode(data).unwrap();
                queue == "problems"
                    && job.id == "j-1"
                    && props.reply_to.as_deref() == Some("solutions.j-1")
                    && props.persistent
                    && props.message_id.is_some()
                    && props.content_type.as_deref() == Some(JSON_CONTENT_TYPE)
            })
            .times(1)
            .returning(|_, _, _| Ok(()));

        let publisher = RabbitMQPublisher::new(Arc::new(channel));
        let job = Job {
            id: "j-1".to_owned(),
            problem: json!({"locations": [[0, 0]]}),
        };

        publisher
            .enqueue_job(&Context::new(), &job, Some("solutions.j-1"))
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn raw_publish_is_persistent_with_a_fresh_id_per_message() {
        let ids = Arc::new(Mutex::new(Vec::new()));

        let mut channel = MockBrokerChannel::new();
        let seen = ids.clone();
        channel
            .expect_publish()
            .withf(|queue, data, props| {
                queue == "solutions.7"
                    && data == b"{}"
                    && props.persistent
                    && props.reply_to.is_none()
                    && props.content_type.as_deref() == Some(JSON_CONTENT_TYPE)
            })
            .times(2)
            .returning(move |_, _, props| {
                seen.lock().unwrap().extend(props.message_id.clone());
                Ok(())
            });

        let publisher = RabbitMQPublisher::new(Arc::new(channel));
        for _ in 0..2 {
            publisher
                .publish(&Context::new(), "solutions.7", b"{}")
                .await
                .unwrap();
        }

        let ids = ids.lock().unwrap();
        assert_eq!(ids.len(), 2);
        assert_ne!(ids[0], ids[1]);
    }

    #[tokio::test]
    async fn transport_failures_surface_to_the_caller() {
        let mut channel = MockBrokerChannel::new();
        channel
            .expect_publish()
            .returning(|_, _, _| Err(AmqpError::PublishingError));

        let publisher = RabbitMQPublisher::new(Arc::new(channel));
        let err = publisher
            .enqueue_result(&Context::new(), RESULTS_QUEUE, &JobResult::new("x", None))
            .await
            .unwrap_err();

        assert_eq!(err, AmqpError::PublishingError);
    }
}
