// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Solve Client
//!
//! The broker-facing half of an API layer: validates and submits problems,
//! and retrieves their results without blocking. Every call works on its own
//! channel, so one client can serve concurrent requests.

use crate::{
    broker::{Broker, BrokerChannel},
    configs::{RabbitMQConfigs, ReplyMode},
    errors::AmqpError,
    message::{Job, JobResult},
    poller::ResultPoller,
    publisher::RabbitMQPublisher,
    queue::reply_queue,
    solver::RouteProblem,
    topology::ensure_topology,
};
use opentelemetry::Context;
use serde::Serialize;
use serde_json::Value;
use std::sync::Arc;
use tracing::{info, warn};

/// Acknowledgement of an accepted submission.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Submission {
    pub id: String,
    /// Where the caller polls for the solution, when the client knows the
    /// retrieval endpoint.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub solution_location: Option<String>,
}

/// Submission and retrieval of routing problems on behalf of an API layer.
pub struct SolveClient {
    broker: Arc<dyn Broker>,
    cfg: RabbitMQConfigs,
    solution_base: Option<String>,
}

impl SolveClient {
    /// Creates a client opening one channel per call on `broker`.
    pub fn new(broker: Arc<dyn Broker>, cfg: RabbitMQConfigs) -> SolveClient {
        SolveClient {
            broker,
            cfg,
            solution_base: None,
        }
    }

    /// Sets the retrieval endpoint base. Submissions then carry
    /// `<base>/<id>` as their solution location.
    pub fn with_solution_base(mut self, base: &str) -> Self {
        self.solution_base = Some(base.trim_end_matches('/').to_owned());
        self
    }

    /// Validates a raw problem and enqueues it as a new job.
    ///
    /// Malformed payloads fail with [`AmqpError::InvalidProblem`] before any
    /// broker interaction.
    pub async fn submit(&self, body: &[u8]) -> Result<Submission, AmqpError> {
        let problem: Value = serde_json::from_slice(body)
            .map_err(|err| AmqpError::InvalidProblem(err.to_string()))?;

        RouteProblem::from_value(&problem).map_err(|err| match err {
            AmqpError::DecodeError(reason) => AmqpError::InvalidProblem(reason),
            other => other,
        })?;

        let job = Job::new(problem);
        let channel = self.broker.open_channel().await?;

        let enqueued = self.enqueue(&channel, &job).await;

        if let Err(err) = channel.close().await {
            warn!(error = err.to_string(), "failure to close submission channel");
        }

        enqueued?;
        info!(job_id = %job.id, "problem submitted");

        Ok(Submission {
            solution_location: self
                .solution_base
                .as_ref()
                .map(|base| format!("{base}/{}", job.id)),
            id: job.id,
        })
    }

    /// Looks up the result of a submitted job once.
    ///
    /// `Ok(None)` means the result is not available yet.
    pub async fn retrieve(&self, id: &str) -> Result<Option<JobResult>, AmqpError> {
        let poller = ResultPoller::new(self.broker.clone());
        let settings = self.cfg.poll_settings();

        match self.cfg.reply_mode {
            ReplyMode::Shared => poller.await_result(id, &settings).await,
            ReplyMode::PerJob => {
                poller
                    .await_on(&reply_queue(id, &self.cfg), id, &settings)
                    .await
            }
        }
    }

    async fn enqueue(&self, channel: &Arc<dyn BrokerChannel>, job: &Job) -> Result<(), AmqpError> {
        ensure_topology(channel.as_ref(), &self.cfg).await?;

        let reply_to = match self.cfg.reply_mode {
            ReplyMode::Shared => None,
            ReplyMode::PerJob => {
                let queue = reply_queue(&job.id, &self.cfg);
                channel.declare_queue(&queue).await?;
                Some(queue.name().to_owned())
            }
        };

        RabbitMQPublisher::new(channel.clone())
            .enqueue_job(&Context::current(), job, reply_to.as_deref())
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        broker::{MockBroker, MockBrokerChannel},
        memory::InMemoryBroker,
        queue::JOBS_QUEUE,
    };

    #[tokio::test]
    async fn malformed_payloads_never_reach_the_broker() {
        let mut broker = MockBroker::new();
        broker.expect_open_channel().never();
        let client = SolveClient::new(Arc::new(broker), RabbitMQConfigs::default());

        for body in [
            &b"not json"[..],
            &br#"{"locations": []}"#[..],
            &br#"{"locations": [[0, 0]], "depot": 4}"#[..],
        ] {
            let err = client.submit(body).await.unwrap_err();
            assert!(matches!(err, AmqpError::InvalidProblem(_)));
            assert!(err.is_client_error());
        }
    }

    #[tokio::test]
    async fn submission_enqueues_a_job_with_a_fresh_id() {
        let broker = InMemoryBroker::new();
        let client = SolveClient::new(Arc::new(broker.clone()), RabbitMQConfigs::default());

        let body = br#"{"locations": [[0, 0], [1, 1]]}"#;
        let first = client.submit(body).await.unwrap();
        let second = client.submit(body).await.unwrap();
        assert_ne!(first.id, second.id);

        let jobs: Vec<Job> = broker
            .ready_messages(JOBS_QUEUE)
            .iter()
            .map(|data| Job::decode(data).unwrap())
            .collect();
        assert_eq!(jobs.len(), 2);
        assert_eq!(jobs[0].id, first.id);
        assert_eq!(jobs[0].problem["locations"][1][0], 1);
    }

    #[tokio::test]
    async fn submission_points_at_its_solution() {
        let broker = InMemoryBroker::new();
        let client = SolveClient::new(Arc::new(broker.clone()), RabbitMQConfigs::default())
            .with_solution_base("http://api.local/api/solve-tsp/");

        let submission = client.submit(br#"{"locations": [[0, 0]]}"#).await.unwrap();
        let expected = format!("http://api.local/api/solve-tsp/{}", submission.id);
        assert_eq!(submission.solution_location.as_deref(), Some(expected.as_str()));
        assert_eq!(
            serde_json::to_value(&submission).unwrap(),
            serde_json::json!({"id": submission.id, "solution_location": expected})
        );

        let bare = SolveClient::new(Arc::new(broker), RabbitMQConfigs::default())
            .submit(br#"{"locations": [[0, 0]]}"#)
            .await
            .unwrap();
        assert_eq!(bare.solution_location, None);
        assert_eq!(
            serde_json::to_value(&bare).unwrap(),
            serde_json::json!({"id": bare.id})
        );
    }

    #[tokio::test]
    async fn per_job_mode_declares_a_reply_queue() {
        let broker = InMemoryBroker::new();
        let cfg = RabbitMQConfigs {
            reply_mode: ReplyMode::PerJob,
            ..Default::default()
        };
        let client = SolveClient::new(Arc::new(broker.clone()), cfg);

        let submission = client
            .submit(br#"{"locations": [[0, 0]]}"#)
            .await
            .unwrap();

        let channel = broker.channel();
        let job = channel.get(JOBS_QUEUE).await.unwrap().unwrap();
        assert_eq!(
            job.properties.reply_to,
            Some(format!("solutions.{}", submission.id))
        );
        assert_eq!(broker.ready_count(&format!("solutions.{}", submission.id)), 0);
    }

    #[tokio::test]
    async fn broker_failures_surface_from_submit() {
        let mut channel = MockBrokerChannel::new();
        channel
            .expect_declare_queue()
            .returning(|def| Err(AmqpError::DeclareQueueError(def.name().to_owned())));
        channel.expect_publish().never();
        channel.expect_close().times(1).returning(|| Ok(()));

        let mut broker = MockBroker::new();
        broker
            .expect_open_channel()
            .return_once(move || Ok(Arc::new(channel) as Arc<dyn BrokerChannel>));

        let client = SolveClient::new(Arc::new(broker), RabbitMQConfigs::default());
        let err = client
            .submit(br#"{"locations": [[0, 0]]}"#)
            .await
            .unwrap_err();

        assert_eq!(err, AmqpError::DeclareQueueError("problems-retry".to_owned()));
        assert!(!err.is_client_error());
    }

    #[tokio::test]
    async fn retrieve_reports_pending_jobs_as_none() {
        let broker = InMemoryBroker::new();
        let cfg = RabbitMQConfigs {
            poll_attempts: 1,
            poll_interval_ms: 1,
            ..Default::default()
        };
        let client = SolveClient::new(Arc::new(broker), cfg);

        assert_eq!(client.retrieve("unknown").await, Ok(None));
    }
}
