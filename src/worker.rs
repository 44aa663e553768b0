// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Solver Worker
//!
//! Consumes jobs from the `problems` queue one at a time, runs the solver and
//! publishes each result before acknowledging the job, so a worker that dies
//! mid-job never loses it: the broker hands the unacknowledged job to the next
//! consumer.
//!
//! Jobs whose solve fails are rejected into the retry queue until the broker's
//! death count reaches the configured bound, then parked on the DLQ together
//! with an `x-failure-reason` header. Jobs that cannot be decoded go to the
//! DLQ right away.

use crate::{
    broker::{Broker, BrokerChannel, Envelope, EnvelopeStream, MessageProperties},
    configs::RabbitMQConfigs,
    errors::AmqpError,
    message::{Job, JobResult},
    otel,
    publisher::RabbitMQPublisher,
    queue::{jobs_queue, QueueDefinition, JOBS_QUEUE, RESULTS_QUEUE},
    retry::retry_with_backoff,
    solver::{RouteProblem, Solver, SolverError},
    topology::ensure_topology,
};
use futures_util::StreamExt;
use opentelemetry::{
    global,
    trace::{Span, Status},
};
use std::{borrow::Cow, future::Future, sync::Arc};
use tracing::{debug, error, info, warn};

/// Header carrying the reason a job was dead-lettered.
pub const AMQP_HEADERS_FAILURE_REASON: &str = "x-failure-reason";

const DEFAULT_CONSUMER_TAG: &str = "solver-worker";

/// What happened to one delivered job.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobOutcome {
    /// A result was published and the job acknowledged.
    Completed,
    /// The solve failed and the job went back through the retry queue.
    Retried,
    /// The job was moved to the DLQ.
    DeadLettered,
}

/// Consumer of the jobs queue.
///
/// Owns no connection itself: every session opens a fresh channel through
/// the [`Broker`], so a worker survives connection loss by re-establishing
/// its session.
pub struct Worker {
    broker: Arc<dyn Broker>,
    solver: Arc<dyn Solver>,
    cfg: RabbitMQConfigs,
    jobs: QueueDefinition,
    consumer_tag: String,
}

impl Worker {
    /// Creates a worker.
    ///
    /// # Parameters
    /// * `broker` - Source of the channels each session runs on
    /// * `solver` - Solver invoked for every job, on the blocking thread pool
    /// * `cfg` - Retry bound, retry TTL and reconnect policy
    ///
    /// # Returns
    /// A worker announcing itself with the `solver-worker` consumer tag
    pub fn new(broker: Arc<dyn Broker>, solver: Arc<dyn Solver>, cfg: RabbitMQConfigs) -> Worker {
        Worker {
            broker,
            solver,
            jobs: jobs_queue(&cfg),
            cfg,
            consumer_tag: DEFAULT_CONSUMER_TAG.to_owned(),
        }
    }

    /// Overrides the consumer tag, e.g. to tell workers apart in the
    /// management UI.
    pub fn with_consumer_tag(mut self, consumer_tag: &str) -> Self {
        self.consumer_tag = consumer_tag.to_owned();
        self
    }

    /// Consumes jobs until `shutdown` resolves.
    ///
    /// Sessions are (re-)established with exponential backoff over transient
    /// errors. `shutdown` is only observed between jobs: a job in progress is
    /// always finished, published and acknowledged first.
    pub async fn run<S>(&self, shutdown: S) -> Result<(), AmqpError>
    where
        S: Future<Output = ()> + Send,
    {
        tokio::pin!(shutdown);
        let policy = self.cfg.reconnect_policy();

        loop {
            let (channel, mut deliveries) = tokio::select! {
                biased;
                _ = &mut shutdown => {
                    info!("shutdown requested before a session was established");
                    return Ok(());
                }
                session = retry_with_backoff(&policy, AmqpError::is_transient, || self.open_session()) => session?,
            };

            info!(queue = JOBS_QUEUE, consumer_tag = %self.consumer_tag, "consuming jobs");

            loop {
                tokio::select! {
                    biased;
                    _ = &mut shutdown => {
                        self.stop(channel.as_ref()).await;
                        return Ok(());
                    }
                    next = deliveries.next() => match next {
                        Some(Ok(envelope)) => {
                            if let Err(err) = self.process(&channel, envelope).await {
                                error!(error = err.to_string(), "session failed while handling a job");
                                break;
                            }
                        }
                        Some(Err(err)) => {
                            error!(error = err.to_string(), "consumer failure");
                            break;
                        }
                        None => {
                            warn!("consumer stream ended");
                            break;
                        }
                    }
                }
            }

            // unacknowledged jobs go back to the queue with the channel
            drop(deliveries);
            if let Err(err) = channel.close().await {
                warn!(error = err.to_string(), "failure to close broken session");
            }
        }
    }

    /// Handles one delivery to completion.
    ///
    /// Solver and decode failures are contained and reported as an outcome.
    /// Broker failures are returned before the job is acknowledged, leaving it
    /// for redelivery.
    pub async fn process(
        &self,
        channel: &Arc<dyn BrokerChannel>,
        envelope: Envelope,
    ) -> Result<JobOutcome, AmqpError> {
        let tracer = global::tracer("solver worker");
        let (ctx, mut span) = otel::new_span(&envelope.properties.headers, &tracer, JOBS_QUEUE);

        let (job, problem) = match decode(&envelope.data) {
            Ok(decoded) => decoded,
            Err(err) => {
                warn!(error = err.to_string(), "removing malformed job, sending to dlq");
                span.record_error(&err);
                span.set_status(Status::Error {
                    description: Cow::from("malformed job"),
                });

                self.dead_letter(channel.as_ref(), &envelope, &err).await?;
                return Ok(JobOutcome::DeadLettered);
            }
        };

        debug!(
            job_id = %job.id,
            redelivered = envelope.redelivered,
            death_count = envelope.death_count,
            "job received"
        );

        let solver = self.solver.clone();
        let solved = tokio::task::spawn_blocking(move || solver.solve(&problem))
            .await
            .unwrap_or_else(|err| Err(SolverError::Failed(err.to_string())));

        match solved {
            Ok(solution) => {
                let result = JobResult::new(&job.id, solution);
                let reply_to = envelope
                    .properties
                    .reply_to
                    .as_deref()
                    .unwrap_or(RESULTS_QUEUE);

                RabbitMQPublisher::new(channel.clone())
                    .enqueue_result(&ctx, reply_to, &result)
                    .await
                    .inspect_err(|err| span.record_error(err))?;

                channel
                    .ack(envelope.delivery_tag)
                    .await
                    .inspect_err(|err| span.record_error(err))?;

                span.set_status(Status::Ok);
                info!(
                    job_id = %job.id,
                    feasible = result.solution.is_some(),
                    reply_to,
                    "job completed"
                );
                Ok(JobOutcome::Completed)
            }
            Err(err) => {
                let err = AmqpError::SolverFailure(err.to_string());
                span.record_error(&err);
                span.set_status(Status::Error {
                    description: Cow::from("solver failure"),
                });

                if envelope.death_count < self.jobs.max_retries() {
                    warn!(
                        job_id = %job.id,
                        error = err.to_string(),
                        attempt = envelope.death_count + 1,
                        "solver failed, requeuing for later"
                    );
                    channel.reject(envelope.delivery_tag).await?;
                    return Ok(JobOutcome::Retried);
                }

                error!(job_id = %job.id, error = err.to_string(), "too many attempts, sending to dlq");
                self.dead_letter(channel.as_ref(), &envelope, &err).await?;
                Ok(JobOutcome::DeadLettered)
            }
        }
    }

    async fn open_session(&self) -> Result<(Arc<dyn BrokerChannel>, EnvelopeStream), AmqpError> {
        let channel = self.broker.open_channel().await?;

        let session = async {
            ensure_topology(channel.as_ref(), &self.cfg).await?;
            channel.consume(JOBS_QUEUE, &self.consumer_tag, 1).await
        }
        .await;

        match session {
            Ok(deliveries) => Ok((channel, deliveries)),
            Err(err) => {
                if let Err(close_err) = channel.close().await {
                    warn!(error = close_err.to_string(), "failure to close channel");
                }
                Err(err)
            }
        }
    }

    async fn stop(&self, channel: &dyn BrokerChannel) {
        if let Err(err) = channel.cancel(&self.consumer_tag).await {
            warn!(error = err.to_string(), "failure to cancel consumer");
        }

        if let Err(err) = channel.close().await {
            warn!(error = err.to_string(), "failure to close channel");
        }

        info!("worker stopped");
    }

    /// Publishes the job to the DLQ with the failure reason, then acks it.
    async fn dead_letter(
        &self,
        channel: &dyn BrokerChannel,
        envelope: &Envelope,
        reason: &AmqpError,
    ) -> Result<(), AmqpError> {
        let Some(dlq) = self.jobs.dlq_name.as_deref() else {
            return channel.reject(envelope.delivery_tag).await;
        };

        let mut headers = envelope.properties.headers.clone();
        headers.insert(AMQP_HEADERS_FAILURE_REASON.to_owned(), reason.to_string());

        let properties = MessageProperties {
            headers,
            persistent: true,
            ..envelope.properties.clone()
        };

        channel
            .publish(dlq, &envelope.data, &properties)
            .await
            .map_err(|err| {
                error!(error = err.to_string(), "failure to send to dlq");
                AmqpError::PublishingToDQLError
            })?;

        channel.ack(envelope.delivery_tag).await
    }
}

fn decode(data: &[u8]) -> Result<(Job, RouteProblem), AmqpError> {
    let job = Job::decode(data)?;
    let problem = RouteProblem::from_value(&job.problem)?;
    Ok((job, problem))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        broker::MockBrokerChannel, memory::InMemoryBroker, queue::reply_queue,
        solver::MockSolver,
    };
    use opentelemetry::Context;
    use serde_json::{json, Value};

    fn problem() -> Value {
        json!({"locations": [[0, 0], [0, 1], [1, 1]]})
    }

    fn worker(broker: &InMemoryBroker, solver: MockSolver, cfg: RabbitMQConfigs) -> Worker {
        Worker::new(Arc::new(broker.clone()), Arc::new(solver), cfg)
    }

    async fn setup(broker: &InMemoryBroker, cfg: &RabbitMQConfigs) -> Arc<dyn BrokerChannel> {
        let channel = broker.open_channel().await.unwrap();
        ensure_topology(channel.as_ref(), cfg).await.unwrap();
        channel
    }

    async fn next_job(channel: &Arc<dyn BrokerChannel>) -> Envelope {
        channel.get(JOBS_QUEUE).await.unwrap().unwrap()
    }

    #[tokio::test]
    async fn publishes_result_then_acks() {
        let broker = InMemoryBroker::new();
        let cfg = RabbitMQConfigs::default();
        let channel = setup(&broker, &cfg).await;

        let job = Job::new(problem());
        RabbitMQPublisher::new(channel.clone())
            .enqueue_job(&Context::new(), &job, None)
            .await
            .unwrap();

        let mut solver = MockSolver::new();
        solver
            .expect_solve()
            .times(1)
            .returning(|_| Ok(Some(json!({"route": [0, 1, 2, 0]}))));

        let outcome = worker(&broker, solver, cfg)
            .process(&channel, next_job(&channel).await)
            .await
            .unwrap();
        assert_eq!(outcome, JobOutcome::Completed);

        let results = broker.ready_messages(RESULTS_QUEUE);
        assert_eq!(results.len(), 1);
        let result = JobResult::decode(&results[0]).unwrap();
        assert_eq!(result.id, job.id);
        assert_eq!(result.solution, Some(json!({"route": [0, 1, 2, 0]})));

        channel.close().await.unwrap();
        assert_eq!(broker.ready_count(JOBS_QUEUE), 0);
    }

    #[tokio::test]
    async fn infeasible_problems_produce_an_empty_solution() {
        let broker = InMemoryBroker::new();
        let cfg = RabbitMQConfigs::default();
        let channel = setup(&broker, &cfg).await;

        let job = Job::new(problem());
        let reply = reply_queue(&job.id, &cfg);
        channel.declare_queue(&reply).await.unwrap();
        RabbitMQPublisher::new(channel.clone())
            .enqueue_job(&Context::new(), &job, Some(reply.name()))
            .await
            .unwrap();

        let mut solver = MockSolver::new();
        solver.expect_solve().returning(|_| Ok(None));

        worker(&broker, solver, cfg)
            .process(&channel, next_job(&channel).await)
            .await
            .unwrap();

        assert_eq!(broker.ready_count(RESULTS_QUEUE), 0);
        let results = broker.ready_messages(reply.name());
        assert_eq!(JobResult::decode(&results[0]).unwrap().solution, None);
    }

    #[tokio::test]
    async fn failing_jobs_are_retried_then_dead_lettered() {
        let broker = InMemoryBroker::new();
        let cfg = RabbitMQConfigs {
            max_redeliveries: 2,
            ..Default::default()
        };
        let channel = setup(&broker, &cfg).await;

        let job = Job::new(problem());
        RabbitMQPublisher::new(channel.clone())
            .enqueue_job(&Context::new(), &job, None)
            .await
            .unwrap();

        let mut solver = MockSolver::new();
        solver
            .expect_solve()
            .times(3)
            .returning(|_| Err(SolverError::Failed("diverged".to_owned())));
        let worker = worker(&broker, solver, cfg);

        let mut outcomes = Vec::new();
        for _ in 0..3 {
            outcomes.push(worker.process(&channel, next_job(&channel).await).await.unwrap());
        }

        assert_eq!(
            outcomes,
            vec![
                JobOutcome::Retried,
                JobOutcome::Retried,
                JobOutcome::DeadLettered
            ]
        );
        assert_eq!(broker.ready_count(JOBS_QUEUE), 0);
        assert_eq!(broker.ready_count(RESULTS_QUEUE), 0);
        assert_eq!(broker.ready_messages("problems-dlq"), vec![job.encode().unwrap()]);
    }

    #[tokio::test]
    async fn malformed_jobs_skip_the_solver() {
        let broker = InMemoryBroker::new();
        let cfg = RabbitMQConfigs::default();
        let channel = setup(&broker, &cfg).await;

        channel
            .publish(JOBS_QUEUE, b"{\"id\": 7}", &MessageProperties::default())
            .await
            .unwrap();
        channel
            .publish(
                JOBS_QUEUE,
                &Job::new(json!({"locations": []})).encode().unwrap(),
                &MessageProperties::default(),
            )
            .await
            .unwrap();

        let mut solver = MockSolver::new();
        solver.expect_solve().never();
        let worker = worker(&broker, solver, cfg);

        for _ in 0..2 {
            let outcome = worker.process(&channel, next_job(&channel).await).await;
            assert_eq!(outcome, Ok(JobOutcome::DeadLettered));
        }
        assert_eq!(broker.ready_count("problems-dlq"), 2);
    }

    #[tokio::test]
    async fn dead_lettered_jobs_carry_the_failure_reason() {
        let job = Job::new(problem());
        let envelope = Envelope {
            delivery_tag: 9,
            data: job.encode().unwrap(),
            properties: MessageProperties::default(),
            redelivered: true,
            death_count: 3,
        };

        let mut channel = MockBrokerChannel::new();
        channel
            .expect_publish()
            .withf(|queue, _, props| {
                queue == "problems-dlq"
                    && props
                        .headers
                        .get(AMQP_HEADERS_FAILURE_REASON)
                        .is_some_and(|reason| reason.contains("diverged"))
            })
            .times(1)
            .returning(|_, _, _| Ok(()));
        channel.expect_ack().times(1).returning(|_| Ok(()));
        channel.expect_reject().never();

        let mut solver = MockSolver::new();
        solver
            .expect_solve()
            .returning(|_| Err(SolverError::Failed("diverged".to_owned())));

        let worker = Worker::new(
            Arc::new(InMemoryBroker::new()),
            Arc::new(solver),
            RabbitMQConfigs::default(),
        );
        let channel: Arc<dyn BrokerChannel> = Arc::new(channel);

        let outcome = worker.process(&channel, envelope).await.unwrap();
        assert_eq!(outcome, JobOutcome::DeadLettered);
    }

    #[tokio::test]
    async fn publish_failures_leave_the_job_unacked() {
        let job = Job::new(problem());
        let envelope = Envelope {
            delivery_tag: 1,
            data: job.encode().unwrap(),
            properties: MessageProperties::default(),
            redelivered: false,
            death_count: 0,
        };

        let mut channel = MockBrokerChannel::new();
        channel
            .expect_publish()
            .returning(|_, _, _| Err(AmqpError::PublishingError));
        channel.expect_ack().never();
        channel.expect_reject().never();

        let mut solver = MockSolver::new();
        solver.expect_solve().returning(|_| Ok(Some(json!({}))));

        let worker = Worker::new(
            Arc::new(InMemoryBroker::new()),
            Arc::new(solver),
            RabbitMQConfigs::default(),
        );
        let channel: Arc<dyn BrokerChannel> = Arc::new(channel);

        let err = worker.process(&channel, envelope).await.unwrap_err();
        assert_eq!(err, AmqpError::PublishingError);
    }
}
