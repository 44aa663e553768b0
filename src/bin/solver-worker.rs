// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

use clap::{Parser, ValueEnum};
use solver_dispatch::{
    channel::AmqpConnectionManager, configs::RabbitMQConfigs, errors::AmqpError,
    solver::NearestNeighbourSolver, worker::Worker,
};
use std::{process::ExitCode, sync::Arc};
use tracing::{error, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

#[derive(Debug, Clone, Copy, ValueEnum)]
enum LogFormat {
    Json,
    Pretty,
}

/// Consumes routing problems from RabbitMQ and publishes their solutions.
///
/// Broker settings are read from `RABBITMQ_*` environment variables.
#[derive(Debug, Parser)]
#[command(name = "solver-worker", version)]
struct Args {
    /// Log filter used when `RUST_LOG` is unset.
    #[arg(short, long, env = "LOG_LEVEL", default_value = "info")]
    log_level: String,

    #[arg(long, env = "LOG_FORMAT", value_enum, default_value_t = LogFormat::Pretty)]
    log_format: LogFormat,

    /// Consumer tag announced to the broker.
    #[arg(long, default_value = "solver-worker")]
    consumer_tag: String,
}

fn init_logging(log_level: &str, log_format: LogFormat) -> Result<(), AmqpError> {
    let env_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(log_level));
    let registry = tracing_subscriber::registry().with(env_filter);

    match log_format {
        LogFormat::Json => registry
            .with(tracing_subscriber::fmt::layer().json())
            .try_init(),
        LogFormat::Pretty => registry
            .with(tracing_subscriber::fmt::layer().pretty())
            .try_init(),
    }
    .map_err(|err| AmqpError::ConfigError(err.to_string()))
}

async fn shutdown_signal() {
    if let Err(err) = tokio::signal::ctrl_c().await {
        error!(error = err.to_string(), "failure to listen for shutdown signal");
        // never resolve, the worker keeps running
        std::future::pending::<()>().await;
    }
    info!("shutdown signal received");
}

async fn run(args: Args) -> Result<(), AmqpError> {
    let cfg = RabbitMQConfigs::from_env()?;
    let manager = AmqpConnectionManager::new(cfg.clone());

    let worker = Worker::new(manager.clone(), Arc::new(NearestNeighbourSolver), cfg)
        .with_consumer_tag(&args.consumer_tag);

    let outcome = worker.run(shutdown_signal()).await;
    manager.close().await;

    outcome
}

#[tokio::main]
async fn main() -> ExitCode {
    let args = Args::parse();

    if let Err(err) = init_logging(&args.log_level, args.log_format) {
        eprintln!("failure to install logging: {err}");
        return ExitCode::FAILURE;
    }

    info!(version = env!("CARGO_PKG_VERSION"), "starting solver worker");

    match run(args).await {
        Ok(()) => {
            info!("solver worker exited");
            ExitCode::SUCCESS
        }
        Err(err) => {
            error!(error = err.to_string(), kind = ?err.kind(), "solver worker failed");
            ExitCode::FAILURE
        }
    }
}
