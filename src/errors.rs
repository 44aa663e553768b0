// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Error Types for the Solver Dispatch Protocol
//!
//! `AmqpError` covers every failure the crate can surface: connection
//! establishment, channel and queue handling, message publishing and
//! consumption, payload decoding and solver failures. Each variant belongs to
//! an [`ErrorKind`], which is what retry predicates and API layers match on.

use thiserror::Error;

/// Coarse classification of an [`AmqpError`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    /// Transport or handshake failure, retried at connection boundaries.
    Connection,
    /// Protocol failure on an established connection.
    Broker,
    /// Malformed message body.
    Decode,
    /// The solver raised an error.
    Solver,
    /// A submission was rejected before reaching the broker.
    InvalidInput,
    /// Configuration could not be loaded or is invalid.
    Config,
}

/// Represents errors that can occur while dispatching jobs through RabbitMQ.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum AmqpError {
    /// Internal errors that don't fit into other categories
    #[error("internal error")]
    InternalError,

    /// Configuration loading or validation failure
    #[error("invalid configuration `{0}`")]
    ConfigError(String),

    /// Error establishing a connection to the RabbitMQ server
    #[error("failure to connect")]
    ConnectionError,

    /// Error creating a channel from an established connection
    #[error("failure to create a channel")]
    ChannelError,

    /// Error declaring a queue with the given name
    #[error("failure to declare a queue `{0}`")]
    DeclareQueueError(String),

    /// Error configuring Quality of Service parameters
    #[error("failure to configure qos `{0}`")]
    QoSDeclarationError(String),

    /// Error publishing a message
    #[error("failure to publish")]
    PublishingError,

    /// Error publishing a message to the Dead Letter Queue (DLQ)
    #[error("failure to publish to dlq")]
    PublishingToDQLError,

    /// Error fetching or consuming a message
    #[error("failure to consume message `{0}`")]
    ConsumerError(String),

    /// Error acknowledging a message
    #[error("failure to ack message")]
    AckMessageError,

    /// Error negative-acknowledging a message
    #[error("failure to nack message")]
    NackMessageError,

    /// Error closing a channel or connection that was still open
    #[error("failure to close `{0}`")]
    CloseError(String),

    /// Error parsing a message payload
    #[error("failure to parse payload `{0}`")]
    DecodeError(String),

    /// The solver failed for the given job
    #[error("solver failure `{0}`")]
    SolverFailure(String),

    /// A submitted problem was rejected before publishing
    #[error("invalid problem `{0}`")]
    InvalidProblem(String),
}

impl AmqpError {
    /// Returns the kind this error belongs to.
    pub fn kind(&self) -> ErrorKind {
        match self {
            AmqpError::ConnectionError | AmqpError::ChannelError => ErrorKind::Connection,
            AmqpError::DecodeError(_) => ErrorKind::Decode,
            AmqpError::SolverFailure(_) => ErrorKind::Solver,
            AmqpError::InvalidProblem(_) => ErrorKind::InvalidInput,
            AmqpError::ConfigError(_) => ErrorKind::Config,
            AmqpError::InternalError
            | AmqpError::DeclareQueueError(_)
            | AmqpError::QoSDeclarationError(_)
            | AmqpError::PublishingError
            | AmqpError::PublishingToDQLError
            | AmqpError::ConsumerError(_)
            | AmqpError::AckMessageError
            | AmqpError::NackMessageError
            | AmqpError::CloseError(_) => ErrorKind::Broker,
        }
    }

    /// Whether retrying the failed operation on a fresh connection can succeed.
    pub fn is_transient(&self) -> bool {
        self.kind() == ErrorKind::Connection
    }

    /// Whether the caller supplied bad input (a 400-equivalent for an API layer).
    pub fn is_client_error(&self) -> bool {
        self.kind() == ErrorKind::InvalidInput
    }
}
