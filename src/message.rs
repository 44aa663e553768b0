// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Message Contracts
//!
//! Job and result bodies exchanged between independently deployed producers,
//! workers and pollers. Both are UTF-8 JSON:
//!
//! - job: `{"id": <string>, "problem": <object>}`
//! - result: `{"id": <string>, "solution": <object> | null}`

use crate::errors::AmqpError;
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use serde_json::Value;
use tracing::error;
use uuid::Uuid;

/// A submitted problem awaiting a worker.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Job {
    pub id: String,
    pub problem: Value,
}

impl Job {
    /// Creates a job with a fresh UUIDv4 id.
    pub fn new(problem: Value) -> Job {
        Job {
            id: Uuid::new_v4().to_string(),
            problem,
        }
    }

    pub fn encode(&self) -> Result<Vec<u8>, AmqpError> {
        encode(self)
    }

    pub fn decode(data: &[u8]) -> Result<Job, AmqpError> {
        decode(data)
    }
}

/// The outcome of a job. `solution` is `None` when the solver found no
/// feasible solution.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobResult {
    pub id: String,
    pub solution: Option<Value>,
}

impl JobResult {
    pub fn new(id: &str, solution: Option<Value>) -> JobResult {
        JobResult {
            id: id.to_owned(),
            solution,
        }
    }

    pub fn encode(&self) -> Result<Vec<u8>, AmqpError> {
        encode(self)
    }

    pub fn decode(data: &[u8]) -> Result<JobResult, AmqpError> {
        decode(data)
    }
}

fn encode<T: Serialize>(value: &T) -> Result<Vec<u8>, AmqpError> {
    serde_json::to_vec(value).map_err(|err| {
        error!(error = err.to_string(), "failure to serialize message");
        AmqpError::InternalError
    })
}

fn decode<T: DeserializeOwned>(data: &[u8]) -> Result<T, AmqpError> {
    serde_json::from_slice(data).map_err(|err| AmqpError::DecodeError(err.to_string()))
}
