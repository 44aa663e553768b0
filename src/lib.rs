// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

mod otel;

pub mod broker;
pub mod channel;
pub mod client;
pub mod configs;
pub mod errors;
pub mod memory;
pub mod message;
pub mod poller;
pub mod publisher;
pub mod queue;
pub mod retry;
pub mod solver;
pub mod topology;
pub mod worker;
