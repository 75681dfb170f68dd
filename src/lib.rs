// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

mod consumer;
mod otel;

pub mod broker;
pub mod channel;
pub mod config;
pub mod delayed;
pub mod dispatcher;
pub mod errors;
pub mod exchange;
pub mod handler;
pub mod memory;
pub mod message;
pub mod noop;
pub mod publisher;
pub mod queue;
pub mod rabbitmq;
pub mod topology;

pub use broker::{connect, scoped, Broker};
pub use consumer::ConsumerHandle;
