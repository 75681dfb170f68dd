// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Error Types for the Delivery Subsystem
//!
//! `AmqpError` covers every failure the broker-facing operations can report:
//! construction (configuration, connection, channel), topology declarations,
//! delayed-delivery provisioning, publishing, consumption and shutdown.
//!
//! `HandlerError` is the business-level failure returned by consumer handlers.
//! It never escapes the consumer loop: it is turned into a reject without requeue.

use std::fmt;
use thiserror::Error;

/// Represents errors that can occur during AMQP/RabbitMQ operations.
#[derive(Error, Debug, PartialEq, Eq)]
pub enum AmqpError {
    /// Internal errors that don't fit into other categories
    #[error("internal error")]
    InternalError,

    /// The configuration could not be loaded
    #[error("failure to load the configuration `{0}`")]
    ConfigError(String),

    /// Error establishing a connection to the RabbitMQ server
    #[error("failure to connect `{0}`")]
    ConnectionError(String),

    /// Error creating a channel from an established connection
    #[error("failure to create a channel `{0}`")]
    ChannelError(String),

    /// The operation needs a live connection and channel
    #[error("broker is not initialized, can not {0}")]
    NotInitialized(String),

    /// Error declaring an exchange with the given name
    #[error("failure to declare an exchange `{0}`")]
    DeclareExchangeError(String),

    /// Error declaring a queue with the given name
    #[error("failure to declare a queue `{0}`")]
    DeclareQueueError(String),

    /// Error binding an exchange to a queue
    #[error("failure to binding exchange `{0}` to queue `{1}`")]
    BindingExchangeToQueueError(String, String),

    /// One of the delayed-delivery declarations failed, the remaining ones were skipped
    #[error("failure to provision delayed delivery at {0}: {1}")]
    DelayedSetupError(DelayedStep, Box<AmqpError>),

    /// Error publishing a message
    #[error("failure to publish `{0}`")]
    PublishingError(String),

    /// Error serializing a message payload
    #[error("failure to serialize payload `{0}`")]
    SerializePayloadError(String),

    /// The broker refused the subscription
    #[error("failure to declare consumer `{0}`")]
    ConsumerDeclarationError(String),

    /// Error consuming a message
    #[error("failure to consume message `{0}`")]
    ConsumerError(String),

    /// Error acknowledging a message
    #[error("failure to ack message `{0}`")]
    AckMessageError(u64),

    /// Error negative-acknowledging a message
    #[error("failure to nack message `{0}`")]
    NackMessageError(u64),

    /// Error closing the connection
    #[error("failure to close the connection `{0}`")]
    CloseError(String),
}

/// The declaration steps of a delayed-delivery setup, in execution order.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DelayedStep {
    ActualExchange,
    DelayQueue,
    DelayExchange,
    DelayBinding,
}

impl fmt::Display for DelayedStep {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let step = match self {
            DelayedStep::ActualExchange => "actual exchange declaration",
            DelayedStep::DelayQueue => "delay queue declaration",
            DelayedStep::DelayExchange => "delay exchange declaration",
            DelayedStep::DelayBinding => "delay queue binding",
        };

        f.write_str(step)
    }
}

/// Failure reported by a consumer handler.
///
/// Any handler failure ends with the delivery rejected without requeue, the
/// variants only carry the reason into the logs and the consumer span.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum HandlerError {
    /// The payload could not be understood by the handler
    #[error("invalid payload: {0}")]
    InvalidPayload(String),

    /// The handler understood the message but could not process it
    #[error("processing failure: {0}")]
    Processing(String),

    /// The handler panicked while processing the message
    #[error("handler panicked: {0}")]
    Panicked(String),
}
