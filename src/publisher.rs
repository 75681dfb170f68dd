// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Message Publisher
//!
//! Builds the envelopes handed to the broker and offers a JSON publisher on top of
//! any [`Broker`]. Every envelope is persistent, time-stamped, carries a fresh
//! message id and the current trace context.

use crate::{broker::Broker, errors::AmqpError, message::Envelope, otel};
use serde::Serialize;
use std::sync::Arc;
use tracing::{debug, error};

/// Builds the envelope of a publish, `delay_ms > 0` sets the per-message expiration.
pub(crate) fn new_envelope(payload: &[u8], delay_ms: u64) -> Envelope {
    let mut envelope = Envelope::new(payload.to_vec()).with_delay(delay_ms);
    otel::inject_current(&mut envelope.headers);
    envelope
}

/// Publishes serializable messages through a broker.
pub struct Publisher {
    broker: Arc<dyn Broker>,
}

impl Publisher {
    /// Creates a publisher sharing `broker`.
    pub fn new(broker: Arc<dyn Broker>) -> Arc<Publisher> {
        Arc::new(Publisher { broker })
    }

    /// Serializes `msg` as JSON and publishes it.
    ///
    /// # Parameters
    /// * `exchange` - Target exchange
    /// * `routing_key` - Routing key of the message
    /// * `msg` - Message to serialize
    /// * `delay_ms` - Per-message TTL in milliseconds, 0 for none
    ///
    /// # Returns
    /// `SerializePayloadError` when `msg` can not be serialized, otherwise the
    /// outcome of the publish
    ///
    /// The publisher never chooses topology: a delayed message must be sent to a
    /// delay exchange with the delay queue name as routing key.
    pub async fn publish_json<T>(
        &self,
        exchange: &str,
        routing_key: &str,
        msg: &T,
        delay_ms: u64,
    ) -> Result<(), AmqpError>
    where
        T: Serialize + ?Sized + Sync,
    {
        self.publish_typed(exchange, routing_key, None, msg, delay_ms)
            .await
    }

    /// Same as [`Publisher::publish_json`], tagging the message with `msg_type`.
    pub async fn publish_typed<T>(
        &self,
        exchange: &str,
        routing_key: &str,
        msg_type: Option<&str>,
        msg: &T,
        delay_ms: u64,
    ) -> Result<(), AmqpError>
    where
        T: Serialize + ?Sized + Sync,
    {
        let payload = serde_json::to_vec(msg).map_err(|err| {
            error!(error = err.to_string(), "failure to serialize payload");
            AmqpError::SerializePayloadError(err.to_string())
        })?;

        if !self.broker.is_initialized() {
            debug!(exchange, routing_key, "broker not initialized, skipping publish");
            return Ok(());
        }

        let mut envelope = new_envelope(&payload, delay_ms);
        if let Some(msg_type) = msg_type {
            envelope = envelope.with_type(msg_type);
        }

        self.broker
            .publish_envelope(exchange, routing_key, envelope)
            .await
    }
}
