// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Broker Abstraction
//!
//! The [`Broker`] trait is the caller-facing API of the delivery subsystem. It is
//! implemented by the lapin-backed [`RabbitMQBroker`](crate::rabbitmq::RabbitMQBroker),
//! by the [`NoopBroker`](crate::noop::NoopBroker) used when no broker is configured,
//! and by the [`InMemoryBroker`](crate::memory::InMemoryBroker).
//!
//! Policies shared by every implementation live in the provided methods: delayed
//! setup provisioning and the best-effort publish path.

use crate::{
    config::RabbitMQConfigs,
    consumer::ConsumerHandle,
    delayed::{self, DelayedSetup},
    errors::AmqpError,
    exchange::ExchangeDefinition,
    handler::ConsumerHandler,
    message::Envelope,
    noop::NoopBroker,
    publisher,
    queue::{QueueBinding, QueueDefinition, QueueHandle},
    rabbitmq::RabbitMQBroker,
};
use async_trait::async_trait;
use std::{future::Future, sync::Arc};
use tracing::{debug, error, info};

/// Caller-facing API of a message broker.
///
/// Every operation can be called concurrently from several tasks. Once `close` was
/// called, or when the broker never connected, declarations and subscriptions fail
/// with [`AmqpError::NotInitialized`] while publishing silently succeeds.
#[async_trait]
pub trait Broker: Send + Sync {
    /// True only while both the connection and the channel are usable.
    fn is_initialized(&self) -> bool;

    /// Declares an exchange. Repeating an identical declaration has no effect.
    async fn declare_exchange(&self, def: &ExchangeDefinition) -> Result<(), AmqpError>;

    /// Declares a queue. Repeating an identical declaration has no effect.
    async fn declare_queue(&self, def: &QueueDefinition) -> Result<QueueHandle, AmqpError>;

    /// Binds a queue to an exchange. Repeating a binding has no effect.
    async fn bind_queue(&self, binding: &QueueBinding) -> Result<(), AmqpError>;

    /// Hands a fully built envelope to the broker.
    async fn publish_envelope(
        &self,
        exchange: &str,
        routing_key: &str,
        envelope: Envelope,
    ) -> Result<(), AmqpError>;

    /// Starts a manual-ack subscription and its delivery loop.
    ///
    /// Each delivery is acknowledged when `handler` succeeds and rejected without
    /// requeue when it fails.
    ///
    /// # Parameters
    /// * `queue` - Queue to consume
    /// * `consumer_tag` - Tag of the subscription, empty to let the broker pick one
    /// * `handler` - Handler of every delivery
    ///
    /// # Returns
    /// A handle on the running delivery loop
    async fn consume(
        &self,
        queue: &str,
        consumer_tag: &str,
        handler: Arc<dyn ConsumerHandler>,
    ) -> Result<ConsumerHandle, AmqpError>;

    /// Releases the broker resources. The broker can not be reused afterwards.
    async fn close(&self) -> Result<(), AmqpError>;

    /// Declares the exchanges, queue and binding that implement delayed delivery.
    ///
    /// Does nothing when the broker is not initialized.
    async fn declare_delayed_setup(&self, setup: &DelayedSetup) -> Result<(), AmqpError> {
        delayed::provision(self, setup).await
    }

    /// Publishes `payload` as a persistent message, expiring after `delay_ms`
    /// milliseconds when `delay_ms > 0`.
    ///
    /// # Parameters
    /// * `exchange` - Target exchange, the delay exchange for delayed messages
    /// * `routing_key` - Routing key, the delay queue name for delayed messages
    /// * `payload` - JSON encoded message body
    /// * `delay_ms` - Per-message TTL in milliseconds, 0 for none
    ///
    /// Publishing is best effort: without an initialized broker this succeeds
    /// without doing anything.
    async fn publish(
        &self,
        exchange: &str,
        routing_key: &str,
        payload: &[u8],
        delay_ms: u64,
    ) -> Result<(), AmqpError> {
        if !self.is_initialized() {
            debug!(exchange, routing_key, "broker not initialized, skipping publish");
            return Ok(());
        }

        let envelope = publisher::new_envelope(payload, delay_ms);
        self.publish_envelope(exchange, routing_key, envelope).await
    }
}

/// Connects to the configured broker.
///
/// Without a configured address this returns a [`NoopBroker`], so the rest of the
/// system can run without a broker.
pub async fn connect(cfg: &RabbitMQConfigs) -> Result<Arc<dyn Broker>, AmqpError> {
    let Some(address) = cfg.address() else {
        info!("no rabbitmq address configured, running in no-op mode");
        return Ok(Arc::new(NoopBroker));
    };

    let broker = RabbitMQBroker::connect(address, &cfg.connection_name).await?;
    Ok(Arc::new(broker))
}

/// Runs `f` with the broker and closes the broker afterwards, whatever `f` returned.
///
/// An error from `f` takes precedence over an error from closing.
pub async fn scoped<F, Fut, T>(broker: Arc<dyn Broker>, f: F) -> Result<T, AmqpError>
where
    F: FnOnce(Arc<dyn Broker>) -> Fut,
    Fut: Future<Output = Result<T, AmqpError>>,
{
    let result = f(broker.clone()).await;
    let closed = broker.close().await;

    match (result, closed) {
        (Err(err), Err(close_err)) => {
            error!(error = close_err.to_string(), "failure to close broker after error");
            Err(err)
        }
        (Err(err), _) => Err(err),
        (Ok(_), Err(close_err)) => Err(close_err),
        (Ok(value), Ok(())) => Ok(value),
    }
}
