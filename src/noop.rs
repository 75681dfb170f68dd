// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # No-op Broker
//!
//! Stands in for the broker when none is configured. Declarations and
//! subscriptions fail with `NotInitialized`, publishing silently succeeds.

use crate::{
    broker::Broker,
    consumer::ConsumerHandle,
    errors::AmqpError,
    exchange::ExchangeDefinition,
    handler::ConsumerHandler,
    message::Envelope,
    queue::{QueueBinding, QueueDefinition, QueueHandle},
};
use async_trait::async_trait;
use std::sync::Arc;
use tracing::debug;

#[derive(Debug, Clone, Copy, Default)]
pub struct NoopBroker;

#[async_trait]
impl Broker for NoopBroker {
    fn is_initialized(&self) -> bool {
        false
    }

    async fn declare_exchange(&self, def: &ExchangeDefinition) -> Result<(), AmqpError> {
        Err(AmqpError::NotInitialized(format!(
            "declare exchange `{}`",
            def.name
        )))
    }

    async fn declare_queue(&self, def: &QueueDefinition) -> Result<QueueHandle, AmqpError> {
        Err(AmqpError::NotInitialized(format!(
            "declare queue `{}`",
            def.name
        )))
    }

    async fn bind_queue(&self, binding: &QueueBinding) -> Result<(), AmqpError> {
        Err(AmqpError::NotInitialized(format!(
            "bind queue `{}` to exchange `{}`",
            binding.queue_name, binding.exchange_name
        )))
    }

    async fn publish_envelope(
        &self,
        exchange: &str,
        routing_key: &str,
        _envelope: Envelope,
    ) -> Result<(), AmqpError> {
        debug!(exchange, routing_key, "no-op broker, message dropped");
        Ok(())
    }

    async fn consume(
        &self,
        queue: &str,
        _consumer_tag: &str,
        _handler: Arc<dyn ConsumerHandler>,
    ) -> Result<ConsumerHandle, AmqpError> {
        Err(AmqpError::NotInitialized(format!("consume queue `{}`", queue)))
    }

    async fn close(&self) -> Result<(), AmqpError> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{delayed::DelayedSetup, handler::handler_fn};

    #[tokio::test]
    async fn declarations_fail_without_panicking() {
        let broker = NoopBroker;

        assert_eq!(
            broker.declare_exchange(&ExchangeDefinition::new("ex")).await,
            Err(AmqpError::NotInitialized("declare exchange `ex`".to_owned()))
        );
        assert!(broker
            .declare_queue(&QueueDefinition::new("q"))
            .await
            .is_err());
        assert!(broker
            .bind_queue(&QueueBinding::new("q").exchange("ex"))
            .await
            .is_err());
        assert!(broker
            .consume("q", "", handler_fn(|_| Ok(())))
            .await
            .is_err());
    }

    #[tokio::test]
    async fn publish_delayed_setup_and_close_are_silent() {
        let broker = NoopBroker;

        assert_eq!(broker.publish("ex", "rk", b"{}", 500).await, Ok(()));
        assert_eq!(
            broker
                .declare_delayed_setup(&DelayedSetup::new("ex.delay", "q.delay", "ex.actual", "rk"))
                .await,
            Ok(())
        );
        assert_eq!(broker.close().await, Ok(()));
        assert_eq!(broker.close().await, Ok(()));
    }
}
