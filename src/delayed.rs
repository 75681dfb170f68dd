// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Delayed Delivery
//!
//! Delayed delivery is built from plain AMQP features: a message published with a
//! per-message expiration waits in a delay queue that has no consumers. Once the
//! expiration fires the broker dead-letters the message to the actual exchange,
//! which routes it with the actual routing key.
//!
//! ```text
//! publish(delay exchange, delay queue name, payload, ttl)
//!   -> delay exchange -> delay queue --(ttl, dead-letter)--> actual exchange -> bound queues
//! ```
//!
//! Messages with different expirations sharing a delay queue are not guaranteed to
//! come out in publish order.

use crate::{
    broker::Broker,
    errors::{AmqpError, DelayedStep},
    exchange::ExchangeDefinition,
    queue::{QueueBinding, QueueDefinition},
};
use tracing::{debug, error};

/// Names of the entities composing a delayed-delivery path.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DelayedSetup {
    pub(crate) delay_exchange: String,
    pub(crate) delay_queue: String,
    pub(crate) actual_exchange: String,
    pub(crate) actual_routing_key: String,
}

impl DelayedSetup {
    /// Creates a delayed-delivery setup.
    ///
    /// # Parameters
    /// * `delay_exchange` - Exchange delayed messages are published to
    /// * `delay_queue` - Queue holding messages until they expire
    /// * `actual_exchange` - Exchange receiving the messages once expired
    /// * `actual_routing_key` - Routing key used on the actual exchange
    pub fn new(
        delay_exchange: &str,
        delay_queue: &str,
        actual_exchange: &str,
        actual_routing_key: &str,
    ) -> Self {
        DelayedSetup {
            delay_exchange: delay_exchange.to_owned(),
            delay_queue: delay_queue.to_owned(),
            actual_exchange: actual_exchange.to_owned(),
            actual_routing_key: actual_routing_key.to_owned(),
        }
    }

    /// Exchange to use when publishing delayed messages.
    pub fn delay_exchange(&self) -> &str {
        &self.delay_exchange
    }

    /// Routing key to use when publishing delayed messages: the delay queue name.
    pub fn delay_routing_key(&self) -> &str {
        &self.delay_queue
    }

    pub(crate) fn actual_exchange_definition(&self) -> ExchangeDefinition {
        ExchangeDefinition::new(&self.actual_exchange)
            .direct()
            .durable()
    }

    pub(crate) fn delay_queue_definition(&self) -> QueueDefinition {
        QueueDefinition::new(&self.delay_queue)
            .durable()
            .dead_letter(&self.actual_exchange, Some(&self.actual_routing_key))
    }

    pub(crate) fn delay_exchange_definition(&self) -> ExchangeDefinition {
        ExchangeDefinition::new(&self.delay_exchange)
            .direct()
            .durable()
    }

    pub(crate) fn delay_binding(&self) -> QueueBinding {
        QueueBinding::new(&self.delay_queue)
            .exchange(&self.delay_exchange)
            .routing_key(&self.delay_queue)
    }
}

/// Declares, in order, the actual exchange, the delay queue, the delay exchange and
/// the delay binding. The first failure stops the sequence.
pub(crate) async fn provision<B>(broker: &B, setup: &DelayedSetup) -> Result<(), AmqpError>
where
    B: Broker + ?Sized,
{
    if !broker.is_initialized() {
        debug!(
            delay_exchange = %setup.delay_exchange,
            "broker not initialized, skipping delayed setup"
        );
        return Ok(());
    }

    broker
        .declare_exchange(&setup.actual_exchange_definition())
        .await
        .map_err(|err| step_failure(DelayedStep::ActualExchange, err))?;

    broker
        .declare_queue(&setup.delay_queue_definition())
        .await
        .map_err(|err| step_failure(DelayedStep::DelayQueue, err))?;

    broker
        .declare_exchange(&setup.delay_exchange_definition())
        .await
        .map_err(|err| step_failure(DelayedStep::DelayExchange, err))?;

    broker
        .bind_queue(&setup.delay_binding())
        .await
        .map_err(|err| step_failure(DelayedStep::DelayBinding, err))?;

    debug!(
        delay_exchange = %setup.delay_exchange,
        delay_queue = %setup.delay_queue,
        actual_exchange = %setup.actual_exchange,
        actual_routing_key = %setup.actual_routing_key,
        "delayed delivery provisioned"
    );

    Ok(())
}

fn step_failure(step: DelayedStep, err: AmqpError) -> AmqpError {
    error!(error = err.to_string(), step = %step, "failure to provision delayed delivery");
    AmqpError::DelayedSetupError(step, Box::new(err))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        consumer::ConsumerHandle,
        handler::ConsumerHandler,
        message::Envelope,
        queue::QueueHandle,
    };
    use async_trait::async_trait;
    use std::sync::{Arc, Mutex};

    /// Records every declaration and fails the one at `fail_at`.
    struct RecordingBroker {
        calls: Mutex<Vec<String>>,
        fail_at: Option<usize>,
    }

    impl RecordingBroker {
        fn new(fail_at: Option<usize>) -> Self {
            RecordingBroker {
                calls: Mutex::new(vec![]),
                fail_at,
            }
        }

        fn record(&self, call: String) -> Result<(), AmqpError> {
            let mut calls = self.calls.lock().unwrap();
            let idx = calls.len();
            calls.push(call.clone());
            if self.fail_at == Some(idx) {
                return Err(AmqpError::InternalError);
            }
            Ok(())
        }
    }

    #[async_trait]
    impl Broker for RecordingBroker {
        fn is_initialized(&self) -> bool {
            true
        }

        async fn declare_exchange(&self, def: &ExchangeDefinition) -> Result<(), AmqpError> {
            assert!(def.durable);
            self.record(format!("exchange {}", def.name))
        }

        async fn declare_queue(&self, def: &QueueDefinition) -> Result<QueueHandle, AmqpError> {
            let (dlx, dlrk) = def.dead_letter_target().unwrap();
            self.record(format!("queue {} -> {}/{}", def.name, dlx, dlrk.unwrap()))?;
            Ok(QueueHandle {
                name: def.name.clone(),
                message_count: 0,
                consumer_count: 0,
            })
        }

        async fn bind_queue(&self, binding: &QueueBinding) -> Result<(), AmqpError> {
            self.record(format!(
                "bind {} {} {}",
                binding.queue_name, binding.exchange_name, binding.routing_key
            ))
        }

        async fn publish_envelope(&self, _: &str, _: &str, _: Envelope) -> Result<(), AmqpError> {
            unreachable!()
        }

        async fn consume(
            &self,
            _: &str,
            _: &str,
            _: Arc<dyn ConsumerHandler>,
        ) -> Result<ConsumerHandle, AmqpError> {
            unreachable!()
        }

        async fn close(&self) -> Result<(), AmqpError> {
            Ok(())
        }
    }

    fn setup() -> DelayedSetup {
        DelayedSetup::new("ex.delay", "q.delay", "ex.actual", "rk.actual")
    }

    #[tokio::test]
    async fn declares_in_order() {
        let broker = RecordingBroker::new(None);

        broker.declare_delayed_setup(&setup()).await.unwrap();

        assert_eq!(
            *broker.calls.lock().unwrap(),
            vec![
                "exchange ex.actual",
                "queue q.delay -> ex.actual/rk.actual",
                "exchange ex.delay",
                "bind q.delay ex.delay q.delay",
            ]
        );
    }

    #[tokio::test]
    async fn failure_aborts_remaining_steps() {
        let broker = RecordingBroker::new(Some(1));

        let err = broker.declare_delayed_setup(&setup()).await.unwrap_err();

        assert_eq!(
            err,
            AmqpError::DelayedSetupError(DelayedStep::DelayQueue, Box::new(AmqpError::InternalError))
        );
        assert_eq!(broker.calls.lock().unwrap().len(), 2);
    }

    #[tokio::test]
    async fn binding_failure_is_reported_as_last_step() {
        let broker = RecordingBroker::new(Some(3));

        let err = broker.declare_delayed_setup(&setup()).await.unwrap_err();

        assert!(matches!(
            err,
            AmqpError::DelayedSetupError(DelayedStep::DelayBinding, _)
        ));
    }

    #[test]
    fn delayed_publishes_use_the_queue_name_as_key() {
        let setup = setup();
        assert_eq!(setup.delay_exchange(), "ex.delay");
        assert_eq!(setup.delay_routing_key(), "q.delay");
    }
}
