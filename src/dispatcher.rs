// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Message Dispatcher
//!
//! Registers one handler per queue and starts every subscription at once. Each
//! registration gets its own delivery loop, so a slow queue never holds back the
//! others.

use crate::{broker::Broker, consumer::ConsumerHandle, errors::AmqpError, handler::ConsumerHandler};
use futures_util::future::join_all;
use std::sync::Arc;
use tracing::{error, info};

/// Associates a queue with the handler of its deliveries.
#[derive(Clone)]
pub struct DispatcherDefinition {
    pub(crate) queue: String,
    pub(crate) consumer_tag: String,
    pub(crate) handler: Arc<dyn ConsumerHandler>,
}

/// Starts and supervises the consumers of a set of queues.
pub struct Dispatcher {
    broker: Arc<dyn Broker>,
    pub(crate) dispatchers_def: Vec<DispatcherDefinition>,
}

impl Dispatcher {
    /// Creates a dispatcher without registrations.
    pub fn new(broker: Arc<dyn Broker>) -> Self {
        Dispatcher {
            broker,
            dispatchers_def: vec![],
        }
    }

    /// Registers `handler` for `queue`, the broker picks the consumer tag.
    ///
    /// # Returns
    /// Self for method chaining
    pub fn register(self, queue: &str, handler: Arc<dyn ConsumerHandler>) -> Self {
        self.register_with_tag(queue, "", handler)
    }

    /// Registers `handler` for `queue` under an explicit consumer tag.
    pub fn register_with_tag(
        mut self,
        queue: &str,
        consumer_tag: &str,
        handler: Arc<dyn ConsumerHandler>,
    ) -> Self {
        self.dispatchers_def.push(DispatcherDefinition {
            queue: queue.to_owned(),
            consumer_tag: consumer_tag.to_owned(),
            handler,
        });
        self
    }

    /// Starts one subscription per registration.
    ///
    /// If a subscription is refused, the error is returned and the loops already
    /// started keep running until their channel closes.
    pub async fn start(&self) -> Result<Vec<ConsumerHandle>, AmqpError> {
        let mut handles = vec![];

        for def in &self.dispatchers_def {
            let handle = self
                .broker
                .consume(&def.queue, &def.consumer_tag, def.handler.clone())
                .await
                .inspect_err(|err| {
                    error!(error = err.to_string(), queue = %def.queue, "failure to create the consumer")
                })?;

            info!(queue = %def.queue, consumer_tag = handle.consumer_tag(), "consumer started");
            handles.push(handle);
        }

        Ok(handles)
    }

    /// Starts every subscription and waits until all delivery loops terminate.
    pub async fn consume_blocking(&self) -> Result<(), AmqpError> {
        let handles = self.start().await?;

        let finished = join_all(handles.into_iter().map(ConsumerHandle::wait)).await;
        for res in finished {
            if res.is_err() {
                error!("tokio process error");
                return Err(AmqpError::InternalError);
            }
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        handler::handler_fn,
        memory::InMemoryBroker,
        noop::NoopBroker,
        queue::QueueDefinition,
    };
    use std::time::Duration;

    #[tokio::test]
    async fn starts_one_loop_per_registration() {
        let broker = Arc::new(InMemoryBroker::new());
        broker.declare_queue(&QueueDefinition::new("jobs")).await.unwrap();
        broker.declare_queue(&QueueDefinition::new("emails")).await.unwrap();

        let handles = Dispatcher::new(broker.clone())
            .register("jobs", handler_fn(|_| Ok(())))
            .register_with_tag("emails", "mailer", handler_fn(|_| Ok(())))
            .start()
            .await
            .unwrap();

        assert_eq!(handles.len(), 2);
        assert_eq!(handles[0].queue(), "jobs");
        assert!(handles[0].consumer_tag().starts_with("amq.ctag-"));
        assert_eq!(handles[1].consumer_tag(), "mailer");
    }

    #[tokio::test]
    async fn consume_blocking_returns_once_the_broker_closes() {
        let broker = Arc::new(InMemoryBroker::new());
        broker.declare_queue(&QueueDefinition::new("jobs")).await.unwrap();

        let dispatcher = Dispatcher::new(broker.clone()).register("jobs", handler_fn(|_| Ok(())));

        let closer = {
            let broker = broker.clone();
            tokio::spawn(async move {
                tokio::time::sleep(Duration::from_millis(50)).await;
                broker.close().await
            })
        };

        tokio::time::timeout(Duration::from_secs(5), dispatcher.consume_blocking())
            .await
            .expect("dispatcher should stop after close")
            .unwrap();
        closer.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn refused_subscription_is_reported() {
        let res = Dispatcher::new(Arc::new(NoopBroker))
            .register("jobs", handler_fn(|_| Ok(())))
            .consume_blocking()
            .await;

        assert!(matches!(res, Err(AmqpError::NotInitialized(_))));
    }
}
