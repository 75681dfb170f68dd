// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # RabbitMQ Broker
//!
//! [`RabbitMQBroker`] owns one connection and one channel. Every operation takes a
//! clone of the channel out of a short critical section and issues its command on
//! it; lapin serializes the frames of concurrent callers on the channel, so
//! publishers, declarations and consumers can share the broker freely.
//!
//! `close` empties the handle slot: afterwards declarations and subscriptions fail
//! with `NotInitialized` and publishing becomes a silent no-op.

use crate::{
    broker::Broker,
    channel::{new_amqp_channel, REPLY_SUCCESS},
    consumer::{spawn_delivery_loop, ConsumerHandle},
    errors::AmqpError,
    exchange::ExchangeDefinition,
    handler::ConsumerHandler,
    message::{Acknowledger, Delivery, Envelope},
    queue::{QueueBinding, QueueDefinition, QueueHandle},
};
use async_trait::async_trait;
use futures_util::StreamExt;
use lapin::{
    acker::Acker,
    options::{
        BasicAckOptions, BasicConsumeOptions, BasicNackOptions, BasicPublishOptions,
        QueueBindOptions,
    },
    types::FieldTable,
    Channel, Connection,
};
use std::sync::{Arc, Mutex};
use tracing::{debug, error, warn};

struct Handles {
    connection: Option<Arc<Connection>>,
    channel: Option<Arc<Channel>>,
}

/// Broker backed by a RabbitMQ connection and a single channel.
pub struct RabbitMQBroker {
    handles: Mutex<Handles>,
}

impl RabbitMQBroker {
    /// Opens the connection and the channel.
    pub async fn connect(uri: &str, connection_name: &str) -> Result<Self, AmqpError> {
        let (connection, channel) = new_amqp_channel(uri, connection_name).await?;
        Ok(Self::from_handles(connection, channel))
    }

    /// Wraps an already opened connection and channel.
    pub fn from_handles(connection: Arc<Connection>, channel: Arc<Channel>) -> Self {
        RabbitMQBroker {
            handles: Mutex::new(Handles {
                connection: Some(connection),
                channel: Some(channel),
            }),
        }
    }

    fn channel(&self, op: &str) -> Result<Arc<Channel>, AmqpError> {
        let handles = self.handles.lock().map_err(|_| AmqpError::InternalError)?;

        match (&handles.connection, &handles.channel) {
            (Some(conn), Some(channel))
                if conn.status().connected() && channel.status().connected() =>
            {
                Ok(channel.clone())
            }
            _ => {
                error!(op, "rabbitmq connection is not initialized");
                Err(AmqpError::NotInitialized(op.to_owned()))
            }
        }
    }
}

#[async_trait]
impl Broker for RabbitMQBroker {
    fn is_initialized(&self) -> bool {
        let Ok(handles) = self.handles.lock() else {
            return false;
        };

        match (&handles.connection, &handles.channel) {
            (Some(conn), Some(channel)) => {
                conn.status().connected() && channel.status().connected()
            }
            _ => false,
        }
    }

    async fn declare_exchange(&self, def: &ExchangeDefinition) -> Result<(), AmqpError> {
        let channel = self.channel(&format!("declare exchange `{}`", def.name))?;
        debug!("creating exchange: {}", def.name);

        match channel
            .exchange_declare(
                &def.name,
                def.kind.into(),
                def.options(),
                def.arguments(),
            )
            .await
        {
            Err(err) => {
                error!(
                    error = err.to_string(),
                    name = %def.name,
                    "error to declare the exchange"
                );
                Err(AmqpError::DeclareExchangeError(def.name.clone()))
            }
            _ => {
                debug!("exchange: {} was created", def.name);
                Ok(())
            }
        }
    }

    async fn declare_queue(&self, def: &QueueDefinition) -> Result<QueueHandle, AmqpError> {
        let channel = self.channel(&format!("declare queue `{}`", def.name))?;
        debug!("creating queue: {}", def.name);

        if def.dead_letters_to_itself() {
            error!(name = %def.name, "queue would dead-letter into itself");
            return Err(AmqpError::DeclareQueueError(def.name.clone()));
        }

        match channel
            .queue_declare(&def.name, def.options(), def.field_table())
            .await
        {
            Err(err) => {
                error!(error = err.to_string(), name = %def.name, "error to declare the queue");
                Err(AmqpError::DeclareQueueError(def.name.clone()))
            }
            Ok(queue) => {
                debug!("queue: {} was created", queue.name());
                Ok(QueueHandle {
                    name: queue.name().to_string(),
                    message_count: queue.message_count(),
                    consumer_count: queue.consumer_count(),
                })
            }
        }
    }

    async fn bind_queue(&self, binding: &QueueBinding) -> Result<(), AmqpError> {
        let channel = self.channel(&format!(
            "bind queue `{}` to exchange `{}`",
            binding.queue_name, binding.exchange_name
        ))?;

        debug!(
            "binding queue: {} to the exchange: {} with the key: {}",
            binding.queue_name, binding.exchange_name, binding.routing_key
        );

        match channel
            .queue_bind(
                &binding.queue_name,
                &binding.exchange_name,
                &binding.routing_key,
                QueueBindOptions {
                    nowait: binding.no_wait,
                },
                FieldTable::default(),
            )
            .await
        {
            Err(err) => {
                error!(error = err.to_string(), "error to bind queue to exchange");
                Err(AmqpError::BindingExchangeToQueueError(
                    binding.exchange_name.clone(),
                    binding.queue_name.clone(),
                ))
            }
            _ => Ok(()),
        }
    }

    async fn publish_envelope(
        &self,
        exchange: &str,
        routing_key: &str,
        envelope: Envelope,
    ) -> Result<(), AmqpError> {
        let channel = match self.channel("publish") {
            Ok(channel) => channel,
            Err(_) => {
                debug!(exchange, routing_key, "broker not initialized, skipping publish");
                return Ok(());
            }
        };

        match channel
            .basic_publish(
                exchange,
                routing_key,
                BasicPublishOptions {
                    immediate: false,
                    mandatory: false,
                },
                &envelope.payload,
                envelope.properties(),
            )
            .await
        {
            Err(err) => {
                error!(error = err.to_string(), exchange, routing_key, "error publishing message");
                Err(AmqpError::PublishingError(err.to_string()))
            }
            _ => Ok(()),
        }
    }

    async fn consume(
        &self,
        queue: &str,
        consumer_tag: &str,
        handler: Arc<dyn ConsumerHandler>,
    ) -> Result<ConsumerHandle, AmqpError> {
        let channel = self.channel(&format!("consume queue `{}`", queue))?;

        let consumer = match channel
            .basic_consume(
                queue,
                consumer_tag,
                BasicConsumeOptions {
                    no_local: false,
                    no_ack: false,
                    exclusive: false,
                    nowait: false,
                },
                FieldTable::default(),
            )
            .await
        {
            Err(err) => {
                error!(error = err.to_string(), queue, "error to create the consumer");
                Err(AmqpError::ConsumerDeclarationError(queue.to_owned()))
            }
            Ok(c) => Ok(c),
        }?;

        let tag = consumer.tag().to_string();
        debug!(queue, consumer_tag = %tag, "consumer created");

        let deliveries = consumer.map(|result| {
            result
                .map(from_lapin)
                .map_err(|err| AmqpError::ConsumerError(err.to_string()))
        });

        Ok(spawn_delivery_loop(queue, &tag, deliveries, handler))
    }

    async fn close(&self) -> Result<(), AmqpError> {
        let (connection, channel) = {
            let mut handles = self.handles.lock().map_err(|_| AmqpError::InternalError)?;
            (handles.connection.take(), handles.channel.take())
        };

        if let Some(channel) = channel {
            if let Err(err) = channel.close(REPLY_SUCCESS, "closing").await {
                warn!(error = err.to_string(), "failure to close the channel");
            }
        }

        if let Some(connection) = connection {
            if let Err(err) = connection.close(REPLY_SUCCESS, "closing").await {
                error!(error = err.to_string(), "failure to close the connection");
                return Err(AmqpError::CloseError(err.to_string()));
            }
        }

        debug!("rabbitmq connection closed");
        Ok(())
    }
}

/// Settles deliveries through the lapin acker of the delivery.
struct LapinAcknowledger {
    acker: Acker,
}

#[async_trait]
impl Acknowledger for LapinAcknowledger {
    async fn ack(&self, delivery_tag: u64) -> Result<(), AmqpError> {
        self.acker
            .ack(BasicAckOptions { multiple: false })
            .await
            .map_err(|err| {
                error!(error = err.to_string(), delivery_tag, "error whiling ack msg");
                AmqpError::AckMessageError(delivery_tag)
            })
    }

    async fn reject(&self, delivery_tag: u64, requeue: bool) -> Result<(), AmqpError> {
        self.acker
            .nack(BasicNackOptions {
                multiple: false,
                requeue,
            })
            .await
            .map_err(|err| {
                error!(error = err.to_string(), delivery_tag, "error whiling nack msg");
                AmqpError::NackMessageError(delivery_tag)
            })
    }
}

fn from_lapin(delivery: lapin::message::Delivery) -> Delivery {
    let envelope = Envelope::from_properties(delivery.data, &delivery.properties);

    Delivery::new(
        delivery.delivery_tag,
        delivery.exchange.as_str(),
        delivery.routing_key.as_str(),
        delivery.redelivered,
        envelope,
        Arc::new(LapinAcknowledger {
            acker: delivery.acker,
        }),
    )
}
