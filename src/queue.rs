// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Queue Management for RabbitMQ
//!
//! This module provides types for defining queues and queue bindings. Queue options
//! are typed (TTL, max length, dead-lettering) and rendered into the AMQP argument
//! table on declaration, so every broker implementation reads the same arguments.

use lapin::types::{AMQPValue, FieldTable, LongInt, LongString, ShortString};
use std::collections::BTreeMap;

/// Constant for the argument used to specify a dead letter exchange
pub const AMQP_HEADERS_DEAD_LETTER_EXCHANGE: &str = "x-dead-letter-exchange";
/// Constant for the argument used to specify a dead letter routing key
pub const AMQP_HEADERS_DEAD_LETTER_ROUTING_KEY: &str = "x-dead-letter-routing-key";
/// Constant for the argument used to specify message TTL
pub const AMQP_HEADERS_MESSAGE_TTL: &str = "x-message-ttl";
/// Constant for the argument used to specify maximum queue length
pub const AMQP_HEADERS_MAX_LENGTH: &str = "x-max-length";
/// Constant for the argument used to specify maximum queue size in bytes
pub const AMQP_HEADERS_MAX_LENGTH_BYTES: &str = "x-max-length-bytes";

/// Definition of a RabbitMQ queue with its configuration parameters.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct QueueDefinition {
    pub(crate) name: String,
    pub(crate) durable: bool,
    pub(crate) delete: bool,
    pub(crate) exclusive: bool,
    pub(crate) passive: bool,
    pub(crate) no_wait: bool,
    pub(crate) ttl: Option<i32>,
    pub(crate) max_length: Option<i32>,
    pub(crate) max_length_bytes: Option<i32>,
    pub(crate) dead_letter_exchange: Option<String>,
    pub(crate) dead_letter_routing_key: Option<String>,
    pub(crate) dlq_name: Option<String>,
    pub(crate) params: BTreeMap<ShortString, AMQPValue>,
}

impl QueueDefinition {
    /// Creates a new queue definition with the given name.
    ///
    /// An empty name asks the broker to generate one.
    ///
    /// # Parameters
    /// * `name` - Name of the queue
    ///
    /// # Returns
    /// A new QueueDefinition instance
    pub fn new(name: &str) -> QueueDefinition {
        QueueDefinition {
            name: name.to_owned(),
            ..Default::default()
        }
    }

    /// Name of the queue, empty when the broker should generate one.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Makes the queue durable, persisting across broker restarts.
    ///
    /// # Returns
    /// Self for method chaining
    pub fn durable(mut self) -> Self {
        self.durable = true;
        self
    }

    /// Sets the queue to auto-delete when its last consumer goes away.
    ///
    /// # Returns
    /// Self for method chaining
    pub fn delete(mut self) -> Self {
        self.delete = true;
        self
    }

    /// Makes the queue exclusive to the connection.
    ///
    /// # Returns
    /// Self for method chaining
    pub fn exclusive(mut self) -> Self {
        self.exclusive = true;
        self
    }

    /// Makes the declaration passive, checking for existence without creating it.
    ///
    /// # Returns
    /// Self for method chaining
    pub fn passive(mut self) -> Self {
        self.passive = true;
        self
    }

    /// Sets no_wait flag, the broker will not answer the declaration.
    ///
    /// # Returns
    /// Self for method chaining
    pub fn no_wait(mut self) -> Self {
        self.no_wait = true;
        self
    }

    /// Sets the message Time-To-Live (TTL) for the queue, in milliseconds.
    ///
    /// Expired messages are dead-lettered when a dead-letter exchange is set.
    ///
    /// # Parameters
    /// * `ttl` - TTL in milliseconds
    ///
    /// # Returns
    /// Self for method chaining
    pub fn ttl(mut self, ttl: i32) -> Self {
        self.ttl = Some(ttl);
        self
    }

    /// Sets the maximum number of messages the queue can hold.
    ///
    /// # Returns
    /// Self for method chaining
    pub fn max_length(mut self, max: i32) -> Self {
        self.max_length = Some(max);
        self
    }

    /// Sets the maximum size in bytes the queue can hold.
    ///
    /// # Returns
    /// Self for method chaining
    pub fn max_length_bytes(mut self, max_bytes: i32) -> Self {
        self.max_length_bytes = Some(max_bytes);
        self
    }

    /// Routes expired and rejected messages to `exchange` using `routing_key`.
    ///
    /// Without a routing key the message keeps its original one.
    ///
    /// # Parameters
    /// * `exchange` - Dead-letter exchange, `""` for the default exchange
    /// * `routing_key` - Routing key replacing the original one
    ///
    /// # Returns
    /// Self for method chaining
    pub fn dead_letter(mut self, exchange: &str, routing_key: Option<&str>) -> Self {
        self.dead_letter_exchange = Some(exchange.to_owned());
        self.dead_letter_routing_key = routing_key.map(str::to_owned);
        self
    }

    /// Adds a Dead Letter Queue (DLQ) named `<name>-dlq`.
    ///
    /// The topology installs the DLQ before the queue itself and, unless an explicit
    /// dead-letter target was set, dead-letters the queue into it.
    ///
    /// # Returns
    /// Self for method chaining
    pub fn with_dlq(mut self) -> Self {
        self.dlq_name = Some(format!("{}-dlq", self.name));
        self
    }

    /// Name of the Dead Letter Queue, `None` unless [`QueueDefinition::with_dlq`] was called.
    pub fn dlq_name(&self) -> Option<&str> {
        self.dlq_name.as_deref()
    }

    /// Adds a raw argument to the declaration.
    ///
    /// # Returns
    /// Self for method chaining
    pub fn param(mut self, key: ShortString, value: AMQPValue) -> Self {
        self.params.insert(key, value);
        self
    }

    pub(crate) fn options(&self) -> lapin::options::QueueDeclareOptions {
        lapin::options::QueueDeclareOptions {
            passive: self.passive,
            durable: self.durable,
            exclusive: self.exclusive,
            auto_delete: self.delete,
            nowait: self.no_wait,
        }
    }

    /// Renders the typed options and the raw arguments into an argument table.
    ///
    /// Typed options win over raw arguments with the same key.
    pub(crate) fn arguments(&self) -> BTreeMap<ShortString, AMQPValue> {
        let mut args = self.params.clone();

        if let Some(ttl) = self.ttl {
            args.insert(
                ShortString::from(AMQP_HEADERS_MESSAGE_TTL),
                AMQPValue::LongInt(LongInt::from(ttl)),
            );
        }

        if let Some(max) = self.max_length {
            args.insert(
                ShortString::from(AMQP_HEADERS_MAX_LENGTH),
                AMQPValue::LongInt(LongInt::from(max)),
            );
        }

        if let Some(max) = self.max_length_bytes {
            args.insert(
                ShortString::from(AMQP_HEADERS_MAX_LENGTH_BYTES),
                AMQPValue::LongInt(LongInt::from(max)),
            );
        }

        if let Some(exchange) = &self.dead_letter_exchange {
            args.insert(
                ShortString::from(AMQP_HEADERS_DEAD_LETTER_EXCHANGE),
                AMQPValue::LongString(LongString::from(exchange.clone())),
            );
        }

        if let Some(key) = &self.dead_letter_routing_key {
            args.insert(
                ShortString::from(AMQP_HEADERS_DEAD_LETTER_ROUTING_KEY),
                AMQPValue::LongString(LongString::from(key.clone())),
            );
        }

        args
    }

    pub(crate) fn field_table(&self) -> FieldTable {
        FieldTable::from(self.arguments())
    }

    /// The dead-letter exchange and optional routing key, read from the arguments.
    pub(crate) fn dead_letter_target(&self) -> Option<(String, Option<String>)> {
        let args = self.arguments();
        let exchange = args
            .get(&ShortString::from(AMQP_HEADERS_DEAD_LETTER_EXCHANGE))
            .and_then(amqp_string)?;
        let key = args
            .get(&ShortString::from(AMQP_HEADERS_DEAD_LETTER_ROUTING_KEY))
            .and_then(amqp_string);

        Some((exchange, key))
    }

    /// The queue-level message TTL in milliseconds, read from the arguments.
    pub(crate) fn message_ttl(&self) -> Option<u64> {
        match self.arguments().get(&ShortString::from(AMQP_HEADERS_MESSAGE_TTL)) {
            Some(AMQPValue::LongInt(v)) => u64::try_from(*v).ok(),
            Some(AMQPValue::LongUInt(v)) => Some(u64::from(*v)),
            Some(AMQPValue::LongLongInt(v)) => u64::try_from(*v).ok(),
            Some(AMQPValue::ShortInt(v)) => u64::try_from(*v).ok(),
            _ => None,
        }
    }

    /// A queue may never dead-letter into itself through the default exchange.
    pub(crate) fn dead_letters_to_itself(&self) -> bool {
        match self.dead_letter_target() {
            Some((exchange, Some(key))) => exchange.is_empty() && key == self.name,
            _ => false,
        }
    }

    /// Whether a redeclaration with `other` would be accepted by the broker.
    pub(crate) fn is_equivalent(&self, other: &QueueDefinition) -> bool {
        self.name == other.name
            && self.durable == other.durable
            && self.delete == other.delete
            && self.exclusive == other.exclusive
            && self.arguments() == other.arguments()
    }
}

fn amqp_string(value: &AMQPValue) -> Option<String> {
    match value {
        AMQPValue::LongString(v) => Some(String::from_utf8_lossy(v.as_bytes()).into_owned()),
        AMQPValue::ShortString(v) => Some(v.as_str().to_owned()),
        _ => None,
    }
}

/// Configuration for binding a queue to an exchange.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueueBinding {
    pub(crate) queue_name: String,
    pub(crate) exchange_name: String,
    pub(crate) routing_key: String,
    pub(crate) no_wait: bool,
}

impl QueueBinding {
    /// Creates a new queue binding for the given queue.
    ///
    /// The exchange name and routing key start empty and are set with
    /// `exchange` and `routing_key`.
    pub fn new(queue: &str) -> QueueBinding {
        QueueBinding {
            queue_name: queue.to_owned(),
            exchange_name: String::new(),
            routing_key: String::new(),
            no_wait: false,
        }
    }

    /// Sets the exchange to bind the queue to.
    ///
    /// # Returns
    /// Self for method chaining
    pub fn exchange(mut self, exchange: &str) -> Self {
        self.exchange_name = exchange.to_owned();
        self
    }

    /// Sets the routing key for the binding.
    ///
    /// # Returns
    /// Self for method chaining
    pub fn routing_key(mut self, key: &str) -> Self {
        self.routing_key = key.to_owned();
        self
    }

    /// Sets no_wait flag, the broker will not answer the binding.
    ///
    /// # Returns
    /// Self for method chaining
    pub fn no_wait(mut self) -> Self {
        self.no_wait = true;
        self
    }

    /// Name of the bound queue.
    pub fn queue_name(&self) -> &str {
        &self.queue_name
    }

    /// Name of the exchange the queue is bound to.
    pub fn exchange_name(&self) -> &str {
        &self.exchange_name
    }

    /// Routing key of the binding.
    pub fn key(&self) -> &str {
        &self.routing_key
    }
}

/// What the broker reports back after a queue declaration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueueHandle {
    /// Name of the queue, generated by the broker when declared without one
    pub name: String,
    /// Messages ready for delivery at declaration time
    pub message_count: u32,
    /// Active consumers at declaration time
    pub consumer_count: u32,
}
