// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Message Envelopes and Deliveries
//!
//! An [`Envelope`] is what gets published: payload plus the AMQP properties this
//! subsystem uses. A [`Delivery`] is an envelope received by a consumer together
//! with the delivery tag used to settle it.
//!
//! Settling a delivery (`ack` or `reject`) consumes it, so a delivery tag can not
//! be resolved twice through the same `Delivery`.

use crate::errors::AmqpError;
use async_trait::async_trait;
use lapin::{
    types::{AMQPValue, FieldTable, LongString, ShortString},
    BasicProperties,
};
use std::{
    collections::BTreeMap,
    fmt,
    sync::Arc,
    time::{Duration, SystemTime, UNIX_EPOCH},
};
use uuid::Uuid;

#[cfg(test)]
use mockall::automock;

/// Default content type for JSON messages
pub const JSON_CONTENT_TYPE: &str = "application/json";

/// AMQP delivery mode of messages that must survive a broker restart
pub const PERSISTENT_DELIVERY_MODE: u8 = 2;

/// AMQP delivery mode of transient messages
pub const TRANSIENT_DELIVERY_MODE: u8 = 1;

/// A message as handed to the broker.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Envelope {
    pub payload: Vec<u8>,
    pub content_type: String,
    pub message_id: String,
    pub msg_type: Option<String>,
    /// Seconds since the unix epoch
    pub timestamp: u64,
    pub persistent: bool,
    /// Per-message TTL, milliseconds rendered as a decimal string
    pub expiration: Option<String>,
    pub headers: BTreeMap<String, String>,
}

impl Envelope {
    /// A persistent JSON message stamped with the current time and a fresh id.
    pub fn new(payload: impl Into<Vec<u8>>) -> Self {
        Envelope {
            payload: payload.into(),
            content_type: JSON_CONTENT_TYPE.to_owned(),
            message_id: Uuid::new_v4().to_string(),
            msg_type: None,
            timestamp: now_secs(),
            persistent: true,
            expiration: None,
            headers: BTreeMap::default(),
        }
    }

    /// Expires the message `delay_ms` milliseconds after it reaches a queue.
    ///
    /// A zero delay leaves the message without expiration.
    pub fn with_delay(mut self, delay_ms: u64) -> Self {
        self.expiration = if delay_ms > 0 {
            Some(delay_ms.to_string())
        } else {
            None
        };
        self
    }

    /// Sets the AMQP `type` property, used as the consumer span name.
    pub fn with_type(mut self, msg_type: &str) -> Self {
        self.msg_type = Some(msg_type.to_owned());
        self
    }

    /// Overrides the default JSON content type.
    pub fn with_content_type(mut self, content_type: &str) -> Self {
        self.content_type = content_type.to_owned();
        self
    }

    /// Adds a string header.
    pub fn with_header(mut self, key: &str, value: &str) -> Self {
        self.headers.insert(key.to_owned(), value.to_owned());
        self
    }

    /// The per-message TTL, `None` when absent or not a valid number of milliseconds.
    pub fn ttl(&self) -> Option<Duration> {
        self.expiration
            .as_deref()
            .and_then(|exp| exp.parse::<u64>().ok())
            .map(Duration::from_millis)
    }

    pub(crate) fn properties(&self) -> BasicProperties {
        let headers = self
            .headers
            .iter()
            .map(|(key, value)| {
                (
                    ShortString::from(key.clone()),
                    AMQPValue::LongString(LongString::from(value.clone())),
                )
            })
            .collect::<BTreeMap<ShortString, AMQPValue>>();

        let delivery_mode = if self.persistent {
            PERSISTENT_DELIVERY_MODE
        } else {
            TRANSIENT_DELIVERY_MODE
        };

        let mut props = BasicProperties::default()
            .with_content_type(ShortString::from(self.content_type.clone()))
            .with_message_id(ShortString::from(self.message_id.clone()))
            .with_timestamp(self.timestamp)
            .with_delivery_mode(delivery_mode)
            .with_headers(FieldTable::from(headers));

        if let Some(msg_type) = &self.msg_type {
            props = props.with_kind(ShortString::from(msg_type.clone()));
        }

        if let Some(expiration) = &self.expiration {
            props = props.with_expiration(ShortString::from(expiration.clone()));
        }

        props
    }

    pub(crate) fn from_properties(payload: Vec<u8>, props: &BasicProperties) -> Self {
        let headers = match props.headers() {
            Some(table) => table
                .inner()
                .iter()
                .filter_map(|(key, value)| {
                    header_string(value).map(|v| (key.as_str().to_owned(), v))
                })
                .collect(),
            None => BTreeMap::default(),
        };

        Envelope {
            payload,
            content_type: props
                .content_type()
                .as_ref()
                .map(|v| v.to_string())
                .unwrap_or_default(),
            message_id: props
                .message_id()
                .as_ref()
                .map(|v| v.to_string())
                .unwrap_or_default(),
            msg_type: props.kind().as_ref().map(|v| v.to_string()),
            timestamp: props.timestamp().unwrap_or_default(),
            persistent: props.delivery_mode().unwrap_or(TRANSIENT_DELIVERY_MODE)
                == PERSISTENT_DELIVERY_MODE,
            expiration: props.expiration().as_ref().map(|v| v.to_string()),
            headers,
        }
    }
}

fn header_string(value: &AMQPValue) -> Option<String> {
    match value {
        AMQPValue::LongString(v) => Some(String::from_utf8_lossy(v.as_bytes()).into_owned()),
        AMQPValue::ShortString(v) => Some(v.as_str().to_owned()),
        _ => None,
    }
}

pub(crate) fn now_secs() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or_default()
}

/// Transmits the settlement of a delivery back to the broker.
#[cfg_attr(test, automock)]
#[async_trait]
pub trait Acknowledger: Send + Sync {
    async fn ack(&self, delivery_tag: u64) -> Result<(), AmqpError>;

    async fn reject(&self, delivery_tag: u64, requeue: bool) -> Result<(), AmqpError>;
}

/// Final state of a delivery.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Disposition {
    Acknowledged,
    Rejected { requeue: bool },
}

/// A received message waiting to be settled.
pub struct Delivery {
    /// Broker-assigned tag, unique on the channel
    pub delivery_tag: u64,
    /// Exchange the message was last published or dead-lettered to
    pub exchange: String,
    pub routing_key: String,
    /// Set when the message was delivered before and not settled
    pub redelivered: bool,
    pub envelope: Envelope,
    acker: Arc<dyn Acknowledger>,
}

impl Delivery {
    pub fn new(
        delivery_tag: u64,
        exchange: &str,
        routing_key: &str,
        redelivered: bool,
        envelope: Envelope,
        acker: Arc<dyn Acknowledger>,
    ) -> Self {
        Delivery {
            delivery_tag,
            exchange: exchange.to_owned(),
            routing_key: routing_key.to_owned(),
            redelivered,
            envelope,
            acker,
        }
    }

    /// The message body.
    pub fn data(&self) -> &[u8] {
        &self.envelope.payload
    }

    /// Removes the message from the broker's unacknowledged set.
    pub async fn ack(self) -> Result<Disposition, AmqpError> {
        self.acker.ack(self.delivery_tag).await?;
        Ok(Disposition::Acknowledged)
    }

    /// Rejects the message. Without requeue the broker dead-letters it when the
    /// source queue has a dead-letter exchange, and drops it otherwise.
    pub async fn reject(self, requeue: bool) -> Result<Disposition, AmqpError> {
        self.acker.reject(self.delivery_tag, requeue).await?;
        Ok(Disposition::Rejected { requeue })
    }
}

impl fmt::Debug for Delivery {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Delivery")
            .field("delivery_tag", &self.delivery_tag)
            .field("exchange", &self.exchange)
            .field("routing_key", &self.routing_key)
            .field("redelivered", &self.redelivered)
            .field("envelope", &self.envelope)
            .finish()
    }
}
