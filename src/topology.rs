// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Topology Management
//!
//! Collects exchanges, queues, delayed-delivery setups and bindings, then installs
//! them on a broker at startup. Declarations are idempotent, so installing the same
//! topology again is harmless.
//!
//! The main components are:
//! - `Topology` trait: Interface for topology management
//! - `AmqpTopology`: Implementation of the Topology trait over any [`Broker`]

use crate::{
    broker::Broker,
    delayed::DelayedSetup,
    errors::AmqpError,
    exchange::ExchangeDefinition,
    queue::{QueueBinding, QueueDefinition},
};
use async_trait::async_trait;
use std::sync::Arc;
use tracing::debug;

/// Trait defining the interface for topology management.
#[async_trait]
pub trait Topology {
    /// Adds an exchange definition to the topology.
    fn exchange(self, def: ExchangeDefinition) -> Self;

    /// Adds a queue definition to the topology.
    fn queue(self, def: QueueDefinition) -> Self;

    /// Adds a delayed-delivery setup to the topology.
    fn delayed(self, setup: DelayedSetup) -> Self;

    /// Adds a queue-to-exchange binding to the topology.
    fn queue_binding(self, binding: QueueBinding) -> Self;

    /// Declares everything on the broker.
    async fn install(&self) -> Result<(), AmqpError>;
}

/// Topology installed through a [`Broker`].
pub struct AmqpTopology {
    broker: Arc<dyn Broker>,
    pub(crate) exchanges: Vec<ExchangeDefinition>,
    pub(crate) queues: Vec<QueueDefinition>,
    pub(crate) delayed: Vec<DelayedSetup>,
    pub(crate) queues_binding: Vec<QueueBinding>,
}

impl AmqpTopology {
    /// Creates an empty topology installed through `broker`.
    pub fn new(broker: Arc<dyn Broker>) -> AmqpTopology {
        AmqpTopology {
            broker,
            exchanges: vec![],
            queues: vec![],
            delayed: vec![],
            queues_binding: vec![],
        }
    }
}

#[async_trait]
impl Topology for AmqpTopology {
    fn exchange(mut self, def: ExchangeDefinition) -> Self {
        self.exchanges.push(def);
        self
    }

    fn queue(mut self, def: QueueDefinition) -> Self {
        self.queues.push(def);
        self
    }

    fn delayed(mut self, setup: DelayedSetup) -> Self {
        self.delayed.push(setup);
        self
    }

    fn queue_binding(mut self, binding: QueueBinding) -> Self {
        self.queues_binding.push(binding);
        self
    }

    /// Installs, in order, exchanges, queues (with their DLQs), delayed setups and
    /// bindings. The first failure aborts the installation.
    async fn install(&self) -> Result<(), AmqpError> {
        self.install_exchanges().await?;
        self.install_queues().await?;
        self.install_delayed().await?;
        self.binding_queues().await
    }
}

impl AmqpTopology {
    async fn install_exchanges(&self) -> Result<(), AmqpError> {
        for exch in &self.exchanges {
            self.broker.declare_exchange(exch).await?;
        }

        Ok(())
    }

    async fn install_queues(&self) -> Result<(), AmqpError> {
        for def in &self.queues {
            let Some(dlq_name) = def.dlq_name() else {
                self.broker.declare_queue(def).await?;
                continue;
            };

            self.declare_dlq(def, dlq_name).await?;

            if def.dead_letter_target().is_some() {
                self.broker.declare_queue(def).await?;
            } else {
                let def = def.clone().dead_letter("", Some(dlq_name));
                self.broker.declare_queue(&def).await?;
            }
        }

        Ok(())
    }

    /// Declares the Dead Letter Queue of `def`, sharing its durability flags.
    async fn declare_dlq(&self, def: &QueueDefinition, dlq_name: &str) -> Result<(), AmqpError> {
        debug!("creating dlq: {}", dlq_name);

        let mut dlq = QueueDefinition::new(dlq_name);
        dlq.durable = def.durable;
        dlq.delete = def.delete;
        dlq.exclusive = def.exclusive;
        dlq.no_wait = def.no_wait;

        self.broker.declare_queue(&dlq).await.map(|_| ())
    }

    async fn install_delayed(&self) -> Result<(), AmqpError> {
        for setup in &self.delayed {
            self.broker.declare_delayed_setup(setup).await?;
        }

        Ok(())
    }

    async fn binding_queues(&self) -> Result<(), AmqpError> {
        for binding in &self.queues_binding {
            self.broker.bind_queue(binding).await?;
        }

        debug!("queues were bound");

        Ok(())
    }
}
