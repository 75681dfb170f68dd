// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Consumer Handlers
//!
//! A handler receives each delivery of a subscription. Returning `Ok` acknowledges
//! the delivery, returning a [`HandlerError`] rejects it without requeue.

use crate::{errors::HandlerError, message::Delivery};
use async_trait::async_trait;
use opentelemetry::Context;
use std::sync::Arc;

#[cfg(test)]
use mockall::automock;

#[cfg_attr(test, automock)]
#[async_trait]
pub trait ConsumerHandler: Send + Sync {
    /// Processes one delivery. `ctx` carries the trace context of the publisher.
    async fn exec(&self, ctx: &Context, delivery: &Delivery) -> Result<(), HandlerError>;
}

/// Handler built from a plain closure, see [`handler_fn`].
pub struct FnHandler<F> {
    f: F,
}

#[async_trait]
impl<F> ConsumerHandler for FnHandler<F>
where
    F: Fn(&Delivery) -> Result<(), HandlerError> + Send + Sync,
{
    async fn exec(&self, _ctx: &Context, delivery: &Delivery) -> Result<(), HandlerError> {
        (self.f)(delivery)
    }
}

/// Wraps a synchronous closure into a shareable handler.
pub fn handler_fn<F>(f: F) -> Arc<dyn ConsumerHandler>
where
    F: Fn(&Delivery) -> Result<(), HandlerError> + Send + Sync + 'static,
{
    Arc::new(FnHandler { f })
}
