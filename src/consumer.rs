// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Message Consumer Runtime
//!
//! Every subscription runs one tokio task draining an ordered stream of deliveries.
//! Each delivery is handed to the handler and then settled: acknowledged on success,
//! rejected without requeue on failure. Dead-lettering of rejected messages is left
//! to the broker, driven by the queue's dead-letter arguments.
//!
//! A handler that panics is treated as a failed handler: the panic is caught, the
//! delivery rejected and the loop moves on to the next delivery.
//!
//! Settlement failures and stream errors are logged and never stop the loop. The
//! loop ends when the stream ends, which happens when the broker side of the
//! subscription goes away.

use crate::{
    errors::{AmqpError, HandlerError},
    handler::ConsumerHandler,
    message::{Delivery, Disposition},
    otel,
};
use futures_util::{FutureExt, Stream, StreamExt};
use opentelemetry::{
    global::{self, BoxedTracer},
    trace::{Span, Status},
};
use std::{any::Any, borrow::Cow, panic::AssertUnwindSafe, sync::Arc};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

/// Handles and settles a single delivery.
pub(crate) async fn consume(
    tracer: &BoxedTracer,
    delivery: Delivery,
    handler: &dyn ConsumerHandler,
) -> Result<Disposition, AmqpError> {
    let span_name = delivery
        .envelope
        .msg_type
        .clone()
        .unwrap_or_else(|| delivery.routing_key.clone());
    let (ctx, mut span) = otel::new_span(&delivery.envelope.headers, tracer, &span_name);

    debug!(
        tag = delivery.delivery_tag,
        exchange = %delivery.exchange,
        routing_key = %delivery.routing_key,
        "received message"
    );

    let result = match AssertUnwindSafe(handler.exec(&ctx, &delivery))
        .catch_unwind()
        .await
    {
        Ok(result) => result,
        Err(panic) => Err(HandlerError::Panicked(panic_message(panic.as_ref()))),
    };

    if let Err(err) = result {
        warn!(
            error = err.to_string(),
            tag = delivery.delivery_tag,
            "handler failure, rejecting message"
        );
        span.record_error(&err);

        return match delivery.reject(false).await {
            Ok(disposition) => {
                span.set_status(Status::Error {
                    description: Cow::from("message rejected"),
                });
                Ok(disposition)
            }
            Err(e) => {
                error!(error = e.to_string(), "error whiling nack msg");
                span.record_error(&e);
                span.set_status(Status::Error {
                    description: Cow::from("error to nack msg"),
                });
                Err(e)
            }
        };
    }

    debug!("message successfully processed");
    match delivery.ack().await {
        Ok(disposition) => {
            span.set_status(Status::Ok);
            Ok(disposition)
        }
        Err(e) => {
            error!(error = e.to_string(), "error whiling ack msg");
            span.record_error(&e);
            span.set_status(Status::Error {
                description: Cow::from("error to ack msg"),
            });
            Err(e)
        }
    }
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(msg) = panic.downcast_ref::<&str>() {
        return (*msg).to_owned();
    }
    if let Some(msg) = panic.downcast_ref::<String>() {
        return msg.clone();
    }
    "unknown panic".to_owned()
}

/// Spawns the delivery loop of one subscription.
pub(crate) fn spawn_delivery_loop<S>(
    queue: &str,
    consumer_tag: &str,
    mut deliveries: S,
    handler: Arc<dyn ConsumerHandler>,
) -> ConsumerHandle
where
    S: Stream<Item = Result<Delivery, AmqpError>> + Send + Unpin + 'static,
{
    let task_queue = queue.to_owned();
    let task_tag = consumer_tag.to_owned();

    let task = tokio::spawn(async move {
        let tracer = global::tracer(otel::CONSUMER_TRACER);

        while let Some(result) = deliveries.next().await {
            match result {
                Ok(delivery) => {
                    if let Err(err) = consume(&tracer, delivery, handler.as_ref()).await {
                        error!(error = err.to_string(), "error consume msg");
                    }
                }
                Err(err) => error!(error = err.to_string(), "errors consume msg"),
            }
        }

        info!(
            queue = %task_queue,
            consumer_tag = %task_tag,
            "delivery stream closed, consumer loop terminated"
        );
    });

    ConsumerHandle {
        queue: queue.to_owned(),
        consumer_tag: consumer_tag.to_owned(),
        task,
    }
}

/// A running subscription.
///
/// Dropping the handle detaches the delivery loop, it keeps running until the
/// broker side of the subscription goes away.
#[derive(Debug)]
pub struct ConsumerHandle {
    queue: String,
    consumer_tag: String,
    task: JoinHandle<()>,
}

impl ConsumerHandle {
    /// Name of the consumed queue.
    pub fn queue(&self) -> &str {
        &self.queue
    }

    /// Consumer tag of the subscription, generated by the broker when none was given.
    pub fn consumer_tag(&self) -> &str {
        &self.consumer_tag
    }

    /// Whether the delivery loop has terminated.
    pub fn is_finished(&self) -> bool {
        self.task.is_finished()
    }

    /// Waits for the delivery loop to terminate.
    ///
    /// # Returns
    /// `Ok(())` once the delivery stream ended, `InternalError` if the task was
    /// cancelled or aborted
    pub async fn wait(self) -> Result<(), AmqpError> {
        self.task.await.map_err(|err| {
            error!(error = err.to_string(), "consumer task failure");
            AmqpError::InternalError
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        handler::MockConsumerHandler,
        message::{Envelope, MockAcknowledger},
    };
    use futures_util::stream;
    use mockall::predicate::eq;
    use std::sync::Mutex;

    fn delivery(tag: u64, acker: Arc<MockAcknowledger>) -> Delivery {
        Delivery::new(tag, "ex", "rk", false, Envelope::new(vec![]), acker)
    }

    #[tokio::test]
    async fn successful_handler_acks_once() {
        let mut acker = MockAcknowledger::new();
        acker.expect_ack().with(eq(1)).times(1).returning(|_| Ok(()));
        acker.expect_reject().never();

        let mut handler = MockConsumerHandler::new();
        handler.expect_exec().times(1).returning(|_, _| Ok(()));

        let tracer = global::tracer("test");
        let res = consume(&tracer, delivery(1, Arc::new(acker)), &handler).await;

        assert_eq!(res, Ok(Disposition::Acknowledged));
    }

    #[tokio::test]
    async fn failing_handler_rejects_without_requeue() {
        let mut acker = MockAcknowledger::new();
        acker.expect_ack().never();
        acker
            .expect_reject()
            .with(eq(9), eq(false))
            .times(1)
            .returning(|_, _| Ok(()));

        let mut handler = MockConsumerHandler::new();
        handler
            .expect_exec()
            .times(1)
            .returning(|_, _| Err(HandlerError::Processing("boom".to_owned())));

        let tracer = global::tracer("test");
        let res = consume(&tracer, delivery(9, Arc::new(acker)), &handler).await;

        assert_eq!(res, Ok(Disposition::Rejected { requeue: false }));
    }

    #[tokio::test]
    async fn ack_failure_is_reported() {
        let mut acker = MockAcknowledger::new();
        acker
            .expect_ack()
            .returning(|tag| Err(AmqpError::AckMessageError(tag)));

        let mut handler = MockConsumerHandler::new();
        handler.expect_exec().returning(|_, _| Ok(()));

        let tracer = global::tracer("test");
        let res = consume(&tracer, delivery(4, Arc::new(acker)), &handler).await;

        assert_eq!(res, Err(AmqpError::AckMessageError(4)));
    }

    #[tokio::test]
    async fn loop_survives_settlement_and_stream_errors_and_keeps_order() {
        let mut acker = MockAcknowledger::new();
        acker
            .expect_ack()
            .with(eq(1))
            .times(1)
            .returning(|tag| Err(AmqpError::AckMessageError(tag)));
        acker.expect_ack().with(eq(3)).times(1).returning(|_| Ok(()));
        let acker = Arc::new(acker);

        let seen = Arc::new(Mutex::new(vec![]));
        let handler = crate::handler::handler_fn({
            let seen = seen.clone();
            move |d: &Delivery| {
                seen.lock().unwrap().push(d.delivery_tag);
                Ok(())
            }
        });

        let items = vec![
            Ok(delivery(1, acker.clone())),
            Err(AmqpError::ConsumerError("transient".to_owned())),
            Ok(delivery(3, acker.clone())),
        ];

        let handle = spawn_delivery_loop("q", "ctag", stream::iter(items), handler);
        assert_eq!(handle.queue(), "q");
        assert_eq!(handle.consumer_tag(), "ctag");

        handle.wait().await.unwrap();
        assert_eq!(*seen.lock().unwrap(), vec![1, 3]);
    }

    #[tokio::test]
    async fn panicking_handler_is_rejected_and_loop_keeps_going() {
        let mut acker = MockAcknowledger::new();
        acker
            .expect_reject()
            .with(eq(1), eq(false))
            .times(1)
            .returning(|_, _| Ok(()));
        acker.expect_ack().with(eq(2)).times(1).returning(|_| Ok(()));
        let acker = Arc::new(acker);

        let handled = Arc::new(Mutex::new(vec![]));
        let handler = crate::handler::handler_fn({
            let handled = handled.clone();
            move |d: &Delivery| {
                if d.delivery_tag == 1 {
                    panic!("handler bug");
                }
                handled.lock().unwrap().push(d.delivery_tag);
                Ok(())
            }
        });

        let items = vec![Ok(delivery(1, acker.clone())), Ok(delivery(2, acker.clone()))];

        let handle = spawn_delivery_loop("q", "ctag", stream::iter(items), handler);
        handle.wait().await.unwrap();

        assert_eq!(*handled.lock().unwrap(), vec![2]);
    }

    #[test]
    fn panic_payloads_are_readable() {
        assert_eq!(panic_message(&"static"), "static");
        assert_eq!(panic_message(&"owned".to_owned()), "owned");
        assert_eq!(panic_message(&42_u8), "unknown panic");
    }
}
