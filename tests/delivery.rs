// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

use rabbitmq_delivery::{
    delayed::DelayedSetup,
    errors::{AmqpError, HandlerError},
    exchange::ExchangeDefinition,
    handler::handler_fn,
    memory::{InMemoryBroker, FIRST_DEATH_QUEUE_HEADER, FIRST_DEATH_REASON_HEADER},
    message::{Delivery, Disposition},
    noop::NoopBroker,
    publisher::Publisher,
    queue::{QueueBinding, QueueDefinition},
    topology::{AmqpTopology, Topology},
    Broker,
};
use serde_json::json;
use std::{
    sync::Arc,
    time::{Duration, Instant},
};
use tokio::{
    sync::mpsc::{unbounded_channel, UnboundedReceiver},
    time::{sleep, timeout},
};

#[derive(Debug)]
struct Seen {
    at: Instant,
    tag: u64,
    exchange: String,
    routing_key: String,
    payload: Vec<u8>,
    reason: Option<String>,
    first_queue: Option<String>,
}

/// Consumes `queue`, reporting every delivery on the returned channel.
async fn observe(
    broker: &Arc<InMemoryBroker>,
    queue: &str,
    fail: bool,
) -> UnboundedReceiver<Seen> {
    let (tx, rx) = unbounded_channel();

    let handler = handler_fn(move |d: &Delivery| {
        let _ = tx.send(Seen {
            at: Instant::now(),
            tag: d.delivery_tag,
            exchange: d.exchange.clone(),
            routing_key: d.routing_key.clone(),
            payload: d.data().to_vec(),
            reason: d.envelope.headers.get(FIRST_DEATH_REASON_HEADER).cloned(),
            first_queue: d.envelope.headers.get(FIRST_DEATH_QUEUE_HEADER).cloned(),
        });

        if fail {
            return Err(HandlerError::Processing("always failing".to_owned()));
        }
        Ok(())
    });

    broker.consume(queue, "", handler).await.unwrap();
    rx
}

async fn delayed_topology(broker: &Arc<InMemoryBroker>) {
    AmqpTopology::new(broker.clone())
        .delayed(DelayedSetup::new(
            "ex.delay",
            "q.delay",
            "ex.actual",
            "rk.actual",
        ))
        .queue(QueueDefinition::new("q.actual").durable())
        .queue_binding(
            QueueBinding::new("q.actual")
                .exchange("ex.actual")
                .routing_key("rk.actual"),
        )
        .install()
        .await
        .unwrap();
}

#[tokio::test]
async fn delayed_message_arrives_after_delay_through_actual_exchange() {
    let broker = Arc::new(InMemoryBroker::new());
    delayed_topology(&broker).await;
    let mut rx = observe(&broker, "q.actual", false).await;

    let published_at = Instant::now();
    broker
        .publish("ex.delay", "q.delay", br#"{"id":1}"#, 500)
        .await
        .unwrap();

    assert!(
        timeout(Duration::from_millis(400), rx.recv()).await.is_err(),
        "no delivery expected before the delay"
    );
    assert_eq!(broker.message_count("q.delay"), Some(1));

    let seen = timeout(Duration::from_secs(3), rx.recv())
        .await
        .unwrap()
        .unwrap();

    assert!(seen.at.duration_since(published_at) >= Duration::from_millis(500));
    assert_eq!(seen.exchange, "ex.actual");
    assert_eq!(seen.routing_key, "rk.actual");
    assert_eq!(seen.payload, br#"{"id":1}"#.to_vec());
    assert_eq!(seen.reason.as_deref(), Some("expired"));
    assert_eq!(broker.message_count("q.delay"), Some(0));

    sleep(Duration::from_millis(200)).await;
    assert!(rx.try_recv().is_err(), "exactly one delivery expected");
    assert_eq!(broker.disposition(seen.tag), Some(Disposition::Acknowledged));
}

#[tokio::test]
async fn delay_queue_releases_by_expiry_not_by_arrival() {
    let broker = Arc::new(InMemoryBroker::new());
    delayed_topology(&broker).await;
    let mut rx = observe(&broker, "q.actual", false).await;

    let publisher = Publisher::new(broker.clone());
    publisher
        .publish_json("ex.delay", "q.delay", &json!({"id": "slow"}), 400)
        .await
        .unwrap();
    publisher
        .publish_json("ex.delay", "q.delay", &json!({"id": "fast"}), 100)
        .await
        .unwrap();

    let first = timeout(Duration::from_secs(3), rx.recv()).await.unwrap().unwrap();
    let second = timeout(Duration::from_secs(3), rx.recv()).await.unwrap().unwrap();

    assert_eq!(first.payload, br#"{"id":"fast"}"#.to_vec());
    assert_eq!(second.payload, br#"{"id":"slow"}"#.to_vec());
}

#[tokio::test]
async fn successful_handler_acknowledges_once_without_redelivery() {
    let broker = Arc::new(InMemoryBroker::new());
    broker
        .declare_queue(&QueueDefinition::new("schools"))
        .await
        .unwrap();
    let mut rx = observe(&broker, "schools", false).await;

    broker.publish("", "schools", b"{}", 0).await.unwrap();

    let seen = timeout(Duration::from_secs(1), rx.recv()).await.unwrap().unwrap();
    sleep(Duration::from_millis(100)).await;

    assert!(rx.try_recv().is_err());
    assert_eq!(broker.disposition(seen.tag), Some(Disposition::Acknowledged));
    assert_eq!(broker.unacked_count(), 0);
    assert_eq!(broker.message_count("schools"), Some(0));
}

#[tokio::test]
async fn failing_handler_rejects_and_message_is_dead_lettered_once() {
    let broker = Arc::new(InMemoryBroker::new());
    AmqpTopology::new(broker.clone())
        .exchange(ExchangeDefinition::new("dlx").durable())
        .queue(QueueDefinition::new("jobs.dead").durable())
        .queue(
            QueueDefinition::new("jobs")
                .durable()
                .dead_letter("dlx", Some("jobs.dead")),
        )
        .queue_binding(
            QueueBinding::new("jobs.dead")
                .exchange("dlx")
                .routing_key("jobs.dead"),
        )
        .install()
        .await
        .unwrap();

    let mut failing = observe(&broker, "jobs", true).await;
    let mut dead = observe(&broker, "jobs.dead", false).await;

    broker.publish("", "jobs", br#"{"id":1}"#, 0).await.unwrap();

    let rejected = timeout(Duration::from_secs(1), failing.recv())
        .await
        .unwrap()
        .unwrap();
    let dead_lettered = timeout(Duration::from_secs(1), dead.recv())
        .await
        .unwrap()
        .unwrap();

    assert_eq!(
        broker.disposition(rejected.tag),
        Some(Disposition::Rejected { requeue: false })
    );
    assert_eq!(dead_lettered.payload, br#"{"id":1}"#.to_vec());
    assert_eq!(dead_lettered.exchange, "dlx");
    assert_eq!(dead_lettered.reason.as_deref(), Some("rejected"));
    assert_eq!(dead_lettered.first_queue.as_deref(), Some("jobs"));

    sleep(Duration::from_millis(100)).await;
    assert!(failing.try_recv().is_err(), "rejected message must not be redelivered");
    assert!(dead.try_recv().is_err(), "dead-lettered exactly once");
    assert_eq!(broker.unacked_count(), 0);
}

#[tokio::test]
async fn rejected_message_is_retried_through_the_delay_queue() {
    let broker = Arc::new(InMemoryBroker::new());
    AmqpTopology::new(broker.clone())
        .exchange(ExchangeDefinition::new("ex.delay").durable())
        .exchange(ExchangeDefinition::new("ex.actual").durable())
        .queue(
            QueueDefinition::new("q.delay")
                .durable()
                .ttl(50)
                .dead_letter("ex.actual", Some("rk.actual")),
        )
        .queue(
            QueueDefinition::new("jobs")
                .durable()
                .dead_letter("ex.delay", Some("q.delay")),
        )
        .queue_binding(
            QueueBinding::new("q.delay")
                .exchange("ex.delay")
                .routing_key("q.delay"),
        )
        .queue_binding(
            QueueBinding::new("jobs")
                .exchange("ex.actual")
                .routing_key("rk.actual"),
        )
        .install()
        .await
        .unwrap();

    let (tx, mut rx) = unbounded_channel();
    let attempts = Arc::new(std::sync::atomic::AtomicUsize::new(0));
    let handler = handler_fn({
        let attempts = attempts.clone();
        move |d: &Delivery| {
            let attempt = attempts.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
            let _ = tx.send((attempt, d.delivery_tag));
            if attempt < 2 {
                return Err(HandlerError::Processing("not yet".to_owned()));
            }
            Ok(())
        }
    });
    broker.consume("jobs", "", handler).await.unwrap();

    broker
        .publish("ex.actual", "rk.actual", br#"{"id":1}"#, 0)
        .await
        .unwrap();

    let mut seen = vec![];
    for _ in 0..3 {
        let attempt = timeout(Duration::from_secs(3), rx.recv())
            .await
            .unwrap()
            .unwrap();
        seen.push(attempt);
    }

    assert_eq!(
        seen.iter().map(|(attempt, _)| *attempt).collect::<Vec<_>>(),
        vec![0, 1, 2]
    );
    assert_eq!(
        broker.disposition(seen[0].1),
        Some(Disposition::Rejected { requeue: false })
    );
    assert_eq!(
        broker.disposition(seen[1].1),
        Some(Disposition::Rejected { requeue: false })
    );

    sleep(Duration::from_millis(100)).await;
    assert_eq!(broker.disposition(seen[2].1), Some(Disposition::Acknowledged));
    assert!(rx.try_recv().is_err());
    assert_eq!(broker.message_count("q.delay"), Some(0));
    assert_eq!(broker.message_count("jobs"), Some(0));
}

#[tokio::test]
async fn failing_handler_without_dead_letter_drops_the_message() {
    let broker = Arc::new(InMemoryBroker::new());
    broker
        .declare_queue(&QueueDefinition::new("emails"))
        .await
        .unwrap();
    let mut rx = observe(&broker, "emails", true).await;

    broker.publish("", "emails", b"{}", 0).await.unwrap();

    let seen = timeout(Duration::from_secs(1), rx.recv()).await.unwrap().unwrap();
    sleep(Duration::from_millis(100)).await;

    assert!(rx.try_recv().is_err());
    assert_eq!(
        broker.disposition(seen.tag),
        Some(Disposition::Rejected { requeue: false })
    );
    assert_eq!(broker.message_count("emails"), Some(0));
}

#[tokio::test]
async fn dlq_helper_collects_poison_messages() {
    let broker = Arc::new(InMemoryBroker::new());
    AmqpTopology::new(broker.clone())
        .queue(QueueDefinition::new("subscriptions").with_dlq())
        .install()
        .await
        .unwrap();

    let mut rx = observe(&broker, "subscriptions", true).await;
    broker.publish("", "subscriptions", b"{}", 0).await.unwrap();

    timeout(Duration::from_secs(1), rx.recv()).await.unwrap().unwrap();
    sleep(Duration::from_millis(100)).await;

    assert_eq!(broker.message_count("subscriptions"), Some(0));
    assert_eq!(broker.message_count("subscriptions-dlq"), Some(1));
}

#[tokio::test]
async fn deliveries_are_handled_in_broker_order() {
    let broker = Arc::new(InMemoryBroker::new());
    broker
        .declare_exchange(&ExchangeDefinition::new("messages").fanout())
        .await
        .unwrap();
    broker
        .declare_queue(&QueueDefinition::new("inbox"))
        .await
        .unwrap();
    broker
        .bind_queue(&QueueBinding::new("inbox").exchange("messages"))
        .await
        .unwrap();

    for i in 0..10 {
        broker
            .publish("messages", "any", i.to_string().as_bytes(), 0)
            .await
            .unwrap();
    }

    let mut rx = observe(&broker, "inbox", false).await;

    let mut payloads = vec![];
    for _ in 0..10 {
        let seen = timeout(Duration::from_secs(1), rx.recv()).await.unwrap().unwrap();
        payloads.push(String::from_utf8(seen.payload).unwrap());
    }

    let expected: Vec<String> = (0..10).map(|i| i.to_string()).collect();
    assert_eq!(payloads, expected);
}

#[tokio::test]
async fn uninitialized_broker_refuses_declarations_but_accepts_publishes() {
    for broker in [
        Arc::new(NoopBroker) as Arc<dyn Broker>,
        {
            let closed = Arc::new(InMemoryBroker::new());
            closed.close().await.unwrap();
            closed as Arc<dyn Broker>
        },
    ] {
        assert!(!broker.is_initialized());
        assert!(matches!(
            broker.declare_exchange(&ExchangeDefinition::new("ex")).await,
            Err(AmqpError::NotInitialized(_))
        ));
        assert!(matches!(
            broker.declare_queue(&QueueDefinition::new("q")).await,
            Err(AmqpError::NotInitialized(_))
        ));
        assert!(matches!(
            broker
                .bind_queue(&QueueBinding::new("q").exchange("ex"))
                .await,
            Err(AmqpError::NotInitialized(_))
        ));
        assert!(matches!(
            broker.consume("q", "", handler_fn(|_| Ok(()))).await,
            Err(AmqpError::NotInitialized(_))
        ));
        assert_eq!(broker.publish("ex", "rk", b"{}", 500).await, Ok(()));
        assert_eq!(
            broker
                .declare_delayed_setup(&DelayedSetup::new("a", "b", "c", "d"))
                .await,
            Ok(())
        );
    }
}
