// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # In-Memory Broker
//!
//! A broker living inside the process, used to exercise topology, delayed delivery,
//! consumption and dead-lettering without a RabbitMQ server. It follows the AMQP
//! 0-9-1 semantics this crate relies on:
//!
//! - direct, fanout and topic routing, plus the default exchange which routes to the
//!   queue named by the routing key (headers exchanges route nowhere);
//! - identical redeclarations are no-ops, conflicting ones are refused;
//! - per-message (`expiration`) and per-queue (`x-message-ttl`) TTL, the shorter
//!   one wins; every message expires on its own timer, so a delay queue holding
//!   messages with different TTLs releases them by expiry, not by arrival;
//! - expired and rejected-without-requeue messages are dead-lettered when the queue
//!   has a dead-letter exchange, and dropped otherwise; dead-lettered copies lose
//!   their expiration;
//! - a dead-lettered message is dropped instead of entering a queue it already died
//!   in only when every death since then was an expiry, so retry loops going through
//!   a rejection keep working while fully automatic cycles are cut;
//! - deliveries are pushed round-robin to the queue consumers with delivery tags
//!   increasing across the whole broker; settling an unknown or already settled tag
//!   is an error;
//! - the unsettled deliveries of a consumer that went away are requeued at the front
//!   of their queue, flagged as redelivered; a requeued message keeps its original
//!   expiry deadline.
//!
//! All state sits behind one mutex which is never held across an await point.

use crate::{
    broker::Broker,
    consumer::{spawn_delivery_loop, ConsumerHandle},
    errors::AmqpError,
    exchange::{ExchangeDefinition, ExchangeKind},
    handler::ConsumerHandler,
    message::{Acknowledger, Delivery, Disposition, Envelope},
    queue::{QueueBinding, QueueDefinition, QueueHandle},
};
use async_trait::async_trait;
use futures_util::stream;
use std::{
    collections::{BTreeSet, HashMap, VecDeque},
    sync::{Arc, Mutex, MutexGuard, Weak},
    time::Duration,
};
use tokio::{
    sync::mpsc::{self, UnboundedSender},
    time::Instant,
};
use tracing::{debug, error, warn};
use uuid::Uuid;

/// Header added to dead-lettered messages with the reason of the first death.
pub const FIRST_DEATH_REASON_HEADER: &str = "x-first-death-reason";
/// Header added to dead-lettered messages with the queue of the first death.
pub const FIRST_DEATH_QUEUE_HEADER: &str = "x-first-death-queue";

/// Number of settlements remembered by [`InMemoryBroker::disposition`].
pub const DISPOSITION_HISTORY: usize = 10_000;

const DEFAULT_EXCHANGE: &str = "";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum DeathReason {
    Expired,
    Rejected,
}

impl DeathReason {
    fn as_str(&self) -> &'static str {
        match self {
            DeathReason::Expired => "expired",
            DeathReason::Rejected => "rejected",
        }
    }
}

#[derive(Debug, Clone)]
struct Death {
    queue: String,
    reason: DeathReason,
}

#[derive(Debug, Clone)]
struct Stored {
    id: u64,
    exchange: String,
    routing_key: String,
    redelivered: bool,
    envelope: Envelope,
    /// Oldest first
    deaths: Vec<Death>,
    deadline: Option<Instant>,
}

struct MemoryConsumer {
    tag: String,
    sender: UnboundedSender<Result<Delivery, AmqpError>>,
}

struct MemoryQueue {
    def: QueueDefinition,
    messages: VecDeque<Stored>,
    consumers: Vec<MemoryConsumer>,
    next_consumer: usize,
}

struct Unacked {
    queue: String,
    consumer_tag: String,
    message: Stored,
}

struct State {
    closed: bool,
    exchanges: HashMap<String, ExchangeDefinition>,
    queues: HashMap<String, MemoryQueue>,
    /// (queue, exchange, routing key)
    bindings: BTreeSet<(String, String, String)>,
    next_message_id: u64,
    next_delivery_tag: u64,
    unacked: HashMap<u64, Unacked>,
    dispositions: HashMap<u64, Disposition>,
    /// Settled tags, oldest first
    settled: VecDeque<u64>,
    disposition_capacity: usize,
}

impl State {
    fn new() -> Self {
        State {
            closed: false,
            exchanges: HashMap::new(),
            queues: HashMap::new(),
            bindings: BTreeSet::new(),
            next_message_id: 0,
            next_delivery_tag: 0,
            unacked: HashMap::new(),
            dispositions: HashMap::new(),
            settled: VecDeque::new(),
            disposition_capacity: DISPOSITION_HISTORY,
        }
    }

    fn record_disposition(&mut self, delivery_tag: u64, disposition: Disposition) {
        self.dispositions.insert(delivery_tag, disposition);
        self.settled.push_back(delivery_tag);

        while self.settled.len() > self.disposition_capacity {
            if let Some(oldest) = self.settled.pop_front() {
                self.dispositions.remove(&oldest);
            }
        }
    }
}

/// Broker keeping exchanges, queues and messages in memory.
pub struct InMemoryBroker {
    state: Arc<Mutex<State>>,
}

impl Default for InMemoryBroker {
    fn default() -> Self {
        Self::new()
    }
}

impl InMemoryBroker {
    /// An empty, initialized broker.
    pub fn new() -> Self {
        InMemoryBroker {
            state: Arc::new(Mutex::new(State::new())),
        }
    }

    fn lock(&self) -> Result<MutexGuard<'_, State>, AmqpError> {
        self.state.lock().map_err(|_| AmqpError::InternalError)
    }

    fn open_state(&self, op: String) -> Result<MutexGuard<'_, State>, AmqpError> {
        let state = self.lock()?;
        if state.closed {
            return Err(AmqpError::NotInitialized(op));
        }
        Ok(state)
    }

    /// Number of messages waiting in `queue`, `None` for an unknown queue.
    pub fn message_count(&self, queue: &str) -> Option<usize> {
        let state = self.lock().ok()?;
        state.queues.get(queue).map(|q| q.messages.len())
    }

    /// How the delivery `tag` was settled, `None` while unsettled or unknown.
    ///
    /// Only the last [`DISPOSITION_HISTORY`] settlements are remembered.
    pub fn disposition(&self, tag: u64) -> Option<Disposition> {
        let state = self.lock().ok()?;
        state.dispositions.get(&tag).copied()
    }

    /// Number of deliveries handed to consumers and not yet settled.
    pub fn unacked_count(&self) -> usize {
        self.lock().map(|state| state.unacked.len()).unwrap_or_default()
    }

    /// Current bindings as (queue, exchange, routing key).
    pub fn bindings(&self) -> Vec<(String, String, String)> {
        self.lock()
            .map(|state| state.bindings.iter().cloned().collect())
            .unwrap_or_default()
    }

    /// Number of declared exchanges, the default exchange excluded.
    pub fn exchange_count(&self) -> usize {
        self.lock().map(|state| state.exchanges.len()).unwrap_or_default()
    }

    /// Number of declared queues.
    pub fn queue_count(&self) -> usize {
        self.lock().map(|state| state.queues.len()).unwrap_or_default()
    }
}

#[async_trait]
impl Broker for InMemoryBroker {
    fn is_initialized(&self) -> bool {
        self.lock().map(|state| !state.closed).unwrap_or(false)
    }

    async fn declare_exchange(&self, def: &ExchangeDefinition) -> Result<(), AmqpError> {
        let mut state = self.open_state(format!("declare exchange `{}`", def.name))?;

        if def.name.is_empty() {
            error!("the default exchange can not be declared");
            return Err(AmqpError::DeclareExchangeError(def.name.clone()));
        }

        match state.exchanges.get(&def.name) {
            Some(existing) if existing.is_equivalent(def) => Ok(()),
            Some(_) => {
                error!(name = %def.name, "exchange redeclared with different attributes");
                Err(AmqpError::DeclareExchangeError(def.name.clone()))
            }
            None if def.passive => {
                error!(name = %def.name, "passive declaration of a missing exchange");
                Err(AmqpError::DeclareExchangeError(def.name.clone()))
            }
            None => {
                state.exchanges.insert(def.name.clone(), def.clone());
                debug!("exchange: {} was created", def.name);
                Ok(())
            }
        }
    }

    async fn declare_queue(&self, def: &QueueDefinition) -> Result<QueueHandle, AmqpError> {
        let mut state = self.open_state(format!("declare queue `{}`", def.name))?;

        let mut def = def.clone();
        if def.name.is_empty() {
            def.name = format!("amq.gen-{}", Uuid::new_v4());
        }

        if def.dead_letters_to_itself() {
            error!(name = %def.name, "queue would dead-letter into itself");
            return Err(AmqpError::DeclareQueueError(def.name));
        }

        match state.queues.get(&def.name) {
            Some(existing) if existing.def.is_equivalent(&def) => {}
            Some(_) => {
                error!(name = %def.name, "queue redeclared with different attributes");
                return Err(AmqpError::DeclareQueueError(def.name));
            }
            None if def.passive => {
                error!(name = %def.name, "passive declaration of a missing queue");
                return Err(AmqpError::DeclareQueueError(def.name));
            }
            None => {
                debug!("queue: {} was created", def.name);
                state.queues.insert(
                    def.name.clone(),
                    MemoryQueue {
                        def: def.clone(),
                        messages: VecDeque::new(),
                        consumers: vec![],
                        next_consumer: 0,
                    },
                );
            }
        }

        let queue = &state.queues[&def.name];
        Ok(QueueHandle {
            name: def.name.clone(),
            message_count: queue.messages.len() as u32,
            consumer_count: queue.consumers.len() as u32,
        })
    }

    async fn bind_queue(&self, binding: &QueueBinding) -> Result<(), AmqpError> {
        let mut state = self.open_state(format!(
            "bind queue `{}` to exchange `{}`",
            binding.queue_name, binding.exchange_name
        ))?;

        if !state.queues.contains_key(&binding.queue_name)
            || !state.exchanges.contains_key(&binding.exchange_name)
        {
            error!(
                queue = %binding.queue_name,
                exchange = %binding.exchange_name,
                "binding refers to a missing entity"
            );
            return Err(AmqpError::BindingExchangeToQueueError(
                binding.exchange_name.clone(),
                binding.queue_name.clone(),
            ));
        }

        state.bindings.insert((
            binding.queue_name.clone(),
            binding.exchange_name.clone(),
            binding.routing_key.clone(),
        ));

        Ok(())
    }

    async fn publish_envelope(
        &self,
        exchange: &str,
        routing_key: &str,
        envelope: Envelope,
    ) -> Result<(), AmqpError> {
        let mut state = self.lock()?;
        if state.closed {
            debug!(exchange, routing_key, "broker closed, skipping publish");
            return Ok(());
        }

        if exchange != DEFAULT_EXCHANGE && !state.exchanges.contains_key(exchange) {
            error!(exchange, "publishing to a missing exchange");
            return Err(AmqpError::PublishingError(format!(
                "no exchange `{}`",
                exchange
            )));
        }

        let routed = route(
            &self.state,
            &mut state,
            exchange,
            routing_key,
            envelope,
            false,
            &[],
        );
        if routed == 0 {
            debug!(exchange, routing_key, "message unroutable, dropped");
        }

        Ok(())
    }

    async fn consume(
        &self,
        queue: &str,
        consumer_tag: &str,
        handler: Arc<dyn ConsumerHandler>,
    ) -> Result<ConsumerHandle, AmqpError> {
        let (tx, mut rx) = mpsc::unbounded_channel();

        let tag = {
            let mut state = self.open_state(format!("consume queue `{}`", queue))?;

            let tag = if consumer_tag.is_empty() {
                format!("amq.ctag-{}", Uuid::new_v4())
            } else {
                consumer_tag.to_owned()
            };

            let in_use = state
                .queues
                .values()
                .any(|q| q.consumers.iter().any(|c| c.tag == tag));

            let Some(memory_queue) = state.queues.get_mut(queue) else {
                error!(queue, "consuming a missing queue");
                return Err(AmqpError::ConsumerDeclarationError(queue.to_owned()));
            };

            if in_use {
                error!(queue, consumer_tag = %tag, "consumer tag already in use");
                return Err(AmqpError::ConsumerDeclarationError(queue.to_owned()));
            }

            memory_queue.consumers.push(MemoryConsumer {
                tag: tag.clone(),
                sender: tx,
            });

            // Waiting messages keep their expiry timers, only delivery is retried.
            let pending: Vec<Stored> = memory_queue.messages.drain(..).collect();
            for message in pending {
                if let Some(message) = try_deliver(&self.state, &mut state, queue, message) {
                    if let Some(memory_queue) = state.queues.get_mut(queue) {
                        memory_queue.messages.push_back(message);
                    }
                }
            }

            tag
        };

        debug!(queue, consumer_tag = %tag, "consumer created");

        let deliveries = stream::poll_fn(move |cx| rx.poll_recv(cx));
        Ok(spawn_delivery_loop(queue, &tag, deliveries, handler))
    }

    async fn close(&self) -> Result<(), AmqpError> {
        let mut state = self.lock()?;
        state.closed = true;

        for queue in state.queues.values_mut() {
            queue.consumers.clear();
        }

        debug!("in-memory broker closed");
        Ok(())
    }
}

/// Settles deliveries against the broker state.
struct MemoryAcknowledger {
    state: Weak<Mutex<State>>,
}

impl MemoryAcknowledger {
    fn settle(&self, delivery_tag: u64, disposition: Disposition) -> Result<(), ()> {
        let shared = self.state.upgrade().ok_or(())?;
        let mut state = shared.lock().map_err(|_| ())?;

        if state.closed {
            return Err(());
        }

        let unacked = state.unacked.remove(&delivery_tag).ok_or(())?;
        state.record_disposition(delivery_tag, disposition);

        match disposition {
            Disposition::Acknowledged => {}
            Disposition::Rejected { requeue: true } => {
                let mut message = unacked.message;
                message.redelivered = true;
                requeue_front(&shared, &mut state, &unacked.queue, message);
            }
            Disposition::Rejected { requeue: false } => {
                dead_letter(
                    &shared,
                    &mut state,
                    &unacked.queue,
                    unacked.message,
                    DeathReason::Rejected,
                );
            }
        }

        Ok(())
    }
}

#[async_trait]
impl Acknowledger for MemoryAcknowledger {
    async fn ack(&self, delivery_tag: u64) -> Result<(), AmqpError> {
        self.settle(delivery_tag, Disposition::Acknowledged)
            .map_err(|_| {
                error!(delivery_tag, "unknown delivery tag");
                AmqpError::AckMessageError(delivery_tag)
            })
    }

    async fn reject(&self, delivery_tag: u64, requeue: bool) -> Result<(), AmqpError> {
        self.settle(delivery_tag, Disposition::Rejected { requeue })
            .map_err(|_| {
                error!(delivery_tag, "unknown delivery tag");
                AmqpError::NackMessageError(delivery_tag)
            })
    }
}

/// Routes a message through `exchange` and returns the number of queues reached.
///
/// `deaths` is the dead-letter history of the message, empty for a fresh publish.
fn route(
    shared: &Arc<Mutex<State>>,
    state: &mut State,
    exchange: &str,
    routing_key: &str,
    envelope: Envelope,
    redelivered: bool,
    deaths: &[Death],
) -> usize {
    let targets: Vec<String> = if exchange == DEFAULT_EXCHANGE {
        if state.queues.contains_key(routing_key) {
            vec![routing_key.to_owned()]
        } else {
            vec![]
        }
    } else {
        let Some(kind) = state.exchanges.get(exchange).map(|e| e.exchange_kind()) else {
            return 0;
        };

        state
            .bindings
            .iter()
            .filter(|(_, ex, key)| ex == exchange && matches(kind, key, routing_key))
            .map(|(queue, _, _)| queue.clone())
            .collect::<BTreeSet<String>>()
            .into_iter()
            .collect()
    };

    let mut routed = 0;
    for queue in targets {
        if is_dead_letter_cycle(deaths, &queue) {
            warn!(queue = %queue, "dead-letter cycle detected, message dropped");
            continue;
        }

        state.next_message_id += 1;
        let message = Stored {
            id: state.next_message_id,
            exchange: exchange.to_owned(),
            routing_key: routing_key.to_owned(),
            redelivered,
            envelope: envelope.clone(),
            deaths: deaths.to_vec(),
            deadline: None,
        };

        enqueue(shared, state, &queue, message);
        routed += 1;
    }

    routed
}

/// A message re-entering a queue it died in is dropped unless a rejection happened
/// since, a cycle made of expiries only would never end.
fn is_dead_letter_cycle(deaths: &[Death], queue: &str) -> bool {
    match deaths.iter().rposition(|death| death.queue == queue) {
        Some(pos) => deaths[pos..]
            .iter()
            .all(|death| death.reason == DeathReason::Expired),
        None => false,
    }
}

fn matches(kind: ExchangeKind, binding_key: &str, routing_key: &str) -> bool {
    match kind {
        ExchangeKind::Direct => binding_key == routing_key,
        ExchangeKind::Fanout => true,
        ExchangeKind::Topic => topic_matches(binding_key, routing_key),
        ExchangeKind::Headers => false,
    }
}

/// AMQP topic matching: `*` matches one word, `#` matches zero or more words.
fn topic_matches(pattern: &str, key: &str) -> bool {
    fn go(pattern: &[&str], key: &[&str]) -> bool {
        match pattern.split_first() {
            None => key.is_empty(),
            Some((&"#", rest)) => (0..=key.len()).any(|skip| go(rest, &key[skip..])),
            Some((&word, rest)) => match key.split_first() {
                Some((&first, key_rest)) => (word == "*" || word == first) && go(rest, key_rest),
                None => false,
            },
        }
    }

    let pattern: Vec<&str> = pattern.split('.').collect();
    let key: Vec<&str> = key.split('.').collect();
    go(&pattern, &key)
}

/// Hands the message to the next live consumer, or stores it.
fn enqueue(shared: &Arc<Mutex<State>>, state: &mut State, queue: &str, mut message: Stored) {
    let ttl = effective_ttl(state, queue, &message);
    message.deadline = ttl.map(|ttl| Instant::now() + ttl);

    let Some(message) = try_deliver(shared, state, queue, message) else {
        return;
    };

    if ttl == Some(Duration::ZERO) {
        dead_letter(shared, state, queue, message, DeathReason::Expired);
        return;
    }

    let id = message.id;
    if let Some(memory_queue) = state.queues.get_mut(queue) {
        memory_queue.messages.push_back(message);
    }

    if let Some(ttl) = ttl {
        schedule_expiry(shared, queue, id, ttl);
    }
}

/// Puts a settled-back message at the head of `queue`, keeping its expiry deadline.
fn requeue_front(shared: &Arc<Mutex<State>>, state: &mut State, queue: &str, message: Stored) {
    let Some(message) = try_deliver(shared, state, queue, message) else {
        return;
    };

    let remaining = message
        .deadline
        .map(|deadline| deadline.saturating_duration_since(Instant::now()));
    if remaining == Some(Duration::ZERO) {
        dead_letter(shared, state, queue, message, DeathReason::Expired);
        return;
    }

    let id = message.id;
    if let Some(memory_queue) = state.queues.get_mut(queue) {
        memory_queue.messages.push_front(message);
    }

    if let Some(remaining) = remaining {
        schedule_expiry(shared, queue, id, remaining);
    }
}

/// Returns the message back when no consumer could take it.
///
/// Consumers found gone on the way are removed and their unsettled deliveries
/// requeued.
fn try_deliver(
    shared: &Arc<Mutex<State>>,
    state: &mut State,
    queue: &str,
    message: Stored,
) -> Option<Stored> {
    let mut gone = vec![];
    let undelivered = push_to_consumer(shared, state, queue, message, &mut gone);

    for consumer_tag in gone {
        requeue_unacked_of(shared, state, &consumer_tag);
    }

    undelivered
}

fn push_to_consumer(
    shared: &Arc<Mutex<State>>,
    state: &mut State,
    queue: &str,
    message: Stored,
    gone: &mut Vec<String>,
) -> Option<Stored> {
    let Some(memory_queue) = state.queues.get_mut(queue) else {
        return Some(message);
    };

    while !memory_queue.consumers.is_empty() {
        let idx = memory_queue.next_consumer % memory_queue.consumers.len();
        memory_queue.next_consumer = idx + 1;

        let delivery_tag = state.next_delivery_tag + 1;
        let delivery = Delivery::new(
            delivery_tag,
            &message.exchange,
            &message.routing_key,
            message.redelivered,
            message.envelope.clone(),
            Arc::new(MemoryAcknowledger {
                state: Arc::downgrade(shared),
            }),
        );

        let consumer = &memory_queue.consumers[idx];
        if consumer.sender.send(Ok(delivery)).is_ok() {
            state.next_delivery_tag = delivery_tag;
            state.unacked.insert(
                delivery_tag,
                Unacked {
                    queue: queue.to_owned(),
                    consumer_tag: consumer.tag.clone(),
                    message,
                },
            );
            return None;
        }

        let removed = memory_queue.consumers.remove(idx);
        debug!(queue, consumer_tag = %removed.tag, "consumer gone, removed");
        gone.push(removed.tag);
    }

    Some(message)
}

/// Requeues, oldest at the head, the unsettled deliveries of a removed consumer.
fn requeue_unacked_of(shared: &Arc<Mutex<State>>, state: &mut State, consumer_tag: &str) {
    let mut tags: Vec<u64> = state
        .unacked
        .iter()
        .filter(|(_, unacked)| unacked.consumer_tag == consumer_tag)
        .map(|(tag, _)| *tag)
        .collect();
    tags.sort_unstable();

    for tag in tags.into_iter().rev() {
        let Some(unacked) = state.unacked.remove(&tag) else {
            continue;
        };

        debug!(queue = %unacked.queue, delivery_tag = tag, "requeuing unsettled delivery");
        let mut message = unacked.message;
        message.redelivered = true;
        requeue_front(shared, state, &unacked.queue, message);
    }
}

fn effective_ttl(state: &State, queue: &str, message: &Stored) -> Option<Duration> {
    let queue_ttl = state
        .queues
        .get(queue)
        .and_then(|q| q.def.message_ttl())
        .map(Duration::from_millis);

    match (message.envelope.ttl(), queue_ttl) {
        (Some(a), Some(b)) => Some(a.min(b)),
        (a, b) => a.or(b),
    }
}

fn schedule_expiry(shared: &Arc<Mutex<State>>, queue: &str, id: u64, ttl: Duration) {
    let weak = Arc::downgrade(shared);
    let queue = queue.to_owned();

    tokio::spawn(async move {
        tokio::time::sleep(ttl).await;

        let Some(shared) = weak.upgrade() else {
            return;
        };
        let Ok(mut state) = shared.lock() else {
            return;
        };
        if state.closed {
            return;
        }

        let expired = state.queues.get_mut(&queue).and_then(|q| {
            let pos = q.messages.iter().position(|m| m.id == id)?;
            q.messages.remove(pos)
        });

        if let Some(message) = expired {
            debug!(queue = %queue, "message expired");
            dead_letter(&shared, &mut state, &queue, message, DeathReason::Expired);
        }
    });
}

/// Forwards a message to the queue's dead-letter exchange, or drops it.
fn dead_letter(
    shared: &Arc<Mutex<State>>,
    state: &mut State,
    queue: &str,
    message: Stored,
    reason: DeathReason,
) {
    let Some((exchange, key)) = state
        .queues
        .get(queue)
        .and_then(|q| q.def.dead_letter_target())
    else {
        debug!(queue, reason = reason.as_str(), "message dropped, no dead-letter exchange");
        return;
    };

    if exchange != DEFAULT_EXCHANGE && !state.exchanges.contains_key(&exchange) {
        warn!(queue, exchange = %exchange, "dead-letter exchange missing, message dropped");
        return;
    }

    let mut envelope = message.envelope;
    envelope.expiration = None;
    envelope
        .headers
        .entry(FIRST_DEATH_REASON_HEADER.to_owned())
        .or_insert_with(|| reason.as_str().to_owned());
    envelope
        .headers
        .entry(FIRST_DEATH_QUEUE_HEADER.to_owned())
        .or_insert_with(|| queue.to_owned());

    let mut deaths = message.deaths;
    deaths.push(Death {
        queue: queue.to_owned(),
        reason,
    });

    let routing_key = key.unwrap_or(message.routing_key);
    debug!(
        queue,
        exchange = %exchange,
        routing_key = %routing_key,
        reason = reason.as_str(),
        "dead-lettering message"
    );

    route(shared, state, &exchange, &routing_key, envelope, false, &deaths);
}
