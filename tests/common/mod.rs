// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! In-memory AMQP broker used by the integration tests.
//!
//! Implements the routing rules the pipeline relies on: direct, topic and
//! fanout exchanges, the default exchange, per-message TTL queues,
//! dead-lettering on reject and expiry, per-channel prefetch, and requeue of
//! unacked deliveries when a channel goes away.

#![allow(dead_code)]

use amqp_pipeline::{
    broker::{Broker, Connector, DeliveryStream},
    envelope::{Envelope, Message},
    errors::AmqpError,
    exchange::{ExchangeDefinition, ExchangeKind},
    queue::{
        QueueBinding, QueueDefinition, AMQP_HEADERS_DEAD_LETTER_EXCHANGE,
        AMQP_HEADERS_DEAD_LETTER_ROUTING_KEY, AMQP_HEADERS_MESSAGE_TTL,
    },
};
use async_trait::async_trait;
use futures_util::{stream, StreamExt};
use lapin::types::AMQPValue;
use std::{
    collections::{HashMap, VecDeque},
    future::Future,
    sync::{Arc, Mutex},
    time::Duration,
};
use tokio::sync::mpsc;

#[derive(Clone)]
struct Stored {
    id: u64,
    exchange: String,
    envelope: Envelope,
    redelivered: bool,
}

struct QueueState {
    def: QueueDefinition,
    ready: VecDeque<Stored>,
    consumer: Option<(u64, mpsc::UnboundedSender<Result<Message, AmqpError>>)>,
}

impl QueueState {
    fn string_arg(&self, key: &str) -> Option<String> {
        match self.def.arguments().inner().get(key) {
            Some(AMQPValue::LongString(v)) => Some(String::from_utf8_lossy(v.as_bytes()).into_owned()),
            Some(AMQPValue::ShortString(v)) => Some(v.as_str().to_owned()),
            _ => None,
        }
    }

    fn ttl(&self) -> Option<Duration> {
        match self.def.arguments().inner().get(AMQP_HEADERS_MESSAGE_TTL) {
            Some(AMQPValue::LongLongInt(ms)) => Some(Duration::from_millis((*ms).max(0) as u64)),
            Some(AMQPValue::LongInt(ms)) => Some(Duration::from_millis((*ms).max(0) as u64)),
            _ => None,
        }
    }
}

struct ChannelState {
    open: bool,
    prefetch: u16,
    unacked: HashMap<u64, (String, Stored)>,
}

#[derive(Default)]
struct State {
    exchanges: HashMap<String, ExchangeDefinition>,
    queues: HashMap<String, QueueState>,
    bindings: Vec<QueueBinding>,
    channels: HashMap<u64, ChannelState>,
    discarded: Vec<Envelope>,
    next_id: u64,
    next_tag: u64,
    next_channel: u64,
    connects: usize,
    failing_connects: usize,
}

struct Expiry {
    queue: String,
    id: u64,
    ttl: Duration,
}

/// Shared broker state. Cheap to clone.
#[derive(Clone, Default)]
pub struct MemoryServer {
    state: Arc<Mutex<State>>,
}

impl MemoryServer {
    pub fn new() -> Self {
        MemoryServer::default()
    }

    pub fn connector(&self) -> Arc<MemoryConnector> {
        Arc::new(MemoryConnector {
            server: self.clone(),
        })
    }

    /// Makes the next `n` connection attempts fail.
    pub fn fail_next_connects(&self, n: usize) {
        self.state.lock().unwrap().failing_connects = n;
    }

    /// Drops every open channel, as a broker restart would.
    pub fn disconnect_all(&self) {
        let mut state = self.state.lock().unwrap();
        let ids: Vec<u64> = state
            .channels
            .iter()
            .filter(|(_, ch)| ch.open)
            .map(|(id, _)| *id)
            .collect();
        for id in ids {
            close_channel(&mut state, id);
        }
    }

    pub fn connects(&self) -> usize {
        self.state.lock().unwrap().connects
    }

    pub fn has_exchange(&self, name: &str) -> bool {
        self.state.lock().unwrap().exchanges.contains_key(name)
    }

    pub fn exchange_kind(&self, name: &str) -> Option<ExchangeKind> {
        self.state
            .lock()
            .unwrap()
            .exchanges
            .get(name)
            .map(|e| e.exchange_kind())
    }

    pub fn has_queue(&self, name: &str) -> bool {
        self.state.lock().unwrap().queues.contains_key(name)
    }

    pub fn queue_string_arg(&self, queue: &str, key: &str) -> Option<String> {
        self.state
            .lock()
            .unwrap()
            .queues
            .get(queue)
            .and_then(|q| q.string_arg(key))
    }

    pub fn queue_ttl(&self, queue: &str) -> Option<Duration> {
        self.state
            .lock()
            .unwrap()
            .queues
            .get(queue)
            .and_then(|q| q.ttl())
    }

    pub fn binding_keys(&self, exchange: &str, queue: &str) -> Vec<String> {
        self.state
            .lock()
            .unwrap()
            .bindings
            .iter()
            .filter(|b| b.exchange_name() == exchange && b.queue_name() == queue)
            .map(|b| b.key().to_owned())
            .collect()
    }

    /// Messages waiting in `queue`.
    pub fn ready(&self, queue: &str) -> Vec<Envelope> {
        self.state
            .lock()
            .unwrap()
            .queues
            .get(queue)
            .map(|q| q.ready.iter().map(|s| s.envelope.clone()).collect())
            .unwrap_or_default()
    }

    pub fn unacked(&self) -> usize {
        self.state
            .lock()
            .unwrap()
            .channels
            .values()
            .map(|ch| ch.unacked.len())
            .sum()
    }

    /// Messages rejected from queues without a dead-letter exchange.
    pub fn discarded(&self) -> Vec<Envelope> {
        self.state.lock().unwrap().discarded.clone()
    }

    fn open_channel(&self) -> Result<u64, AmqpError> {
        let mut state = self.state.lock().unwrap();
        state.connects += 1;

        if state.failing_connects > 0 {
            state.failing_connects -= 1;
            return Err(AmqpError::ConnectionError("connection refused".to_owned()));
        }

        state.next_channel += 1;
        let id = state.next_channel;
        state.channels.insert(
            id,
            ChannelState {
                open: true,
                prefetch: 0,
                unacked: HashMap::new(),
            },
        );
        Ok(id)
    }

    /// Runs `f` on the state of an open channel, then schedules any TTL
    /// expiries it produced.
    fn with_channel<T>(
        &self,
        channel: u64,
        closed: AmqpError,
        f: impl FnOnce(&mut State, &mut Vec<Expiry>) -> Result<T, AmqpError>,
    ) -> Result<T, AmqpError> {
        let mut expiries = vec![];
        let result = {
            let mut state = self.state.lock().unwrap();
            if !state.channels.get(&channel).map(|ch| ch.open).unwrap_or(false) {
                return Err(closed);
            }
            let result = f(&mut state, &mut expiries);
            pump(&mut state);
            result
        };
        self.schedule(expiries);
        result
    }

    fn schedule(&self, expiries: Vec<Expiry>) {
        for expiry in expiries {
            let server = self.clone();
            tokio::spawn(async move {
                tokio::time::sleep(expiry.ttl).await;
                server.expire(&expiry.queue, expiry.id);
            });
        }
    }

    fn expire(&self, queue: &str, id: u64) {
        let mut expiries = vec![];
        {
            let mut state = self.state.lock().unwrap();
            let stored = state.queues.get_mut(queue).and_then(|q| {
                let pos = q.ready.iter().position(|s| s.id == id)?;
                q.ready.remove(pos)
            });
            if let Some(stored) = stored {
                dead_letter(&mut state, queue, stored, &mut expiries);
            }
            pump(&mut state);
        }
        self.schedule(expiries);
    }
}

fn close_channel(state: &mut State, id: u64) {
    let Some(ch) = state.channels.get_mut(&id) else {
        return;
    };
    ch.open = false;
    let mut unacked: Vec<(u64, (String, Stored))> = ch.unacked.drain().collect();
    unacked.sort_by_key(|(tag, _)| *tag);

    for queue in state.queues.values_mut() {
        if matches!(&queue.consumer, Some((owner, _)) if *owner == id) {
            queue.consumer = None;
        }
    }

    for (_, (queue, mut stored)) in unacked.into_iter().rev() {
        if let Some(q) = state.queues.get_mut(&queue) {
            stored.redelivered = true;
            q.ready.push_front(stored);
        }
    }
    pump(state);
}

/// Hands ready messages to consumers within their prefetch window.
fn pump(state: &mut State) {
    let State {
        queues,
        channels,
        next_tag,
        ..
    } = state;

    for queue in queues.values_mut() {
        let Some((owner, sender)) = queue.consumer.clone() else {
            continue;
        };
        let Some(ch) = channels.get_mut(&owner) else {
            continue;
        };

        while !queue.ready.is_empty()
            && (ch.prefetch == 0 || ch.unacked.len() < ch.prefetch as usize)
        {
            let Some(stored) = queue.ready.pop_front() else {
                break;
            };
            *next_tag += 1;
            let tag = *next_tag;
            let msg = Message::new(
                tag,
                stored.redelivered,
                &stored.exchange,
                stored.envelope.clone(),
            );

            if sender.send(Ok(msg)).is_err() {
                queue.ready.push_front(stored);
                queue.consumer = None;
                break;
            }
            ch.unacked.insert(tag, (queue.def.name().to_owned(), stored));
        }
    }
}

fn topic_matches(pattern: &str, key: &str) -> bool {
    fn matches(pattern: &[&str], key: &[&str]) -> bool {
        match (pattern.first(), key.first()) {
            (None, None) => true,
            (Some(&"#"), _) => {
                matches(&pattern[1..], key) || (!key.is_empty() && matches(pattern, &key[1..]))
            }
            (Some(&"*"), Some(_)) => matches(&pattern[1..], &key[1..]),
            (Some(p), Some(k)) if p == k => matches(&pattern[1..], &key[1..]),
            _ => false,
        }
    }

    let pattern: Vec<&str> = pattern.split('.').collect();
    let key: Vec<&str> = if key.is_empty() {
        vec![]
    } else {
        key.split('.').collect()
    };
    matches(&pattern, &key)
}

/// Routes a message; silently drops it when nothing matches.
fn route(
    state: &mut State,
    exchange: &str,
    envelope: Envelope,
    expiries: &mut Vec<Expiry>,
) -> Result<(), AmqpError> {
    let targets: Vec<String> = if exchange.is_empty() {
        vec![envelope.routing_key().to_owned()]
    } else {
        let kind = state
            .exchanges
            .get(exchange)
            .map(|e| e.exchange_kind())
            .ok_or_else(|| AmqpError::PublishingError(format!("no exchange `{}`", exchange)))?;

        let mut targets: Vec<String> = state
            .bindings
            .iter()
            .filter(|b| b.exchange_name() == exchange)
            .filter(|b| match kind {
                ExchangeKind::Fanout => true,
                ExchangeKind::Topic => topic_matches(b.key(), envelope.routing_key()),
                _ => b.key() == envelope.routing_key(),
            })
            .map(|b| b.queue_name().to_owned())
            .collect();
        targets.sort();
        targets.dedup();
        targets
    };

    for target in targets {
        state.next_id += 1;
        let id = state.next_id;
        let Some(queue) = state.queues.get_mut(&target) else {
            continue;
        };
        queue.ready.push_back(Stored {
            id,
            exchange: exchange.to_owned(),
            envelope: envelope.clone(),
            redelivered: false,
        });
        if let Some(ttl) = queue.ttl() {
            expiries.push(Expiry {
                queue: target.clone(),
                id,
                ttl,
            });
        }
    }

    Ok(())
}

/// Republishes through the queue's dead-letter exchange, or drops.
fn dead_letter(state: &mut State, queue: &str, stored: Stored, expiries: &mut Vec<Expiry>) {
    let (dlx, dl_key) = match state.queues.get(queue) {
        Some(q) => (
            q.string_arg(AMQP_HEADERS_DEAD_LETTER_EXCHANGE),
            q.string_arg(AMQP_HEADERS_DEAD_LETTER_ROUTING_KEY),
        ),
        None => (None, None),
    };

    let Some(dlx) = dlx else {
        state.discarded.push(stored.envelope);
        return;
    };

    let envelope = match dl_key {
        Some(key) => rekey(&stored.envelope, &key),
        None => stored.envelope,
    };

    if route(state, &dlx, envelope.clone(), expiries).is_err() {
        state.discarded.push(envelope);
    }
}

fn rekey(envelope: &Envelope, routing_key: &str) -> Envelope {
    envelope
        .headers()
        .iter()
        .fold(
            Envelope::new(routing_key, envelope.payload().to_vec())
                .with_content_type(envelope.content_type())
                .with_message_id(envelope.message_id())
                .with_timestamp(envelope.timestamp()),
            |env, (k, v)| env.with_header(k.as_str(), v.clone()),
        )
}

/// One channel on the in-memory broker.
pub struct MemoryBroker {
    server: MemoryServer,
    channel: u64,
}

#[async_trait]
impl Broker for MemoryBroker {
    async fn declare_exchange(&self, def: &ExchangeDefinition) -> Result<(), AmqpError> {
        let name = def.name().to_owned();
        self.server.with_channel(
            self.channel,
            AmqpError::DeclareExchangeError(name.clone()),
            |state, _| match state.exchanges.get(&name) {
                Some(_) if def.is_passive() => Ok(()),
                Some(existing) if existing.is_equivalent(def) => Ok(()),
                Some(_) => Err(AmqpError::DeclareExchangeError(name.clone())),
                None if def.is_passive() => Err(AmqpError::DeclareExchangeError(name.clone())),
                None => {
                    state.exchanges.insert(name.clone(), def.clone());
                    Ok(())
                }
            },
        )
    }

    async fn declare_queue(&self, def: &QueueDefinition) -> Result<(), AmqpError> {
        let name = def.name().to_owned();
        self.server.with_channel(
            self.channel,
            AmqpError::DeclareQueueError(name.clone()),
            |state, _| match state.queues.get(&name) {
                Some(_) if def.is_passive() => Ok(()),
                Some(existing) if existing.def.is_equivalent(def) => Ok(()),
                Some(_) => Err(AmqpError::DeclareQueueError(name.clone())),
                None if def.is_passive() => Err(AmqpError::DeclareQueueError(name.clone())),
                None => {
                    state.queues.insert(
                        name.clone(),
                        QueueState {
                            def: def.clone(),
                            ready: VecDeque::new(),
                            consumer: None,
                        },
                    );
                    Ok(())
                }
            },
        )
    }

    async fn bind_queue(&self, binding: &QueueBinding) -> Result<(), AmqpError> {
        let err = AmqpError::BindingExchangeToQueueError(
            binding.exchange_name().to_owned(),
            binding.queue_name().to_owned(),
        );
        self.server
            .with_channel(self.channel, err.clone(), |state, _| {
                if !state.exchanges.contains_key(binding.exchange_name())
                    || !state.queues.contains_key(binding.queue_name())
                {
                    return Err(err);
                }
                if !state.bindings.contains(binding) {
                    state.bindings.push(binding.clone());
                }
                Ok(())
            })
    }

    async fn qos(&self, prefetch: u16) -> Result<(), AmqpError> {
        let channel = self.channel;
        self.server.with_channel(
            channel,
            AmqpError::QoSDeclarationError("channel closed".to_owned()),
            |state, _| {
                if let Some(ch) = state.channels.get_mut(&channel) {
                    ch.prefetch = prefetch;
                }
                Ok(())
            },
        )
    }

    async fn consume(&self, queue: &str, _consumer_tag: &str) -> Result<DeliveryStream, AmqpError> {
        let (tx, rx) = mpsc::unbounded_channel();
        let channel = self.channel;

        self.server.with_channel(
            channel,
            AmqpError::BindingConsumerError(queue.to_owned()),
            |state, _| match state.queues.get_mut(queue) {
                Some(q) => {
                    q.consumer = Some((channel, tx));
                    Ok(())
                }
                None => Err(AmqpError::BindingConsumerError(queue.to_owned())),
            },
        )?;

        Ok(stream::unfold(rx, |mut rx| async move {
            rx.recv().await.map(|item| (item, rx))
        })
        .boxed())
    }

    async fn publish(&self, exchange: &str, envelope: &Envelope) -> Result<(), AmqpError> {
        self.server.with_channel(
            self.channel,
            AmqpError::PublishingError("channel closed".to_owned()),
            |state, expiries| route(state, exchange, envelope.clone(), expiries),
        )
    }

    async fn ack(&self, delivery_tag: u64) -> Result<(), AmqpError> {
        let channel = self.channel;
        self.server
            .with_channel(channel, AmqpError::AckMessageError, |state, _| {
                state
                    .channels
                    .get_mut(&channel)
                    .and_then(|ch| ch.unacked.remove(&delivery_tag))
                    .map(|_| ())
                    .ok_or(AmqpError::AckMessageError)
            })
    }

    async fn nack(&self, delivery_tag: u64, requeue: bool) -> Result<(), AmqpError> {
        let channel = self.channel;
        self.server
            .with_channel(channel, AmqpError::NackMessageError, |state, expiries| {
                let (queue, mut stored) = state
                    .channels
                    .get_mut(&channel)
                    .and_then(|ch| ch.unacked.remove(&delivery_tag))
                    .ok_or(AmqpError::NackMessageError)?;

                if requeue {
                    stored.redelivered = true;
                    if let Some(q) = state.queues.get_mut(&queue) {
                        q.ready.push_front(stored);
                    }
                } else {
                    dead_letter(state, &queue, stored, expiries);
                }
                Ok(())
            })
    }

    fn is_open(&self) -> bool {
        self.server
            .state
            .lock()
            .unwrap()
            .channels
            .get(&self.channel)
            .map(|ch| ch.open)
            .unwrap_or(false)
    }

    async fn close(&self) -> Result<(), AmqpError> {
        let mut state = self.server.state.lock().unwrap();
        close_channel(&mut state, self.channel);
        Ok(())
    }
}

/// Opens channels on a [`MemoryServer`].
pub struct MemoryConnector {
    server: MemoryServer,
}

#[async_trait]
impl Connector for MemoryConnector {
    async fn connect(&self) -> Result<Arc<dyn Broker>, AmqpError> {
        let channel = self.server.open_channel()?;
        Ok(Arc::new(MemoryBroker {
            server: self.server.clone(),
            channel,
        }))
    }
}

/// Polls `check` until it holds or `within` elapses.
pub async fn eventually<F>(within: Duration, check: F) -> bool
where
    F: Fn() -> bool,
{
    let deadline = tokio::time::Instant::now() + within;
    loop {
        if check() {
            return true;
        }
        if tokio::time::Instant::now() >= deadline {
            return false;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

/// Same as [`eventually`] for async checks.
pub async fn eventually_async<F, Fut>(within: Duration, check: F) -> bool
where
    F: Fn() -> Fut,
    Fut: Future<Output = bool>,
{
    let deadline = tokio::time::Instant::now() + within;
    loop {
        if check().await {
            return true;
        }
        if tokio::time::Instant::now() >= deadline {
            return false;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}
