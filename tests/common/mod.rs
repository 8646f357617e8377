// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! In-memory broker for driving the engines without a RabbitMQ server.
//!
//! It models what the engines rely on: durable and exclusive queues, broker
//! named queues, topic and direct routing, priority ordering, the prefetch
//! window, acknowledgements and requeue on close.

#![allow(dead_code)]

use async_trait::async_trait;
use futures_util::{stream, StreamExt};
use message_queue::{
    AmqpError, BrokerChannel, Connector, ConsumerHandle, Delivery, DeliveryStream,
    ExchangeDefinition, ExchangeKind, HandlerError, MessageHandler, MessageProperties,
    QueueBinding, QueueDefinition,
};
use std::{
    collections::{BTreeMap, HashMap, HashSet},
    sync::{Arc, Mutex, MutexGuard, OnceLock},
};
use tokio::sync::watch;

#[derive(Clone)]
struct Stored {
    seq: u64,
    body: Vec<u8>,
    properties: MessageProperties,
    redelivered: bool,
}

struct MemQueue {
    durable: bool,
    max_priority: Option<u8>,
    owner: Option<u64>,
    ready: Vec<Stored>,
}

impl MemQueue {
    fn effective_priority(&self, msg: &Stored) -> u8 {
        match self.max_priority {
            Some(max) => msg.properties.priority.unwrap_or(0).min(max),
            None => 0,
        }
    }

    /// Highest priority first, publish order within a priority.
    fn pop_next(&mut self) -> Option<Stored> {
        let idx = self
            .ready
            .iter()
            .enumerate()
            .max_by(|(_, a), (_, b)| {
                self.effective_priority(a)
                    .cmp(&self.effective_priority(b))
                    .then(b.seq.cmp(&a.seq))
            })
            .map(|(idx, _)| idx)?;
        Some(self.ready.remove(idx))
    }
}

#[derive(Default)]
struct ChannelState {
    open: bool,
    prefetch: u16,
    next_tag: u64,
    consumers: HashSet<String>,
    unacked: BTreeMap<u64, (String, Stored)>,
}

#[derive(Default)]
struct State {
    exchanges: HashMap<String, ExchangeKind>,
    queues: HashMap<String, MemQueue>,
    bindings: Vec<(String, String, String)>,
    channels: HashMap<u64, ChannelState>,
    next_channel: u64,
    next_seq: u64,
    next_queue: u64,
    refused_connects: u32,
    connects: u32,
    acked: Vec<Vec<u8>>,
}

enum Step {
    Deliver(Delivery),
    Wait,
    End,
}

impl State {
    fn channel(&mut self, id: u64) -> Result<&mut ChannelState, AmqpError> {
        match self.channels.get_mut(&id) {
            Some(ch) if ch.open => Ok(ch),
            _ => Err(AmqpError::ChannelClosed("channel is closed".to_owned())),
        }
    }

    fn next_delivery(&mut self, channel_id: u64, queue: &str, consumer_tag: &str) -> Step {
        let Some(ch) = self.channels.get(&channel_id) else {
            return Step::End;
        };
        if !ch.open || !ch.consumers.contains(consumer_tag) {
            return Step::End;
        }
        if ch.prefetch > 0 && ch.unacked.len() >= usize::from(ch.prefetch) {
            return Step::Wait;
        }
        let Some(q) = self.queues.get_mut(queue) else {
            return Step::End;
        };
        let Some(msg) = q.pop_next() else {
            return Step::Wait;
        };

        let Some(ch) = self.channels.get_mut(&channel_id) else {
            return Step::End;
        };
        ch.next_tag += 1;
        let tag = ch.next_tag;
        ch.unacked.insert(tag, (queue.to_owned(), msg.clone()));

        Step::Deliver(Delivery {
            delivery_tag: tag,
            body: msg.body,
            properties: msg.properties,
            redelivered: msg.redelivered,
        })
    }

    /// Requeues unacknowledged messages and drops the channel's exclusive queues.
    fn release(&mut self, channel_id: u64) {
        let Some(ch) = self.channels.get_mut(&channel_id) else {
            return;
        };
        ch.open = false;
        ch.consumers.clear();
        let unacked = std::mem::take(&mut ch.unacked);

        for (_, (queue, mut msg)) in unacked {
            if let Some(q) = self.queues.get_mut(&queue) {
                msg.redelivered = true;
                q.ready.push(msg);
            }
        }

        let exclusive: Vec<String> = self
            .queues
            .iter()
            .filter(|(_, q)| q.owner == Some(channel_id))
            .map(|(name, _)| name.clone())
            .collect();
        for name in &exclusive {
            self.queues.remove(name);
        }
        self.bindings.retain(|(_, queue, _)| !exclusive.contains(queue));
    }
}

/// Topic matching where `*` is one word and `#` zero or more words.
fn topic_matches(pattern: &[&str], key: &[&str]) -> bool {
    match (pattern.first(), key.first()) {
        (None, None) => true,
        (Some(&"#"), _) => {
            topic_matches(&pattern[1..], key) || (!key.is_empty() && topic_matches(pattern, &key[1..]))
        }
        (Some(&"*"), Some(_)) => topic_matches(&pattern[1..], &key[1..]),
        (Some(p), Some(k)) if p == k => topic_matches(&pattern[1..], &key[1..]),
        _ => false,
    }
}

fn routes(kind: &ExchangeKind, binding_key: &str, routing_key: &str) -> bool {
    match kind {
        ExchangeKind::Direct => binding_key == routing_key,
        ExchangeKind::Topic => {
            let pattern: Vec<&str> = binding_key.split('.').collect();
            let key: Vec<&str> = routing_key.split('.').collect();
            topic_matches(&pattern, &key)
        }
    }
}

/// Shared broker; every `connect` opens a new channel on it.
#[derive(Clone)]
pub struct MemoryBroker {
    state: Arc<Mutex<State>>,
    version: Arc<watch::Sender<u64>>,
}

impl Default for MemoryBroker {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryBroker {
    pub fn new() -> Self {
        let (version, _) = watch::channel(0);
        MemoryBroker {
            state: Arc::new(Mutex::new(State::default())),
            version: Arc::new(version),
        }
    }

    fn lock(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap()
    }

    fn changed(&self) {
        self.version.send_modify(|v| *v += 1);
    }

    /// Refuses the next `count` connection attempts.
    pub fn refuse_connections(&self, count: u32) {
        self.lock().refused_connects = count;
    }

    /// Closes every open channel as if the broker went away.
    pub fn force_close(&self) {
        {
            let mut state = self.lock();
            let ids: Vec<u64> = state.channels.keys().copied().collect();
            for id in ids {
                state.release(id);
            }
        }
        self.changed();
    }

    pub fn connects(&self) -> u32 {
        self.lock().connects
    }

    pub fn open_channels(&self) -> usize {
        self.lock().channels.values().filter(|ch| ch.open).count()
    }

    pub fn queue_exists(&self, name: &str) -> bool {
        self.lock().queues.contains_key(name)
    }

    pub fn queue_depth(&self, name: &str) -> usize {
        self.lock().queues.get(name).map_or(0, |q| q.ready.len())
    }

    pub fn queue_priority(&self, name: &str) -> Option<u8> {
        self.lock().queues.get(name).and_then(|q| q.max_priority)
    }

    pub fn acked(&self) -> Vec<String> {
        self.lock()
            .acked
            .iter()
            .map(|body| String::from_utf8_lossy(body).into_owned())
            .collect()
    }
}

#[async_trait]
impl Connector for MemoryBroker {
    async fn connect(&self) -> Result<Arc<dyn BrokerChannel>, AmqpError> {
        let mut state = self.lock();
        state.connects += 1;
        if state.refused_connects > 0 {
            state.refused_connects -= 1;
            return Err(AmqpError::ConnectionError);
        }

        state.next_channel += 1;
        let id = state.next_channel;
        state.channels.insert(
            id,
            ChannelState {
                open: true,
                ..ChannelState::default()
            },
        );

        Ok(Arc::new(MemoryChannel {
            broker: self.clone(),
            id,
        }))
    }
}

pub struct MemoryChannel {
    broker: MemoryBroker,
    id: u64,
}

#[async_trait]
impl BrokerChannel for MemoryChannel {
    async fn qos(&self, prefetch_count: u16) -> Result<(), AmqpError> {
        let mut state = self.broker.lock();
        state.channel(self.id)?.prefetch = prefetch_count;
        Ok(())
    }

    async fn declare_exchange(&self, def: &ExchangeDefinition) -> Result<(), AmqpError> {
        let mut state = self.broker.lock();
        state.channel(self.id)?;
        match state.exchanges.get(def.name()).cloned() {
            Some(kind) if &kind != def.exchange_kind() => {
                Err(AmqpError::DeclareExchangeError(def.name().to_owned()))
            }
            Some(_) => Ok(()),
            None => {
                state
                    .exchanges
                    .insert(def.name().to_owned(), def.exchange_kind().clone());
                Ok(())
            }
        }
    }

    async fn declare_queue(&self, def: &QueueDefinition) -> Result<String, AmqpError> {
        let mut state = self.broker.lock();
        state.channel(self.id)?;

        let name = if def.name().is_empty() {
            state.next_queue += 1;
            format!("amq.gen-{}", state.next_queue)
        } else {
            def.name().to_owned()
        };

        if let Some(existing) = state.queues.get(&name) {
            if existing.durable != def.is_durable() || existing.max_priority != def.priority() {
                return Err(AmqpError::QueueConfigConflict(name));
            }
            if existing.owner.is_some_and(|owner| owner != self.id) {
                return Err(AmqpError::DeclareQueueError(name));
            }
            return Ok(name);
        }

        state.queues.insert(
            name.clone(),
            MemQueue {
                durable: def.is_durable(),
                max_priority: def.priority(),
                owner: def.is_exclusive().then_some(self.id),
                ready: vec![],
            },
        );
        Ok(name)
    }

    async fn bind_queue(&self, binding: &QueueBinding) -> Result<(), AmqpError> {
        let mut state = self.broker.lock();
        state.channel(self.id)?;
        if !state.exchanges.contains_key(binding.exchange_name())
            || !state.queues.contains_key(binding.queue_name())
        {
            return Err(AmqpError::BindingExchangeToQueueError(
                binding.exchange_name().to_owned(),
                binding.queue_name().to_owned(),
            ));
        }

        let entry = (
            binding.exchange_name().to_owned(),
            binding.queue_name().to_owned(),
            binding.key().to_owned(),
        );
        if !state.bindings.contains(&entry) {
            state.bindings.push(entry);
        }
        Ok(())
    }

    async fn consume(&self, queue: &str, consumer_tag: &str) -> Result<DeliveryStream, AmqpError> {
        {
            let mut state = self.broker.lock();
            if !state.queues.contains_key(queue) {
                return Err(AmqpError::BindingConsumerError(queue.to_owned()));
            }
            state
                .channel(self.id)?
                .consumers
                .insert(consumer_tag.to_owned());
        }

        let broker = self.broker.clone();
        let seed = (broker, self.id, queue.to_owned(), consumer_tag.to_owned());
        let deliveries = stream::unfold(seed, |(broker, id, queue, tag)| async move {
            loop {
                let mut changes = broker.version.subscribe();
                let step = broker.lock().next_delivery(id, &queue, &tag);
                match step {
                    Step::Deliver(delivery) => return Some((Ok(delivery), (broker, id, queue, tag))),
                    Step::End => return None,
                    Step::Wait => {
                        let _ = changes.changed().await;
                    }
                }
            }
        });

        Ok(deliveries.boxed())
    }

    async fn ack(&self, delivery_tag: u64) -> Result<(), AmqpError> {
        {
            let mut state = self.broker.lock();
            let Some((_, msg)) = state.channel(self.id)?.unacked.remove(&delivery_tag) else {
                return Err(AmqpError::AckMessageError);
            };
            state.acked.push(msg.body);
        }
        self.broker.changed();
        Ok(())
    }

    async fn cancel(&self, consumer_tag: &str) -> Result<(), AmqpError> {
        {
            let mut state = self.broker.lock();
            if !state.channel(self.id)?.consumers.remove(consumer_tag) {
                return Err(AmqpError::CancelConsumerError);
            }
        }
        self.broker.changed();
        Ok(())
    }

    async fn publish(
        &self,
        exchange: &str,
        routing_key: &str,
        body: &[u8],
        properties: &MessageProperties,
    ) -> Result<(), AmqpError> {
        {
            let mut state = self.broker.lock();
            state.channel(self.id)?;
            let Some(kind) = state.exchanges.get(exchange).cloned() else {
                return Err(AmqpError::PublishingError);
            };

            let targets: Vec<String> = state
                .bindings
                .iter()
                .filter(|(exch, _, key)| exch == exchange && routes(&kind, key, routing_key))
                .map(|(_, queue, _)| queue.clone())
                .collect();

            for queue in targets {
                state.next_seq += 1;
                let seq = state.next_seq;
                if let Some(q) = state.queues.get_mut(&queue) {
                    q.ready.push(Stored {
                        seq,
                        body: body.to_vec(),
                        properties: properties.clone(),
                        redelivered: false,
                    });
                }
            }
        }
        self.broker.changed();
        Ok(())
    }

    async fn close(&self) -> Result<(), AmqpError> {
        self.broker.lock().release(self.id);
        self.broker.changed();
        Ok(())
    }

    fn is_connected(&self) -> bool {
        self.broker
            .lock()
            .channels
            .get(&self.id)
            .is_some_and(|ch| ch.open)
    }
}

/// Handler recording every body it sees and stopping its engine on a sentinel.
pub struct Recorder {
    seen: Arc<Mutex<Vec<String>>>,
    stopper: Arc<OnceLock<ConsumerHandle>>,
    failing: Option<&'static str>,
}

impl Recorder {
    pub fn new() -> Self {
        Recorder {
            seen: Arc::new(Mutex::new(vec![])),
            stopper: Arc::new(OnceLock::new()),
            failing: None,
        }
    }

    /// Makes the handler return an error for `body`.
    pub fn failing_on(mut self, body: &'static str) -> Self {
        self.failing = Some(body);
        self
    }

    pub fn handler(&self, sentinel: &'static str) -> Arc<dyn MessageHandler> {
        let seen = self.seen.clone();
        let stopper = self.stopper.clone();
        let failing = self.failing;
        Arc::new(move |body: &[u8], _: u64| -> Result<bool, HandlerError> {
            let text = String::from_utf8_lossy(body).into_owned();
            seen.lock().unwrap().push(text.clone());
            if text == sentinel {
                if let Some(handle) = stopper.get() {
                    handle.stop();
                }
            }
            if failing == Some(text.as_str()) {
                return Err(format!("cannot process `{text}`").into());
            }
            Ok(true)
        })
    }

    pub fn stop_with(&self, handle: ConsumerHandle) {
        let _ = self.stopper.set(handle);
    }

    pub fn seen(&self) -> Vec<String> {
        self.seen.lock().unwrap().clone()
    }
}
