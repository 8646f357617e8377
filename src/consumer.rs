// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Consumer Engine
//!
//! This module implements the consumer lifecycle: connect, open a channel with
//! a prefetch window of one, declare the exchange/queue/binding, consume, and
//! on request cancel the consumer and close the channel and connection.
//!
//! The lifecycle is an explicit `ConsumerState` published through a watch
//! channel, so other tasks can observe it and request a stop through a
//! `ConsumerHandle` while `run` is pending.
//!
//! Delivery semantics: every delivery is handed to the `WorkerDispatch` and
//! acknowledged once the handler returns, whether it succeeded or not. A crash
//! while a handler runs is the only way a message gets redelivered.

use crate::{
    channel::{BrokerChannel, Connector, Delivery},
    connection::{connect_with_retry, RetryBudget},
    dispatcher::{MessageHandler, WorkerDispatch},
    errors::AmqpError,
    exchange::{ExchangeDefinition, ExchangeKind},
    queue::{validate_max_priority, QueueBinding, QueueDefinition},
    topology::{AmqpTopology, Topology},
};
use futures_util::StreamExt;
use std::{
    fmt,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
    time::Duration,
};
use tokio::sync::watch;
use tracing::{debug, error, field, info, info_span, warn, Instrument, Span};
use uuid::Uuid;

/// Unacknowledged deliveries allowed per channel
pub const PREFETCH_COUNT: u16 = 1;

/// Lifecycle state of a consumer or subscriber engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConsumerState {
    Disconnected,
    Connecting,
    ChannelOpen,
    TopologyReady,
    Consuming,
    Cancelling,
    Closing,
}

impl ConsumerState {
    /// Whether the lifecycle allows moving from `self` to `next`.
    pub fn can_transition_to(self, next: ConsumerState) -> bool {
        use ConsumerState::*;

        matches!(
            (self, next),
            (Disconnected, Connecting)
                | (Connecting, ChannelOpen)
                | (Connecting, Disconnected)
                | (ChannelOpen, TopologyReady)
                | (ChannelOpen, Closing)
                | (TopologyReady, Consuming)
                | (TopologyReady, Closing)
                | (Consuming, Cancelling)
                | (Consuming, Closing)
                | (Cancelling, Closing)
                | (Closing, Disconnected)
        )
    }
}

impl fmt::Display for ConsumerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ConsumerState::Disconnected => "DISCONNECTED",
            ConsumerState::Connecting => "CONNECTING",
            ConsumerState::ChannelOpen => "CHANNEL_OPEN",
            ConsumerState::TopologyReady => "TOPOLOGY_READY",
            ConsumerState::Consuming => "CONSUMING",
            ConsumerState::Cancelling => "CANCELLING",
            ConsumerState::Closing => "CLOSING",
        };
        f.write_str(name)
    }
}

/// Cloneable control surface of an engine.
///
/// `stop` only flips a flag; the cancel request and the teardown happen inside
/// the pending `run` call. Calling it more than once has no further effect.
#[derive(Clone)]
pub struct ConsumerHandle {
    state: Arc<watch::Sender<ConsumerState>>,
    stop: Arc<watch::Sender<bool>>,
    consumed: Arc<AtomicBool>,
}

impl fmt::Debug for ConsumerHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConsumerHandle")
            .field("state", &self.state())
            .field("stop_requested", &self.is_stop_requested())
            .finish()
    }
}

impl ConsumerHandle {
    pub(crate) fn new() -> Self {
        let (state, _) = watch::channel(ConsumerState::Disconnected);
        let (stop, _) = watch::channel(false);
        ConsumerHandle {
            state: Arc::new(state),
            stop: Arc::new(stop),
            consumed: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Requests the engine to cancel its consumer and shut down.
    pub fn stop(&self) {
        let already = self.stop.send_replace(true);
        if !already {
            info!("clean stop requested");
        }
    }

    pub fn is_stop_requested(&self) -> bool {
        *self.stop.borrow()
    }

    pub fn state(&self) -> ConsumerState {
        *self.state.borrow()
    }

    /// Receiver observing every state transition.
    pub fn watch_state(&self) -> watch::Receiver<ConsumerState> {
        self.state.subscribe()
    }

    /// Whether the engine has reached `Consuming` at least once.
    pub fn has_consumed(&self) -> bool {
        self.consumed.load(Ordering::SeqCst)
    }

    pub(crate) fn advance(&self, next: ConsumerState) -> Result<(), AmqpError> {
        let current = self.state();
        if !current.can_transition_to(next) {
            error!(from = %current, to = %next, "invalid state transition");
            return Err(AmqpError::InternalError);
        }

        if next == ConsumerState::Consuming {
            self.consumed.store(true, Ordering::SeqCst);
        }
        self.state.send_replace(next);
        debug!(from = %current, to = %next, "state transition");
        Ok(())
    }

    fn stop_signal(&self) -> watch::Receiver<bool> {
        self.stop.subscribe()
    }
}

async fn stop_requested(signal: &mut watch::Receiver<bool>) {
    loop {
        let requested = *signal.borrow_and_update();
        if requested {
            return;
        }
        if signal.changed().await.is_err() {
            std::future::pending::<()>().await;
        }
    }
}

/// Registers a consumer on `queue` and processes deliveries until a stop is
/// requested or the broker ends the consumer.
///
/// Expects the engine in `TopologyReady`; returns in `Consuming` or `Cancelling`.
pub(crate) async fn consume_until_stopped(
    channel: &dyn BrokerChannel,
    queue: &str,
    dispatch: &WorkerDispatch,
    handle: &ConsumerHandle,
) -> Result<(), AmqpError> {
    let consumer_tag = format!("ctag-{}", Uuid::new_v4());
    info!(queue, consumer_tag, "issuing consumer related RPC commands");
    let mut deliveries = channel.consume(queue, &consumer_tag).await?;
    handle.advance(ConsumerState::Consuming)?;

    let mut signal = handle.stop_signal();
    loop {
        tokio::select! {
            biased;

            _ = stop_requested(&mut signal) => {
                handle.advance(ConsumerState::Cancelling)?;
                info!(consumer_tag, "sending a Basic.Cancel command");
                channel.cancel(&consumer_tag).await?;
                info!("broker acknowledged the cancellation of the consumer");
                return Ok(());
            }

            next = deliveries.next() => match next {
                Some(Ok(delivery)) => process_delivery(channel, dispatch, &delivery).await?,
                Some(Err(err)) => {
                    warn!(error = err.to_string(), "delivery stream failed");
                    return Err(err);
                }
                None => {
                    warn!(consumer_tag, "consumer was cancelled remotely");
                    return Err(AmqpError::ChannelClosed(
                        "consumer cancelled by broker".to_owned(),
                    ));
                }
            },
        }
    }
}

async fn process_delivery(
    channel: &dyn BrokerChannel,
    dispatch: &WorkerDispatch,
    delivery: &Delivery,
) -> Result<(), AmqpError> {
    info!(
        delivery_tag = delivery.delivery_tag,
        app_id = ?delivery.properties.app_id,
        priority = ?delivery.properties.priority,
        redelivered = delivery.redelivered,
        "received message"
    );

    match dispatch.dispatch(delivery, channel).await {
        Ok(true) => debug!(delivery_tag = delivery.delivery_tag, "message processed"),
        Ok(false) => warn!(
            delivery_tag = delivery.delivery_tag,
            "handler reported the message as not processed"
        ),
        Err(err) => error!(
            error = err.to_string(),
            delivery_tag = delivery.delivery_tag,
            "worker failing"
        ),
    }

    debug!(delivery_tag = delivery.delivery_tag, "acknowledging message");
    channel.ack(delivery.delivery_tag).await
}

/// Closes the channel and connection, moving the engine through `Closing` to
/// `Disconnected` even when the close itself fails.
pub(crate) async fn shutdown(
    channel: &dyn BrokerChannel,
    handle: &ConsumerHandle,
) -> Result<(), AmqpError> {
    handle.advance(ConsumerState::Closing)?;
    info!("closing the channel");
    let closed = channel.close().await;
    handle.advance(ConsumerState::Disconnected)?;
    closed
}

/// Consumer bound to a named, durable queue.
///
/// The queue, exchange and binding are declared each time a channel is opened.
/// Messages published while no consumer is attached wait in the queue.
pub struct ConsumerEngine {
    connector: Arc<dyn Connector>,
    dispatch: WorkerDispatch,
    exchange: Option<ExchangeDefinition>,
    queue_name: Option<String>,
    routing_key: String,
    max_priority: Option<u8>,
    retry: Option<RetryBudget>,
    handle: ConsumerHandle,
    span: Span,
    spent: bool,
}

impl ConsumerEngine {
    pub fn new(connector: Arc<dyn Connector>, handler: Arc<dyn MessageHandler>) -> Self {
        ConsumerEngine {
            connector,
            dispatch: WorkerDispatch::new(handler),
            exchange: None,
            queue_name: None,
            routing_key: String::new(),
            max_priority: None,
            retry: None,
            handle: ConsumerHandle::new(),
            span: info_span!("consumer", queue = field::Empty, exchange = field::Empty),
            spent: false,
        }
    }

    /// Retries connection failures with the given budget instead of failing fast.
    pub fn with_retry(mut self, budget: RetryBudget) -> Self {
        self.retry = Some(budget);
        self
    }

    /// Logs under `span` instead of the engine's own `consumer` span.
    pub fn with_span(mut self, span: Span) -> Self {
        self.span = span;
        self
    }

    pub fn with_poll_interval(mut self, poll_interval: Duration) -> Self {
        self.dispatch = self.dispatch.with_poll_interval(poll_interval);
        self
    }

    pub fn set_queue(&mut self, name: &str, routing_key: &str) -> Result<(), AmqpError> {
        self.ensure_configurable()?;
        self.span.record("queue", name);
        self.queue_name = Some(name.to_owned());
        self.routing_key = routing_key.to_owned();
        Ok(())
    }

    pub fn set_exchange(&mut self, name: &str, kind: ExchangeKind) -> Result<(), AmqpError> {
        self.ensure_configurable()?;
        self.span.record("exchange", name);
        self.exchange = Some(ExchangeDefinition::new(name).kind(kind).durable());
        Ok(())
    }

    /// Declares the queue priority capable (`Some(1..=10)`) or not (`None`).
    ///
    /// `Publisher` declares priority queues with a maximum of 10, so any other
    /// maximum on a queue the publisher also writes to fails with
    /// `QueueConfigConflict` on whichever side declares second.
    pub fn set_max_priority(&mut self, max_priority: Option<u8>) -> Result<(), AmqpError> {
        self.ensure_configurable()?;
        self.max_priority = max_priority.map(validate_max_priority).transpose()?;
        Ok(())
    }

    pub fn handle(&self) -> ConsumerHandle {
        self.handle.clone()
    }

    pub fn stop(&self) {
        self.handle.stop();
    }

    pub fn state(&self) -> ConsumerState {
        self.handle.state()
    }

    /// Connects, declares the topology and processes deliveries.
    ///
    /// Resolves once a requested stop has been acknowledged by the broker, or
    /// with an error when connecting fails or the broker closes the channel.
    /// After a clean stop the engine cannot be run again.
    pub async fn run(&mut self) -> Result<(), AmqpError> {
        if self.spent {
            return Err(AmqpError::ConfigurationError(
                "engine was stopped; construct a new one".to_owned(),
            ));
        }
        let (exchange, queue, binding) = self.topology()?;

        let span = self.span.clone();
        self.drive(exchange, queue, binding).instrument(span).await
    }

    async fn drive(
        &mut self,
        exchange: ExchangeDefinition,
        queue: QueueDefinition,
        binding: QueueBinding,
    ) -> Result<(), AmqpError> {
        self.handle.advance(ConsumerState::Connecting)?;
        info!("connecting");

        let connected = match &self.retry {
            Some(budget) => connect_with_retry(self.connector.as_ref(), budget).await,
            None => self.connector.connect().await,
        };
        let channel = match connected {
            Ok(channel) => channel,
            Err(err) => {
                error!(error = err.to_string(), "failure to connect");
                self.handle.advance(ConsumerState::Disconnected)?;
                return Err(err);
            }
        };
        self.handle.advance(ConsumerState::ChannelOpen)?;
        info!("channel opened");

        let outcome = self
            .consume(channel.as_ref(), &exchange, &queue, &binding)
            .await;
        if let Err(err) = &outcome {
            error!(error = err.to_string(), "consumer failing");
        }

        let closed = shutdown(channel.as_ref(), &self.handle).await;
        if outcome.is_ok() {
            self.spent = true;
            info!("cleanly stopped");
        }

        outcome.and(closed)
    }

    async fn consume(
        &self,
        channel: &dyn BrokerChannel,
        exchange: &ExchangeDefinition,
        queue: &QueueDefinition,
        binding: &QueueBinding,
    ) -> Result<(), AmqpError> {
        channel.qos(PREFETCH_COUNT).await?;

        AmqpTopology::new(channel)
            .exchange(exchange)
            .queue(queue)
            .queue_binding(binding)
            .install()
            .await?;
        self.handle.advance(ConsumerState::TopologyReady)?;
        info!(queue = queue.name(), "queue bound");

        consume_until_stopped(channel, queue.name(), &self.dispatch, &self.handle).await
    }

    fn topology(&self) -> Result<(ExchangeDefinition, QueueDefinition, QueueBinding), AmqpError> {
        let Some(exchange) = self.exchange.clone() else {
            return Err(AmqpError::ConfigurationError("exchange not set".to_owned()));
        };
        let Some(queue_name) = self.queue_name.as_deref() else {
            return Err(AmqpError::ConfigurationError("queue not set".to_owned()));
        };

        let mut queue = QueueDefinition::new(queue_name).durable();
        if let Some(max) = self.max_priority {
            queue = queue.max_priority(max)?;
        }
        let binding = QueueBinding::new(queue_name)
            .exchange(exchange.name())
            .routing_key(&self.routing_key);

        Ok((exchange, queue, binding))
    }

    fn ensure_configurable(&self) -> Result<(), AmqpError> {
        if self.spent || self.handle.has_consumed() {
            return Err(AmqpError::ConfigurationError(
                "topology cannot change once consuming started".to_owned(),
            ));
        }
        Ok(())
    }
}
