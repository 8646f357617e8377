// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Subscriber Engine
//!
//! Fan-out variant of the consumer. Each subscriber owns one exclusive,
//! broker-named, priority capable queue and binds it to any number of direct
//! exchanges with the shared `SUBSCRIBER_ROUTING_KEY`, so publishers and
//! subscribers only agree on exchange names.
//!
//! The queue disappears with the connection: messages published while a
//! subscriber is not running are lost for it.

use crate::{
    channel::{BrokerChannel, Connector},
    consumer::{consume_until_stopped, shutdown, ConsumerHandle, ConsumerState, PREFETCH_COUNT},
    dispatcher::{MessageHandler, WorkerDispatch},
    errors::AmqpError,
    exchange::ExchangeDefinition,
    queue::{QueueBinding, QueueDefinition},
};
use std::{sync::Arc, time::Duration};
use tracing::{error, info, info_span, Instrument, Span};

/// Routing key shared by every direct-exchange publisher and subscriber
pub const SUBSCRIBER_ROUTING_KEY: &str = "subscriber_routing_key";

pub struct SubscriberEngine {
    channel: Arc<dyn BrokerChannel>,
    queue_name: String,
    exchanges: Vec<String>,
    dispatch: WorkerDispatch,
    handle: ConsumerHandle,
    span: Span,
}

impl SubscriberEngine {
    /// Connects and declares the subscriber's exclusive queue.
    ///
    /// A `QueueConfigConflict` here means the broker refused to mix priority
    /// and non-priority declarations.
    pub async fn connect(
        connector: &dyn Connector,
        handler: Arc<dyn MessageHandler>,
    ) -> Result<SubscriberEngine, AmqpError> {
        let handle = ConsumerHandle::new();
        let span = info_span!("subscriber");

        let (channel, queue_name) = Self::open(connector, &handle)
            .instrument(span.clone())
            .await?;

        Ok(SubscriberEngine {
            channel,
            queue_name,
            exchanges: vec![],
            dispatch: WorkerDispatch::new(handler),
            handle,
            span,
        })
    }

    async fn open(
        connector: &dyn Connector,
        handle: &ConsumerHandle,
    ) -> Result<(Arc<dyn BrokerChannel>, String), AmqpError> {
        handle.advance(ConsumerState::Connecting)?;
        info!("connecting");
        let channel = match connector.connect().await {
            Ok(channel) => channel,
            Err(err) => {
                error!(error = err.to_string(), "failure to connect");
                handle.advance(ConsumerState::Disconnected)?;
                return Err(err);
            }
        };
        handle.advance(ConsumerState::ChannelOpen)?;

        let declared = match channel.qos(PREFETCH_COUNT).await {
            Ok(()) => {
                let def = QueueDefinition::server_named()
                    .exclusive()
                    .durable()
                    .with_priority();
                channel.declare_queue(&def).await
            }
            Err(err) => Err(err),
        };

        match declared {
            Ok(queue_name) => {
                handle.advance(ConsumerState::TopologyReady)?;
                info!(queue = queue_name, "subscriber queue declared");
                Ok((channel, queue_name))
            }
            Err(err) => {
                if let AmqpError::QueueConfigConflict(_) = err {
                    error!("mixing of priority queues and non-priority queues");
                }
                if let Err(close_err) = shutdown(channel.as_ref(), handle).await {
                    error!(error = close_err.to_string(), "failure to close after declare error");
                }
                Err(err)
            }
        }
    }

    /// Logs under `span` instead of the engine's own `subscriber` span.
    pub fn with_span(mut self, span: Span) -> Self {
        self.span = span;
        self
    }

    pub fn with_poll_interval(mut self, poll_interval: Duration) -> Self {
        self.dispatch = self.dispatch.with_poll_interval(poll_interval);
        self
    }

    /// Declares a durable direct exchange and binds the subscriber queue to it.
    pub async fn add_exchange(&mut self, name: &str) -> Result<(), AmqpError> {
        if self.handle.state() != ConsumerState::TopologyReady {
            return Err(AmqpError::ConfigurationError(format!(
                "cannot add exchange `{name}` in state {}",
                self.handle.state()
            )));
        }

        let exchange = ExchangeDefinition::new(name).direct().durable();
        let binding = QueueBinding::new(&self.queue_name)
            .exchange(name)
            .routing_key(SUBSCRIBER_ROUTING_KEY);

        async {
            self.channel.declare_exchange(&exchange).await?;
            self.channel.bind_queue(&binding).await
        }
        .instrument(self.span.clone())
        .await?;

        self.exchanges.push(name.to_owned());
        Ok(())
    }

    /// Processes deliveries until stopped.
    ///
    /// Returns `Ok` right away, without consuming, when no exchange was added.
    pub async fn run(&mut self) -> Result<(), AmqpError> {
        let span = self.span.clone();
        async {
            if self.exchanges.is_empty() {
                info!("no exchanges, nothing to consume");
                return Ok(());
            }
            if self.handle.state() != ConsumerState::TopologyReady {
                return Err(AmqpError::ConfigurationError(format!(
                    "subscriber cannot run in state {}",
                    self.handle.state()
                )));
            }

            let outcome = consume_until_stopped(
                self.channel.as_ref(),
                &self.queue_name,
                &self.dispatch,
                &self.handle,
            )
            .await;
            if let Err(err) = &outcome {
                error!(error = err.to_string(), "subscriber failing");
            }

            let closed = shutdown(self.channel.as_ref(), &self.handle).await;
            outcome.and(closed)
        }
        .instrument(span)
        .await
    }

    /// Releases the connection of a subscriber that is not running.
    pub async fn close(&mut self) -> Result<(), AmqpError> {
        match self.handle.state() {
            ConsumerState::Disconnected => Ok(()),
            ConsumerState::TopologyReady => {
                shutdown(self.channel.as_ref(), &self.handle)
                    .instrument(self.span.clone())
                    .await
            }
            state => Err(AmqpError::ConfigurationError(format!(
                "cannot close a subscriber in state {state}"
            ))),
        }
    }

    /// Broker assigned name of the exclusive queue.
    pub fn queue_name(&self) -> &str {
        &self.queue_name
    }

    pub fn exchanges(&self) -> &[String] {
        &self.exchanges
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
}
