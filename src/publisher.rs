// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Message Publisher
//!
//! Every publish is stateless: a fresh connection and channel are opened, the
//! topology is declared, one persistent message is published and the
//! connection is closed again. The current OpenTelemetry context travels in
//! the message headers so consumers continue the trace.
//!
//! `publish` and `publish_direct` report failures as `false` after logging
//! them; `try_publish` and `try_publish_direct` return the error instead.

use crate::{
    channel::{BrokerChannel, Connector, MessageProperties},
    errors::AmqpError,
    exchange::ExchangeDefinition,
    otel,
    queue::{QueueBinding, QueueDefinition, MAX_PRIORITY},
    subscriber::SUBSCRIBER_ROUTING_KEY,
    topology::{AmqpTopology, Topology},
};
use opentelemetry::Context;
use std::{collections::BTreeMap, sync::Arc, time::Instant};
use tracing::{debug, error, info, info_span, warn, Instrument, Span};
use uuid::Uuid;

/// Priority used when a malformed priority is supplied
pub const DEFAULT_PRIORITY: u8 = 1;

/// Coerces a requested priority into `1..=10`.
///
/// Out of range values are not rejected: they are logged and replaced by
/// `DEFAULT_PRIORITY`.
pub fn normalize_priority(priority: i64) -> u8 {
    match u8::try_from(priority) {
        Ok(p) if (1..=MAX_PRIORITY).contains(&p) => p,
        _ => {
            warn!(
                priority,
                "priority must be an integer in [1, {MAX_PRIORITY}], using {DEFAULT_PRIORITY}"
            );
            DEFAULT_PRIORITY
        }
    }
}

pub struct Publisher {
    connector: Arc<dyn Connector>,
    app_id: Option<String>,
    span: Span,
}

impl Publisher {
    pub fn new(connector: Arc<dyn Connector>) -> Self {
        Publisher {
            connector,
            app_id: None,
            span: info_span!("publisher"),
        }
    }

    /// Sets the `app_id` property of every published message.
    pub fn with_app_id(mut self, app_id: &str) -> Self {
        self.app_id = Some(app_id.to_owned());
        self
    }

    pub fn with_span(mut self, span: Span) -> Self {
        self.span = span;
        self
    }

    /// Publishes `message` to a durable queue bound to a topic exchange.
    ///
    /// The queue is declared priority capable when `priority` is given.
    pub async fn publish(
        &self,
        message: &[u8],
        exchange_name: &str,
        queue_name: &str,
        routing_key: &str,
        priority: Option<i64>,
    ) -> bool {
        match self
            .try_publish(message, exchange_name, queue_name, routing_key, priority)
            .await
        {
            Ok(()) => true,
            Err(err) => {
                report_failure(&err, exchange_name);
                false
            }
        }
    }

    pub async fn try_publish(
        &self,
        message: &[u8],
        exchange_name: &str,
        queue_name: &str,
        routing_key: &str,
        priority: Option<i64>,
    ) -> Result<(), AmqpError> {
        let priority = priority.map(normalize_priority);

        let exchange = ExchangeDefinition::new(exchange_name).topic().durable();
        let mut queue = QueueDefinition::new(queue_name).durable();
        if priority.is_some() {
            queue = queue.with_priority();
        }
        let binding = QueueBinding::new(queue_name)
            .exchange(exchange_name)
            .routing_key(routing_key);

        let span = self.span.clone();
        async {
            let started = Instant::now();
            let channel = self.connector.connect().await?;

            let published = async {
                AmqpTopology::new(channel.as_ref())
                    .exchange(&exchange)
                    .queue(&queue)
                    .queue_binding(&binding)
                    .install()
                    .await?;
                self.send(channel.as_ref(), exchange_name, routing_key, message, priority)
                    .await
            }
            .await;

            let closed = channel.close().await;
            if published.is_ok() {
                info!(
                    exchange = exchange_name,
                    queue = queue_name,
                    routing_key,
                    priority,
                    elapsed_ms = started.elapsed().as_millis() as u64,
                    "message published"
                );
            }
            published.and(closed)
        }
        .instrument(span)
        .await
    }

    /// Publishes `message` to a direct exchange with the subscriber routing key.
    ///
    /// No queue is declared or bound; subscribers bind their own queues.
    pub async fn publish_direct(
        &self,
        message: &[u8],
        exchange_name: &str,
        priority: Option<i64>,
    ) -> bool {
        match self.try_publish_direct(message, exchange_name, priority).await {
            Ok(()) => true,
            Err(err) => {
                report_failure(&err, exchange_name);
                false
            }
        }
    }

    pub async fn try_publish_direct(
        &self,
        message: &[u8],
        exchange_name: &str,
        priority: Option<i64>,
    ) -> Result<(), AmqpError> {
        let priority = priority.map(normalize_priority);
        let exchange = ExchangeDefinition::new(exchange_name).direct().durable();

        let span = self.span.clone();
        async {
            let started = Instant::now();
            let channel = self.connector.connect().await?;

            let published = async {
                AmqpTopology::new(channel.as_ref())
                    .exchange(&exchange)
                    .install()
                    .await?;
                self.send(
                    channel.as_ref(),
                    exchange_name,
                    SUBSCRIBER_ROUTING_KEY,
                    message,
                    priority,
                )
                .await
            }
            .await;

            let closed = channel.close().await;
            if published.is_ok() {
                info!(
                    exchange = exchange_name,
                    priority,
                    elapsed_ms = started.elapsed().as_millis() as u64,
                    "message published to direct exchange"
                );
            }
            published.and(closed)
        }
        .instrument(span)
        .await
    }

    async fn send(
        &self,
        channel: &dyn BrokerChannel,
        exchange: &str,
        routing_key: &str,
        message: &[u8],
        priority: Option<u8>,
    ) -> Result<(), AmqpError> {
        let mut headers = BTreeMap::new();
        otel::inject_context(&Context::current(), &mut headers);

        let properties = MessageProperties {
            app_id: self.app_id.clone(),
            priority,
            persistent: true,
            message_id: Some(Uuid::new_v4().to_string()),
            headers,
        };

        debug!(exchange, routing_key, "publishing message");
        channel
            .publish(exchange, routing_key, message, &properties)
            .await
    }
}

fn report_failure(err: &AmqpError, exchange_name: &str) {
    match err {
        AmqpError::QueueConfigConflict(queue) => error!(
            exchange = exchange_name,
            queue, "queue exists with a different priority configuration"
        ),
        other => error!(
            exchange = exchange_name,
            error = other.to_string(),
            "failure to publish"
        ),
    }
}
