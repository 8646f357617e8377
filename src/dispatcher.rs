// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Worker Dispatch
//!
//! This module runs the user supplied `MessageHandler` for each delivery. The
//! handler is synchronous user code, so it runs on tokio's blocking pool while
//! the calling task keeps polling: it waits on the handler's completion and
//! periodically checks the connection instead of parking on the handler. A
//! failing or panicking handler is turned into `AmqpError::HandlerFailure` and
//! never touches the channel.
//!
//! There is no timeout on a handler; a hung handler hangs its engine.

use crate::{
    channel::{BrokerChannel, Delivery},
    errors::AmqpError,
    otel,
};
use opentelemetry::{
    global,
    trace::{Span, Status},
};
use std::{borrow::Cow, sync::Arc, time::Duration};
use tracing::{debug, warn};

/// How often the connection is checked while a handler runs
pub const KEEPALIVE_POLL_INTERVAL: Duration = Duration::from_secs(1);

pub type HandlerError = Box<dyn std::error::Error + Send + Sync>;

/// Per message processing supplied by the application.
///
/// The returned flag reports whether the message was processed; it is logged
/// but the delivery is acknowledged either way.
#[cfg_attr(test, mockall::automock)]
pub trait MessageHandler: Send + Sync {
    fn handle(&self, body: &[u8], delivery_tag: u64) -> Result<bool, HandlerError>;
}

impl<F> MessageHandler for F
where
    F: Fn(&[u8], u64) -> Result<bool, HandlerError> + Send + Sync,
{
    fn handle(&self, body: &[u8], delivery_tag: u64) -> Result<bool, HandlerError> {
        self(body, delivery_tag)
    }
}

/// Runs a handler in isolation for one delivery at a time.
#[derive(Clone)]
pub struct WorkerDispatch {
    handler: Arc<dyn MessageHandler>,
    poll_interval: Duration,
}

impl WorkerDispatch {
    pub fn new(handler: Arc<dyn MessageHandler>) -> Self {
        WorkerDispatch {
            handler,
            poll_interval: KEEPALIVE_POLL_INTERVAL,
        }
    }

    pub fn with_poll_interval(mut self, poll_interval: Duration) -> Self {
        self.poll_interval = poll_interval;
        self
    }

    /// Executes the handler for `delivery` and waits for it to finish.
    ///
    /// Returns the handler's flag, or `HandlerFailure` if it returned an error
    /// or panicked.
    pub async fn dispatch(
        &self,
        delivery: &Delivery,
        channel: &dyn BrokerChannel,
    ) -> Result<bool, AmqpError> {
        let tag = delivery.delivery_tag;
        let mut span = otel::new_span(
            &delivery.properties,
            &global::tracer(otel::TRACER_NAME),
            "amqp delivery",
        );

        let handler = self.handler.clone();
        let body = delivery.body.clone();
        let mut worker = tokio::task::spawn_blocking(move || handler.handle(&body, tag));

        let mut ticker = tokio::time::interval(self.poll_interval);
        ticker.tick().await;

        let joined = loop {
            tokio::select! {
                joined = &mut worker => break joined,
                _ = ticker.tick() => {
                    if channel.is_connected() {
                        debug!(delivery_tag = tag, "handler still running");
                    } else {
                        warn!(delivery_tag = tag, "connection lost while handler is running");
                    }
                }
            }
        };

        let outcome = match joined {
            Ok(Ok(processed)) => Ok(processed),
            Ok(Err(err)) => Err(AmqpError::HandlerFailure(err.to_string())),
            Err(err) if err.is_panic() => Err(AmqpError::HandlerFailure("handler panicked".to_owned())),
            Err(err) => Err(AmqpError::HandlerFailure(err.to_string())),
        };

        match &outcome {
            Ok(_) => span.set_status(Status::Ok),
            Err(err) => {
                span.record_error(err);
                span.set_status(Status::Error {
                    description: Cow::from(err.to_string()),
                });
            }
        }
        span.end();

        outcome
    }
}
