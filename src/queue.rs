// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Queue Definitions
//!
//! This module provides the queue and binding definitions used when declaring
//! topology. A queue's maximum priority is fixed when the broker creates it;
//! redeclaring the queue with a different priority setting is a conflict.

use crate::errors::AmqpError;

/// Highest priority a queue can be declared with
pub const MAX_PRIORITY: u8 = 10;

/// Definition of a queue with its configuration parameters.
///
/// An empty name asks the broker to generate one.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct QueueDefinition {
    pub(crate) name: String,
    pub(crate) durable: bool,
    pub(crate) exclusive: bool,
    pub(crate) max_priority: Option<u8>,
}

impl QueueDefinition {
    /// Creates a new, non-durable, non-exclusive queue definition.
    pub fn new(name: &str) -> QueueDefinition {
        QueueDefinition {
            name: name.to_owned(),
            durable: false,
            exclusive: false,
            max_priority: None,
        }
    }

    /// Definition of a queue whose name is assigned by the broker.
    pub fn server_named() -> QueueDefinition {
        QueueDefinition::new("")
    }

    /// Makes the queue durable, persisting across broker restarts.
    pub fn durable(mut self) -> Self {
        self.durable = true;
        self
    }

    /// Makes the queue exclusive to the connection.
    ///
    /// Exclusive queues are deleted when the connection closes.
    pub fn exclusive(mut self) -> Self {
        self.exclusive = true;
        self
    }

    /// Declares the queue priority capable, with priorities `1..=max`.
    pub fn max_priority(mut self, max: u8) -> Result<Self, AmqpError> {
        self.max_priority = Some(validate_max_priority(max)?);
        Ok(self)
    }

    /// Declares the queue with the full `1..=10` priority range.
    pub fn with_priority(mut self) -> Self {
        self.max_priority = Some(MAX_PRIORITY);
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn is_durable(&self) -> bool {
        self.durable
    }

    pub fn is_exclusive(&self) -> bool {
        self.exclusive
    }

    pub fn priority(&self) -> Option<u8> {
        self.max_priority
    }
}

pub(crate) fn validate_max_priority(max: u8) -> Result<u8, AmqpError> {
    if (1..=MAX_PRIORITY).contains(&max) {
        Ok(max)
    } else {
        Err(AmqpError::ConfigurationError(format!(
            "max priority must be within 1..={MAX_PRIORITY}, got {max}"
        )))
    }
}

/// Configuration for binding a queue to an exchange.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct QueueBinding {
    pub(crate) queue_name: String,
    pub(crate) exchange_name: String,
    pub(crate) routing_key: String,
}

impl QueueBinding {
    /// Creates a new queue binding for the given queue.
    ///
    /// The exchange name and routing key start empty and are set with the
    /// `exchange` and `routing_key` methods.
    pub fn new(queue: &str) -> QueueBinding {
        QueueBinding {
            queue_name: queue.to_owned(),
            exchange_name: String::new(),
            routing_key: String::new(),
        }
    }

    /// Sets the exchange to bind the queue to.
    pub fn exchange(mut self, exchange: &str) -> Self {
        self.exchange_name = exchange.to_owned();
        self
    }

    /// Sets the routing key for the binding.
    pub fn routing_key(mut self, key: &str) -> Self {
        self.routing_key = key.to_owned();
        self
    }

    pub fn queue_name(&self) -> &str {
        &self.queue_name
    }

    pub fn exchange_name(&self) -> &str {
        &self.exchange_name
    }

    pub fn key(&self) -> &str {
        &self.routing_key
    }
}
