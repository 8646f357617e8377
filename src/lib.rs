// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Message Queue
//!
//! AMQP 0-9-1 client layer on top of `lapin`: a stateless publisher, a
//! consumer engine bound to a durable named queue, and a subscriber engine for
//! direct-exchange fan-out over exclusive queues.

mod otel;

pub mod channel;
pub mod configs;
pub mod connection;
pub mod consumer;
pub mod dispatcher;
pub mod errors;
pub mod exchange;
pub mod publisher;
pub mod queue;
pub mod subscriber;
pub mod topology;

pub use channel::{
    AmqpConnector, BrokerChannel, Connector, Delivery, DeliveryStream, LapinChannel,
    MessageProperties,
};
pub use configs::RabbitMqConfigs;
pub use connection::{
    connect_with_retry, ConnectionMode, ConnectionParameters, ConnectionProvider, RetryBudget,
};
pub use consumer::{ConsumerEngine, ConsumerHandle, ConsumerState};
pub use dispatcher::{HandlerError, MessageHandler, WorkerDispatch};
pub use errors::AmqpError;
pub use exchange::{ExchangeDefinition, ExchangeKind};
pub use publisher::Publisher;
pub use queue::{QueueBinding, QueueDefinition};
pub use subscriber::{SubscriberEngine, SUBSCRIBER_ROUTING_KEY};
