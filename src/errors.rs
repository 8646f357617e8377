// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Error Types for the Message Queue Client
//!
//! Errors shared by the connection provider, the publisher and the
//! consumer/subscriber engines.

use thiserror::Error;

/// Represents errors that can occur while talking to the broker.
///
/// `QueueConfigConflict` means an existing queue was declared with different
/// arguments, for instance priority vs non-priority. Retrying does not clear it.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum AmqpError {
    /// Internal errors that don't fit into other categories
    #[error("internal error")]
    InternalError,

    /// Missing or invalid connection settings, or an engine misconfiguration
    #[error("configuration error: {0}")]
    ConfigurationError(String),

    /// Broker unreachable or credentials rejected
    #[error("failure to connect")]
    ConnectionError,

    /// Error creating a channel from an established connection
    #[error("failure to create a channel")]
    ChannelError,

    /// Error configuring Quality of Service parameters
    #[error("failure to configure qos `{0}`")]
    QoSDeclarationError(String),

    /// Error declaring an exchange with the given name
    #[error("failure to declare an exchange `{0}`")]
    DeclareExchangeError(String),

    /// Error declaring a queue with the given name
    #[error("failure to declare a queue `{0}`")]
    DeclareQueueError(String),

    /// The queue already exists with an incompatible configuration
    #[error("queue `{0}` already exists with a different configuration")]
    QueueConfigConflict(String),

    /// Error binding a queue to an exchange
    #[error("failure to bind exchange `{0}` to queue `{1}`")]
    BindingExchangeToQueueError(String, String),

    /// Error registering a consumer on a queue
    #[error("failure to declare consumer `{0}`")]
    BindingConsumerError(String),

    /// Error publishing a message
    #[error("failure to publish")]
    PublishingError,

    /// Error acknowledging a message
    #[error("failure to ack message")]
    AckMessageError,

    /// Error cancelling a consumer
    #[error("failure to cancel consumer")]
    CancelConsumerError,

    /// The broker closed the channel or connection while consuming
    #[error("channel closed by broker: {0}")]
    ChannelClosed(String),

    /// The user supplied handler failed or panicked
    #[error("handler failure: {0}")]
    HandlerFailure(String),
}
