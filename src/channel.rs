// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # AMQP Channel Management
//!
//! This module handles the creation of AMQP connections and channels and hides
//! them behind the `BrokerChannel` trait. The engines and the publisher only
//! talk to a `BrokerChannel` obtained from a `Connector`.
//!
//! `AmqpConnector` and `LapinChannel` are the lapin backed implementations.

use crate::{
    connection::{ConnectionMode, ConnectionParameters, ConnectionProvider, TlsMaterial},
    errors::AmqpError,
    exchange::ExchangeDefinition,
    queue::{QueueBinding, QueueDefinition},
    topology::queue_arguments,
};
use async_trait::async_trait;
use futures_util::{stream::BoxStream, StreamExt};
use lapin::{
    options::{
        BasicAckOptions, BasicCancelOptions, BasicConsumeOptions, BasicPublishOptions,
        BasicQosOptions, ExchangeDeclareOptions, QueueBindOptions, QueueDeclareOptions,
    },
    protocol::{AMQPErrorKind, AMQPSoftError},
    tcp::OwnedTLSConfig,
    types::{AMQPValue, FieldTable, LongString, ShortString},
    uri::{AMQPAuthority, AMQPQueryString, AMQPScheme, AMQPUri, AMQPUserInfo},
    BasicProperties, Channel, Connection, ConnectionProperties,
};
use std::{collections::BTreeMap, sync::Arc};
use tracing::{debug, error, warn};

/// Delivery mode flag marking a message as persistent
pub const PERSISTENT_DELIVERY_MODE: u8 = 2;
/// Delivery mode flag marking a message as transient
pub const TRANSIENT_DELIVERY_MODE: u8 = 1;

/// Message properties attached to a published message or a delivery.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MessageProperties {
    pub app_id: Option<String>,
    pub priority: Option<u8>,
    pub persistent: bool,
    pub message_id: Option<String>,
    pub headers: BTreeMap<String, String>,
}

/// A message handed to the consumer by the broker.
///
/// The delivery tag is unique for the lifetime of the channel it arrived on.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Delivery {
    pub delivery_tag: u64,
    pub body: Vec<u8>,
    pub properties: MessageProperties,
    pub redelivered: bool,
}

/// Stream of deliveries for one consumer; it ends once the consumer is cancelled.
pub type DeliveryStream = BoxStream<'static, Result<Delivery, AmqpError>>;

/// The broker operations used by the publisher and the engines.
///
/// One implementation instance wraps exactly one connection/channel pair.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait BrokerChannel: Send + Sync {
    /// Sets the prefetch window of the channel.
    async fn qos(&self, prefetch_count: u16) -> Result<(), AmqpError>;

    async fn declare_exchange(&self, def: &ExchangeDefinition) -> Result<(), AmqpError>;

    /// Declares a queue and returns its name, which the broker assigns when
    /// the definition name is empty.
    async fn declare_queue(&self, def: &QueueDefinition) -> Result<String, AmqpError>;

    async fn bind_queue(&self, binding: &QueueBinding) -> Result<(), AmqpError>;

    async fn consume(&self, queue: &str, consumer_tag: &str) -> Result<DeliveryStream, AmqpError>;

    async fn ack(&self, delivery_tag: u64) -> Result<(), AmqpError>;

    /// Cancels the consumer and waits for the broker to confirm it.
    async fn cancel(&self, consumer_tag: &str) -> Result<(), AmqpError>;

    async fn publish(
        &self,
        exchange: &str,
        routing_key: &str,
        body: &[u8],
        properties: &MessageProperties,
    ) -> Result<(), AmqpError>;

    /// Closes the channel and then the connection.
    async fn close(&self) -> Result<(), AmqpError>;

    fn is_connected(&self) -> bool;
}

/// Produces a fresh `BrokerChannel` per call.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait Connector: Send + Sync {
    async fn connect(&self) -> Result<Arc<dyn BrokerChannel>, AmqpError>;
}

/// Connector resolving its parameters from a `ConnectionProvider` on every attempt.
#[derive(Debug, Clone)]
pub struct AmqpConnector {
    provider: ConnectionProvider,
    mode: ConnectionMode,
}

impl AmqpConnector {
    pub fn new(provider: ConnectionProvider, mode: ConnectionMode) -> Self {
        AmqpConnector { provider, mode }
    }
}

#[async_trait]
impl Connector for AmqpConnector {
    async fn connect(&self) -> Result<Arc<dyn BrokerChannel>, AmqpError> {
        let params = self.provider.resolve(self.mode)?;
        let (conn, channel) = new_amqp_channel(&params).await?;
        Ok(Arc::new(LapinChannel::new(conn, channel)))
    }
}

/// Creates a new AMQP connection and a channel on it.
///
/// Plain parameters connect over TCP; parameters carrying TLS material connect
/// over `amqps` trusting the configured CA chain.
///
/// # Returns
/// * `Result<(Arc<Connection>, Arc<Channel>), AmqpError>` -
///   A tuple containing the connection and channel on success, or an error on failure.
pub async fn new_amqp_channel(
    params: &ConnectionParameters,
) -> Result<(Arc<Connection>, Arc<Channel>), AmqpError> {
    debug!(url = params.redacted_url(), "creating amqp connection...");
    let options = ConnectionProperties::default()
        .with_connection_name(LongString::from(params.connection_name.clone()));

    let uri = amqp_uri(params);

    let connected = match &params.tls {
        None => Connection::connect_uri(uri, options).await,
        Some(tls) => {
            let config = tls_config(tls).await?;
            Connection::connect_uri_with_config(uri, options, config).await
        }
    };

    let conn = match connected {
        Ok(c) => Ok(c),
        Err(err) => {
            error!(error = err.to_string(), "failure to connect");
            Err(AmqpError::ConnectionError {})
        }
    }?;
    debug!("amqp connected");

    debug!("creating amqp channel...");
    match conn.create_channel().await {
        Ok(c) => {
            debug!("channel created");
            Ok((Arc::new(conn), Arc::new(c)))
        }
        Err(err) => {
            error!(error = err.to_string(), "error to create the channel");
            Err(AmqpError::ChannelError {})
        }
    }
}

/// TLS settings for lapin: the CA chain in PEM form.
///
/// lapin takes a client identity only as a PKCS#12 bundle, so PEM client
/// key/certificate paths are not presented on this connection; they stay in
/// the URL form of the parameters.
async fn tls_config(tls: &TlsMaterial) -> Result<OwnedTLSConfig, AmqpError> {
    let cert_chain = tokio::fs::read_to_string(&tls.ca_cert_file)
        .await
        .map_err(|err| {
            error!(
                error = err.to_string(),
                path = tls.ca_cert_file,
                "failure to read ca certificate"
            );
            AmqpError::ConfigurationError(format!("unreadable `{}`", tls.ca_cert_file))
        })?;

    if tls.has_client_identity() {
        warn!("client key and certificate are not presented on the lapin connection");
    }

    Ok(OwnedTLSConfig {
        cert_chain: Some(cert_chain),
        identity: None,
    })
}

fn amqp_uri(params: &ConnectionParameters) -> AMQPUri {
    AMQPUri {
        scheme: if params.is_encrypted() {
            AMQPScheme::AMQPS
        } else {
            AMQPScheme::AMQP
        },
        authority: AMQPAuthority {
            userinfo: AMQPUserInfo {
                username: params.credentials.user.clone(),
                password: params.credentials.password.clone(),
            },
            host: params.host.clone(),
            port: params.port,
        },
        vhost: params.virtual_host.clone(),
        query: AMQPQueryString {
            heartbeat: Some(params.heartbeat),
            ..AMQPQueryString::default()
        },
    }
}

/// `BrokerChannel` over a lapin connection/channel pair.
pub struct LapinChannel {
    conn: Arc<Connection>,
    channel: Arc<Channel>,
}

impl LapinChannel {
    pub fn new(conn: Arc<Connection>, channel: Arc<Channel>) -> Self {
        LapinChannel { conn, channel }
    }
}

#[async_trait]
impl BrokerChannel for LapinChannel {
    async fn qos(&self, prefetch_count: u16) -> Result<(), AmqpError> {
        self.channel
            .basic_qos(prefetch_count, BasicQosOptions { global: false })
            .await
            .map_err(|err| {
                error!(error = err.to_string(), "error to configure qos");
                AmqpError::QoSDeclarationError(err.to_string())
            })
    }

    async fn declare_exchange(&self, def: &ExchangeDefinition) -> Result<(), AmqpError> {
        self.channel
            .exchange_declare(
                &def.name,
                def.kind.clone().into(),
                ExchangeDeclareOptions {
                    passive: false,
                    durable: def.durable,
                    auto_delete: false,
                    internal: false,
                    nowait: false,
                },
                FieldTable::default(),
            )
            .await
            .map_err(|err| {
                error!(
                    error = err.to_string(),
                    name = def.name,
                    "error to declare the exchange"
                );
                AmqpError::DeclareExchangeError(def.name.clone())
            })
    }

    async fn declare_queue(&self, def: &QueueDefinition) -> Result<String, AmqpError> {
        match self
            .channel
            .queue_declare(
                &def.name,
                QueueDeclareOptions {
                    passive: false,
                    durable: def.durable,
                    exclusive: def.exclusive,
                    auto_delete: false,
                    nowait: false,
                },
                queue_arguments(def),
            )
            .await
        {
            Ok(queue) => Ok(queue.name().to_string()),
            Err(err) if is_precondition_failed(&err) => {
                error!(
                    error = err.to_string(),
                    name = def.name,
                    "queue exists with different arguments"
                );
                Err(AmqpError::QueueConfigConflict(def.name.clone()))
            }
            Err(err) => {
                error!(error = err.to_string(), name = def.name, "error to declare the queue");
                Err(AmqpError::DeclareQueueError(def.name.clone()))
            }
        }
    }

    async fn bind_queue(&self, binding: &QueueBinding) -> Result<(), AmqpError> {
        self.channel
            .queue_bind(
                &binding.queue_name,
                &binding.exchange_name,
                &binding.routing_key,
                QueueBindOptions { nowait: false },
                FieldTable::default(),
            )
            .await
            .map_err(|err| {
                error!(error = err.to_string(), "error to bind queue to exchange");
                AmqpError::BindingExchangeToQueueError(
                    binding.exchange_name.clone(),
                    binding.queue_name.clone(),
                )
            })
    }

    async fn consume(&self, queue: &str, consumer_tag: &str) -> Result<DeliveryStream, AmqpError> {
        let consumer = self
            .channel
            .basic_consume(
                queue,
                consumer_tag,
                BasicConsumeOptions {
                    no_local: false,
                    no_ack: false,
                    exclusive: false,
                    nowait: false,
                },
                FieldTable::default(),
            )
            .await
            .map_err(|err| {
                error!(error = err.to_string(), "error to create the consumer");
                AmqpError::BindingConsumerError(queue.to_owned())
            })?;

        Ok(consumer
            .map(|result| match result {
                Ok(delivery) => Ok(Delivery {
                    delivery_tag: delivery.delivery_tag,
                    properties: properties_from(&delivery.properties),
                    redelivered: delivery.redelivered,
                    body: delivery.data,
                }),
                Err(err) => Err(AmqpError::ChannelClosed(err.to_string())),
            })
            .boxed())
    }

    async fn ack(&self, delivery_tag: u64) -> Result<(), AmqpError> {
        self.channel
            .basic_ack(delivery_tag, BasicAckOptions { multiple: false })
            .await
            .map_err(|err| {
                error!(error = err.to_string(), delivery_tag, "error whiling ack msg");
                AmqpError::AckMessageError
            })
    }

    async fn cancel(&self, consumer_tag: &str) -> Result<(), AmqpError> {
        self.channel
            .basic_cancel(consumer_tag, BasicCancelOptions { nowait: false })
            .await
            .map_err(|err| {
                error!(error = err.to_string(), consumer_tag, "error to cancel the consumer");
                AmqpError::CancelConsumerError
            })
    }

    async fn publish(
        &self,
        exchange: &str,
        routing_key: &str,
        body: &[u8],
        properties: &MessageProperties,
    ) -> Result<(), AmqpError> {
        match self
            .channel
            .basic_publish(
                exchange,
                routing_key,
                BasicPublishOptions {
                    immediate: false,
                    mandatory: false,
                },
                body,
                basic_properties(properties),
            )
            .await
        {
            Err(err) => {
                error!(error = err.to_string(), "error publishing message");
                Err(AmqpError::PublishingError)
            }
            _ => Ok(()),
        }
    }

    async fn close(&self) -> Result<(), AmqpError> {
        if self.channel.status().connected() {
            if let Err(err) = self.channel.close(200, "OK").await {
                error!(error = err.to_string(), "error to close the channel");
                return Err(AmqpError::ChannelError);
            }
        }

        if self.conn.status().connected() {
            if let Err(err) = self.conn.close(200, "OK").await {
                error!(error = err.to_string(), "error to close the connection");
                return Err(AmqpError::ConnectionError);
            }
        }

        debug!("channel and connection closed");
        Ok(())
    }

    fn is_connected(&self) -> bool {
        self.conn.status().connected() && self.channel.status().connected()
    }
}

fn is_precondition_failed(err: &lapin::Error) -> bool {
    match err {
        lapin::Error::ProtocolError(amqp) => matches!(
            amqp.kind(),
            AMQPErrorKind::Soft(AMQPSoftError::PRECONDITIONFAILED)
        ),
        _ => false,
    }
}

fn basic_properties(props: &MessageProperties) -> BasicProperties {
    let delivery_mode = if props.persistent {
        PERSISTENT_DELIVERY_MODE
    } else {
        TRANSIENT_DELIVERY_MODE
    };

    let headers: BTreeMap<ShortString, AMQPValue> = props
        .headers
        .iter()
        .map(|(k, v)| {
            (
                ShortString::from(k.clone()),
                AMQPValue::LongString(LongString::from(v.clone())),
            )
        })
        .collect();

    let mut basic = BasicProperties::default()
        .with_delivery_mode(delivery_mode)
        .with_headers(FieldTable::from(headers));

    if let Some(app_id) = &props.app_id {
        basic = basic.with_app_id(ShortString::from(app_id.clone()));
    }
    if let Some(priority) = props.priority {
        basic = basic.with_priority(priority);
    }
    if let Some(message_id) = &props.message_id {
        basic = basic.with_message_id(ShortString::from(message_id.clone()));
    }

    basic
}

fn properties_from(props: &BasicProperties) -> MessageProperties {
    let mut headers = BTreeMap::new();
    if let Some(table) = props.headers() {
        for (key, value) in table.inner() {
            let text = match value {
                AMQPValue::LongString(v) => std::str::from_utf8(v.as_bytes()).ok().map(str::to_owned),
                AMQPValue::ShortString(v) => Some(v.to_string()),
                _ => None,
            };
            if let Some(text) = text {
                headers.insert(key.to_string(), text);
            }
        }
    }

    MessageProperties {
        app_id: props.app_id().as_ref().map(|v| v.to_string()),
        priority: *props.priority(),
        persistent: *props.delivery_mode() == Some(PERSISTENT_DELIVERY_MODE),
        message_id: props.message_id().as_ref().map(|v| v.to_string()),
        headers,
    }
}
