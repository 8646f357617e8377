// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Site Configuration
//!
//! Raw broker settings as provided by the site. Values are read from the
//! environment with the `SITE_RBMQ_` prefix (for example `SITE_RBMQ_SERVER_HOST`)
//! and are only validated when the `ConnectionProvider` resolves them.

use crate::errors::AmqpError;
use config::{Config, Environment};
use serde::Deserialize;
use tracing::error;

/// Environment prefix used for every broker setting
pub const ENV_PREFIX: &str = "SITE_RBMQ";

pub const DEFAULT_PORT: u16 = 5672;
pub const DEFAULT_SSL_PORT: u16 = 5671;
pub const DEFAULT_HEARTBEAT_SECS: u16 = 60;
pub const DEFAULT_CONNECTION_NAME: &str = "message-queue";

/// Broker settings for one site.
///
/// Every field required to connect is optional here; a missing value is a
/// `ConfigurationError` raised at resolve time, not at load time.
#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
pub struct RabbitMqConfigs {
    #[serde(default)]
    pub server_host: Option<String>,
    #[serde(default = "default_port")]
    pub server_port: u16,
    #[serde(default = "default_ssl_port")]
    pub ssl_server_port: u16,
    #[serde(default)]
    pub user_name: Option<String>,
    #[serde(default)]
    pub password: Option<String>,
    #[serde(default)]
    pub virtual_host: Option<String>,
    #[serde(default)]
    pub ssl_ca_cert_file: Option<String>,
    #[serde(default)]
    pub ssl_key_file: Option<String>,
    #[serde(default)]
    pub ssl_cert_file: Option<String>,
    /// Selects the site default transport; any value containing `SSL` means encrypted
    #[serde(default)]
    pub client_protocol: String,
    #[serde(default = "default_heartbeat")]
    pub heartbeat: u16,
    #[serde(default = "default_connection_name")]
    pub connection_name: String,
}

fn default_port() -> u16 {
    DEFAULT_PORT
}

fn default_ssl_port() -> u16 {
    DEFAULT_SSL_PORT
}

fn default_heartbeat() -> u16 {
    DEFAULT_HEARTBEAT_SECS
}

fn default_connection_name() -> String {
    DEFAULT_CONNECTION_NAME.to_owned()
}

impl Default for RabbitMqConfigs {
    fn default() -> Self {
        RabbitMqConfigs {
            server_host: None,
            server_port: DEFAULT_PORT,
            ssl_server_port: DEFAULT_SSL_PORT,
            user_name: None,
            password: None,
            virtual_host: None,
            ssl_ca_cert_file: None,
            ssl_key_file: None,
            ssl_cert_file: None,
            client_protocol: String::new(),
            heartbeat: DEFAULT_HEARTBEAT_SECS,
            connection_name: DEFAULT_CONNECTION_NAME.to_owned(),
        }
    }
}

/// Values stay strings until deserialized, so numeric looking credentials
/// such as `0123` are kept verbatim.
fn environment() -> Environment {
    Environment::with_prefix(ENV_PREFIX)
}

impl RabbitMqConfigs {
    /// Loads the settings from `SITE_RBMQ_*` environment variables.
    pub fn load() -> Result<Self, AmqpError> {
        Self::load_from(environment())
    }

    fn load_from(source: Environment) -> Result<Self, AmqpError> {
        let cfg = Config::builder()
            .add_source(source)
            .build()
            .map_err(|err| {
                error!(error = err.to_string(), "failure to read broker settings");
                AmqpError::ConfigurationError(err.to_string())
            })?;

        Self::from_config(cfg)
    }

    /// Deserializes the settings from an already built `config::Config`.
    pub fn from_config(cfg: Config) -> Result<Self, AmqpError> {
        cfg.try_deserialize().map_err(|err| {
            error!(error = err.to_string(), "invalid broker settings");
            AmqpError::ConfigurationError(err.to_string())
        })
    }

    /// Whether the site default transport is TLS.
    pub fn prefers_ssl(&self) -> bool {
        self.client_protocol.contains("SSL")
    }
}
