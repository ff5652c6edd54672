use crate::client::{is_valid_channel_name, is_valid_topic_name};
use core_config::{env_list, env_or_default, env_parse, ConfigError, FromEnv, VarSource};
use messaging::ConnectorError;
use serde::Deserialize;
use std::borrow::Cow;
use tls_config::TlsConfig;
use validator::{Validate, ValidationError, ValidationErrors};

fn validate_topic(topic: &str) -> Result<(), ValidationError> {
    if !is_valid_topic_name(topic) {
        return Err(ValidationError::new("invalid_topic")
            .with_message(Cow::from(format!("invalid topic name {topic:?}"))));
    }
    Ok(())
}

fn validate_channel(channel: &str) -> Result<(), ValidationError> {
    if !is_valid_channel_name(channel) {
        return Err(ValidationError::new("invalid_channel")
            .with_message(Cow::from(format!("invalid channel name {channel:?}"))));
    }
    Ok(())
}

fn validate_reader_addresses(config: &NsqReaderConfig) -> Result<(), ValidationError> {
    if config.addresses.is_empty() && config.lookup_addresses.is_empty() {
        return Err(ValidationError::new("no_addresses")
            .with_message(Cow::from("at least one nsqd or nsqlookupd address is required")));
    }
    Ok(())
}

/// Flatten validator output into one message, sorted so it is stable.
pub(crate) fn validation_message(errors: &ValidationErrors) -> String {
    let mut messages: Vec<String> = errors
        .field_errors()
        .iter()
        .flat_map(|(field, errors)| {
            errors.iter().map(move |err| match &err.message {
                Some(message) => message.to_string(),
                None => format!("{field}: {}", err.code),
            })
        })
        .collect();
    messages.sort();
    messages.join("; ")
}

/// Settings for [`NsqReader`](crate::NsqReader).
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Validate)]
#[serde(default)]
#[validate(schema(function = "validate_reader_addresses"))]
pub struct NsqReaderConfig {
    /// nsqd TCP addresses to connect to directly
    pub addresses: Vec<String>,
    /// nsqlookupd HTTP addresses used for discovery
    pub lookup_addresses: Vec<String>,
    #[validate(custom(function = "validate_topic"))]
    pub topic: String,
    #[validate(custom(function = "validate_channel"))]
    pub channel: String,
    pub user_agent: String,
    /// Maximum messages in flight across all connections
    pub max_in_flight: u32,
    /// Deliveries after which a message is discarded; 0 means unlimited
    pub max_attempts: u16,
    pub tls: TlsConfig,
}

impl Default for NsqReaderConfig {
    fn default() -> Self {
        Self {
            addresses: vec!["127.0.0.1:4150".to_string()],
            lookup_addresses: vec!["127.0.0.1:4161".to_string()],
            topic: "chatc".to_string(),
            channel: "chatc".to_string(),
            user_agent: String::new(),
            max_in_flight: 100,
            max_attempts: 5,
            tls: TlsConfig::default(),
        }
    }
}

impl NsqReaderConfig {
    pub fn check(&self) -> Result<(), ConnectorError> {
        self.validate()
            .map_err(|e| ConnectorError::Validation(validation_message(&e)))
    }
}

impl FromEnv for NsqReaderConfig {
    fn from_source(source: &dyn VarSource) -> Result<Self, ConfigError> {
        Ok(Self {
            addresses: env_list(source, "NSQ_ADDRESSES", &["127.0.0.1:4150"]),
            lookup_addresses: env_list(source, "NSQ_LOOKUP_ADDRESSES", &["127.0.0.1:4161"]),
            topic: env_or_default(source, "NSQ_TOPIC", "chatc"),
            channel: env_or_default(source, "NSQ_CHANNEL", "chatc"),
            user_agent: env_or_default(source, "NSQ_USER_AGENT", ""),
            max_in_flight: env_parse(source, "NSQ_MAX_IN_FLIGHT", 100)?,
            max_attempts: env_parse(source, "NSQ_MAX_ATTEMPTS", 5)?,
            tls: TlsConfig::from_source(source)?,
        })
    }
}

/// Settings for [`NsqWriter`](crate::NsqWriter).
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Validate)]
#[serde(default)]
pub struct NsqWriterConfig {
    #[validate(length(min = 1, message = "nsq address is required"))]
    pub address: String,
    pub user_agent: String,
    pub max_in_flight: u32,
    pub tls: TlsConfig,
}

impl Default for NsqWriterConfig {
    fn default() -> Self {
        Self {
            address: "127.0.0.1:4150".to_string(),
            user_agent: "nsq-connector producer/1.0".to_string(),
            max_in_flight: 64,
            tls: TlsConfig::default(),
        }
    }
}

impl NsqWriterConfig {
    pub fn check(&self) -> Result<(), ConnectorError> {
        self.validate()
            .map_err(|e| ConnectorError::Validation(validation_message(&e)))
    }
}

impl FromEnv for NsqWriterConfig {
    fn from_source(source: &dyn VarSource) -> Result<Self, ConfigError> {
        Ok(Self {
            address: env_or_default(source, "NSQ_WRITER_ADDRESS", "127.0.0.1:4150"),
            user_agent: env_or_default(
                source,
                "NSQ_WRITER_USER_AGENT",
                "nsq-connector producer/1.0",
            ),
            max_in_flight: env_parse(source, "NSQ_WRITER_MAX_IN_FLIGHT", 64)?,
            tls: TlsConfig::from_source(source)?,
        })
    }
}
