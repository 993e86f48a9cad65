//! MQTT configuration and transport errors

use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    /// A topic string violates the MQTT topic rules
    #[error("invalid topic '{topic}': {reason}")]
    InvalidTopic { topic: String, reason: String },

    /// Both `availability_topic` and `availability` were configured
    #[error("availability_topic and availability are mutually exclusive")]
    Exclusive,

    /// A discovery payload failed to parse or validate
    #[error("invalid configuration payload: {0}")]
    Payload(String),

    /// A value template failed to compile or render
    #[error("template error: {0}")]
    Template(#[from] minijinja::Error),

    /// The broker connection failed
    #[error("mqtt client error: {0}")]
    Client(String),
}
