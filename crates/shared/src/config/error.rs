//! Errors raised while reading `ROOMCAST_*` settings.

use std::path::PathBuf;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Missing required configuration: {var}")]
    MissingRequired { var: String },

    /// `value` could not be parsed as the type `var` expects
    #[error("Invalid value for {var}: {value}")]
    InvalidValue { var: String, value: String },

    #[error("Failed to load .env file from {path}: {source}")]
    EnvFileLoad {
        path: PathBuf,
        #[source]
        source: dotenv::Error,
    },

    /// A value parsed but is out of range, e.g. a queue count of zero
    #[error("Configuration validation failed: {0}")]
    Validation(String),

    /// Not an `amqp://` or `amqps://` URL with a host
    #[error("Invalid AMQP URL: {0}")]
    InvalidAmqpUrl(String),
}

pub type Result<T> = std::result::Result<T, ConfigError>;
