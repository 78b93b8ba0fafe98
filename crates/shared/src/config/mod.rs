//! Configuration module for roomcast
//!
//! Centralized configuration loading, validation, and Data Transfer Objects
//! (DTOs) for the fan-out engine.
//!
//! # Architecture
//!
//! 1. **Single Source of Truth**: configuration is loaded once at startup
//! 2. **Fail Fast**: invalid values are reported immediately
//! 3. **DTO Pattern**: configuration is immutable and passed via dependency injection
//! 4. **Env File Priority**: `.env` file > environment variables > defaults
//!
//! # Usage
//!
//! ```ignore
//! use roomcast_shared::config::ConfigLoader;
//! use std::path::PathBuf;
//!
//! let loader = ConfigLoader::new(Some(PathBuf::from(".env")));
//! let config = loader.load_server_config()?;
//! println!("Consuming {} shard queues", config.consumers.queue_count);
//! ```
//!
//! # Environment Variables
//!
//! ## Required Variables
//!
//! - `ROOMCAST_AMQP_URL`: broker connection string (amqp:// or amqps://)
//!
//! ## Optional Variables
//!
//! - `ROOMCAST_INSTANCE_ID`: instance identity (default: random UUID)
//! - `ROOMCAST_ROOMS_EXCHANGE`: topic exchange for room traffic (default: "ds-rooms")
//! - `ROOMCAST_PERSISTENCE_EXCHANGE`: history exchange (default: "ds-persistence")
//! - `ROOMCAST_QUEUE_COUNT`: number of shard queues (default: 20)
//! - `ROOMCAST_QUEUE_AUTO_DELETE`: "1"=auto-delete shard queues (default: 1)
//! - `ROOMCAST_QUEUE_DURABLE`: "1"=durable shard queues (default: 0)
//! - `ROOMCAST_CONSUMER_CONCURRENCY`: in-flight handlers per shard (default: 5)
//! - `ROOMCAST_CONSUMER_PREFETCH`: unacked deliveries per shard (default: 20)
//! - `ROOMCAST_PUBLISHER_MAX_ATTEMPTS`: publish attempts (default: 2)
//! - `ROOMCAST_CHANNEL_MAX_RECONNECT_ATTEMPTS`: admin channel retries (default: 5)
//! - `ROOMCAST_CHANNEL_RECONNECT_INTERVAL_MS`: delay between retries (default: 5000)
//! - `ROOMCAST_DEV_MODE`: "1"=use the in-memory broker (default: 0)
//! - `RUST_LOG`: log level (default: "info")

pub mod dto;
pub mod error;
pub mod loader;
pub mod validator;

pub use dto::{
    BrokerConfig, ChannelConfig, ConsumerConfig, FeatureFlags, LoggingConfig, PublisherConfig,
    ServerConfigDto,
};
pub use error::{ConfigError, Result};
pub use loader::ConfigLoader;
pub use validator::{
    validate_amqp_url, validate_channel_config, validate_consumer_config, validate_exchange_name,
    validate_publisher_config, validate_server_config,
};
