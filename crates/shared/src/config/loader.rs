//! Configuration loader
//!
//! Loads configuration from an optional `.env` file and environment variables.

use std::path::Path;

use super::dto::{
    BrokerConfig, ChannelConfig, ConsumerConfig, FeatureFlags, LoggingConfig, PublisherConfig,
    ServerConfigDto,
};
use super::error::{ConfigError, Result};
use super::validator::validate_server_config;
use crate::ids::InstanceId;

/// Configuration loader
///
/// This loader handles loading configuration from:
/// 1. .env file (optional, highest priority)
/// 2. Environment variables
///
/// # Example
///
/// ```ignore
/// use roomcast_shared::config::ConfigLoader;
/// use std::path::PathBuf;
///
/// let loader = ConfigLoader::new(Some(PathBuf::from(".env")));
/// let config = loader.load_server_config()?;
/// ```
#[derive(Debug, Clone)]
pub struct ConfigLoader {
    /// Optional path to .env file
    env_file_path: Option<std::path::PathBuf>,
    /// Dev mode requested on the command line, regardless of the environment
    force_dev_mode: bool,
}

impl ConfigLoader {
    /// Create a new ConfigLoader
    ///
    /// # Example
    ///
    /// ```
    /// use roomcast_shared::config::ConfigLoader;
    ///
    /// // Without .env file
    /// let loader = ConfigLoader::new(None);
    ///
    /// // With .env file
    /// let loader = ConfigLoader::new(Some(".env".into()));
    /// ```
    pub fn new(env_file_path: Option<std::path::PathBuf>) -> Self {
        Self {
            env_file_path,
            force_dev_mode: false,
        }
    }

    /// Forces the in-memory broker on top of whatever `ROOMCAST_DEV_MODE` says
    pub fn with_dev_mode(mut self, dev_mode: bool) -> Self {
        self.force_dev_mode = dev_mode;
        self
    }

    /// Load and validate server configuration
    ///
    /// # Returns
    ///
    /// `Ok(ServerConfigDto)` if configuration is valid and complete
    /// `Err(ConfigError)` if required configuration is missing or invalid
    pub fn load_server_config(&self) -> Result<ServerConfigDto> {
        if let Some(path) = &self.env_file_path {
            self.load_env_file(path)?;
        }

        let mut features = FeatureFlags::from_env()?;
        features.dev_mode |= self.force_dev_mode;
        let config = ServerConfigDto::from_env_with(features)?;
        validate_server_config(&config)?;

        Ok(config)
    }

    fn load_env_file(&self, path: &Path) -> Result<()> {
        if !path.exists() {
            return Err(ConfigError::EnvFileLoad {
                path: path.to_path_buf(),
                source: dotenv::Error::Io(std::io::Error::new(
                    std::io::ErrorKind::NotFound,
                    format!("File not found: {}", path.display()),
                )),
            });
        }

        dotenv::from_path(path).map_err(|e| ConfigError::EnvFileLoad {
            path: path.to_path_buf(),
            source: e,
        })?;

        Ok(())
    }
}

impl Default for ConfigLoader {
    /// Create a ConfigLoader without .env file support
    fn default() -> Self {
        Self::new(None)
    }
}

// ============================================================================
// Implementation: ServerConfigDto::from_env
// ============================================================================

impl ServerConfigDto {
    /// Build server configuration from environment variables
    ///
    /// Fails with `ConfigError::MissingRequired` when `ROOMCAST_AMQP_URL` is
    /// unset (unless dev mode is on) and with `ConfigError::InvalidValue` when a
    /// set variable cannot be parsed.
    pub fn from_env() -> Result<Self> {
        Self::from_env_with(FeatureFlags::from_env()?)
    }

    /// Same as [`from_env`](Self::from_env) with feature flags already resolved
    pub fn from_env_with(features: FeatureFlags) -> Result<Self> {
        let instance_id = match std::env::var("ROOMCAST_INSTANCE_ID") {
            Ok(raw) => InstanceId::parse(raw.clone()).map_err(|_| ConfigError::InvalidValue {
                var: "ROOMCAST_INSTANCE_ID".to_string(),
                value: raw,
            })?,
            Err(_) => InstanceId::new(),
        };

        Ok(Self {
            instance_id,
            broker: BrokerConfig::from_env(features.dev_mode)?,
            consumers: ConsumerConfig::from_env()?,
            channel: ChannelConfig::from_env()?,
            publisher: PublisherConfig::from_env()?,
            logging: LoggingConfig::from_env(),
            features,
        })
    }
}

impl BrokerConfig {
    /// # Required Variables
    ///
    /// - `ROOMCAST_AMQP_URL` (optional in dev mode)
    ///
    /// # Optional Variables
    ///
    /// - `ROOMCAST_ROOMS_EXCHANGE`: Default "ds-rooms"
    /// - `ROOMCAST_PERSISTENCE_EXCHANGE`: Default "ds-persistence"
    pub fn from_env(dev_mode: bool) -> Result<Self> {
        let defaults = Self::default();

        let url = match std::env::var("ROOMCAST_AMQP_URL") {
            Ok(url) => url.trim().to_string(),
            Err(_) if dev_mode => defaults.url,
            Err(_) => {
                return Err(ConfigError::MissingRequired {
                    var: "ROOMCAST_AMQP_URL".to_string(),
                });
            }
        };

        Ok(Self {
            url,
            rooms_exchange: std::env::var("ROOMCAST_ROOMS_EXCHANGE")
                .unwrap_or(defaults.rooms_exchange),
            persistence_exchange: std::env::var("ROOMCAST_PERSISTENCE_EXCHANGE")
                .unwrap_or(defaults.persistence_exchange),
        })
    }
}

impl ConsumerConfig {
    /// # Optional Variables
    ///
    /// - `ROOMCAST_QUEUE_COUNT`: Default 20
    /// - `ROOMCAST_QUEUE_AUTO_DELETE`: Default 1
    /// - `ROOMCAST_QUEUE_DURABLE`: Default 0
    /// - `ROOMCAST_CONSUMER_CONCURRENCY`: Default 5
    /// - `ROOMCAST_CONSUMER_PREFETCH`: Default 20
    pub fn from_env() -> Result<Self> {
        let defaults = Self::default();
        Ok(Self {
            queue_count: parse_optional_var("ROOMCAST_QUEUE_COUNT", defaults.queue_count)?,
            auto_delete: parse_flag("ROOMCAST_QUEUE_AUTO_DELETE", defaults.auto_delete)?,
            durable: parse_flag("ROOMCAST_QUEUE_DURABLE", defaults.durable)?,
            concurrency: parse_optional_var("ROOMCAST_CONSUMER_CONCURRENCY", defaults.concurrency)?,
            prefetch_count: parse_optional_var(
                "ROOMCAST_CONSUMER_PREFETCH",
                defaults.prefetch_count,
            )?,
        })
    }
}

impl ChannelConfig {
    /// # Optional Variables
    ///
    /// - `ROOMCAST_CHANNEL_MAX_RECONNECT_ATTEMPTS`: Default 5
    /// - `ROOMCAST_CHANNEL_RECONNECT_INTERVAL_MS`: Default 5000
    pub fn from_env() -> Result<Self> {
        let defaults = Self::default();
        Ok(Self {
            max_reconnect_attempts: parse_optional_var(
                "ROOMCAST_CHANNEL_MAX_RECONNECT_ATTEMPTS",
                defaults.max_reconnect_attempts,
            )?,
            reconnect_interval_ms: parse_optional_var(
                "ROOMCAST_CHANNEL_RECONNECT_INTERVAL_MS",
                defaults.reconnect_interval_ms,
            )?,
        })
    }
}

impl PublisherConfig {
    /// # Optional Variables
    ///
    /// - `ROOMCAST_PUBLISHER_MAX_ATTEMPTS`: Default 2
    pub fn from_env() -> Result<Self> {
        Ok(Self {
            max_attempts: parse_optional_var(
                "ROOMCAST_PUBLISHER_MAX_ATTEMPTS",
                Self::default().max_attempts,
            )?,
        })
    }
}

impl LoggingConfig {
    /// # Optional Variables
    ///
    /// - `RUST_LOG`: Log level (default: "info")
    pub fn from_env() -> Self {
        Self {
            level: std::env::var("RUST_LOG").unwrap_or_else(|_| "info".to_string()),
        }
    }
}

impl FeatureFlags {
    /// # Optional Variables
    ///
    /// - `ROOMCAST_DEV_MODE`: "1"=in-memory broker (default: 0)
    pub fn from_env() -> Result<Self> {
        Ok(Self {
            dev_mode: parse_flag("ROOMCAST_DEV_MODE", false)?,
        })
    }
}

// ============================================================================
// Helper Functions
// ============================================================================

/// Parse an optional variable; unset means default, unparsable is an error
fn parse_optional_var<T>(var: &str, default: T) -> Result<T>
where
    T: std::str::FromStr,
{
    match std::env::var(var) {
        Ok(raw) => raw.trim().parse().map_err(|_| ConfigError::InvalidValue {
            var: var.to_string(),
            value: raw,
        }),
        Err(_) => Ok(default),
    }
}

/// Parse a "0"/"1" flag
fn parse_flag(var: &str, default: bool) -> Result<bool> {
    match std::env::var(var) {
        Ok(raw) => match raw.trim() {
            "1" | "true" => Ok(true),
            "0" | "false" => Ok(false),
            _ => Err(ConfigError::InvalidValue {
                var: var.to_string(),
                value: "must be 0 or 1".to_string(),
            }),
        },
        Err(_) => Ok(default),
    }
}

// ============================================================================
// Tests
// ============================================================================
