//! Broker ports.
//!
//! The engine talks to the message broker only through these traits. The
//! AMQP adapter and the in-memory broker both live in the infrastructure
//! crate.

use async_trait::async_trait;
use std::fmt;
use std::sync::Arc;
use thiserror::Error;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum BrokerError {
    #[error("Connection error: {0}")]
    Connection(String),

    #[error("Not connected to broker")]
    NotConnected,

    #[error("Channel error: {0}")]
    Channel(String),

    #[error("Channel is closed")]
    ChannelClosed,

    #[error("Topology error: {0}")]
    Topology(String),

    #[error("Publish not confirmed: {0}")]
    PublishNotConfirmed(String),

    #[error("Publish failed after {attempts} attempt(s): {reason}")]
    PublishFailed { attempts: u32, reason: String },

    #[error("Consumer error: {0}")]
    Consumer(String),
}

/// Error returned by a delivery handler; the delivery is dropped
pub type HandlerError = Box<dyn std::error::Error + Send + Sync>;

/// Callback invoked for connection-level errors
pub type ErrorObserver = Arc<dyn Fn(BrokerError) + Send + Sync>;

/// A durable topic exchange
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExchangeSpec {
    pub name: String,
    pub durable: bool,
}

impl ExchangeSpec {
    pub fn topic(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            durable: true,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueueSpec {
    pub name: String,
    pub durable: bool,
    pub auto_delete: bool,
}

/// Everything needed to start one shard consumer
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConsumerSpec {
    pub queue: QueueSpec,
    pub exchange: ExchangeSpec,
    pub consumer_tag: String,
    /// Deliveries handled at the same time
    pub concurrency: usize,
    /// Unacknowledged deliveries the broker may push ahead
    pub prefetch_count: u16,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Delivery {
    pub routing_key: String,
    pub body: Vec<u8>,
    pub redelivered: bool,
}

/// Why an administrative channel stopped
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChannelClosure {
    /// `true` when we closed it ourselves
    pub solicited: bool,
    pub reason: String,
}

impl ChannelClosure {
    pub fn solicited() -> Self {
        Self {
            solicited: true,
            reason: "closed by client".to_string(),
        }
    }

    pub fn unsolicited(reason: impl Into<String>) -> Self {
        Self {
            solicited: false,
            reason: reason.into(),
        }
    }
}

impl fmt::Display for ChannelClosure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.solicited {
            write!(f, "solicited: {}", self.reason)
        } else {
            write!(f, "unsolicited: {}", self.reason)
        }
    }
}

/// Opens connections; one per process in practice
#[async_trait]
pub trait BrokerConnector: Send + Sync {
    async fn connect(&self, url: &str) -> Result<Arc<dyn BrokerConnection>, BrokerError>;
}

#[async_trait]
pub trait BrokerConnection: Send + Sync {
    /// Channel dedicated to bind/unbind calls
    async fn create_admin_channel(&self) -> Result<Arc<dyn AdminChannel>, BrokerError>;

    /// Declares `exchange` and returns a publisher in confirm mode
    async fn create_publisher(
        &self,
        exchange: &ExchangeSpec,
    ) -> Result<Arc<dyn ConfirmPublisher>, BrokerError>;

    /// Declares the exchange and queue, then consumes it.
    ///
    /// Deliveries are acknowledged when `handler` succeeds and rejected
    /// without requeue when it fails.
    async fn start_consumer(
        &self,
        spec: ConsumerSpec,
        handler: Arc<dyn DeliveryHandler>,
    ) -> Result<Box<dyn ConsumerHandle>, BrokerError>;

    /// Registers a callback for connection-level errors
    fn on_error(&self, observer: ErrorObserver);

    fn is_connected(&self) -> bool;

    async fn close(&self) -> Result<(), BrokerError>;
}

#[async_trait]
pub trait AdminChannel: Send + Sync {
    async fn queue_bind(
        &self,
        queue: &str,
        exchange: &str,
        routing_key: &str,
    ) -> Result<(), BrokerError>;

    async fn queue_unbind(
        &self,
        queue: &str,
        exchange: &str,
        routing_key: &str,
    ) -> Result<(), BrokerError>;

    /// Resolves once the channel is closed, by either side
    async fn closed(&self) -> ChannelClosure;

    async fn close(&self) -> Result<(), BrokerError>;

    fn is_open(&self) -> bool;
}

#[async_trait]
pub trait ConfirmPublisher: Send + Sync {
    /// One publish, resolved when the broker confirms it
    async fn publish(
        &self,
        exchange: &str,
        routing_key: &str,
        body: &[u8],
    ) -> Result<(), BrokerError>;
}

#[async_trait]
pub trait DeliveryHandler: Send + Sync {
    async fn handle(&self, delivery: Delivery) -> Result<(), HandlerError>;
}

#[async_trait]
pub trait ConsumerHandle: Send + Sync {
    fn queue(&self) -> &str;

    async fn cancel(&self) -> Result<(), BrokerError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_topic_exchange_is_durable() {
        let exchange = ExchangeSpec::topic("ds-rooms");
        assert!(exchange.durable);
        assert_eq!(exchange.name, "ds-rooms");
    }

    #[test]
    fn test_channel_closure_display() {
        assert_eq!(
            ChannelClosure::unsolicited("404 NOT_FOUND").to_string(),
            "unsolicited: 404 NOT_FOUND"
        );
        assert!(ChannelClosure::solicited().solicited);
    }

    #[test]
    fn test_publish_failed_message() {
        let err = BrokerError::PublishFailed {
            attempts: 2,
            reason: "nack".to_string(),
        };
        assert_eq!(err.to_string(), "Publish failed after 2 attempt(s): nack");
    }
}
