//! Confirm-mode publisher for outbound room traffic.

use crate::error::DispatchError;
use roomcast_server_domain::{
    BrokerConnection, BrokerError, ConfirmPublisher, ExchangeSpec, OutboundEnvelope, RoutingKey,
};
use roomcast_shared::config::PublisherConfig;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use tracing::{debug, error, instrument, warn};

pub struct AdministrativePublisher {
    publisher: Arc<dyn ConfirmPublisher>,
    exchange: String,
    max_attempts: u32,
    published: AtomicU64,
    failures: AtomicU64,
}

impl AdministrativePublisher {
    /// Declares the exchange and opens a confirm channel on it
    #[instrument(skip_all, fields(exchange = %exchange.name))]
    pub async fn create(
        connection: &Arc<dyn BrokerConnection>,
        exchange: ExchangeSpec,
        config: &PublisherConfig,
    ) -> Result<Self, BrokerError> {
        let publisher = connection.create_publisher(&exchange).await.map_err(|e| {
            error!(error = %e, "Failed to create publisher");
            e
        })?;
        Ok(Self::new(publisher, exchange.name, config.max_attempts))
    }

    pub fn new(
        publisher: Arc<dyn ConfirmPublisher>,
        exchange: impl Into<String>,
        max_attempts: u32,
    ) -> Self {
        Self {
            publisher,
            exchange: exchange.into(),
            max_attempts: max_attempts.max(1),
            published: AtomicU64::new(0),
            failures: AtomicU64::new(0),
        }
    }

    pub fn exchange(&self) -> &str {
        &self.exchange
    }

    /// Publishes `body`, retrying unconfirmed attempts up to `max_attempts`
    pub async fn send(&self, routing_key: &str, body: &[u8]) -> Result<(), BrokerError> {
        let mut last_error = None;
        for attempt in 1..=self.max_attempts {
            match self
                .publisher
                .publish(&self.exchange, routing_key, body)
                .await
            {
                Ok(()) => {
                    self.published.fetch_add(1, Ordering::Relaxed);
                    debug!(routing_key, attempt, "Publish confirmed");
                    return Ok(());
                }
                Err(e) => {
                    warn!(routing_key, attempt, error = %e, "Publish attempt failed");
                    last_error = Some(e);
                }
            }
        }

        self.failures.fetch_add(1, Ordering::Relaxed);
        let reason = last_error
            .map(|e| e.to_string())
            .unwrap_or_else(|| "no attempt made".to_string());
        error!(routing_key, attempts = self.max_attempts, %reason, "Publish failed");
        Err(BrokerError::PublishFailed {
            attempts: self.max_attempts,
            reason,
        })
    }

    pub async fn publish_message(
        &self,
        routing_key: &RoutingKey,
        envelope: &OutboundEnvelope,
    ) -> Result<(), DispatchError> {
        let body = envelope.to_bytes()?;
        self.send(routing_key.as_str(), &body).await?;
        Ok(())
    }

    pub fn published(&self) -> u64 {
        self.published.load(Ordering::Relaxed)
    }

    pub fn failures(&self) -> u64 {
        self.failures.load(Ordering::Relaxed)
    }
}
