use roomcast_server_domain::{
    BrokerError, EnvelopeError, LocalPubSubError, MetricsQueueError,
};
use roomcast_shared::SharedError;
use thiserror::Error;

/// Failure to get a message onto the rooms exchange
#[derive(Debug, Error)]
pub enum DispatchError {
    #[error("Cannot route room: {0}")]
    Routing(#[from] SharedError),

    #[error("Cannot encode envelope: {0}")]
    Envelope(#[from] EnvelopeError),

    #[error(transparent)]
    Broker(#[from] BrokerError),
}

/// Failure while handling one inbound delivery
#[derive(Debug, Error)]
pub enum RouterError {
    #[error("Rejected inbound message: {0}")]
    Envelope(#[from] EnvelopeError),

    #[error("Local delivery failed: {0}")]
    LocalPublish(#[from] LocalPubSubError),

    #[error("Delivery metrics enqueue failed: {0}")]
    Metrics(#[from] MetricsQueueError),
}
