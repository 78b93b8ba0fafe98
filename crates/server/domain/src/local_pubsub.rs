use async_trait::async_trait;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum LocalPubSubError {
    #[error("Publish to topic {topic} failed: {reason}")]
    Publish { topic: String, reason: String },
}

/// In-process topic pub/sub that local sockets subscribe to
#[async_trait]
pub trait LocalPubSub: Send + Sync {
    /// Delivers `payload` to every socket subscribed to exactly `topic`.
    ///
    /// Returns how many sockets accepted it.
    async fn publish(&self, topic: &str, payload: String) -> Result<usize, LocalPubSubError>;

    async fn num_subscribers(&self, topic: &str) -> usize;
}
