//! Delivery loop shared by the broker adapters.
//!
//! Pulls deliveries from a stream, runs the handler with at most
//! `concurrency` deliveries in flight, then acknowledges or rejects each one.

use async_trait::async_trait;
use futures::{Stream, StreamExt};
use roomcast_server_domain::{BrokerError, Delivery, DeliveryHandler};
use std::sync::Arc;
use tokio::sync::{Semaphore, watch};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

/// Settles one delivery with the broker
#[async_trait]
pub trait DeliveryAck: Send + 'static {
    async fn ack(self) -> Result<(), BrokerError>;

    /// Rejects without requeue; the delivery is dropped
    async fn reject(self) -> Result<(), BrokerError>;
}

pub fn spawn_consumer_loop<S, A>(
    queue: String,
    deliveries: S,
    handler: Arc<dyn DeliveryHandler>,
    concurrency: usize,
    mut cancel: watch::Receiver<bool>,
) -> JoinHandle<()>
where
    S: Stream<Item = Result<(Delivery, A), BrokerError>> + Send + Unpin + 'static,
    A: DeliveryAck,
{
    tokio::spawn(async move {
        let limiter = Arc::new(Semaphore::new(concurrency.max(1)));
        let mut deliveries = deliveries;
        info!(queue = %queue, concurrency, "Consumer started");

        // Dropping the sender is not a cancel; only an explicit `true` is
        let mut cancellable = true;
        loop {
            let next = tokio::select! {
                changed = cancel.changed(), if cancellable => {
                    match changed {
                        Ok(()) if *cancel.borrow() => break,
                        Ok(()) => {}
                        Err(_) => cancellable = false,
                    }
                    continue;
                }
                next = deliveries.next() => next,
            };

            let (delivery, acker) = match next {
                Some(Ok(item)) => item,
                Some(Err(e)) => {
                    error!(queue = %queue, error = %e, "Consumer error");
                    continue;
                }
                None => {
                    warn!(queue = %queue, "Delivery stream ended");
                    break;
                }
            };

            let Ok(permit) = limiter.clone().acquire_owned().await else {
                break;
            };
            let handler = handler.clone();
            let queue = queue.clone();
            tokio::spawn(async move {
                let _permit = permit;
                match handler.handle(delivery).await {
                    Ok(()) => {
                        if let Err(e) = acker.ack().await {
                            warn!(queue = %queue, error = %e, "Failed to ack delivery");
                        }
                    }
                    Err(e) => {
                        error!(queue = %queue, error = %e, "Handler failed, dropping delivery");
                        if let Err(e) = acker.reject().await {
                            warn!(queue = %queue, error = %e, "Failed to reject delivery");
                        }
                    }
                }
            });
        }

        debug!(queue = %queue, "Consumer stopped");
    })
}
