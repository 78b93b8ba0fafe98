//! One consumer per shard queue, created once at startup.

use roomcast_server_domain::{
    BrokerConnection, BrokerError, ConsumerHandle, ConsumerSpec, DeliveryHandler, ExchangeSpec,
    QueueSpec, ShardRouter,
};
use roomcast_shared::config::ConsumerConfig;
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{error, info, instrument, warn};

pub struct ShardConsumerPool {
    router: ShardRouter,
    exchange: ExchangeSpec,
    config: ConsumerConfig,
    consumers: Mutex<Vec<Box<dyn ConsumerHandle>>>,
}

impl ShardConsumerPool {
    pub fn new(router: ShardRouter, exchange: ExchangeSpec, config: ConsumerConfig) -> Self {
        Self {
            router,
            exchange,
            config,
            consumers: Mutex::new(Vec::new()),
        }
    }

    fn spec_for(&self, shard_index: u32) -> ConsumerSpec {
        let queue = self.router.queue_name(shard_index);
        ConsumerSpec {
            consumer_tag: format!("{}-consumer", queue),
            queue: QueueSpec {
                name: queue,
                durable: self.config.durable,
                auto_delete: self.config.auto_delete,
            },
            exchange: self.exchange.clone(),
            concurrency: self.config.concurrency,
            prefetch_count: self.config.prefetch_count,
        }
    }

    /// Starts `queue_count` consumers feeding `handler`.
    ///
    /// Calling this twice is a wiring bug: the second call is logged and
    /// refused. If one consumer fails to start, the ones already started are
    /// cancelled. A consumer that fails later is not recreated.
    #[instrument(skip(self, connection, handler), fields(queue_count = self.router.queue_count()))]
    pub async fn create_consumers(
        &self,
        connection: &Arc<dyn BrokerConnection>,
        handler: Arc<dyn DeliveryHandler>,
    ) -> Result<usize, BrokerError> {
        let mut consumers = self.consumers.lock().await;
        if !consumers.is_empty() {
            error!(
                existing = consumers.len(),
                "Shard consumers already created, refusing to create them again"
            );
            return Err(BrokerError::Consumer(
                "shard consumers already created".to_string(),
            ));
        }

        for shard_index in 0..self.router.queue_count() {
            let spec = self.spec_for(shard_index);
            let queue = spec.queue.name.clone();
            match connection.start_consumer(spec, handler.clone()).await {
                Ok(consumer) => consumers.push(consumer),
                Err(e) => {
                    error!(queue = %queue, error = %e, "Failed to start shard consumer");
                    // All or nothing, so a later create is not refused
                    for started in consumers.drain(..) {
                        if let Err(e) = started.cancel().await {
                            warn!(
                                queue = %started.queue(),
                                error = %e,
                                "Failed to cancel shard consumer"
                            );
                        }
                    }
                    return Err(e);
                }
            }
        }

        info!(
            count = consumers.len(),
            concurrency = self.config.concurrency,
            prefetch = self.config.prefetch_count,
            "Shard consumers started"
        );
        Ok(consumers.len())
    }

    pub async fn len(&self) -> usize {
        self.consumers.lock().await.len()
    }

    pub async fn queues(&self) -> Vec<String> {
        self.consumers
            .lock()
            .await
            .iter()
            .map(|c| c.queue().to_string())
            .collect()
    }

    /// Cancels every consumer; errors are logged and do not stop the sweep
    pub async fn cancel_all(&self) {
        let consumers = std::mem::take(&mut *self.consumers.lock().await);
        for consumer in consumers {
            if let Err(e) = consumer.cancel().await {
                warn!(queue = %consumer.queue(), error = %e, "Failed to cancel shard consumer");
            }
        }
    }
}
