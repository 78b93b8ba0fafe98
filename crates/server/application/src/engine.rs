//! Wiring of the fan-out services for one instance.

use crate::binding::BindingController;
use crate::connection::{BrokerConnectionManager, BrokerConnectionRegistry};
use crate::consumers::ShardConsumerPool;
use crate::dispatcher::Dispatcher;
use crate::publisher::AdministrativePublisher;
use crate::router::InboundMessageRouter;
use roomcast_server_domain::{
    BrokerError, DeliveryMetricsQueue, ExchangeSpec, InterestReceiver,
    LocalPubSub, ShardRouter,
};
use roomcast_shared::config::ServerConfigDto;
use std::sync::Arc;
use tokio::sync::{Mutex, watch};
use tokio::task::JoinHandle;
use tracing::{info, warn};

pub struct FanoutEngine {
    registry: Arc<BrokerConnectionRegistry>,
    connections: Arc<BrokerConnectionManager>,
    bindings: Arc<BindingController>,
    consumers: ShardConsumerPool,
    dispatcher: Dispatcher,
    router: Arc<InboundMessageRouter>,
    interest_task: Mutex<Option<JoinHandle<()>>>,
    shutdown_tx: watch::Sender<()>,
}

impl FanoutEngine {
    /// Connects, opens the publisher and administrative channel, starts the
    /// shard consumers and finally begins applying interest events.
    pub async fn start(
        config: &ServerConfigDto,
        registry: Arc<BrokerConnectionRegistry>,
        pubsub: Arc<dyn LocalPubSub>,
        metrics_queue: Arc<dyn DeliveryMetricsQueue>,
        interest: InterestReceiver,
    ) -> Result<Self, BrokerError> {
        let connections = registry.get_instance();
        let connection = connections.connect(&config.broker.url).await?;

        let shards = ShardRouter::new(config.instance_id.clone(), config.consumers.queue_count);
        let exchange = ExchangeSpec::topic(config.broker.rooms_exchange.clone());

        let publisher =
            AdministrativePublisher::create(&connection, exchange.clone(), &config.publisher)
                .await?;
        let dispatcher = Dispatcher::new(Arc::new(publisher), shards.clone());

        let bindings = Arc::new(BindingController::new(
            shards.clone(),
            exchange.name.clone(),
            config.channel.clone(),
        ));
        bindings.create_channel(connection.clone()).await?;

        let router = Arc::new(InboundMessageRouter::new(pubsub, metrics_queue));
        let consumers = ShardConsumerPool::new(shards, exchange, config.consumers.clone());
        consumers
            .create_consumers(&connection, router.clone())
            .await?;

        let (shutdown_tx, shutdown_rx) = watch::channel(());
        let interest_task = tokio::spawn(bindings.clone().run_interest_loop(interest, shutdown_rx));

        info!(
            instance_id = %config.instance_id,
            exchange = %config.broker.rooms_exchange,
            queue_count = config.consumers.queue_count,
            "Fan-out engine started"
        );

        Ok(Self {
            registry,
            connections,
            bindings,
            consumers,
            dispatcher,
            router,
            interest_task: Mutex::new(Some(interest_task)),
            shutdown_tx,
        })
    }

    pub fn dispatcher(&self) -> &Dispatcher {
        &self.dispatcher
    }

    pub fn bindings(&self) -> &Arc<BindingController> {
        &self.bindings
    }

    pub fn router(&self) -> &Arc<InboundMessageRouter> {
        &self.router
    }

    pub fn consumers(&self) -> &ShardConsumerPool {
        &self.consumers
    }

    pub fn connections(&self) -> &Arc<BrokerConnectionManager> {
        &self.connections
    }

    /// Stops the interest loop and consumers, then closes the channel and
    /// connection. Safe to call more than once.
    pub async fn shutdown(&self) {
        let _ = self.shutdown_tx.send(());
        if let Some(task) = self.interest_task.lock().await.take() {
            if let Err(e) = task.await {
                warn!(error = %e, "Interest loop ended abnormally");
            }
        }

        self.consumers.cancel_all().await;

        if let Err(e) = self.bindings.close().await {
            warn!(error = %e, "Failed to close administrative channel");
        }
        if let Err(e) = self.connections.close().await {
            warn!(error = %e, "Failed to close broker connection");
        }
        self.registry.destroy_instance();
        info!("Fan-out engine stopped");
    }
}
