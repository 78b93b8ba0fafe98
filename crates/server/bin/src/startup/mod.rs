//! Startup module - orchestrates application initialization.
//!
//! Builds the broker connector (RabbitMQ, or the in-process broker in dev
//! mode), the local socket layer and the delivery metrics queue, then starts
//! the fan-out engine on top of them.

pub mod shutdown;

use anyhow::Context;
use roomcast_server_application::{BrokerConnectionRegistry, FanoutEngine};
use roomcast_server_domain::{BrokerConnector, interest_channel};
use roomcast_server_infrastructure::metrics_queue::DEFAULT_METRICS_QUEUE_CAPACITY;
use roomcast_server_infrastructure::{
    AmqpConnector, ChannelMetricsQueue, ConnectionManager, InMemoryBroker, RealtimeMetrics,
    spawn_metrics_logger,
};
use roomcast_shared::config::ServerConfigDto;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::{info, warn};

/// Current application version
pub const APP_VERSION: &str = env!("CARGO_PKG_VERSION");

/// Everything `run` started; dropped in order by [`Server::shutdown`]
pub struct Server {
    engine: FanoutEngine,
    sockets: Arc<ConnectionManager>,
    metrics_registry: prometheus::Registry,
    metrics_logger: JoinHandle<u64>,
}

fn connector_for(config: &ServerConfigDto) -> Arc<dyn BrokerConnector> {
    if config.features.dev_mode {
        warn!("Dev mode: using the in-process broker, nothing leaves this instance");
        InMemoryBroker::new().connector()
    } else {
        Arc::new(AmqpConnector::new())
    }
}

/// Run the complete application startup sequence.
pub async fn run(config: ServerConfigDto) -> anyhow::Result<Server> {
    info!(
        version = APP_VERSION,
        instance_id = %config.instance_id,
        dev_mode = config.features.dev_mode,
        "Starting roomcast server"
    );

    let metrics_registry = prometheus::Registry::new();
    let realtime = RealtimeMetrics::new().context("Failed to create realtime metrics")?;
    realtime
        .register(&metrics_registry)
        .context("Failed to register realtime metrics")?;

    let (interest_tx, interest_rx) = interest_channel();
    let sockets = Arc::new(ConnectionManager::new(realtime, interest_tx));

    let (metrics_queue, metrics_rx) = ChannelMetricsQueue::new(DEFAULT_METRICS_QUEUE_CAPACITY);
    let metrics_logger = spawn_metrics_logger(metrics_rx);

    let registry = Arc::new(BrokerConnectionRegistry::new(connector_for(&config)));
    let engine = FanoutEngine::start(
        &config,
        registry,
        sockets.clone(),
        Arc::new(metrics_queue),
        interest_rx,
    )
    .await
    .context("Failed to start fan-out engine")?;
    info!("✓ Fan-out engine running");

    Ok(Server {
        engine,
        sockets,
        metrics_registry,
        metrics_logger,
    })
}

impl Server {
    pub fn engine(&self) -> &FanoutEngine {
        &self.engine
    }

    pub fn sockets(&self) -> &Arc<ConnectionManager> {
        &self.sockets
    }

    pub fn metrics_registry(&self) -> &prometheus::Registry {
        &self.metrics_registry
    }

    /// Stops the engine, then waits for the metrics queue to drain.
    ///
    /// Returns `false` if `grace` ran out first.
    pub async fn shutdown(self, grace: Duration) -> bool {
        let Server {
            engine,
            sockets,
            metrics_logger,
            ..
        } = self;

        if tokio::time::timeout(grace, engine.shutdown()).await.is_err() {
            return false;
        }
        let dispatcher = engine.dispatcher();
        info!(
            published = dispatcher.published(),
            publish_failures = dispatcher.publish_failures(),
            sessions = sockets.active_sessions_count(),
            "Engine stopped"
        );

        // The router holds the last queue sender
        drop(engine);
        match tokio::time::timeout(grace, metrics_logger).await {
            Ok(Ok(drained)) => {
                info!(drained, "Metrics queue closed");
                true
            }
            Ok(Err(e)) => {
                warn!(error = %e, "Metrics logger ended abnormally");
                true
            }
            Err(_) => false,
        }
    }
}
