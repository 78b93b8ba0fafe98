//! Broker connection ownership.
//!
//! Startup code owns a [`BrokerConnectionRegistry`]; every component that
//! needs the broker asks it for the same [`BrokerConnectionManager`], which
//! holds at most one live connection.

use roomcast_server_domain::{BrokerConnection, BrokerConnector, BrokerError};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, PoisonError, RwLock};
use tokio::sync::Mutex;
use tracing::{error, info, instrument};

pub struct BrokerConnectionManager {
    connector: Arc<dyn BrokerConnector>,
    current: RwLock<Option<Arc<dyn BrokerConnection>>>,
    connect_gate: Mutex<()>,
    connection_errors: Arc<AtomicU64>,
}

impl BrokerConnectionManager {
    pub fn new(connector: Arc<dyn BrokerConnector>) -> Self {
        Self {
            connector,
            current: RwLock::new(None),
            connect_gate: Mutex::new(()),
            connection_errors: Arc::new(AtomicU64::new(0)),
        }
    }

    /// Opens the connection, or returns the existing one.
    ///
    /// Connection-level errors are logged by an observer and never end the
    /// process; recovery of the socket itself is left to the client library.
    #[instrument(skip(self, url))]
    pub async fn connect(&self, url: &str) -> Result<Arc<dyn BrokerConnection>, BrokerError> {
        let _gate = self.connect_gate.lock().await;

        if let Some(existing) = self.get_connection() {
            return Ok(existing);
        }

        let connection = self.connector.connect(url).await.map_err(|e| {
            error!(error = %e, "Failed to connect to broker");
            e
        })?;

        let errors = self.connection_errors.clone();
        connection.on_error(Arc::new(move |err| {
            errors.fetch_add(1, Ordering::Relaxed);
            error!(error = %err, "Broker connection error");
        }));

        *self.current.write().unwrap_or_else(PoisonError::into_inner) = Some(connection.clone());
        info!("Connected to broker");
        Ok(connection)
    }

    pub fn get_connection(&self) -> Option<Arc<dyn BrokerConnection>> {
        self.current
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Forgets the connection without closing it.
    ///
    /// Call [`close`](Self::close) first for a graceful shutdown.
    pub fn destroy_instance(&self) {
        *self.current.write().unwrap_or_else(PoisonError::into_inner) = None;
    }

    pub async fn close(&self) -> Result<(), BrokerError> {
        match self.get_connection() {
            Some(connection) => connection.close().await,
            None => Ok(()),
        }
    }

    pub fn connection_errors(&self) -> u64 {
        self.connection_errors.load(Ordering::Relaxed)
    }
}

/// Hands out one shared [`BrokerConnectionManager`] per process
pub struct BrokerConnectionRegistry {
    connector: Arc<dyn BrokerConnector>,
    instance: RwLock<Option<Arc<BrokerConnectionManager>>>,
}

impl BrokerConnectionRegistry {
    pub fn new(connector: Arc<dyn BrokerConnector>) -> Self {
        Self {
            connector,
            instance: RwLock::new(None),
        }
    }

    /// Returns the current manager, building it on first use
    pub fn get_instance(&self) -> Arc<BrokerConnectionManager> {
        if let Some(existing) = self
            .instance
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
        {
            return existing;
        }
        let mut instance = self
            .instance
            .write()
            .unwrap_or_else(PoisonError::into_inner);
        instance
            .get_or_insert_with(|| Arc::new(BrokerConnectionManager::new(self.connector.clone())))
            .clone()
    }

    /// Forgets the manager and its connection without closing anything
    pub fn destroy_instance(&self) {
        let previous = self
            .instance
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(manager) = previous {
            manager.destroy_instance();
        }
    }
}
