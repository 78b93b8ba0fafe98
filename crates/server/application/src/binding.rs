//! Demand-driven bindings between shard queues and the rooms exchange.
//!
//! The controller owns one administrative channel, used only for
//! `queue_bind`/`queue_unbind`. It binds a routing key when the first local
//! room behind it gains interest and unbinds it when the last one loses it.

use roomcast_server_domain::{
    AdminChannel, BrokerConnection, BrokerError, InterestEvent, InterestReceiver, RoutingKey,
    ShardRouter,
};
use roomcast_shared::SharedError;
use roomcast_shared::config::ChannelConfig;
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, PoisonError, RwLock};
use tokio::sync::{Mutex, watch};
use tracing::{debug, error, info, instrument, warn};

#[derive(Debug)]
struct Binding {
    queue: String,
    rooms: HashSet<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BindingStats {
    pub binds: u64,
    pub unbinds: u64,
    pub failures: u64,
    pub channel_reconnects: u64,
}

#[derive(Default)]
struct Counters {
    binds: AtomicU64,
    unbinds: AtomicU64,
    failures: AtomicU64,
    channel_reconnects: AtomicU64,
}

pub struct BindingController {
    router: ShardRouter,
    exchange: String,
    policy: ChannelConfig,
    connection: RwLock<Option<Arc<dyn BrokerConnection>>>,
    channel: RwLock<Option<Arc<dyn AdminChannel>>>,
    bindings: Mutex<HashMap<RoutingKey, Binding>>,
    reconnect_attempts: AtomicU32,
    stopped: AtomicBool,
    counters: Counters,
}

impl BindingController {
    pub fn new(router: ShardRouter, exchange: impl Into<String>, policy: ChannelConfig) -> Self {
        Self {
            router,
            exchange: exchange.into(),
            policy,
            connection: RwLock::new(None),
            channel: RwLock::new(None),
            bindings: Mutex::new(HashMap::new()),
            reconnect_attempts: AtomicU32::new(0),
            stopped: AtomicBool::new(false),
            counters: Counters::default(),
        }
    }

    /// Opens the administrative channel and watches it for closure
    #[instrument(skip(self, connection))]
    pub async fn create_channel(
        self: &Arc<Self>,
        connection: Arc<dyn BrokerConnection>,
    ) -> Result<(), BrokerError> {
        let channel = connection.create_admin_channel().await?;

        *self
            .connection
            .write()
            .unwrap_or_else(PoisonError::into_inner) = Some(connection);
        *self.channel.write().unwrap_or_else(PoisonError::into_inner) = Some(channel.clone());
        info!(exchange = %self.exchange, "Administrative channel ready");

        let controller = Arc::clone(self);
        tokio::spawn(async move {
            let closure = channel.closed().await;
            if closure.solicited || controller.stopped.load(Ordering::SeqCst) {
                debug!(%closure, "Administrative channel closed");
                return;
            }
            warn!(%closure, "Administrative channel closed by broker");
            controller.handle_close();
        });

        Ok(())
    }

    /// Schedules one channel recreation after the fixed delay.
    ///
    /// Attempts count every broker-initiated close over the controller's
    /// lifetime, recreated or not. Returns `false` once the ceiling is reached; from then on the
    /// channel stays down until the process is restarted.
    pub fn handle_close(self: &Arc<Self>) -> bool {
        *self.channel.write().unwrap_or_else(PoisonError::into_inner) = None;
        if self.stopped.load(Ordering::SeqCst) {
            return false;
        }

        let attempt = self.reconnect_attempts.fetch_add(1, Ordering::SeqCst) + 1;
        if attempt > self.policy.max_reconnect_attempts {
            error!(
                attempts = self.policy.max_reconnect_attempts,
                "Administrative channel could not be recreated, giving up; restart the instance"
            );
            return false;
        }

        let connection = match self
            .connection
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
        {
            Some(connection) => connection,
            None => {
                error!("No broker connection to recreate the administrative channel on");
                return false;
            }
        };

        let delay = self.policy.reconnect_interval();
        let max_attempts = self.policy.max_reconnect_attempts;
        info!(attempt, max_attempts, ?delay, "Scheduling administrative channel recreation");

        let controller = Arc::clone(self);
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            if controller.stopped.load(Ordering::SeqCst) {
                return;
            }
            match controller.create_channel(connection).await {
                Ok(()) => {
                    controller
                        .counters
                        .channel_reconnects
                        .fetch_add(1, Ordering::Relaxed);
                    info!(attempt, "Administrative channel recreated");
                }
                Err(e) => {
                    warn!(attempt, error = %e, "Administrative channel recreation failed");
                    controller.handle_close();
                }
            }
        });
        true
    }

    pub fn get_routing_key(&self, nsp_room_id: &str) -> Result<RoutingKey, SharedError> {
        self.router.routing_key(nsp_room_id)
    }

    /// Binds the room's shard queue to its routing key.
    ///
    /// A no-op when another local room already holds that binding. Broker
    /// failures are logged and leave the binding table unchanged.
    #[instrument(skip(self))]
    pub async fn bind_room(&self, nsp_room_id: &str) {
        let key = match self.get_routing_key(nsp_room_id) {
            Ok(key) => key,
            Err(e) => {
                warn!(error = %e, "Ignoring interest for unroutable room");
                return;
            }
        };

        let mut bindings = self.bindings.lock().await;
        if let Some(binding) = bindings.get_mut(&key) {
            binding.rooms.insert(nsp_room_id.to_string());
            debug!(routing_key = %key, "Routing key already bound");
            return;
        }

        let queue = self.router.queue_for(&key);
        let result = match self.current_channel() {
            Some(channel) => {
                channel
                    .queue_bind(&queue, &self.exchange, key.as_str())
                    .await
            }
            None => Err(BrokerError::ChannelClosed),
        };

        match result {
            Ok(()) => {
                info!(routing_key = %key, queue = %queue, "Bound shard queue");
                self.counters.binds.fetch_add(1, Ordering::Relaxed);
                bindings.insert(
                    key,
                    Binding {
                        queue,
                        rooms: HashSet::from([nsp_room_id.to_string()]),
                    },
                );
            }
            Err(e) => {
                self.counters.failures.fetch_add(1, Ordering::Relaxed);
                error!(routing_key = %key, error = %e, "Failed to bind shard queue");
            }
        }
    }

    /// Releases the room; unbinds once no local room needs the routing key
    #[instrument(skip(self))]
    pub async fn unbind_room(&self, nsp_room_id: &str) {
        let key = match self.get_routing_key(nsp_room_id) {
            Ok(key) => key,
            Err(e) => {
                warn!(error = %e, "Ignoring interest for unroutable room");
                return;
            }
        };

        let mut bindings = self.bindings.lock().await;
        let Some(binding) = bindings.get_mut(&key) else {
            debug!(routing_key = %key, "Routing key not bound");
            return;
        };
        binding.rooms.remove(nsp_room_id);
        if !binding.rooms.is_empty() {
            debug!(routing_key = %key, rooms = binding.rooms.len(), "Routing key still in use");
            return;
        }

        let queue = binding.queue.clone();
        let result = match self.current_channel() {
            Some(channel) => {
                channel
                    .queue_unbind(&queue, &self.exchange, key.as_str())
                    .await
            }
            None => Err(BrokerError::ChannelClosed),
        };

        match result {
            Ok(()) => {
                info!(routing_key = %key, "Unbound shard queue");
                self.counters.unbinds.fetch_add(1, Ordering::Relaxed);
                bindings.remove(&key);
            }
            Err(e) => {
                // Keep the entry so a later delete can retry the unbind
                self.counters.failures.fetch_add(1, Ordering::Relaxed);
                error!(routing_key = %key, error = %e, "Failed to unbind shard queue");
            }
        }
    }

    fn current_channel(&self) -> Option<Arc<dyn AdminChannel>> {
        self.channel
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Applies interest events until `shutdown` fires or the sender is dropped
    pub async fn run_interest_loop(
        self: Arc<Self>,
        mut events: InterestReceiver,
        mut shutdown: watch::Receiver<()>,
    ) {
        info!("Interest loop started");
        loop {
            tokio::select! {
                _ = shutdown.changed() => {
                    info!("Interest loop stopping");
                    break;
                }
                event = events.recv() => match event {
                    Some(InterestEvent::Created { topic }) => self.bind_room(&topic).await,
                    Some(InterestEvent::Deleted { topic }) => self.unbind_room(&topic).await,
                    None => {
                        info!("Interest source closed");
                        break;
                    }
                },
            }
        }
    }

    /// Routing keys currently bound, with their queue
    pub async fn bindings(&self) -> Vec<(String, String)> {
        let bindings = self.bindings.lock().await;
        let mut out: Vec<_> = bindings
            .iter()
            .map(|(key, binding)| (key.to_string(), binding.queue.clone()))
            .collect();
        out.sort();
        out
    }

    pub fn is_channel_open(&self) -> bool {
        self.channel
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .as_ref()
            .is_some_and(|channel| channel.is_open())
    }

    pub fn stats(&self) -> BindingStats {
        BindingStats {
            binds: self.counters.binds.load(Ordering::Relaxed),
            unbinds: self.counters.unbinds.load(Ordering::Relaxed),
            failures: self.counters.failures.load(Ordering::Relaxed),
            channel_reconnects: self.counters.channel_reconnects.load(Ordering::Relaxed),
        }
    }

    /// Stops reconnecting and closes the channel
    pub async fn close(&self) -> Result<(), BrokerError> {
        self.stopped.store(true, Ordering::SeqCst);
        let channel = self
            .channel
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        match channel {
            Some(channel) => channel.close().await,
            None => Ok(()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::FakeBroker;
    use roomcast_server_domain::{interest_channel, shard_index};
    use roomcast_shared::InstanceId;
    use std::time::Duration;

    fn controller(queue_count: u32) -> Arc<BindingController> {
        Arc::new(BindingController::new(
            ShardRouter::new(InstanceId::parse("node-1").unwrap(), queue_count),
            "ds-rooms",
            ChannelConfig::default(),
        ))
    }

    async fn ready(queue_count: u32) -> (FakeBroker, Arc<BindingController>) {
        let broker = FakeBroker::new();
        let controller = controller(queue_count);
        controller.create_channel(broker.connection()).await.unwrap();
        (broker, controller)
    }

    #[tokio::test]
    async fn test_bind_room_binds_owning_shard_queue() {
        let (broker, controller) = ready(5).await;

        controller.bind_room("app1:chat").await;

        let index = shard_index("chat", 5);
        assert_eq!(
            broker.binds(),
            vec![(
                format!("node-1-queue-{}", index),
                "ds-rooms".to_string(),
                format!("$$:app1:{}", index)
            )]
        );
        assert_eq!(controller.stats().binds, 1);
    }

    #[tokio::test]
    async fn test_duplicate_create_binds_once() {
        let (broker, controller) = ready(20).await;

        controller.bind_room("app1:chat").await;
        controller.bind_room("app1:chat").await;

        assert_eq!(broker.binds().len(), 1);
        assert_eq!(controller.bindings().await.len(), 1);
    }

    #[tokio::test]
    async fn test_delete_without_create_is_noop() {
        let (broker, controller) = ready(20).await;

        controller.unbind_room("app1:chat").await;

        assert!(broker.unbinds().is_empty());
        assert_eq!(controller.stats(), BindingStats::default());
    }

    #[tokio::test]
    async fn test_shared_routing_key_unbinds_after_last_room() {
        // With one shard every room of an app shares the routing key
        let (broker, controller) = ready(1).await;

        controller.bind_room("app1:chat").await;
        controller.bind_room("app1:lobby").await;
        assert_eq!(broker.binds().len(), 1);

        controller.unbind_room("app1:chat").await;
        assert!(broker.unbinds().is_empty());

        controller.unbind_room("app1:lobby").await;
        assert_eq!(broker.unbinds().len(), 1);
        assert!(controller.bindings().await.is_empty());
    }

    #[tokio::test]
    async fn test_bind_failure_is_swallowed_and_not_recorded() {
        let (broker, controller) = ready(20).await;
        broker.fail_bind(true);

        controller.bind_room("app1:chat").await;
        assert!(controller.bindings().await.is_empty());
        assert_eq!(controller.stats().failures, 1);

        broker.fail_bind(false);
        controller.bind_room("app1:chat").await;
        assert_eq!(broker.binds().len(), 1);
    }

    #[tokio::test]
    async fn test_unroutable_room_is_ignored() {
        let (broker, controller) = ready(20).await;
        controller.bind_room("no-delimiter").await;
        assert!(broker.binds().is_empty());
    }

    #[tokio::test]
    async fn test_get_routing_key() {
        let controller = controller(20);
        assert_eq!(
            controller
                .get_routing_key("appPid:nsp:123:456")
                .unwrap()
                .as_str(),
            "$$:appPid:10"
        );
    }

    #[tokio::test]
    async fn test_channel_is_stored_after_lock_poisoning() {
        let broker = FakeBroker::new();
        let controller = controller(20);

        let poisoner = controller.clone();
        let poisoned = std::thread::spawn(move || {
            let _guard = poisoner.channel.write().unwrap();
            panic!("poison the channel slot");
        })
        .join();
        assert!(poisoned.is_err());

        controller.create_channel(broker.connection()).await.unwrap();
        assert!(controller.is_channel_open());

        controller.bind_room("app1:chat").await;
        assert_eq!(broker.binds().len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_channel_is_recreated_after_unsolicited_close() {
        let (broker, controller) = ready(20).await;
        assert_eq!(broker.admin_channel_calls(), 1);

        broker.close_current_channel("CHANNEL_ERROR");
        tokio::time::sleep(Duration::from_millis(4_900)).await;
        assert_eq!(broker.admin_channel_calls(), 1);

        tokio::time::sleep(Duration::from_millis(200)).await;
        assert_eq!(broker.admin_channel_calls(), 2);
        assert!(controller.is_channel_open());
        assert_eq!(controller.stats().channel_reconnects, 1);

        controller.bind_room("app1:chat").await;
        assert_eq!(broker.binds().len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_reconnect_stops_after_max_attempts() {
        let (broker, controller) = ready(20).await;
        broker.fail_admin_channel(true);

        broker.close_current_channel("CHANNEL_ERROR");
        tokio::time::sleep(Duration::from_secs(60)).await;

        // initial channel plus five failed recreations
        assert_eq!(broker.admin_channel_calls(), 6);
        assert!(!controller.is_channel_open());
        assert!(!controller.handle_close());

        tokio::time::sleep(Duration::from_secs(60)).await;
        assert_eq!(broker.admin_channel_calls(), 6);
    }

    #[tokio::test(start_paused = true)]
    async fn test_successful_recreations_still_count_toward_ceiling() {
        let (broker, controller) = ready(20).await;

        for _ in 0..8 {
            broker.close_current_channel("CHANNEL_ERROR");
            tokio::time::sleep(Duration::from_secs(6)).await;
        }

        // initial channel plus five recreations, the later closes are final
        assert_eq!(broker.admin_channel_calls(), 6);
        assert_eq!(controller.stats().channel_reconnects, 5);
        assert!(!controller.is_channel_open());
    }

    #[tokio::test(start_paused = true)]
    async fn test_solicited_close_does_not_reconnect() {
        let (broker, controller) = ready(20).await;

        controller.close().await.unwrap();
        tokio::time::sleep(Duration::from_secs(30)).await;

        assert_eq!(broker.admin_channel_calls(), 1);
    }

    #[tokio::test]
    async fn test_interest_loop_applies_events_and_stops() {
        let (broker, controller) = ready(20).await;
        let (tx, rx) = interest_channel();
        let (shutdown_tx, shutdown_rx) = watch::channel(());

        let task = tokio::spawn(controller.clone().run_interest_loop(rx, shutdown_rx));

        tx.send(InterestEvent::created("app1:chat")).unwrap();
        tx.send(InterestEvent::created("app1:chat")).unwrap();
        tx.send(InterestEvent::deleted("app1:chat")).unwrap();
        tx.send(InterestEvent::deleted("app1:chat")).unwrap();

        tokio::time::timeout(Duration::from_secs(1), async {
            while broker.unbinds().is_empty() {
                tokio::task::yield_now().await;
            }
        })
        .await
        .unwrap();

        shutdown_tx.send(()).unwrap();
        task.await.unwrap();

        assert_eq!(broker.binds().len(), 1);
        assert_eq!(broker.unbinds().len(), 1);
    }
}
