//! In-process broker.
//!
//! Topic exchanges, queues, bindings and confirm publishing with AMQP
//! semantics close enough to run the engine in dev mode and in tests. Binding
//! a missing queue closes the channel, as RabbitMQ does.

use crate::messaging::consumer_loop::{DeliveryAck, spawn_consumer_loop};
use async_trait::async_trait;
use dashmap::DashMap;
use roomcast_server_domain::{
    AdminChannel, BrokerConnection, BrokerConnector, BrokerError, ChannelClosure,
    ConfirmPublisher, ConsumerHandle, ConsumerSpec, Delivery, DeliveryHandler, ErrorObserver,
    ExchangeSpec,
};
use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use tokio::sync::{mpsc, watch};
use tokio_stream::wrappers::UnboundedReceiverStream;
use tracing::{debug, info, warn};

/// Matches an AMQP topic pattern (`*` one word, `#` zero or more words)
pub fn topic_matches(pattern: &str, routing_key: &str) -> bool {
    fn matches(pattern: &[&str], key: &[&str]) -> bool {
        match (pattern.first(), key.first()) {
            (None, None) => true,
            (Some(&"#"), _) => {
                matches(&pattern[1..], key) || (!key.is_empty() && matches(pattern, &key[1..]))
            }
            (Some(&"*"), Some(_)) => matches(&pattern[1..], &key[1..]),
            (Some(p), Some(k)) if p == k => matches(&pattern[1..], &key[1..]),
            _ => false,
        }
    }
    let pattern: Vec<&str> = pattern.split('.').collect();
    let key: Vec<&str> = routing_key.split('.').collect();
    matches(&pattern, &key)
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct BindingRow {
    pub queue: String,
    pub exchange: String,
    pub routing_key: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct InMemoryStats {
    pub published: u64,
    pub routed: u64,
    pub unroutable: u64,
    pub acked: u64,
    pub rejected: u64,
}

struct QueueEntry {
    sender: mpsc::UnboundedSender<Delivery>,
    receiver: Mutex<Option<mpsc::UnboundedReceiver<Delivery>>>,
    auto_delete: bool,
}

#[derive(Default)]
struct BrokerState {
    exchanges: DashMap<String, ExchangeSpec>,
    queues: DashMap<String, QueueEntry>,
    bindings: Mutex<HashSet<BindingRow>>,
    admin_channels: Mutex<Vec<Arc<InMemoryAdminChannel>>>,
    observers: Mutex<Vec<ErrorObserver>>,
    closed: AtomicBool,
    published: AtomicU64,
    routed: AtomicU64,
    unroutable: AtomicU64,
    acked: AtomicU64,
    rejected: AtomicU64,
}

impl BrokerState {
    fn ensure_open(&self) -> Result<(), BrokerError> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(BrokerError::NotConnected);
        }
        Ok(())
    }

    fn bindings(&self) -> std::sync::MutexGuard<'_, HashSet<BindingRow>> {
        self.bindings.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn route(&self, exchange: &str, routing_key: &str, body: &[u8]) -> Result<usize, BrokerError> {
        if !self.exchanges.contains_key(exchange) {
            return Err(BrokerError::Topology(format!(
                "NOT_FOUND - no exchange '{}'",
                exchange
            )));
        }
        self.published.fetch_add(1, Ordering::Relaxed);

        let targets: HashSet<String> = self
            .bindings()
            .iter()
            .filter(|b| b.exchange == exchange && topic_matches(&b.routing_key, routing_key))
            .map(|b| b.queue.clone())
            .collect();

        let mut delivered = 0;
        for queue in targets {
            if let Some(entry) = self.queues.get(&queue) {
                let delivery = Delivery {
                    routing_key: routing_key.to_string(),
                    body: body.to_vec(),
                    redelivered: false,
                };
                if entry.sender.send(delivery).is_ok() {
                    delivered += 1;
                }
            }
        }

        if delivered == 0 {
            self.unroutable.fetch_add(1, Ordering::Relaxed);
        } else {
            self.routed.fetch_add(delivered as u64, Ordering::Relaxed);
        }
        Ok(delivered)
    }

    fn delete_queue(&self, queue: &str) {
        self.queues.remove(queue);
        self.bindings().retain(|b| b.queue != queue);
        debug!(queue, "Auto-deleted queue");
    }
}

/// Handle to one in-process broker; clones share state
#[derive(Clone, Default)]
pub struct InMemoryBroker {
    state: Arc<BrokerState>,
}

impl InMemoryBroker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn connector(&self) -> Arc<dyn BrokerConnector> {
        Arc::new(InMemoryConnector {
            broker: self.clone(),
        })
    }

    /// Bindings on `exchange`, sorted
    pub fn bindings(&self, exchange: &str) -> Vec<BindingRow> {
        let mut rows: Vec<_> = self
            .state
            .bindings()
            .iter()
            .filter(|b| b.exchange == exchange)
            .cloned()
            .collect();
        rows.sort();
        rows
    }

    pub fn queue_names(&self) -> Vec<String> {
        let mut names: Vec<_> = self.state.queues.iter().map(|e| e.key().clone()).collect();
        names.sort();
        names
    }

    pub fn has_exchange(&self, name: &str) -> bool {
        self.state.exchanges.contains_key(name)
    }

    /// Publishes as a peer instance would
    pub fn publish(&self, exchange: &str, routing_key: &str, body: &[u8]) -> Result<usize, BrokerError> {
        self.state.ensure_open()?;
        self.state.route(exchange, routing_key, body)
    }

    /// Closes every open administrative channel from the broker side
    pub fn close_admin_channels(&self, reason: &str) {
        let channels = self
            .state
            .admin_channels
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone();
        for channel in channels {
            channel.shut(ChannelClosure::unsolicited(reason));
        }
    }

    /// Reports a connection-level error to the registered observers
    pub fn raise_connection_error(&self, reason: &str) {
        let observers = self
            .state
            .observers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone();
        for observer in observers {
            observer(BrokerError::Connection(reason.to_string()));
        }
    }

    pub fn stats(&self) -> InMemoryStats {
        InMemoryStats {
            published: self.state.published.load(Ordering::Relaxed),
            routed: self.state.routed.load(Ordering::Relaxed),
            unroutable: self.state.unroutable.load(Ordering::Relaxed),
            acked: self.state.acked.load(Ordering::Relaxed),
            rejected: self.state.rejected.load(Ordering::Relaxed),
        }
    }
}

struct InMemoryConnector {
    broker: InMemoryBroker,
}

#[async_trait]
impl BrokerConnector for InMemoryConnector {
    async fn connect(&self, url: &str) -> Result<Arc<dyn BrokerConnection>, BrokerError> {
        self.broker.state.closed.store(false, Ordering::SeqCst);
        info!(url, "Connected to in-memory broker");
        Ok(Arc::new(InMemoryConnection {
            state: self.broker.state.clone(),
        }))
    }
}

struct InMemoryConnection {
    state: Arc<BrokerState>,
}

impl InMemoryConnection {
    fn declare_exchange(&self, exchange: &ExchangeSpec) {
        self.state
            .exchanges
            .entry(exchange.name.clone())
            .or_insert_with(|| exchange.clone());
    }
}

#[async_trait]
impl BrokerConnection for InMemoryConnection {
    async fn create_admin_channel(&self) -> Result<Arc<dyn AdminChannel>, BrokerError> {
        self.state.ensure_open()?;
        let (closure, _) = watch::channel(None);
        let channel = Arc::new(InMemoryAdminChannel {
            state: self.state.clone(),
            closure,
        });
        let mut channels = self
            .state
            .admin_channels
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        channels.retain(|c| c.is_open());
        channels.push(channel.clone());
        Ok(channel)
    }

    async fn create_publisher(
        &self,
        exchange: &ExchangeSpec,
    ) -> Result<Arc<dyn ConfirmPublisher>, BrokerError> {
        self.state.ensure_open()?;
        self.declare_exchange(exchange);
        Ok(Arc::new(InMemoryPublisher {
            state: self.state.clone(),
        }))
    }

    async fn start_consumer(
        &self,
        spec: ConsumerSpec,
        handler: Arc<dyn DeliveryHandler>,
    ) -> Result<Box<dyn ConsumerHandle>, BrokerError> {
        self.state.ensure_open()?;
        self.declare_exchange(&spec.exchange);

        let queue = spec.queue.name.clone();
        let receiver = {
            let entry = self.state.queues.entry(queue.clone()).or_insert_with(|| {
                let (sender, receiver) = mpsc::unbounded_channel();
                QueueEntry {
                    sender,
                    receiver: Mutex::new(Some(receiver)),
                    auto_delete: spec.queue.auto_delete,
                }
            });
            let taken = entry
                .receiver
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .take();
            taken
        };
        let receiver = receiver.ok_or_else(|| {
            BrokerError::Consumer(format!(
                "RESOURCE_LOCKED - queue '{}' already has a consumer",
                queue
            ))
        })?;

        let state = self.state.clone();
        let deliveries = futures::StreamExt::map(UnboundedReceiverStream::new(receiver), move |d| {
            Ok((
                d,
                InMemoryAck {
                    state: state.clone(),
                },
            ))
        });

        let (cancel_tx, cancel_rx) = watch::channel(false);
        spawn_consumer_loop(queue.clone(), deliveries, handler, spec.concurrency, cancel_rx);

        Ok(Box::new(InMemoryConsumer {
            queue,
            state: self.state.clone(),
            cancel: cancel_tx,
        }))
    }

    fn on_error(&self, observer: ErrorObserver) {
        self.state
            .observers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(observer);
    }

    fn is_connected(&self) -> bool {
        !self.state.closed.load(Ordering::SeqCst)
    }

    async fn close(&self) -> Result<(), BrokerError> {
        self.state.closed.store(true, Ordering::SeqCst);
        let channels = std::mem::take(
            &mut *self
                .state
                .admin_channels
                .lock()
                .unwrap_or_else(PoisonError::into_inner),
        );
        for channel in channels {
            channel.shut(ChannelClosure::solicited());
        }
        Ok(())
    }
}

pub struct InMemoryAdminChannel {
    state: Arc<BrokerState>,
    closure: watch::Sender<Option<ChannelClosure>>,
}

impl InMemoryAdminChannel {
    fn shut(&self, closure: ChannelClosure) {
        if self.is_open() {
            self.closure.send_replace(Some(closure));
        }
    }

    fn ensure_open(&self) -> Result<(), BrokerError> {
        self.state.ensure_open()?;
        if !self.is_open() {
            return Err(BrokerError::ChannelClosed);
        }
        Ok(())
    }
}

#[async_trait]
impl AdminChannel for InMemoryAdminChannel {
    async fn queue_bind(
        &self,
        queue: &str,
        exchange: &str,
        routing_key: &str,
    ) -> Result<(), BrokerError> {
        self.ensure_open()?;
        if !self.state.queues.contains_key(queue) || !self.state.exchanges.contains_key(exchange) {
            let reason = format!("NOT_FOUND - cannot bind '{}' to '{}'", queue, exchange);
            warn!(%reason, "Closing channel on failed bind");
            self.shut(ChannelClosure::unsolicited(reason.clone()));
            return Err(BrokerError::Channel(reason));
        }
        self.state.bindings().insert(BindingRow {
            queue: queue.to_string(),
            exchange: exchange.to_string(),
            routing_key: routing_key.to_string(),
        });
        Ok(())
    }

    async fn queue_unbind(
        &self,
        queue: &str,
        exchange: &str,
        routing_key: &str,
    ) -> Result<(), BrokerError> {
        self.ensure_open()?;
        self.state.bindings().remove(&BindingRow {
            queue: queue.to_string(),
            exchange: exchange.to_string(),
            routing_key: routing_key.to_string(),
        });
        Ok(())
    }

    async fn closed(&self) -> ChannelClosure {
        let mut rx = self.closure.subscribe();
        match rx.wait_for(Option::is_some).await {
            Ok(closure) => closure
                .clone()
                .unwrap_or_else(|| ChannelClosure::unsolicited("unknown")),
            Err(_) => ChannelClosure::unsolicited("channel dropped"),
        }
    }

    async fn close(&self) -> Result<(), BrokerError> {
        self.shut(ChannelClosure::solicited());
        Ok(())
    }

    fn is_open(&self) -> bool {
        self.closure.borrow().is_none()
    }
}

struct InMemoryPublisher {
    state: Arc<BrokerState>,
}

#[async_trait]
impl ConfirmPublisher for InMemoryPublisher {
    async fn publish(
        &self,
        exchange: &str,
        routing_key: &str,
        body: &[u8],
    ) -> Result<(), BrokerError> {
        self.state.ensure_open()?;
        // Unroutable messages are still confirmed, as with a plain topic exchange
        self.state.route(exchange, routing_key, body).map(|_| ())
    }
}

struct InMemoryAck {
    state: Arc<BrokerState>,
}

#[async_trait]
impl DeliveryAck for InMemoryAck {
    async fn ack(self) -> Result<(), BrokerError> {
        self.state.acked.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    async fn reject(self) -> Result<(), BrokerError> {
        self.state.rejected.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }
}

struct InMemoryConsumer {
    queue: String,
    state: Arc<BrokerState>,
    cancel: watch::Sender<bool>,
}

#[async_trait]
impl ConsumerHandle for InMemoryConsumer {
    fn queue(&self) -> &str {
        &self.queue
    }

    async fn cancel(&self) -> Result<(), BrokerError> {
        let _ = self.cancel.send(true);
        let auto_delete = self
            .state
            .queues
            .get(&self.queue)
            .map(|entry| entry.auto_delete)
            .unwrap_or(false);
        if auto_delete {
            self.state.delete_queue(&self.queue);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use roomcast_server_domain::{HandlerError, QueueSpec};
    use rstest::rstest;
    use std::time::Duration;

    #[rstest]
    #[case("$$:app1:3", "$$:app1:3", true)]
    #[case("$$:app1:3", "$$:app1:4", false)]
    #[case("a.*.c", "a.b.c", true)]
    #[case("a.*.c", "a.b.b.c", false)]
    #[case("a.#", "a", true)]
    #[case("a.#", "a.b.c", true)]
    #[case("#", "anything.at.all", true)]
    #[case("a.#.c", "a.c", true)]
    fn test_topic_matches(#[case] pattern: &str, #[case] key: &str, #[case] expected: bool) {
        assert_eq!(topic_matches(pattern, key), expected);
    }

    struct Forward(mpsc::UnboundedSender<Delivery>);

    #[async_trait]
    impl DeliveryHandler for Forward {
        async fn handle(&self, delivery: Delivery) -> Result<(), HandlerError> {
            if delivery.body == b"poison" {
                return Err("poison".into());
            }
            self.0.send(delivery).map_err(|e| e.to_string().into())
        }
    }

    fn spec(queue: &str) -> ConsumerSpec {
        ConsumerSpec {
            queue: QueueSpec {
                name: queue.to_string(),
                durable: false,
                auto_delete: true,
            },
            exchange: ExchangeSpec::topic("ds-rooms"),
            consumer_tag: format!("{}-consumer", queue),
            concurrency: 2,
            prefetch_count: 20,
        }
    }

    async fn connect(broker: &InMemoryBroker) -> Arc<dyn BrokerConnection> {
        broker.connector().connect("memory://").await.unwrap()
    }

    #[tokio::test]
    async fn test_publish_reaches_only_bound_queues() {
        let broker = InMemoryBroker::new();
        let connection = connect(&broker).await;
        let (tx, mut rx) = mpsc::unbounded_channel();

        let _queue_0 = connection
            .start_consumer(spec("node-1-queue-0"), Arc::new(Forward(tx.clone())))
            .await
            .unwrap();
        let _queue_1 = connection
            .start_consumer(spec("node-1-queue-1"), Arc::new(Forward(tx)))
            .await
            .unwrap();
        let admin = connection.create_admin_channel().await.unwrap();
        admin
            .queue_bind("node-1-queue-1", "ds-rooms", "$$:app1:1")
            .await
            .unwrap();

        assert_eq!(broker.publish("ds-rooms", "$$:app1:1", b"hello").unwrap(), 1);
        assert_eq!(broker.publish("ds-rooms", "$$:app1:0", b"nobody").unwrap(), 0);

        let delivery = tokio::time::timeout(Duration::from_secs(1), rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(delivery.body, b"hello");
        assert_eq!(delivery.routing_key, "$$:app1:1");
        assert_eq!(broker.stats().unroutable, 1);
    }

    #[tokio::test]
    async fn test_handler_failure_rejects_without_requeue() {
        let broker = InMemoryBroker::new();
        let connection = connect(&broker).await;
        let (tx, mut rx) = mpsc::unbounded_channel();
        let _consumer = connection
            .start_consumer(spec("q"), Arc::new(Forward(tx)))
            .await
            .unwrap();
        let admin = connection.create_admin_channel().await.unwrap();
        admin.queue_bind("q", "ds-rooms", "k").await.unwrap();

        broker.publish("ds-rooms", "k", b"poison").unwrap();
        broker.publish("ds-rooms", "k", b"fine").unwrap();

        let delivery = tokio::time::timeout(Duration::from_secs(1), rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(delivery.body, b"fine");

        tokio::time::timeout(Duration::from_secs(1), async {
            while broker.stats().rejected == 0 || broker.stats().acked == 0 {
                tokio::task::yield_now().await;
            }
        })
        .await
        .unwrap();
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_bind_to_missing_queue_closes_channel() {
        let broker = InMemoryBroker::new();
        let connection = connect(&broker).await;
        connection
            .create_publisher(&ExchangeSpec::topic("ds-rooms"))
            .await
            .unwrap();
        let admin = connection.create_admin_channel().await.unwrap();

        let result = admin.queue_bind("missing", "ds-rooms", "k").await;

        assert!(result.is_err());
        assert!(!admin.is_open());
        let closure = admin.closed().await;
        assert!(!closure.solicited);
        assert!(matches!(
            admin.queue_bind("missing", "ds-rooms", "k").await,
            Err(BrokerError::ChannelClosed)
        ));
    }

    #[tokio::test]
    async fn test_unbind_stops_routing() {
        let broker = InMemoryBroker::new();
        let connection = connect(&broker).await;
        let (tx, _rx) = mpsc::unbounded_channel();
        let _consumer = connection
            .start_consumer(spec("q"), Arc::new(Forward(tx)))
            .await
            .unwrap();
        let admin = connection.create_admin_channel().await.unwrap();

        admin.queue_bind("q", "ds-rooms", "k").await.unwrap();
        assert_eq!(broker.bindings("ds-rooms").len(), 1);
        admin.queue_unbind("q", "ds-rooms", "k").await.unwrap();

        assert!(broker.bindings("ds-rooms").is_empty());
        assert_eq!(broker.publish("ds-rooms", "k", b"x").unwrap(), 0);
    }

    #[tokio::test]
    async fn test_second_consumer_on_queue_is_refused() {
        let broker = InMemoryBroker::new();
        let connection = connect(&broker).await;
        let (tx, _rx) = mpsc::unbounded_channel();

        let _first = connection
            .start_consumer(spec("q"), Arc::new(Forward(tx.clone())))
            .await
            .unwrap();
        let second = connection
            .start_consumer(spec("q"), Arc::new(Forward(tx)))
            .await;

        assert!(matches!(second, Err(BrokerError::Consumer(_))));
    }

    #[tokio::test]
    async fn test_cancel_auto_deletes_queue_and_bindings() {
        let broker = InMemoryBroker::new();
        let connection = connect(&broker).await;
        let (tx, _rx) = mpsc::unbounded_channel();
        let consumer = connection
            .start_consumer(spec("q"), Arc::new(Forward(tx)))
            .await
            .unwrap();
        let admin = connection.create_admin_channel().await.unwrap();
        admin.queue_bind("q", "ds-rooms", "k").await.unwrap();

        consumer.cancel().await.unwrap();

        assert!(broker.queue_names().is_empty());
        assert!(broker.bindings("ds-rooms").is_empty());
    }

    #[tokio::test]
    async fn test_forced_close_and_connection_close() {
        let broker = InMemoryBroker::new();
        let connection = connect(&broker).await;
        let admin = connection.create_admin_channel().await.unwrap();

        broker.close_admin_channels("CHANNEL_ERROR - forced");
        let closure = admin.closed().await;
        assert!(!closure.solicited);
        assert_eq!(closure.reason, "CHANNEL_ERROR - forced");

        let admin = connection.create_admin_channel().await.unwrap();
        connection.close().await.unwrap();
        assert!(admin.closed().await.solicited);
        assert!(!connection.is_connected());
        assert!(connection.create_admin_channel().await.is_err());
    }
}
