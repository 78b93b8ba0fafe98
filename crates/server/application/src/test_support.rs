//! Scriptable broker used by the unit tests of this crate.

use async_trait::async_trait;
use roomcast_server_domain::{
    AdminChannel, BrokerConnection, BrokerConnector, BrokerError, ChannelClosure,
    ConfirmPublisher, ConsumerHandle, ConsumerSpec, Delivery, DeliveryHandler, ErrorObserver,
    ExchangeSpec, HandlerError,
};
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use tokio::sync::{Notify, watch};

pub type BindCall = (String, String, String);

#[derive(Default)]
struct FakeState {
    connect_calls: AtomicUsize,
    close_calls: AtomicUsize,
    fail_connect: AtomicBool,
    observers: Mutex<Vec<ErrorObserver>>,
    admin_channel_calls: AtomicUsize,
    fail_admin_channel: AtomicBool,
    channels: Mutex<Vec<Arc<FakeChannel>>>,
    binds: Mutex<Vec<BindCall>>,
    unbinds: Mutex<Vec<BindCall>>,
    fail_bind: AtomicBool,
    publish_attempts: AtomicUsize,
    publish_failures_remaining: AtomicU32,
    published: Mutex<Vec<(String, String, Vec<u8>)>>,
    published_notify: Notify,
    consumers: Mutex<Vec<(ConsumerSpec, Arc<dyn DeliveryHandler>)>>,
    fail_consumer_at: Mutex<Option<usize>>,
    cancelled: Mutex<Vec<String>>,
}

#[derive(Clone, Default)]
pub struct FakeBroker {
    state: Arc<FakeState>,
}

impl FakeBroker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn connector(&self) -> Arc<dyn BrokerConnector> {
        Arc::new(FakeConnector {
            state: self.state.clone(),
        })
    }

    pub fn connection(&self) -> Arc<dyn BrokerConnection> {
        Arc::new(FakeConnection {
            state: self.state.clone(),
        })
    }

    pub fn connect_calls(&self) -> usize {
        self.state.connect_calls.load(Ordering::SeqCst)
    }

    pub fn close_calls(&self) -> usize {
        self.state.close_calls.load(Ordering::SeqCst)
    }

    pub fn fail_connect(&self, fail: bool) {
        self.state.fail_connect.store(fail, Ordering::SeqCst);
    }

    pub fn raise_connection_error(&self, err: BrokerError) {
        for observer in self.state.observers.lock().unwrap().iter() {
            observer(err.clone());
        }
    }

    pub fn admin_channel_calls(&self) -> usize {
        self.state.admin_channel_calls.load(Ordering::SeqCst)
    }

    pub fn fail_admin_channel(&self, fail: bool) {
        self.state.fail_admin_channel.store(fail, Ordering::SeqCst);
    }

    /// Closes the most recent admin channel as the broker would
    pub fn close_current_channel(&self, reason: &str) {
        if let Some(channel) = self.state.channels.lock().unwrap().last() {
            channel.shut(ChannelClosure::unsolicited(reason));
        }
    }

    pub fn binds(&self) -> Vec<BindCall> {
        self.state.binds.lock().unwrap().clone()
    }

    pub fn unbinds(&self) -> Vec<BindCall> {
        self.state.unbinds.lock().unwrap().clone()
    }

    pub fn fail_bind(&self, fail: bool) {
        self.state.fail_bind.store(fail, Ordering::SeqCst);
    }

    pub fn fail_next_publishes(&self, count: u32) {
        self.state
            .publish_failures_remaining
            .store(count, Ordering::SeqCst);
    }

    pub fn publish_attempts(&self) -> usize {
        self.state.publish_attempts.load(Ordering::SeqCst)
    }

    pub fn published(&self) -> Vec<(String, String, Vec<u8>)> {
        self.state.published.lock().unwrap().clone()
    }

    pub async fn wait_for_published(&self, count: usize) {
        loop {
            let notified = self.state.published_notify.notified();
            if self.state.published.lock().unwrap().len() >= count {
                return;
            }
            notified.await;
        }
    }

    pub fn consumer_specs(&self) -> Vec<ConsumerSpec> {
        self.state
            .consumers
            .lock()
            .unwrap()
            .iter()
            .map(|(spec, _)| spec.clone())
            .collect()
    }

    pub fn fail_consumer_at(&self, index: Option<usize>) {
        *self.state.fail_consumer_at.lock().unwrap() = index;
    }

    pub fn cancelled_consumers(&self) -> Vec<String> {
        self.state.cancelled.lock().unwrap().clone()
    }

    /// Runs the handler registered for `queue` on one delivery
    pub async fn deliver(&self, queue: &str, body: Vec<u8>) -> Result<(), HandlerError> {
        let handler = self
            .state
            .consumers
            .lock()
            .unwrap()
            .iter()
            .find(|(spec, _)| spec.queue.name == queue)
            .map(|(_, handler)| handler.clone())
            .expect("no consumer for queue");
        handler
            .handle(Delivery {
                routing_key: String::new(),
                body,
                redelivered: false,
            })
            .await
    }
}

struct FakeConnector {
    state: Arc<FakeState>,
}

#[async_trait]
impl BrokerConnector for FakeConnector {
    async fn connect(&self, _url: &str) -> Result<Arc<dyn BrokerConnection>, BrokerError> {
        self.state.connect_calls.fetch_add(1, Ordering::SeqCst);
        if self.state.fail_connect.load(Ordering::SeqCst) {
            return Err(BrokerError::Connection("connection refused".into()));
        }
        Ok(Arc::new(FakeConnection {
            state: self.state.clone(),
        }))
    }
}

struct FakeConnection {
    state: Arc<FakeState>,
}

#[async_trait]
impl BrokerConnection for FakeConnection {
    async fn create_admin_channel(&self) -> Result<Arc<dyn AdminChannel>, BrokerError> {
        self.state.admin_channel_calls.fetch_add(1, Ordering::SeqCst);
        if self.state.fail_admin_channel.load(Ordering::SeqCst) {
            return Err(BrokerError::Channel("connection blocked".into()));
        }
        let (closure, _) = watch::channel(None);
        let channel = Arc::new(FakeChannel {
            state: self.state.clone(),
            closure,
        });
        self.state.channels.lock().unwrap().push(channel.clone());
        Ok(channel)
    }

    async fn create_publisher(
        &self,
        _exchange: &ExchangeSpec,
    ) -> Result<Arc<dyn ConfirmPublisher>, BrokerError> {
        Ok(Arc::new(FakePublisher {
            state: self.state.clone(),
        }))
    }

    async fn start_consumer(
        &self,
        spec: ConsumerSpec,
        handler: Arc<dyn DeliveryHandler>,
    ) -> Result<Box<dyn ConsumerHandle>, BrokerError> {
        let mut consumers = self.state.consumers.lock().unwrap();
        if *self.state.fail_consumer_at.lock().unwrap() == Some(consumers.len()) {
            return Err(BrokerError::Consumer("queue declare failed".into()));
        }
        let queue = spec.queue.name.clone();
        consumers.push((spec, handler));
        Ok(Box::new(FakeConsumer {
            queue,
            state: self.state.clone(),
        }))
    }

    fn on_error(&self, observer: ErrorObserver) {
        self.state.observers.lock().unwrap().push(observer);
    }

    fn is_connected(&self) -> bool {
        true
    }

    async fn close(&self) -> Result<(), BrokerError> {
        self.state.close_calls.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

struct FakeChannel {
    state: Arc<FakeState>,
    closure: watch::Sender<Option<ChannelClosure>>,
}

impl FakeChannel {
    fn shut(&self, closure: ChannelClosure) {
        self.closure.send_replace(Some(closure));
    }

    fn check(&self) -> Result<(), BrokerError> {
        if !self.is_open() {
            return Err(BrokerError::ChannelClosed);
        }
        if self.state.fail_bind.load(Ordering::SeqCst) {
            return Err(BrokerError::Channel("NOT_FOUND - no queue".into()));
        }
        Ok(())
    }
}

#[async_trait]
impl AdminChannel for FakeChannel {
    async fn queue_bind(&self, queue: &str, exchange: &str, key: &str) -> Result<(), BrokerError> {
        self.check()?;
        self.state
            .binds
            .lock()
            .unwrap()
            .push((queue.into(), exchange.into(), key.into()));
        Ok(())
    }

    async fn queue_unbind(&self, queue: &str, exchange: &str, key: &str) -> Result<(), BrokerError> {
        self.check()?;
        self.state
            .unbinds
            .lock()
            .unwrap()
            .push((queue.into(), exchange.into(), key.into()));
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

struct FakePublisher {
    state: Arc<FakeState>,
}

#[async_trait]
impl ConfirmPublisher for FakePublisher {
    async fn publish(&self, exchange: &str, key: &str, body: &[u8]) -> Result<(), BrokerError> {
        self.state.publish_attempts.fetch_add(1, Ordering::SeqCst);
        let remaining = self.state.publish_failures_remaining.load(Ordering::SeqCst);
        if remaining > 0 {
            self.state
                .publish_failures_remaining
                .store(remaining - 1, Ordering::SeqCst);
            return Err(BrokerError::PublishNotConfirmed("nack".into()));
        }
        self.state
            .published
            .lock()
            .unwrap()
            .push((exchange.into(), key.into(), body.to_vec()));
        self.state.published_notify.notify_waiters();
        Ok(())
    }
}

struct FakeConsumer {
    queue: String,
    state: Arc<FakeState>,
}

#[async_trait]
impl ConsumerHandle for FakeConsumer {
    fn queue(&self) -> &str {
        &self.queue
    }

    async fn cancel(&self) -> Result<(), BrokerError> {
        self.state.cancelled.lock().unwrap().push(self.queue.clone());
        Ok(())
    }
}
