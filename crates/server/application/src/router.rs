//! Inbound side of the fan-out.
//!
//! Shard queues carry many rooms, so the broker only gets a message to the
//! right instance. Precision is restored here by publishing on the exact
//! local topic, where only sockets subscribed to that literal string listen.

use crate::error::RouterError;
use async_trait::async_trait;
use roomcast_server_domain::{
    Delivery, DeliveryHandler, DeliveryMetricsJob, DeliveryMetricsQueue, HandlerError,
    InboundMessage, LocalFrame, LocalPubSub,
};
use roomcast_shared::event_topics::subscribe_all_topic;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use tracing::{debug, error, info, instrument};

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RouterStats {
    pub received: u64,
    pub emitted: u64,
    pub handler_errors: u64,
    pub jobs_enqueued: u64,
}

#[derive(Default)]
struct Counters {
    received: AtomicU64,
    emitted: AtomicU64,
    handler_errors: AtomicU64,
    jobs_enqueued: AtomicU64,
}

pub struct InboundMessageRouter {
    pubsub: Arc<dyn LocalPubSub>,
    metrics_queue: Arc<dyn DeliveryMetricsQueue>,
    counters: Counters,
}

impl InboundMessageRouter {
    pub fn new(pubsub: Arc<dyn LocalPubSub>, metrics_queue: Arc<dyn DeliveryMetricsQueue>) -> Self {
        Self {
            pubsub,
            metrics_queue,
            counters: Counters::default(),
        }
    }

    /// Handles one broker delivery body.
    ///
    /// Errors are logged and returned so the consumer rejects the delivery.
    pub async fn handle_message(&self, body: &[u8]) -> Result<(), RouterError> {
        self.counters.received.fetch_add(1, Ordering::Relaxed);
        let result = self.route(body).await;
        if let Err(e) = &result {
            self.counters.handler_errors.fetch_add(1, Ordering::Relaxed);
            error!(error = %e, "Failed to handle inbound message");
        }
        result
    }

    async fn route(&self, body: &[u8]) -> Result<(), RouterError> {
        let mut message = InboundMessage::from_slice(body)?;
        message.latency_log.mark_received();

        let exact = LocalFrame::event(&message.event, &message.data).to_json()?;
        let all_topic = subscribe_all_topic(&message.nsp_room_id, message.service.as_deref());
        let all = LocalFrame::subscribe_all(&message.event, &message.data).to_json()?;

        // Both frames go out before any accounting so a full metrics queue
        // never holds back room-wide listeners
        self.emit(&message.event, exact).await?;
        self.emit(&all_topic, all).await?;

        let exact_accounted = self.account(&message, &message.event).await;
        let all_accounted = self.account(&message, &all_topic).await;
        exact_accounted.and(all_accounted)
    }

    async fn emit(&self, topic: &str, payload: String) -> Result<(), RouterError> {
        self.pubsub.publish(topic, payload).await?;
        self.counters.emitted.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    /// Enqueues one metrics job if the topic had local recipients
    #[instrument(skip(self, message), fields(request_id = %message.request_id))]
    async fn account(&self, message: &InboundMessage, topic: &str) -> Result<(), RouterError> {
        let recipients = self.pubsub.num_subscribers(topic).await;
        if recipients == 0 {
            debug!("No local subscribers");
            return Ok(());
        }

        let job = DeliveryMetricsJob::for_emission(message, topic, recipients);
        let job_id = self.metrics_queue.enqueue(job).await?;
        self.counters.jobs_enqueued.fetch_add(1, Ordering::Relaxed);
        info!(
            job_id = %job_id,
            recipients,
            nsp_room_id = %message.nsp_room_id,
            "Delivery metrics job enqueued"
        );
        Ok(())
    }

    pub fn stats(&self) -> RouterStats {
        RouterStats {
            received: self.counters.received.load(Ordering::Relaxed),
            emitted: self.counters.emitted.load(Ordering::Relaxed),
            handler_errors: self.counters.handler_errors.load(Ordering::Relaxed),
            jobs_enqueued: self.counters.jobs_enqueued.load(Ordering::Relaxed),
        }
    }
}

#[async_trait]
impl DeliveryHandler for InboundMessageRouter {
    async fn handle(&self, delivery: Delivery) -> Result<(), HandlerError> {
        self.handle_message(&delivery.body)
            .await
            .map_err(|e| Box::new(e) as HandlerError)
    }
}
