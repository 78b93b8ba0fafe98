//! Delivery metrics job queue backed by a bounded mpsc channel.
//!
//! The router only needs `enqueue`; whatever drains the receiver decides
//! where the jobs end up. [`spawn_metrics_logger`] is the drain the binary
//! uses when no other consumer is wired in.

use async_trait::async_trait;
use roomcast_server_domain::{DeliveryMetricsJob, DeliveryMetricsQueue, MetricsQueueError};
use roomcast_shared::JobId;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

pub const DEFAULT_METRICS_QUEUE_CAPACITY: usize = 10_000;

#[derive(Debug, Clone)]
pub struct QueuedJob {
    pub id: JobId,
    pub job: DeliveryMetricsJob,
}

#[derive(Debug, Clone)]
pub struct ChannelMetricsQueue {
    tx: mpsc::Sender<QueuedJob>,
    rejected: Arc<AtomicU64>,
}

impl ChannelMetricsQueue {
    pub fn new(capacity: usize) -> (Self, mpsc::Receiver<QueuedJob>) {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        (
            Self {
                tx,
                rejected: Arc::new(AtomicU64::new(0)),
            },
            rx,
        )
    }

    pub fn rejected(&self) -> u64 {
        self.rejected.load(Ordering::Relaxed)
    }
}

#[async_trait]
impl DeliveryMetricsQueue for ChannelMetricsQueue {
    async fn enqueue(&self, job: DeliveryMetricsJob) -> Result<JobId, MetricsQueueError> {
        let id = JobId::new();
        match self.tx.try_send(QueuedJob {
            id: id.clone(),
            job,
        }) {
            Ok(()) => Ok(id),
            Err(mpsc::error::TrySendError::Full(_)) => {
                self.rejected.fetch_add(1, Ordering::Relaxed);
                Err(MetricsQueueError::Rejected("queue is full".to_string()))
            }
            Err(mpsc::error::TrySendError::Closed(_)) => Err(MetricsQueueError::Closed),
        }
    }
}

/// Drains `rx`, logging each job; resolves with the number drained once
/// every sender is gone
pub fn spawn_metrics_logger(mut rx: mpsc::Receiver<QueuedJob>) -> JoinHandle<u64> {
    tokio::spawn(async move {
        let mut drained = 0u64;
        while let Some(QueuedJob { id, job }) = rx.recv().await {
            drained += 1;
            debug!(
                job_id = %id,
                nsp_room_id = %job.nsp_room_id,
                event = %job.event,
                listener = %job.listener,
                recipient_count = job.recipient_count,
                request_id = %job.request_id,
                "Delivery metrics job"
            );
        }
        if drained == 0 {
            warn!("Metrics queue closed before any job arrived");
        }
        info!(drained, "Metrics queue drained");
        drained
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use roomcast_server_domain::{InboundMessage, LatencyLog, ReducedSession};
    use roomcast_shared::RequestId;

    fn job(listener: &str) -> DeliveryMetricsJob {
        let message = InboundMessage {
            nsp_room_id: "app1:chat".to_string(),
            event: "message".to_string(),
            data: serde_json::json!({"text": "hi"}),
            request_id: RequestId::new(),
            session: ReducedSession {
                app_pid: "app1".to_string(),
                key_id: "key-1".to_string(),
                uid: "user-1".to_string(),
                connection_id: "conn-1".to_string(),
                client_id: None,
                socket_id: "sock-1".to_string(),
                instance_id: None,
            },
            latency_log: LatencyLog::started_now(),
            service: None,
            global: None,
        };
        DeliveryMetricsJob::for_emission(&message, listener, 2)
    }

    #[tokio::test]
    async fn test_enqueue_hands_job_to_receiver() {
        let (queue, mut rx) = ChannelMetricsQueue::new(4);

        let id = queue.enqueue(job("message")).await.unwrap();

        let queued = rx.recv().await.unwrap();
        assert_eq!(queued.id, id);
        assert_eq!(queued.job.listener, "message");
        assert_eq!(queued.job.recipient_count, 2);
    }

    #[tokio::test]
    async fn test_full_queue_rejects() {
        let (queue, _rx) = ChannelMetricsQueue::new(1);

        queue.enqueue(job("a")).await.unwrap();
        let result = queue.enqueue(job("b")).await;

        assert!(matches!(result, Err(MetricsQueueError::Rejected(_))));
        assert_eq!(queue.rejected(), 1);
    }

    #[tokio::test]
    async fn test_closed_queue() {
        let (queue, rx) = ChannelMetricsQueue::new(1);
        drop(rx);

        assert!(matches!(
            queue.enqueue(job("a")).await,
            Err(MetricsQueueError::Closed)
        ));
    }

    #[tokio::test]
    async fn test_logger_counts_drained_jobs() {
        let (queue, rx) = ChannelMetricsQueue::new(8);
        let logger = spawn_metrics_logger(rx);

        queue.enqueue(job("a")).await.unwrap();
        queue.enqueue(job("b")).await.unwrap();
        drop(queue);

        assert_eq!(logger.await.unwrap(), 2);
    }
}
