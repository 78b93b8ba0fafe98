//! Delivery metrics accounting.
//!
//! One job per local emission that reached at least one socket. The queue
//! behind [`DeliveryMetricsQueue`] is owned by another subsystem.

use crate::envelope::{InboundMessage, LatencyLog, ReducedSession};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use roomcast_shared::{JobId, RequestId};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeliveryMetricsJob {
    pub nsp_room_id: String,
    pub event: String,
    pub recipient_count: usize,
    pub data: Value,
    pub request_id: RequestId,
    pub session: ReducedSession,
    pub latency_log: LatencyLog,
    pub timestamp: DateTime<Utc>,
    /// Local topic the message was emitted on
    pub listener: String,
}

impl DeliveryMetricsJob {
    pub fn for_emission(message: &InboundMessage, listener: &str, recipient_count: usize) -> Self {
        Self {
            nsp_room_id: message.nsp_room_id.clone(),
            event: message.event.clone(),
            recipient_count,
            data: message.data.clone(),
            request_id: message.request_id,
            session: message.session.clone(),
            latency_log: message.latency_log.clone(),
            timestamp: Utc::now(),
            listener: listener.to_string(),
        }
    }
}

#[derive(Debug, Error)]
pub enum MetricsQueueError {
    #[error("Metrics queue is closed")]
    Closed,

    #[error("Metrics job rejected: {0}")]
    Rejected(String),
}

#[async_trait]
pub trait DeliveryMetricsQueue: Send + Sync {
    async fn enqueue(&self, job: DeliveryMetricsJob) -> Result<JobId, MetricsQueueError>;
}
