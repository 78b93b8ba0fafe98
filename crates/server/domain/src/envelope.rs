//! Broker and local wire payloads.
//!
//! Everything that crosses the broker is an [`OutboundEnvelope`] on the way
//! out and an [`InboundMessage`] on the way in. Field names are camelCase on
//! the wire so unmigrated peers can read them.

use chrono::{DateTime, Utc};
use roomcast_shared::RequestId;
use roomcast_shared::event_topics::split_room_id;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum EnvelopeError {
    #[error("Malformed message body: {0}")]
    Malformed(#[from] serde_json::Error),

    #[error("Invalid field {field}: {reason}")]
    InvalidField { field: &'static str, reason: String },
}

/// Identity projection of a client session carried over the broker.
///
/// Never holds permissions or credentials.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReducedSession {
    pub app_pid: String,
    pub key_id: String,
    pub uid: String,
    pub connection_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub client_id: Option<String>,
    pub socket_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub instance_id: Option<String>,
}

/// Timing marks accumulated along a message's path
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LatencyLog {
    #[serde(
        default,
        with = "chrono::serde::ts_milliseconds_option",
        skip_serializing_if = "Option::is_none"
    )]
    pub created_at: Option<DateTime<Utc>>,
    #[serde(
        default,
        with = "chrono::serde::ts_milliseconds_option",
        skip_serializing_if = "Option::is_none"
    )]
    pub received_at: Option<DateTime<Utc>>,
}

impl LatencyLog {
    pub fn started_now() -> Self {
        Self {
            created_at: Some(Utc::now()),
            received_at: None,
        }
    }

    /// Marks arrival at this instance, keeping the original creation time
    pub fn mark_received(&mut self) {
        self.received_at = Some(Utc::now());
    }
}

/// Message published to the rooms exchange.
///
/// Built once per dispatch and immutable afterwards; `request_id` is fresh
/// for every envelope.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OutboundEnvelope {
    nsp_room_id: String,
    event: String,
    data: Value,
    session: ReducedSession,
    request_id: RequestId,
    latency_log: LatencyLog,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    global: Option<bool>,
}

impl OutboundEnvelope {
    pub fn new(
        nsp_room_id: impl Into<String>,
        event: impl Into<String>,
        data: Value,
        session: ReducedSession,
        latency_log: LatencyLog,
    ) -> Self {
        Self {
            nsp_room_id: nsp_room_id.into(),
            event: event.into(),
            data,
            session,
            request_id: RequestId::new(),
            latency_log,
            global: None,
        }
    }

    pub fn with_global(mut self, global: bool) -> Self {
        self.global = Some(global);
        self
    }

    pub fn nsp_room_id(&self) -> &str {
        &self.nsp_room_id
    }

    pub fn event(&self) -> &str {
        &self.event
    }

    pub fn data(&self) -> &Value {
        &self.data
    }

    pub fn session(&self) -> &ReducedSession {
        &self.session
    }

    pub fn request_id(&self) -> RequestId {
        self.request_id
    }

    pub fn latency_log(&self) -> &LatencyLog {
        &self.latency_log
    }

    pub fn global(&self) -> Option<bool> {
        self.global
    }

    pub fn to_bytes(&self) -> Result<Vec<u8>, EnvelopeError> {
        Ok(serde_json::to_vec(self)?)
    }
}

/// Message body as received from a shard queue
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InboundMessage {
    pub nsp_room_id: String,
    pub event: String,
    #[serde(default)]
    pub data: Value,
    pub request_id: RequestId,
    pub session: ReducedSession,
    #[serde(default)]
    pub latency_log: LatencyLog,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub service: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub global: Option<bool>,
}

impl InboundMessage {
    /// Decodes and validates a broker delivery body
    pub fn from_slice(body: &[u8]) -> Result<Self, EnvelopeError> {
        let message: InboundMessage = serde_json::from_slice(body)?;
        message.validate()?;
        Ok(message)
    }

    fn validate(&self) -> Result<(), EnvelopeError> {
        if split_room_id(&self.nsp_room_id).is_none() {
            return Err(EnvelopeError::InvalidField {
                field: "nspRoomId",
                reason: format!("expected appPid:room, got '{}'", self.nsp_room_id),
            });
        }
        if self.event.is_empty() {
            return Err(EnvelopeError::InvalidField {
                field: "event",
                reason: "must not be empty".to_string(),
            });
        }
        Ok(())
    }
}

impl From<OutboundEnvelope> for InboundMessage {
    fn from(envelope: OutboundEnvelope) -> Self {
        Self {
            nsp_room_id: envelope.nsp_room_id,
            event: envelope.event,
            data: envelope.data,
            request_id: envelope.request_id,
            session: envelope.session,
            latency_log: envelope.latency_log,
            service: None,
            global: envelope.global,
        }
    }
}

/// Payload written to local sockets: `{type, body, forEvent?}`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LocalFrame {
    #[serde(rename = "type")]
    pub kind: String,
    pub body: Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub for_event: Option<String>,
}

impl LocalFrame {
    pub fn event(event: &str, data: &Value) -> Self {
        Self {
            kind: event.to_string(),
            body: data.clone(),
            for_event: None,
        }
    }

    /// Frame for room-wide listeners, tagged with the originating event
    pub fn subscribe_all(event: &str, data: &Value) -> Self {
        Self {
            kind: event.to_string(),
            body: data.clone(),
            for_event: Some(event.to_string()),
        }
    }

    pub fn to_json(&self) -> Result<String, EnvelopeError> {
        Ok(serde_json::to_string(self)?)
    }
}
