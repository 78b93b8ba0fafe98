//! Outbound entry point: `dispatcher.to(room).dispatch(...)`.
//!
//! Every room-scoped event leaving this instance goes through here. The
//! routing key comes from the same [`ShardRouter`] the binding controller
//! uses, so publishers and bindings always agree.

use crate::error::DispatchError;
use crate::publisher::AdministrativePublisher;
use roomcast_server_domain::{LatencyLog, OutboundEnvelope, ReducedSession, RoutingKey, ShardRouter};
use roomcast_shared::RequestId;
use serde_json::Value;
use std::sync::Arc;
use tracing::{debug, error};

#[derive(Clone)]
pub struct Dispatcher {
    publisher: Arc<AdministrativePublisher>,
    router: ShardRouter,
}

impl Dispatcher {
    pub fn new(publisher: Arc<AdministrativePublisher>, router: ShardRouter) -> Self {
        Self { publisher, router }
    }

    pub fn to(&self, nsp_room_id: impl Into<String>) -> RoomDispatch<'_> {
        RoomDispatch {
            dispatcher: self,
            nsp_room_id: nsp_room_id.into(),
            global: None,
        }
    }

    fn prepare(
        &self,
        nsp_room_id: String,
        global: Option<bool>,
        event: &str,
        data: Value,
        session: ReducedSession,
        latency_log: LatencyLog,
    ) -> Result<(RoutingKey, OutboundEnvelope), DispatchError> {
        let routing_key = self.router.routing_key(&nsp_room_id)?;
        let mut envelope = OutboundEnvelope::new(nsp_room_id, event, data, session, latency_log);
        if let Some(global) = global {
            envelope = envelope.with_global(global);
        }
        Ok((routing_key, envelope))
    }

    pub fn published(&self) -> u64 {
        self.publisher.published()
    }

    pub fn publish_failures(&self) -> u64 {
        self.publisher.failures()
    }
}

/// A dispatch bound to one room
pub struct RoomDispatch<'a> {
    dispatcher: &'a Dispatcher,
    nsp_room_id: String,
    global: Option<bool>,
}

impl RoomDispatch<'_> {
    pub fn global(mut self, global: bool) -> Self {
        self.global = Some(global);
        self
    }

    /// Publishes in the background and returns at once.
    ///
    /// Only an unroutable room is reported to the caller; broker failures are
    /// logged by the background task.
    pub fn dispatch(
        self,
        event: &str,
        data: Value,
        session: ReducedSession,
        latency_log: LatencyLog,
    ) -> Result<RequestId, DispatchError> {
        let (routing_key, envelope) = self.dispatcher.prepare(
            self.nsp_room_id,
            self.global,
            event,
            data,
            session,
            latency_log,
        )?;
        let request_id = envelope.request_id();
        let publisher = self.dispatcher.publisher.clone();

        tokio::spawn(async move {
            match publisher.publish_message(&routing_key, &envelope).await {
                Ok(()) => debug!(
                    routing_key = %routing_key,
                    request_id = %request_id,
                    event = envelope.event(),
                    "Dispatched"
                ),
                Err(e) => error!(
                    routing_key = %routing_key,
                    request_id = %request_id,
                    event = envelope.event(),
                    error = %e,
                    "Dispatch failed"
                ),
            }
        });

        Ok(request_id)
    }

    /// Publishes and waits for the broker confirmation
    pub async fn dispatch_confirmed(
        self,
        event: &str,
        data: Value,
        session: ReducedSession,
        latency_log: LatencyLog,
    ) -> Result<RequestId, DispatchError> {
        let (routing_key, envelope) = self.dispatcher.prepare(
            self.nsp_room_id,
            self.global,
            event,
            data,
            session,
            latency_log,
        )?;
        self.dispatcher
            .publisher
            .publish_message(&routing_key, &envelope)
            .await?;
        Ok(envelope.request_id())
    }
}
