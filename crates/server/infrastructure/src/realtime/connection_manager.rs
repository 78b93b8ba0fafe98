//! Registry of local sessions, their topic subscriptions and room membership.
//!
//! Room membership drives broker interest: the first session to join a room
//! emits [`InterestEvent::Created`] and the last one to leave emits
//! [`InterestEvent::Deleted`]. Events are sent while the room's map shard is
//! locked, so the binding controller always sees them in membership order.

use crate::realtime::metrics::RealtimeMetrics;
use crate::realtime::session::{Session, SessionError, SessionId};
use async_trait::async_trait;
use dashmap::DashMap;
use roomcast_server_domain::{InterestEvent, InterestSender, LocalPubSub, LocalPubSubError};
use roomcast_shared::event_topics::split_room_id;
use std::collections::HashSet;
use std::sync::Arc;
use tracing::{debug, warn};

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum ConnectionError {
    #[error("Session not found: {0}")]
    UnknownSession(String),

    #[error("Invalid room id: {0}")]
    InvalidRoom(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectionManagerMetrics {
    pub active_sessions: usize,
    pub active_topics: usize,
    pub total_subscriptions: usize,
    pub active_rooms: usize,
}

#[derive(Debug)]
pub struct ConnectionManager {
    sessions: DashMap<SessionId, Arc<Session>>,
    subscriptions: DashMap<String, HashSet<SessionId>>,
    rooms: DashMap<String, HashSet<SessionId>>,
    interest: InterestSender,
    metrics: RealtimeMetrics,
}

impl ConnectionManager {
    pub fn new(metrics: RealtimeMetrics, interest: InterestSender) -> Self {
        Self {
            sessions: DashMap::new(),
            subscriptions: DashMap::new(),
            rooms: DashMap::new(),
            interest,
            metrics,
        }
    }

    pub fn register_session(&self, session: Arc<Session>) {
        let session_id = session.id().to_string();
        if self.sessions.insert(session_id.clone(), session).is_none() {
            self.metrics.session_active_inc();
        }
        debug!(session_id = %session_id, "Session registered");
    }

    /// Drops the session's subscriptions and leaves all its rooms
    pub fn unregister_session(&self, session_id: &str) -> Option<Arc<Session>> {
        let (_, session) = self.sessions.remove(session_id)?;
        for topic in session.subscribed_topics() {
            self.remove_subscriber(&topic, session_id);
            session.remove_topic(&topic);
        }
        for room in session.rooms() {
            self.remove_member(&room, session_id);
            session.remove_room(&room);
        }
        self.metrics.session_active_dec();
        debug!(session_id = %session_id, "Session unregistered");
        Some(session)
    }

    fn session(&self, session_id: &str) -> Result<Arc<Session>, ConnectionError> {
        self.sessions
            .get(session_id)
            .map(|entry| entry.clone())
            .ok_or_else(|| ConnectionError::UnknownSession(session_id.to_string()))
    }

    pub fn subscribe(&self, session_id: &str, topic: &str) -> Result<(), ConnectionError> {
        let session = self.session(session_id)?;
        if !session.add_topic(topic) {
            return Ok(());
        }
        self.subscriptions
            .entry(topic.to_string())
            .or_default()
            .insert(session_id.to_string());
        self.metrics.subscription_inc();
        debug!(session_id = %session_id, topic = %topic, "Session subscribed to topic");
        Ok(())
    }

    pub fn unsubscribe(&self, session_id: &str, topic: &str) {
        let Some(session) = self.sessions.get(session_id).map(|entry| entry.clone()) else {
            return;
        };
        if session.remove_topic(topic) {
            self.remove_subscriber(topic, session_id);
            debug!(session_id = %session_id, topic = %topic, "Session unsubscribed from topic");
        }
    }

    fn remove_subscriber(&self, topic: &str, session_id: &str) {
        if let Some(mut subscribers) = self.subscriptions.get_mut(topic) {
            if subscribers.remove(session_id) {
                self.metrics.subscription_dec();
            }
        }
        self.subscriptions
            .remove_if(topic, |_, subscribers| subscribers.is_empty());
    }

    /// Returns `true` when the session was not in the room yet
    pub fn join_room(&self, session_id: &str, nsp_room_id: &str) -> Result<bool, ConnectionError> {
        if split_room_id(nsp_room_id).is_none() {
            return Err(ConnectionError::InvalidRoom(nsp_room_id.to_string()));
        }
        let session = self.session(session_id)?;
        if !session.add_room(nsp_room_id) {
            return Ok(false);
        }

        let mut members = self.rooms.entry(nsp_room_id.to_string()).or_default();
        let first = members.is_empty();
        members.insert(session_id.to_string());
        if first {
            self.signal(InterestEvent::created(nsp_room_id));
            self.metrics.room_interest_created();
        }
        drop(members);

        debug!(session_id = %session_id, room = %nsp_room_id, "Session joined room");
        Ok(true)
    }

    /// Returns `true` when the session was in the room
    pub fn leave_room(&self, session_id: &str, nsp_room_id: &str) -> bool {
        let Some(session) = self.sessions.get(session_id).map(|entry| entry.clone()) else {
            return false;
        };
        if !session.remove_room(nsp_room_id) {
            return false;
        }
        self.remove_member(nsp_room_id, session_id);
        debug!(session_id = %session_id, room = %nsp_room_id, "Session left room");
        true
    }

    fn remove_member(&self, nsp_room_id: &str, session_id: &str) {
        if let Some(mut members) = self.rooms.get_mut(nsp_room_id) {
            if members.remove(session_id) && members.is_empty() {
                self.signal(InterestEvent::deleted(nsp_room_id));
                self.metrics.room_interest_deleted();
            }
        }
        self.rooms.remove_if(nsp_room_id, |_, members| members.is_empty());
    }

    fn signal(&self, event: InterestEvent) {
        if self.interest.send(event).is_err() {
            warn!("Interest receiver dropped; broker bindings will not follow");
        }
    }

    pub fn get_session(&self, session_id: &str) -> Option<Arc<Session>> {
        self.sessions.get(session_id).map(|entry| entry.clone())
    }

    pub fn active_sessions_count(&self) -> usize {
        self.sessions.len()
    }

    pub fn room_members(&self, nsp_room_id: &str) -> usize {
        self.rooms.get(nsp_room_id).map_or(0, |members| members.len())
    }

    pub fn metrics(&self) -> ConnectionManagerMetrics {
        ConnectionManagerMetrics {
            active_sessions: self.sessions.len(),
            active_topics: self.subscriptions.len(),
            total_subscriptions: self.subscriptions.iter().map(|entry| entry.len()).sum(),
            active_rooms: self.rooms.len(),
        }
    }
}

#[async_trait]
impl LocalPubSub for ConnectionManager {
    async fn publish(&self, topic: &str, payload: String) -> Result<usize, LocalPubSubError> {
        let targets: Vec<SessionId> = match self.subscriptions.get(topic) {
            Some(subscribers) => subscribers.iter().cloned().collect(),
            None => return Ok(0),
        };

        let mut delivered = 0;
        let mut closed = Vec::new();
        for session_id in targets {
            let Some(session) = self.get_session(&session_id) else {
                continue;
            };
            match session.send_message(payload.clone()) {
                Ok(()) => delivered += 1,
                Err(SessionError::Backpressure) => {}
                Err(SessionError::Closed) => closed.push(session_id),
            }
        }

        for session_id in closed {
            warn!(session_id = %session_id, "Dropping closed session");
            self.unregister_session(&session_id);
        }
        Ok(delivered)
    }

    async fn num_subscribers(&self, topic: &str) -> usize {
        self.subscriptions
            .get(topic)
            .map_or(0, |subscribers| subscribers.len())
    }
}
