//! One connected socket, seen from the server side.

use crate::realtime::metrics::RealtimeMetrics;
use std::collections::HashSet;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Instant;
use tokio::sync::mpsc;
use tracing::warn;

pub const SESSION_CHANNEL_CAPACITY: usize = 1000;

pub type SessionId = String;

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum SessionError {
    #[error("Backpressure: channel full")]
    Backpressure,

    #[error("Session closed")]
    Closed,
}

#[derive(Debug, Clone)]
pub struct SessionMetrics {
    pub id: SessionId,
    pub messages_sent: u64,
    pub messages_dropped: u64,
    pub active_subscriptions: usize,
    pub joined_rooms: usize,
    pub drop_rate_percent: f64,
    pub session_duration_seconds: f64,
}

/// Outbound frames go to `tx`; the socket writer owns the receiver.
///
/// Topic and room membership is mirrored here so that unregistering a
/// session can undo everything it did.
#[derive(Debug)]
pub struct Session {
    id: SessionId,
    tx: mpsc::Sender<String>,
    topics: Mutex<HashSet<String>>,
    rooms: Mutex<HashSet<String>>,
    metrics: RealtimeMetrics,
    messages_sent: AtomicU64,
    messages_dropped: AtomicU64,
    started: Instant,
}

fn locked<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

impl Session {
    pub fn new(id: impl Into<SessionId>, tx: mpsc::Sender<String>, metrics: RealtimeMetrics) -> Self {
        Self {
            id: id.into(),
            tx,
            topics: Mutex::new(HashSet::new()),
            rooms: Mutex::new(HashSet::new()),
            metrics,
            messages_sent: AtomicU64::new(0),
            messages_dropped: AtomicU64::new(0),
            started: Instant::now(),
        }
    }

    /// A session plus the receiving end of its outbox
    pub fn channel(id: impl Into<SessionId>, metrics: RealtimeMetrics) -> (Self, mpsc::Receiver<String>) {
        let (tx, rx) = mpsc::channel(SESSION_CHANNEL_CAPACITY);
        (Self::new(id, tx, metrics), rx)
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    /// Returns `false` if already subscribed
    pub(crate) fn add_topic(&self, topic: &str) -> bool {
        locked(&self.topics).insert(topic.to_string())
    }

    pub(crate) fn remove_topic(&self, topic: &str) -> bool {
        locked(&self.topics).remove(topic)
    }

    pub(crate) fn add_room(&self, room: &str) -> bool {
        locked(&self.rooms).insert(room.to_string())
    }

    pub(crate) fn remove_room(&self, room: &str) -> bool {
        locked(&self.rooms).remove(room)
    }

    pub fn is_subscribed(&self, topic: &str) -> bool {
        locked(&self.topics).contains(topic)
    }

    pub fn subscribed_topics(&self) -> Vec<String> {
        let mut topics: Vec<_> = locked(&self.topics).iter().cloned().collect();
        topics.sort();
        topics
    }

    pub fn rooms(&self) -> Vec<String> {
        let mut rooms: Vec<_> = locked(&self.rooms).iter().cloned().collect();
        rooms.sort();
        rooms
    }

    /// Never waits: a full outbox drops the frame
    pub fn send_message(&self, message: String) -> Result<(), SessionError> {
        match self.tx.try_send(message) {
            Ok(()) => {
                self.messages_sent.fetch_add(1, Ordering::Relaxed);
                self.metrics.record_message_sent();
                Ok(())
            }
            Err(mpsc::error::TrySendError::Full(_)) => {
                self.messages_dropped.fetch_add(1, Ordering::Relaxed);
                self.metrics.record_backpressure();
                warn!(session_id = %self.id, "Backpressure detected on session");
                Err(SessionError::Backpressure)
            }
            Err(mpsc::error::TrySendError::Closed(_)) => {
                self.messages_dropped.fetch_add(1, Ordering::Relaxed);
                self.metrics.record_session_error();
                Err(SessionError::Closed)
            }
        }
    }

    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }

    pub fn metrics(&self) -> SessionMetrics {
        let sent = self.messages_sent.load(Ordering::Relaxed);
        let dropped = self.messages_dropped.load(Ordering::Relaxed);
        let total = sent.saturating_add(dropped);
        let drop_rate = if total > 0 {
            (dropped as f64 / total as f64) * 100.0
        } else {
            0.0
        };

        SessionMetrics {
            id: self.id.clone(),
            messages_sent: sent,
            messages_dropped: dropped,
            active_subscriptions: locked(&self.topics).len(),
            joined_rooms: locked(&self.rooms).len(),
            drop_rate_percent: drop_rate,
            session_duration_seconds: self.started.elapsed().as_secs_f64(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn metrics() -> RealtimeMetrics {
        RealtimeMetrics::new().unwrap()
    }

    #[test]
    fn test_topic_membership() {
        let (session, _rx) = Session::channel("sess-1", metrics());

        assert!(session.add_topic("app1:chat:message"));
        assert!(!session.add_topic("app1:chat:message"));
        assert!(session.is_subscribed("app1:chat:message"));
        assert!(session.remove_topic("app1:chat:message"));
        assert!(session.subscribed_topics().is_empty());
    }

    #[tokio::test]
    async fn test_send_message_reaches_outbox() {
        let (session, mut rx) = Session::channel("sess-1", metrics());

        session.send_message("hello".to_string()).unwrap();

        assert_eq!(rx.recv().await.as_deref(), Some("hello"));
        assert_eq!(session.metrics().messages_sent, 1);
    }

    #[test]
    fn test_full_outbox_drops() {
        let (tx, _rx) = mpsc::channel(1);
        let session = Session::new("sess-1", tx, metrics());

        session.send_message("one".to_string()).unwrap();
        let result = session.send_message("two".to_string());

        assert_eq!(result, Err(SessionError::Backpressure));
        let stats = session.metrics();
        assert_eq!(stats.messages_dropped, 1);
        assert_eq!(stats.drop_rate_percent, 50.0);
    }

    #[test]
    fn test_closed_outbox() {
        let (session, rx) = Session::channel("sess-1", metrics());
        drop(rx);

        assert!(session.is_closed());
        assert_eq!(
            session.send_message("x".to_string()),
            Err(SessionError::Closed)
        );
    }
}
