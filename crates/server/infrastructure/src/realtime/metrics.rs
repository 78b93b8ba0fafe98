//! Prometheus metrics for the local socket layer.

use prometheus::{IntCounter, IntGauge, Registry};
use std::sync::Arc;

/// Cheap to clone; clones share the same collectors
#[derive(Debug, Clone)]
pub struct RealtimeMetrics {
    inner: Arc<RealtimeMetricsInner>,
}

#[derive(Debug)]
struct RealtimeMetricsInner {
    sessions_active: IntGauge,
    sessions_total: IntCounter,
    subscriptions_active: IntGauge,
    rooms_with_interest: IntGauge,
    interest_events_total: IntCounter,
    messages_sent_total: IntCounter,
    messages_dropped_total: IntCounter,
    backpressure_detected: IntCounter,
    session_errors: IntCounter,
}

impl RealtimeMetrics {
    pub fn new() -> Result<Self, prometheus::Error> {
        Ok(Self {
            inner: Arc::new(RealtimeMetricsInner {
                sessions_active: IntGauge::new("roomcast_sessions_active", "Active sessions")?,
                sessions_total: IntCounter::new(
                    "roomcast_sessions_total",
                    "Sessions registered since start",
                )?,
                subscriptions_active: IntGauge::new(
                    "roomcast_subscriptions_active",
                    "Live topic subscriptions",
                )?,
                rooms_with_interest: IntGauge::new(
                    "roomcast_rooms_with_interest",
                    "Rooms with at least one local session",
                )?,
                interest_events_total: IntCounter::new(
                    "roomcast_interest_events_total",
                    "Interest transitions signalled to the binding controller",
                )?,
                messages_sent_total: IntCounter::new(
                    "roomcast_messages_sent_total",
                    "Frames accepted by session outboxes",
                )?,
                messages_dropped_total: IntCounter::new(
                    "roomcast_messages_dropped_total",
                    "Frames dropped on full or closed outboxes",
                )?,
                backpressure_detected: IntCounter::new(
                    "roomcast_backpressure_detected",
                    "Sends refused because an outbox was full",
                )?,
                session_errors: IntCounter::new("roomcast_session_errors", "Session errors")?,
            }),
        })
    }

    pub fn register(&self, registry: &Registry) -> Result<(), prometheus::Error> {
        let inner = &self.inner;
        registry.register(Box::new(inner.sessions_active.clone()))?;
        registry.register(Box::new(inner.sessions_total.clone()))?;
        registry.register(Box::new(inner.subscriptions_active.clone()))?;
        registry.register(Box::new(inner.rooms_with_interest.clone()))?;
        registry.register(Box::new(inner.interest_events_total.clone()))?;
        registry.register(Box::new(inner.messages_sent_total.clone()))?;
        registry.register(Box::new(inner.messages_dropped_total.clone()))?;
        registry.register(Box::new(inner.backpressure_detected.clone()))?;
        registry.register(Box::new(inner.session_errors.clone()))?;
        Ok(())
    }

    pub fn session_active_inc(&self) {
        self.inner.sessions_active.inc();
        self.inner.sessions_total.inc();
    }

    pub fn session_active_dec(&self) {
        self.inner.sessions_active.dec();
    }

    pub fn subscription_inc(&self) {
        self.inner.subscriptions_active.inc();
    }

    pub fn subscription_dec(&self) {
        self.inner.subscriptions_active.dec();
    }

    pub fn room_interest_created(&self) {
        self.inner.rooms_with_interest.inc();
        self.inner.interest_events_total.inc();
    }

    pub fn room_interest_deleted(&self) {
        self.inner.rooms_with_interest.dec();
        self.inner.interest_events_total.inc();
    }

    pub fn record_message_sent(&self) {
        self.inner.messages_sent_total.inc();
    }

    pub fn record_backpressure(&self) {
        self.inner.backpressure_detected.inc();
        self.inner.messages_dropped_total.inc();
    }

    pub fn record_session_error(&self) {
        self.inner.session_errors.inc();
        self.inner.messages_dropped_total.inc();
    }

    pub fn snapshot(&self) -> RealtimeMetricsSnapshot {
        let inner = &self.inner;
        RealtimeMetricsSnapshot {
            sessions_active: inner.sessions_active.get(),
            subscriptions_active: inner.subscriptions_active.get(),
            rooms_with_interest: inner.rooms_with_interest.get(),
            interest_events_total: inner.interest_events_total.get(),
            messages_sent_total: inner.messages_sent_total.get(),
            messages_dropped_total: inner.messages_dropped_total.get(),
            backpressure_detected: inner.backpressure_detected.get(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RealtimeMetricsSnapshot {
    pub sessions_active: i64,
    pub subscriptions_active: i64,
    pub rooms_with_interest: i64,
    pub interest_events_total: u64,
    pub messages_sent_total: u64,
    pub messages_dropped_total: u64,
    pub backpressure_detected: u64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_counters_move_together() {
        let metrics = RealtimeMetrics::new().unwrap();
        metrics.session_active_inc();
        metrics.session_active_inc();
        metrics.session_active_dec();
        metrics.room_interest_created();
        metrics.record_backpressure();

        let snapshot = metrics.snapshot();
        assert_eq!(snapshot.sessions_active, 1);
        assert_eq!(snapshot.rooms_with_interest, 1);
        assert_eq!(snapshot.interest_events_total, 1);
        assert_eq!(snapshot.messages_dropped_total, 1);
        assert_eq!(snapshot.backpressure_detected, 1);
    }

    #[test]
    fn test_register_twice_fails() {
        let registry = Registry::new();
        let metrics = RealtimeMetrics::new().unwrap();

        metrics.register(&registry).unwrap();
        assert!(metrics.register(&registry).is_err());
        assert!(!registry.gather().is_empty());
    }
}
