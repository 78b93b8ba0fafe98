//! Local socket layer
//!
//! Sessions, topic subscriptions and room membership for this instance.
//! `ConnectionManager` is the `LocalPubSub` the inbound router publishes to
//! and the source of room interest events.

pub mod connection_manager;
pub mod metrics;
pub mod session;

pub use connection_manager::{ConnectionError, ConnectionManager, ConnectionManagerMetrics};
pub use metrics::{RealtimeMetrics, RealtimeMetricsSnapshot};
pub use session::{SESSION_CHANNEL_CAPACITY, Session, SessionError, SessionId, SessionMetrics};
