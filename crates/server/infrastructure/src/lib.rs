// Roomcast - Infrastructure Layer
// - messaging: AMQP and in-memory implementations of the broker ports
// - realtime: local sessions, rooms and the LocalPubSub implementation
// - metrics_queue: channel-backed delivery metrics queue

pub mod messaging;
pub mod metrics_queue;
pub mod realtime;

pub use messaging::{AmqpConnector, InMemoryBroker};
pub use metrics_queue::{ChannelMetricsQueue, QueuedJob, spawn_metrics_logger};
pub use realtime::{ConnectionManager, RealtimeMetrics, Session};
