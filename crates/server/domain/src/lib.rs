// Roomcast - Domain Layer
// - routing: sharding hash, routing keys and queue names
// - envelope: broker and local wire payloads
// - broker: ports implemented by the broker adapters
// - interest: zero-crossing interest events from the socket layer
// - local_pubsub / delivery_metrics: collaborator ports

pub mod broker;
pub mod delivery_metrics;
pub mod envelope;
pub mod interest;
pub mod local_pubsub;
pub mod routing;

pub use broker::*;
pub use delivery_metrics::*;
pub use envelope::*;
pub use interest::*;
pub use local_pubsub::*;
pub use routing::*;
