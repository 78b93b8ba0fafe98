// Roomcast - Application Layer
// Services of the fan-out engine, wired together by `engine`

pub mod binding;
pub mod connection;
pub mod consumers;
pub mod dispatcher;
pub mod engine;
pub mod error;
pub mod publisher;
pub mod router;

#[cfg(test)]
mod test_support;

pub use binding::{BindingController, BindingStats};
pub use connection::{BrokerConnectionManager, BrokerConnectionRegistry};
pub use consumers::ShardConsumerPool;
pub use dispatcher::{Dispatcher, RoomDispatch};
pub use engine::FanoutEngine;
pub use error::{DispatchError, RouterError};
pub use publisher::AdministrativePublisher;
pub use router::{InboundMessageRouter, RouterStats};
