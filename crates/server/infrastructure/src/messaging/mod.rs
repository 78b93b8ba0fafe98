//! Broker adapters
//!
//! - `amqp`: RabbitMQ through lapin
//! - `in_memory`: in-process broker for dev mode and tests
//! - `consumer_loop`: delivery loop both adapters share

pub mod amqp;
pub mod consumer_loop;
pub mod in_memory;

pub use amqp::AmqpConnector;
pub use consumer_loop::{DeliveryAck, spawn_consumer_loop};
pub use in_memory::{BindingRow, InMemoryBroker, InMemoryStats, topic_matches};
