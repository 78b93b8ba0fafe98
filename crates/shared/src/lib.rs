pub mod config;
pub mod error;
pub mod event_topics;
pub mod ids;

pub use error::*;
pub use event_topics::*;
pub use ids::*;
