//! Local interest transitions.
//!
//! The local socket layer emits one event each time the number of local
//! subscribers to a room crosses zero. The binding controller is the only
//! consumer.

use roomcast_shared::event_topics::interest_events::{SUBSCRIPTION_CREATE, SUBSCRIPTION_DELETE};
use tokio::sync::mpsc;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InterestEvent {
    /// First local subscriber for `topic`
    Created { topic: String },
    /// Last local subscriber for `topic` left
    Deleted { topic: String },
}

impl InterestEvent {
    pub fn created(topic: impl Into<String>) -> Self {
        Self::Created {
            topic: topic.into(),
        }
    }

    pub fn deleted(topic: impl Into<String>) -> Self {
        Self::Deleted {
            topic: topic.into(),
        }
    }

    /// Builds an event from its bus name; unknown names yield `None`
    pub fn from_named(name: &str, topic: impl Into<String>) -> Option<Self> {
        match name {
            SUBSCRIPTION_CREATE => Some(Self::created(topic)),
            SUBSCRIPTION_DELETE => Some(Self::deleted(topic)),
            _ => None,
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            Self::Created { .. } => SUBSCRIPTION_CREATE,
            Self::Deleted { .. } => SUBSCRIPTION_DELETE,
        }
    }

    pub fn topic(&self) -> &str {
        match self {
            Self::Created { topic } | Self::Deleted { topic } => topic,
        }
    }
}

/// Unbounded so that emitting never blocks a subscribe call
pub type InterestSender = mpsc::UnboundedSender<InterestEvent>;
pub type InterestReceiver = mpsc::UnboundedReceiver<InterestEvent>;

pub fn interest_channel() -> (InterestSender, InterestReceiver) {
    mpsc::unbounded_channel()
}
