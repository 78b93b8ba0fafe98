//! Centralized topic and routing constants
//!
//! Single source of truth for every string that crosses an instance
//! boundary or a layer boundary, so publishers and consumers never drift.
//!
//! ## Naming Convention
//! - Room id: `{appPid}:{room}` (split on the first `:` only)
//! - Routing key: `$$:{appPid}:{shardIndex}`
//! - Shard queue: `{instanceId}-queue-{shardIndex}`
//! - Room-wide listener topic: `{nspRoomId}:$:subscribe:all`
//!
//! ## Usage
//! ```rust
//! use roomcast_shared::event_topics::{subscribe_all_topic, ROUTING_KEY_PREFIX};
//!
//! assert_eq!(ROUTING_KEY_PREFIX, "$$");
//! assert_eq!(subscribe_all_topic("app1:chat", None), "app1:chat:$:subscribe:all");
//! ```

/// Separator between `appPid` and the room namespace inside an nspRoomId
pub const ROOM_ID_DELIMITER: char = ':';

/// Fixed two-character prefix of every broker routing key
pub const ROUTING_KEY_PREFIX: &str = "$$";

/// Default name of the topic exchange that carries room traffic
pub const DEFAULT_ROOMS_EXCHANGE: &str = "ds-rooms";

/// Default name of the exchange used by the history subsystem.
///
/// The fan-out engine never publishes here; it is configured so both names are
/// owned by one place.
pub const DEFAULT_PERSISTENCE_EXCHANGE: &str = "ds-persistence";

/// Suffix appended to a room id to build its room-wide listener topic
pub const SUBSCRIBE_ALL_SUFFIX: &str = "$:subscribe:all";

/// Interest transition events emitted by the local socket layer
pub mod interest_events {
    /// Local subscriber count for a room went from zero to non-zero
    pub const SUBSCRIPTION_CREATE: &str = "subscription:create";
    /// Local subscriber count for a room went back to zero
    pub const SUBSCRIPTION_DELETE: &str = "subscription:delete";
}

/// Queue name for one shard owned by one instance
pub fn shard_queue_name(instance_id: &str, shard_index: u32) -> String {
    format!("{}-queue-{}", instance_id, shard_index)
}

/// Room-wide listener topic, prefixed by the service name when present
pub fn subscribe_all_topic(nsp_room_id: &str, service: Option<&str>) -> String {
    match service {
        Some(service) if !service.is_empty() => {
            format!("{}:{}:{}", service, nsp_room_id, SUBSCRIBE_ALL_SUFFIX)
        }
        _ => format!("{}:{}", nsp_room_id, SUBSCRIBE_ALL_SUFFIX),
    }
}

/// Splits `appPid:room:...` into `(appPid, "room:...")`.
///
/// Returns `None` when the delimiter is missing or either side is empty.
pub fn split_room_id(nsp_room_id: &str) -> Option<(&str, &str)> {
    let (app_pid, namespace) = nsp_room_id.split_once(ROOM_ID_DELIMITER)?;
    if app_pid.is_empty() || namespace.is_empty() {
        return None;
    }
    Some((app_pid, namespace))
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[test]
    fn test_shard_queue_name() {
        assert_eq!(shard_queue_name("node-a", 3), "node-a-queue-3");
    }

    #[rstest]
    #[case("app1:chat", None, "app1:chat:$:subscribe:all")]
    #[case("app1:chat", Some(""), "app1:chat:$:subscribe:all")]
    #[case("app1:chat", Some("presence"), "presence:app1:chat:$:subscribe:all")]
    fn test_subscribe_all_topic(
        #[case] room: &str,
        #[case] service: Option<&str>,
        #[case] expected: &str,
    ) {
        assert_eq!(subscribe_all_topic(room, service), expected);
    }

    #[rstest]
    #[case("app1:chat", Some(("app1", "chat")))]
    #[case("appPid:nsp:123:456", Some(("appPid", "nsp:123:456")))]
    #[case("app1", None)]
    #[case(":chat", None)]
    #[case("app1:", None)]
    fn test_split_room_id(#[case] input: &str, #[case] expected: Option<(&str, &str)>) {
        assert_eq!(split_room_id(input), expected);
    }

    #[test]
    fn test_interest_event_names_are_distinct() {
        assert_ne!(
            interest_events::SUBSCRIPTION_CREATE,
            interest_events::SUBSCRIPTION_DELETE
        );
    }
}
