//! Room sharding and routing keys.
//!
//! Every instance and every peer must agree on `shard_index` bit for bit: a
//! mismatch means a publisher routes to a key no consumer is bound to.

use roomcast_shared::event_topics::{ROUTING_KEY_PREFIX, shard_queue_name, split_room_id};
use roomcast_shared::{InstanceId, SharedError};
use std::fmt;

/// 32-bit signed rolling hash (`h = h * 31 + c`, wrapping) over UTF-16 code units.
pub fn shard_hash(value: &str) -> i32 {
    value.encode_utf16().fold(0i32, |hash, unit| {
        (hash << 5).wrapping_sub(hash).wrapping_add(i32::from(unit))
    })
}

/// Maps a string into `[0, queue_count)`, normalizing negative remainders.
///
/// `queue_count` must be in `1..=i32::MAX`; configuration validation enforces it.
pub fn shard_index(value: &str, queue_count: u32) -> u32 {
    let count = queue_count as i32;
    let remainder = shard_hash(value) % count;
    ((remainder + count) % count) as u32
}

/// Broker routing key `"$$:{appPid}:{shardIndex}"`
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct RoutingKey {
    app_pid: String,
    shard_index: u32,
    rendered: String,
}

impl RoutingKey {
    pub fn new(app_pid: impl Into<String>, shard_index: u32) -> Self {
        let app_pid = app_pid.into();
        let rendered = format!("{}:{}:{}", ROUTING_KEY_PREFIX, app_pid, shard_index);
        Self {
            app_pid,
            shard_index,
            rendered,
        }
    }

    pub fn app_pid(&self) -> &str {
        &self.app_pid
    }

    pub fn shard_index(&self) -> u32 {
        self.shard_index
    }

    pub fn as_str(&self) -> &str {
        &self.rendered
    }
}

impl fmt::Display for RoutingKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.rendered)
    }
}

/// Shard layout of one instance: how many queues, and whose.
#[derive(Debug, Clone)]
pub struct ShardRouter {
    instance_id: InstanceId,
    queue_count: u32,
}

impl ShardRouter {
    pub fn new(instance_id: InstanceId, queue_count: u32) -> Self {
        assert!(
            queue_count > 0 && queue_count <= i32::MAX as u32,
            "queue_count must be in 1..=i32::MAX"
        );
        Self {
            instance_id,
            queue_count,
        }
    }

    pub fn instance_id(&self) -> &InstanceId {
        &self.instance_id
    }

    pub fn queue_count(&self) -> u32 {
        self.queue_count
    }

    /// Routing key for a room id of the form `appPid:namespace`.
    ///
    /// Only the part after the first delimiter is hashed, so every room of an
    /// app lands in one of that app's `queue_count` keys.
    pub fn routing_key(&self, nsp_room_id: &str) -> Result<RoutingKey, SharedError> {
        let (app_pid, namespace) =
            split_room_id(nsp_room_id).ok_or_else(|| SharedError::InvalidRoomId {
                nsp_room_id: nsp_room_id.to_string(),
            })?;
        Ok(RoutingKey::new(
            app_pid,
            shard_index(namespace, self.queue_count),
        ))
    }

    /// Name of this instance's queue for a shard
    pub fn queue_name(&self, shard_index: u32) -> String {
        shard_queue_name(self.instance_id.as_str(), shard_index)
    }

    /// Queue that owns a routing key on this instance
    pub fn queue_for(&self, key: &RoutingKey) -> String {
        self.queue_name(key.shard_index())
    }

    /// All queue names owned by this instance, in shard order
    pub fn queue_names(&self) -> Vec<String> {
        (0..self.queue_count).map(|i| self.queue_name(i)).collect()
    }
}
