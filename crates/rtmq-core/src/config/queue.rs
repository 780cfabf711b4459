//! Queue sizing and overflow configuration

use serde::{Deserialize, Serialize};

/// Ring size used when a capacity of 0 is requested
pub const DEFAULT_QUEUE_CAPACITY: usize = 256;

/// Default cap on items parked in a writer's local overflow list
pub const DEFAULT_LOCALQ_LIMIT: usize = 4096;

/// What `post()` does once the local overflow list is at its limit
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OverflowPolicy {
    /// Hand the item back to the caller. Never blocks, so safe on RT threads.
    #[default]
    Reject,
    /// Fall back to a blocking push until the reader frees a slot
    Block,
}

/// Configuration for one message queue
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct QueueConfig {
    /// Ring capacity; must be a power of two, 0 selects the default
    pub capacity: usize,
    /// Maximum number of items held in the writer's overflow list
    pub localq_limit: usize,
    /// Behaviour once `localq_limit` is reached
    pub overflow_policy: OverflowPolicy,
    /// Recycled message envelopes kept per queue
    pub item_pool_size: usize,
}

impl QueueConfig {
    /// Ring capacity after applying the default for 0
    pub fn effective_capacity(&self) -> usize {
        if self.capacity == 0 {
            DEFAULT_QUEUE_CAPACITY
        } else {
            self.capacity
        }
    }

    /// Small queue used by tests and handshakes
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            capacity,
            ..Self::default()
        }
    }
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            capacity: DEFAULT_QUEUE_CAPACITY,
            localq_limit: DEFAULT_LOCALQ_LIMIT,
            overflow_policy: OverflowPolicy::Reject,
            item_pool_size: DEFAULT_QUEUE_CAPACITY,
        }
    }
}
