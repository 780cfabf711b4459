//! Message targets
//!
//! Anything that can receive a queued message implements [`MsgObject`]. The
//! target decides what each code means; the queue only carries the tuple.

use std::any::Any;
use std::sync::Arc;

use super::memblock::MemChunk;

/// Opaque per-message data; downcast by the receiving object
pub type Payload = Box<dyn Any + Send>;

/// Runs on the payload when an asynchronous message is released
pub type FreeCb = fn(Payload);

/// Receiver of dispatched messages
pub trait MsgObject: Send + Sync {
    /// Handle `code`; the return value is handed back to a synchronous sender
    fn process_msg(
        &self,
        code: i32,
        userdata: Option<&mut Payload>,
        offset: i64,
        chunk: Option<&MemChunk>,
    ) -> i32;
}

/// Shared handle to a message target
pub type MsgObjectRef = Arc<dyn MsgObject>;
