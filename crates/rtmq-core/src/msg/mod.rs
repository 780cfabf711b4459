//! Message passing between threads
//!
//! - [`asyncmsgq`] - multi-writer message queue with post/send delivery
//! - [`MsgObject`] - targets that messages are dispatched to
//! - [`MemBlock`] / [`MemChunk`] - audio memory carried alongside messages

pub mod asyncmsgq;
mod gc;
mod memblock;
mod object;

pub use asyncmsgq::{
    channel, dispatch, Envelope, Message, MsgReceiver, MsgSender, Reply, MESSAGE_SHUTDOWN,
};
pub use gc::gc_handle;
pub use memblock::{MemBlock, MemBlockRef, MemChunk};
pub use object::{FreeCb, MsgObject, MsgObjectRef, Payload};
