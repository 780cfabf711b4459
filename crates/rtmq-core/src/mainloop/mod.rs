//! Event loops
//!
//! - [`MainloopApi`] - the interface event sources are written against
//! - [`Mainloop`] - `poll(2)` loop driven by the calling thread
//! - [`ThreadedMainloop`] - the same loop on a dedicated thread, guarded by
//!   a big lock

pub mod api;
mod biglock;
mod poll;
mod threaded;

pub use api::{
    once, DeferCallback, DeferEvent, DestroyCallback, IoCallback, IoEvent, IoEventFlags,
    MainloopApi, TimeCallback, TimeEvent,
};
pub use poll::{Mainloop, PollFunc};
pub use threaded::{Signaller, ThreadedMainloop, DEFAULT_THREAD_NAME};
