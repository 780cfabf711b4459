//! Low-level synchronisation primitives
//!
//! - [`FdSem`] - binary semaphore with a pollable descriptor
//! - [`RateLimit`] - log throttling for paths that must not flood stderr

mod fdsem;
mod ratelimit;
pub(crate) mod wakefd;

pub use fdsem::FdSem;
pub use ratelimit::RateLimit;
