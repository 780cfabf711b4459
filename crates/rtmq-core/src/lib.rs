//! rtmq core - cross-thread messaging for real-time audio threads
//!
//! Bottom-up:
//!
//! - [`sync`] - fd-backed binary semaphore
//! - [`queue`] - lock-free SPSC ring with pollable wakeups
//! - [`msg`] - multi-writer message queue, message targets, memblocks
//! - [`mainloop`] - mainloop API with poll and threaded backends
//! - [`thread_mq`] - queue pair wiring a control loop to an IO thread

pub mod config;
pub mod error;
pub mod mainloop;
pub mod msg;
pub mod queue;
pub mod sync;
pub mod thread_mq;

pub use error::{MqError, MqResult};
pub use thread_mq::{ThreadMq, ThreadMqHandle};
