//! Lock-free queues
//!
//! - [`asyncq`] - SPSC ring with fd wakeups and a local overflow list
//! - [`Pool`] - allocation recycling for queue items

pub mod asyncq;
mod pool;

pub use asyncq::{Consumer, Producer};
pub use pool::Pool;
