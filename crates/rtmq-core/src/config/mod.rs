//! Configuration shared by rtmq libraries and daemons
//!
//! - Generic YAML load/save
//! - Standard config paths
//! - [`QueueConfig`] for sizing message queues
//!
//! ```ignore
//! use rtmq_core::config::{load_config, default_config_path, QueueConfig};
//!
//! let queue: QueueConfig = load_config(&default_config_path("queue.yaml"));
//! ```

mod io;
mod paths;
mod queue;

pub use io::{load_config, save_config};
pub use paths::{default_config_dir, default_config_path};
pub use queue::{OverflowPolicy, QueueConfig, DEFAULT_LOCALQ_LIMIT, DEFAULT_QUEUE_CAPACITY};
