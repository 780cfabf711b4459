//! Stream demo configuration
//!
//! Stored as YAML. Default location: ~/.config/rtmq/stream.yaml

use rtmq_core::config::{default_config_path, QueueConfig};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Root configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StreamConfig {
    /// Sizing of both thread queues
    pub queue: QueueConfig,
    /// Name of the IO thread
    pub io_thread_name: String,
    /// Sample format: signed 16-bit little endian at this rate
    pub sample_rate: u32,
    pub channels: u16,
    /// Bytes per written chunk
    pub chunk_bytes: usize,
    /// Number of chunks written before draining
    pub chunks: usize,
    /// Linear gain applied on the IO thread
    pub volume: f32,
    /// Playback timer period on the IO thread
    pub tick_ms: u64,
    /// How often the control loop reports progress
    pub progress_interval_ms: u64,
    /// Give up waiting for the buffer to drain after this long
    pub drain_timeout_ms: u64,
}

impl StreamConfig {
    pub fn bytes_per_second(&self) -> u64 {
        u64::from(self.sample_rate) * u64::from(self.channels) * 2
    }
}

impl Default for StreamConfig {
    fn default() -> Self {
        Self {
            queue: QueueConfig::default(),
            io_thread_name: "stream-io".to_string(),
            sample_rate: 48_000,
            channels: 2,
            chunk_bytes: 4096,
            chunks: 64,
            volume: 0.8,
            tick_ms: 10,
            progress_interval_ms: 100,
            drain_timeout_ms: 5_000,
        }
    }
}

/// `~/.config/rtmq/stream.yaml`
pub fn default_stream_config_path() -> PathBuf {
    default_config_path("stream.yaml")
}

#[cfg(test)]
mod tests {
    use super::*;
    use rtmq_core::config::{load_config, save_config, OverflowPolicy};

    #[test]
    fn test_default_bytes_per_second() {
        let config = StreamConfig::default();
        assert_eq!(config.bytes_per_second(), 192_000);
    }

    #[test]
    fn test_partial_yaml() {
        let yaml = "chunks: 8\nqueue:\n  capacity: 16\n  overflow_policy: block\n";
        let config: StreamConfig = serde_yaml::from_str(yaml).unwrap();
        assert_eq!(config.chunks, 8);
        assert_eq!(config.queue.capacity, 16);
        assert_eq!(config.queue.overflow_policy, OverflowPolicy::Block);
        assert_eq!(config.io_thread_name, "stream-io");
    }

    #[test]
    fn test_save_and_load() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("stream.yaml");
        let config = StreamConfig {
            volume: 0.5,
            chunks: 3,
            ..StreamConfig::default()
        };

        save_config(&config, &path).unwrap();
        let loaded: StreamConfig = load_config(&path);
        assert_eq!(loaded, config);
    }
}
