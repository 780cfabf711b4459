//! Error types for the messaging core
//!
//! Only recoverable conditions are represented here. Contract violations
//! (double dispatch, unbalanced poll hooks, calling thread-confined
//! operations from the wrong thread) panic, and I/O failures on a wake
//! primitive abort the process.

use thiserror::Error;

/// Errors surfaced by queues and mainloops
#[derive(Debug, Error)]
pub enum MqError {
    /// Creating a wake primitive, polling, or spawning failed at the OS level
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Ring sizes must be powers of two
    #[error("Queue capacity {0} is not a power of two")]
    InvalidCapacity(usize),

    /// The ring was full and the local overflow list reached its limit
    #[error("Queue overrun: ring and local overflow list are full")]
    QueueOverrun,

    /// The receiving side went away before completing a synchronous send
    #[error("Message queue receiver disconnected")]
    Disconnected,

    /// The mainloop was asked to quit; carries the exit value passed to `quit()`
    #[error("Mainloop quit with retval {0}")]
    Quit(i32),

    /// A helper thread could not be started
    #[error("Failed to spawn thread '{name}': {reason}")]
    ThreadSpawn { name: String, reason: String },
}

/// Result type for messaging operations
pub type MqResult<T> = Result<T, MqError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = MqError::InvalidCapacity(6);
        assert!(err.to_string().contains('6'));

        let err = MqError::ThreadSpawn {
            name: "io-thread".to_string(),
            reason: "out of memory".to_string(),
        };
        assert!(err.to_string().contains("io-thread"));
        assert!(err.to_string().contains("out of memory"));
    }

    #[test]
    fn test_io_error_conversion() {
        let io = std::io::Error::from(std::io::ErrorKind::WouldBlock);
        let err: MqError = io.into();
        assert!(matches!(err, MqError::Io(_)));
    }
}
