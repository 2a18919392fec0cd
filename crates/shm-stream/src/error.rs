//! Error types for shm-stream.

use thiserror::Error;

/// Errors that can occur on shared-memory transports.
#[derive(Error, Debug)]
pub enum ShmError {
    /// Failed to create or open a shared memory object.
    #[error("shared memory error: {0}")]
    Region(String),

    /// Failed to map a region into the address space.
    #[error("memory mapping error: {0}")]
    Mmap(String),

    /// Region does not satisfy the transport's layout requirements.
    #[error("invalid layout: {0}")]
    InvalidLayout(String),

    /// Payload can never fit the ring, even when empty.
    #[error("payload too large: {size} bytes, max {max} bytes")]
    PayloadTooLarge { size: usize, max: usize },

    /// Blocking push exceeded its timeout while the queue stayed full.
    #[error("queue full")]
    QueueFull,

    /// Blocking shift exceeded its timeout while the queue stayed empty.
    #[error("queue empty")]
    QueueEmpty,

    /// IO error.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Result type for shared-memory operations.
pub type ShmResult<T> = Result<T, ShmError>;
