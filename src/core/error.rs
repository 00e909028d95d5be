//! Error types for the isoterra streaming core

use std::time::Duration;

use thiserror::Error;

use crate::voxel::chunk::ChunkCoord;

/// Main error type for the streaming core
#[derive(Debug, Error)]
pub enum Error {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// A chunk buffer was touched while a worker still owned it.
    #[error("concurrency hazard on chunk {coord:?}: {operation} while buffers are lent to a worker")]
    ConcurrencyHazard {
        coord: ChunkCoord,
        operation: &'static str,
    },

    #[error("corrupt chunk record for {coord:?}: {reason}")]
    CorruptRecord { coord: ChunkCoord, reason: String },

    #[error("{kind} worker for chunk {coord:?} exceeded {elapsed:?}")]
    WorkerTimeout {
        coord: ChunkCoord,
        kind: &'static str,
        elapsed: Duration,
    },

    #[error("{kind} worker for chunk {coord:?} panicked: {message}")]
    WorkerPanic {
        coord: ChunkCoord,
        kind: &'static str,
        message: String,
    },

    #[error("Persistence error: {0}")]
    Persistence(String),

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("World not found: {0}")]
    WorldNotFound(String),
}
