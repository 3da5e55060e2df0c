//! Storage-specific error types.

use std::time::Duration;

use thiserror::Error;

/// Errors raised by the registry, measurement store and batch writer.
#[derive(Debug, Error)]
pub enum StorageError {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    /// Statement did not complete within the command timeout.
    #[error("storage command timed out after {0:?}")]
    Timeout(Duration),

    /// The writer actor is gone; nothing more can be buffered or flushed.
    #[error("measurement writer is not running")]
    ChannelSend,

    #[error("internal error: {0}")]
    Internal(String),

    /// A stored row could not be mapped back to a domain value.
    #[error("invalid data: {0}")]
    InvalidData(String),
}
