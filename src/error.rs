//! Error types for the operation queue
//!
//! Per-item failures are always handled locally by the dispatcher (retried
//! or moved to the dead letter queue); only the caller that submitted a
//! permanently failed operation ever observes an error through its handle.

use thiserror::Error;

/// Result type for queue operations
pub type Result<T> = std::result::Result<T, QueueError>;

/// Errors surfaced through an [`OperationHandle`](crate::OperationHandle)
/// or returned by queue management calls.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum QueueError {
    /// Resource admission wait exceeded the configured maximum.
    /// Retryable: the item is NACKed, not dropped.
    #[error("resource admission timed out after {waited_ms}ms")]
    ResourceTimeout { waited_ms: u64 },

    /// The submitted operation itself failed. Retryable up to max_retries.
    #[error("operation failed: {0}")]
    OperationFailed(String),

    /// An in-flight operation outlived its lease. Retryable.
    #[error("operation lease expired after {lease_ms}ms")]
    LeaseTimeout { lease_ms: u64 },

    /// All retry attempts were exhausted; the item is recorded in the
    /// dead letter queue and this error is delivered to the caller.
    #[error("operation failed permanently after {attempts} attempts (last error: {last_error})")]
    RetryExhausted { attempts: u32, last_error: String },

    /// The queue was cleared by operator action while this item was pending.
    #[error("queue cleared while operation was pending")]
    QueueCleared,

    /// The queue was shut down before the operation could complete.
    #[error("queue shut down")]
    Shutdown,
}

impl QueueError {
    /// Whether the dispatcher may retry an item that failed with this error.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            QueueError::ResourceTimeout { .. }
                | QueueError::OperationFailed(_)
                | QueueError::LeaseTimeout { .. }
        )
    }
}
