//! Resource-gated, priority-ordered operation queue
//!
//! Single-process admission queue for background operations competing for
//! constrained system resources. Five strict-priority FIFO tiers with
//! aging promotion, OS-level CPU/RAM admission gating, lease-bounded
//! serialized execution, exponential-backoff retries with jitter, and a
//! bounded dead letter queue for permanently failed operations.
//!
//! ```no_run
//! use memex_queue::{OperationQueue, Priority, QueueConfig};
//!
//! # async fn example() -> Result<(), memex_queue::QueueError> {
//! let queue = OperationQueue::new(QueueConfig::from_env());
//!
//! let handle = queue.enqueue(
//!     || async { fetch_remote_index().await.map_err(|e| e.to_string()) },
//!     Priority::High,
//! );
//! let index_size: usize = handle.await?;
//!
//! queue.shutdown().await;
//! # Ok(())
//! # }
//! # async fn fetch_remote_index() -> Result<usize, std::io::Error> { Ok(0) }
//! ```
//!
//! Operations are closures producing a fresh future per invocation, so the
//! dispatcher can re-run them on retry. Every failure surfaces through the
//! returned [`OperationHandle`]; enqueueing itself never fails.

pub mod config;
pub mod dead_letter;
pub mod error;
pub mod queue;
pub mod queue_types;
pub mod resource_monitor;

mod lanes;

pub use config::{ConfigSummary, QueueConfig};
pub use dead_letter::DeadLetterEntry;
pub use error::{QueueError, Result};
pub use queue::OperationQueue;
pub use queue_types::{ItemStatus, OperationHandle, Priority, QueueStats, TierCounts};
pub use resource_monitor::{
    RawSample, ResourceMonitor, ResourceSnapshot, SysinfoProbe, SystemProbe,
    IDLE_CPU_CEILING_PERCENT, IDLE_RAM_CEILING_PERCENT,
};
