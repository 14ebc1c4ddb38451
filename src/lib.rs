//! Cooperative task scheduling on Tokio: a FIFO queue whose consumers
//! acknowledge what they take, workers that drain it, and a resizable pool
//! that bounds how many tasks run at once.

mod ack_queue;
mod error;
mod handle;
mod pool;
mod task;
mod worker;

pub use ack_queue::{AckHandle, AckQueue, REVOCATION_TICKS};
pub use error::{AckError, PoolError, QueueError, DEFAULT_CANCEL_REASON, SHUTDOWN_CANCEL_REASON};
pub use handle::TaskHandle;
pub use pool::{ShutdownMode, WorkerPool};
pub use task::{TaskCallback, TaskToExecute};
pub use tokio_util::sync::CancellationToken;
