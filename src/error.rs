use thiserror::Error;

/// Reason attached to a cancellation when the canceller did not supply one.
pub const DEFAULT_CANCEL_REASON: &str = "operation was aborted";

/// Reason attached to in-flight tasks cancelled by a forceful pool shutdown.
pub const SHUTDOWN_CANCEL_REASON: &str = "pool shutting down";

/// Misuse of an [`AckHandle`](crate::AckHandle).
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum AckError {
  #[error("acknowledgment already revoked")]
  Revoked,
}

/// Errors raised by an [`AckQueue`](crate::AckQueue).
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum QueueError {
  #[error("queue is closed")]
  Closed,
}

/// Errors that can occur within the `futures_ackpool` pool.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum PoolError {
  #[error("Task result channel error (worker dropped the task without settling it): {0}")]
  ResultChannelError(String),

  #[error("Task result already taken or channel was not available")]
  ResultUnavailable,

  #[error("Submitted task panicked: {0}")]
  TaskPanicked(String),

  #[error("Task was cancelled: {reason}")]
  TaskCancelled { reason: String },

  #[error("Pool is shutting down or already shut down, cannot accept or run tasks")]
  PoolShuttingDown,
}

impl PoolError {
  pub(crate) fn cancelled(reason: impl Into<String>) -> Self {
    PoolError::TaskCancelled { reason: reason.into() }
  }

  /// Returns `true` for any cancellation rejection, whatever its reason.
  pub fn is_cancelled(&self) -> bool {
    matches!(self, PoolError::TaskCancelled { .. })
  }
}
