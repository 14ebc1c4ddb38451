use crate::error::PoolError;
use crate::task::TaskCancellation;

use tokio::sync::oneshot;

/// A handle to a task submitted to a [`WorkerPool`](crate::WorkerPool).
///
/// Allows for requesting cancellation of the task and awaiting its result.
#[derive(Debug)]
pub struct TaskHandle<R: Send + 'static> {
  pub(crate) task_id: u64,
  pub(crate) cancellation: TaskCancellation,
  pub(crate) result_receiver: Option<oneshot::Receiver<Result<R, PoolError>>>,
}

impl<R: Send + 'static> TaskHandle<R> {
  /// Returns the unique ID of this task.
  pub fn id(&self) -> u64 {
    self.task_id
  }

  /// Checks if cancellation has been requested for this task.
  pub fn is_cancellation_requested(&self) -> bool {
    self.cancellation.is_cancelled()
  }

  /// Requests cancellation with the default reason.
  pub fn cancel(&self) {
    tracing::debug!(task_id = %self.task_id, "TaskHandle: Cancellation requested.");
    self.cancellation.cancel(None);
  }

  /// Requests cancellation, recording `reason` on the task's rejection.
  ///
  /// A running task sees its execution token fire and the outcome becomes
  /// `PoolError::TaskCancelled` once the callback returns. A task still in the
  /// queue is rejected when a worker dequeues it, without ever running.
  pub fn cancel_with_reason(&self, reason: impl Into<String>) {
    let reason = reason.into();
    tracing::debug!(task_id = %self.task_id, %reason, "TaskHandle: Cancellation requested.");
    self.cancellation.cancel(Some(reason));
  }

  /// Awaits the completion of the task and returns its result of type `R`.
  ///
  /// # Errors
  /// Returns `PoolError::TaskCancelled` if the task was cancelled, by its handle,
  /// a pool resize or a forceful shutdown.
  /// Returns `PoolError::TaskPanicked` if the callback panicked.
  /// Returns `PoolError::PoolShuttingDown` if the pool shut down before the task ran.
  /// Returns `PoolError::ResultChannelError` if the task was dropped without being settled.
  /// Returns `PoolError::ResultUnavailable` if the result was already taken.
  pub async fn await_result(&mut self) -> Result<R, PoolError> {
    match self.result_receiver.take() {
      Some(rx) => match rx.await {
        Ok(task_outcome) => task_outcome,
        Err(recv_error) => {
          tracing::warn!(task_id = %self.task_id, "Result channel receive error: {}", recv_error);
          Err(PoolError::ResultChannelError(format!(
            "Task (id: {}) result channel unexpectedly closed: {}",
            self.task_id, recv_error
          )))
        }
      },
      None => Err(PoolError::ResultUnavailable),
    }
  }
}
