use crate::error::PoolError;

use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::oneshot;
use tokio_util::sync::CancellationToken;

/// The type of future that the pool executes.
/// It must be `Send` and `'static`, and produce a result of type `R`.
pub type TaskToExecute<R> = Pin<Box<dyn Future<Output = R> + Send + 'static>>;

/// A submitted callback. It receives the execution token, which fires when
/// the task is cancelled or its worker is terminated.
pub type TaskCallback<R> = Box<dyn FnOnce(CancellationToken) -> TaskToExecute<R> + Send + 'static>;

/// Cancellation token of a task plus the reason recorded by whoever fired it.
#[derive(Debug, Clone, Default)]
pub(crate) struct TaskCancellation {
  token: CancellationToken,
  reason: Arc<Mutex<Option<String>>>,
}

impl TaskCancellation {
  pub(crate) fn new() -> Self {
    Self::default()
  }

  /// Fires the token. The first recorded reason wins.
  pub(crate) fn cancel(&self, reason: Option<String>) {
    {
      let mut slot = self.reason.lock();
      if slot.is_none() {
        *slot = reason;
      }
    }
    self.token.cancel();
  }

  pub(crate) fn token(&self) -> &CancellationToken {
    &self.token
  }

  pub(crate) fn is_cancelled(&self) -> bool {
    self.token.is_cancelled()
  }

  pub(crate) fn reason(&self) -> String {
    self
      .reason
      .lock()
      .clone()
      .unwrap_or_else(|| crate::error::DEFAULT_CANCEL_REASON.to_string())
  }
}

/// Internal representation of a task managed by the pool.
///
/// Queued as `Arc<ManagedTask<R>>`; the callback and the result sender are
/// taken out exactly once by the worker whose acknowledgment confirmed it.
pub(crate) struct ManagedTask<R: Send + 'static> {
  pub(crate) task_id: u64,
  callback: Mutex<Option<TaskCallback<R>>>,
  result_sender: Mutex<Option<oneshot::Sender<Result<R, PoolError>>>>,
  pub(crate) cancellation: TaskCancellation,
}

impl<R: Send + 'static> fmt::Debug for ManagedTask<R> {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.debug_struct("ManagedTask")
      .field("task_id", &self.task_id)
      .field("cancelled", &self.cancellation.is_cancelled())
      .finish_non_exhaustive()
  }
}

impl<R: Send + 'static> ManagedTask<R> {
  pub(crate) fn new(
    task_id: u64,
    callback: TaskCallback<R>,
    result_sender: oneshot::Sender<Result<R, PoolError>>,
    cancellation: TaskCancellation,
  ) -> Self {
    Self {
      task_id,
      callback: Mutex::new(Some(callback)),
      result_sender: Mutex::new(Some(result_sender)),
      cancellation,
    }
  }

  pub(crate) fn take_callback(&self) -> Option<TaskCallback<R>> {
    self.callback.lock().take()
  }

  /// Settles the task without running it. The callback is dropped so a worker
  /// that already holds the task finds nothing to execute.
  pub(crate) fn reject(&self, error: PoolError) -> bool {
    drop(self.take_callback());
    self.settle(Err(error))
  }

  /// Delivers the outcome. Returns `false` if the task was already settled or
  /// its handle is gone.
  pub(crate) fn settle(&self, outcome: Result<R, PoolError>) -> bool {
    match self.result_sender.lock().take() {
      Some(tx) => tx.send(outcome).is_ok(),
      None => false,
    }
  }
}
