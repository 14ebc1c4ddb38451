use crate::ack_queue::AckQueue;
use crate::error::{PoolError, QueueError, DEFAULT_CANCEL_REASON};
use crate::task::{ManagedTask, TaskCancellation};

use std::any::Any;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use dashmap::DashMap;
use futures::FutureExt;
use parking_lot::Mutex;
use tokio::runtime::Handle as TokioHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, info_span, trace, warn, Instrument};

/// The queue shared by every worker of a pool.
pub(crate) type TaskQueue<R> = AckQueue<Arc<ManagedTask<R>>>;

/// Everything a worker loop needs from its pool.
pub(crate) struct WorkerContext<R: Send + 'static> {
  pub(crate) pool_name: Arc<String>,
  pub(crate) queue: TaskQueue<R>,
  pub(crate) active_tasks: Arc<DashMap<u64, TaskCancellation>>,
}

impl<R: Send + 'static> Clone for WorkerContext<R> {
  fn clone(&self) -> Self {
    Self {
      pool_name: self.pool_name.clone(),
      queue: self.queue.clone(),
      active_tasks: self.active_tasks.clone(),
    }
  }
}

#[derive(Debug, Default)]
struct WorkerState {
  terminate_token: CancellationToken,
  termination_reason: Mutex<Option<String>>,
  busy: AtomicBool,
  /// Fired once the loop has exited.
  stopped: CancellationToken,
}

impl WorkerState {
  fn termination_reason(&self) -> String {
    self
      .termination_reason
      .lock()
      .clone()
      .unwrap_or_else(|| DEFAULT_CANCEL_REASON.to_string())
  }
}

/// A loop that takes one task at a time from the shared queue and runs it.
///
/// The loop is spawned as soon as the worker is created. A worker is never
/// restarted: once terminated it finishes its current task (with the
/// execution token fired) and exits.
#[derive(Debug)]
pub(crate) struct Worker {
  id: u64,
  state: Arc<WorkerState>,
}

impl Worker {
  pub(crate) fn spawn<R: Send + 'static>(id: u64, ctx: WorkerContext<R>, tokio_handle: &TokioHandle) -> Self {
    let state = Arc::new(WorkerState::default());
    let span = info_span!("pool_worker", pool_name = %*ctx.pool_name, worker_id = id);
    tokio_handle.spawn(run_worker_loop(id, state.clone(), ctx).instrument(span));
    Self { id, state }
  }

  pub(crate) fn id(&self) -> u64 {
    self.id
  }

  pub(crate) fn is_terminated(&self) -> bool {
    self.state.terminate_token.is_cancelled()
  }

  /// `true` from the moment the worker commits to a task until it settles it.
  pub(crate) fn is_busy(&self) -> bool {
    self.state.busy.load(Ordering::SeqCst)
  }

  /// `true` once the loop has exited.
  pub(crate) fn is_stopped(&self) -> bool {
    self.state.stopped.is_cancelled()
  }

  /// Stops the worker from taking further tasks and cancels the one it is
  /// running, if any. The returned future resolves once the loop has exited,
  /// which for a busy worker means after the running callback returned.
  ///
  /// Only the first call records its reason.
  pub(crate) fn terminate(&self, reason: Option<String>) -> impl Future<Output = ()> + Send + 'static {
    if !self.state.terminate_token.is_cancelled() {
      {
        let mut slot = self.state.termination_reason.lock();
        if slot.is_none() {
          *slot = reason;
        }
      }
      debug!(worker_id = self.id, busy = self.is_busy(), "Worker: termination requested.");
      self.state.terminate_token.cancel();
    }
    self.stopped()
  }

  pub(crate) fn stopped(&self) -> impl Future<Output = ()> + Send + 'static {
    let stopped = self.state.stopped.clone();
    async move { stopped.cancelled().await }
  }
}

async fn run_worker_loop<R: Send + 'static>(id: u64, state: Arc<WorkerState>, ctx: WorkerContext<R>) {
  info!("Worker loop started.");

  loop {
    let taken = tokio::select! {
      biased;
      taken = ctx.queue.take_blocking_ack() => taken,
      _ = state.terminate_token.cancelled() => {
        info!("Worker terminated while idle.");
        break;
      }
    };

    let (task, ack) = match taken {
      Ok(taken) => taken,
      Err(QueueError::Closed) => {
        info!("Task queue closed. Worker loop exiting.");
        break;
      }
    };

    // Busy is raised before the termination check so a concurrent terminate()
    // either sees this worker busy or this worker sees the termination.
    state.busy.store(true, Ordering::SeqCst);
    if state.terminate_token.is_cancelled() {
      state.busy.store(false, Ordering::SeqCst);
      trace!(task_id = task.task_id, "Worker terminated while waiting; declining task.");
      let _ = ack.decline();
      break;
    }
    // Blocking handles are never revoked.
    let _ = ack.confirm();
    drop(ack);

    execute_task(&state, &ctx, &task).await;
    state.busy.store(false, Ordering::SeqCst);

    if state.terminate_token.is_cancelled() {
      info!("Worker terminated after settling its task.");
      break;
    }
  }

  state.stopped.cancel();
  debug!(worker_id = id, "Worker loop stopped.");
}

async fn execute_task<R: Send + 'static>(state: &WorkerState, ctx: &WorkerContext<R>, task: &ManagedTask<R>) {
  let task_id = task.task_id;

  if task.cancellation.is_cancelled() {
    let reason = task.cancellation.reason();
    debug!(%task_id, %reason, "Dequeued task already cancelled (task's own token).");
    task.reject(PoolError::cancelled(reason));
    return;
  }

  let Some(callback) = task.take_callback() else {
    debug!(%task_id, "Dequeued task was already settled by the pool; skipping.");
    return;
  };

  ctx.active_tasks.insert(task_id, task.cancellation.clone());
  debug!(%task_id, "Dequeued task. Executing.");

  // Fired by either the task's own token or this worker's termination.
  let execution_token = CancellationToken::new();
  let mut cancel_reason: Option<String> = None;

  let outcome = match std::panic::catch_unwind(AssertUnwindSafe(|| callback(execution_token.clone()))) {
    Err(payload) => Err(PoolError::TaskPanicked(panic_message(payload.as_ref()))),
    Ok(future) => {
      let execution = AssertUnwindSafe(future).catch_unwind();
      tokio::pin!(execution);
      loop {
        tokio::select! {
          biased;
          result = &mut execution => {
            break result.map_err(|payload| PoolError::TaskPanicked(panic_message(payload.as_ref())));
          }
          _ = task.cancellation.token().cancelled(), if cancel_reason.is_none() => {
            let reason = task.cancellation.reason();
            debug!(%task_id, %reason, "Task cancelled by its own token; waiting for callback to unwind.");
            cancel_reason = Some(reason);
            execution_token.cancel();
          }
          _ = state.terminate_token.cancelled(), if cancel_reason.is_none() => {
            let reason = state.termination_reason();
            debug!(%task_id, %reason, "Worker terminated mid-task; waiting for callback to unwind.");
            cancel_reason = Some(reason);
            execution_token.cancel();
          }
        }
      }
    }
  };

  let outcome = match (cancel_reason, outcome) {
    (Some(reason), _) => Err(PoolError::cancelled(reason)),
    (None, Err(PoolError::TaskPanicked(message))) => {
      error!(%task_id, %message, "Task panicked during execution.");
      Err(PoolError::TaskPanicked(message))
    }
    (None, outcome) => {
      trace!(%task_id, "Task executed successfully.");
      outcome
    }
  };

  ctx.active_tasks.remove(&task_id);
  if !task.settle(outcome) {
    warn!(%task_id, "Result receiver for task was dropped. Task outcome may have been lost.");
  }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
  if let Some(message) = payload.downcast_ref::<&str>() {
    (*message).to_string()
  } else if let Some(message) = payload.downcast_ref::<String>() {
    message.clone()
  } else {
    "task panicked with a non-string payload".to_string()
  }
}
