use crate::error::{PoolError, SHUTDOWN_CANCEL_REASON};
use crate::handle::TaskHandle;
use crate::task::{ManagedTask, TaskCallback, TaskCancellation, TaskToExecute};
use crate::worker::{TaskQueue, Worker, WorkerContext};

use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering as AtomicOrdering};
use std::sync::Arc;

use dashmap::DashMap;
use futures::future::{join_all, BoxFuture};
use futures::FutureExt;
use parking_lot::Mutex;
use tokio::runtime::Handle as TokioHandle;
use tokio::sync::oneshot;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};

lazy_static::lazy_static! {
  static ref NEXT_POOL_TASK_ID_COUNTER: AtomicU64 = AtomicU64::new(0);
}

/// Defines how the pool should behave upon shutdown.
///
/// In both modes tasks still waiting in the queue are rejected with
/// [`PoolError::PoolShuttingDown`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShutdownMode {
  /// Waits for currently executing tasks to complete.
  Graceful,
  /// Cancels currently executing tasks and waits for their callbacks to return.
  ForcefulCancel,
}

/// A resizable set of workers draining one shared FIFO task queue.
///
/// At most [`size`](Self::size) submitted callbacks run at once; the rest wait
/// in submission order.
pub struct WorkerPool<R: Send + 'static> {
  pool_name: Arc<String>,
  tokio_handle: TokioHandle,
  queue: TaskQueue<R>,
  workers: Arc<Mutex<Vec<Worker>>>,
  next_worker_id: AtomicU64,
  active_tasks: Arc<DashMap<u64, TaskCancellation>>,
  shutdown_token: CancellationToken,
}

impl<R: Send + 'static> std::fmt::Debug for WorkerPool<R> {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    f.debug_struct("WorkerPool")
      .field("pool_name", &self.pool_name)
      .field("size", &self.size())
      .field("queued", &self.queue.len())
      .field("active", &self.active_tasks.len())
      .field("shut_down", &self.shutdown_token.is_cancelled())
      .finish_non_exhaustive()
  }
}

impl<R: Send + 'static> WorkerPool<R> {
  pub fn new(size: usize, tokio_handle: TokioHandle, pool_name: &str) -> Arc<Self> {
    let pool = Arc::new(Self {
      pool_name: Arc::new(pool_name.to_string()),
      tokio_handle,
      queue: TaskQueue::new(),
      workers: Arc::new(Mutex::new(Vec::new())),
      next_worker_id: AtomicU64::new(0),
      active_tasks: Arc::new(DashMap::new()),
      shutdown_token: CancellationToken::new(),
    });
    info!(pool_name = %pool.pool_name, size, "Worker pool created.");
    // A fresh pool has no workers to wait for.
    let _ = pool.apply_resize(size, None);
    pool
  }

  pub fn name(&self) -> &str {
    &self.pool_name
  }

  /// Number of workers that have not been terminated.
  pub fn size(&self) -> usize {
    self.workers.lock().iter().filter(|worker| !worker.is_terminated()).count()
  }

  /// Number of callbacks currently executing.
  pub fn active_task_count(&self) -> usize {
    self.active_tasks.len()
  }

  /// Returns the current number of tasks waiting to be picked up.
  pub fn queued_task_count(&self) -> usize {
    self.queue.len()
  }

  /// Queues `callback` for execution and returns a handle to its result.
  ///
  /// The callback receives a [`CancellationToken`] that fires when the task is
  /// cancelled through its handle, or when the worker running it is removed by
  /// [`resize`](Self::resize) or a forceful [`shutdown`](Self::shutdown).
  pub fn submit<F, Fut>(&self, callback: F) -> Result<TaskHandle<R>, PoolError>
  where
    F: FnOnce(CancellationToken) -> Fut + Send + 'static,
    Fut: Future<Output = R> + Send + 'static,
  {
    if self.shutdown_token.is_cancelled() || self.queue.is_closed() {
      warn!(pool_name = %self.pool_name, "Submit: Attempted to submit task to a pool that is shutting down or closed.");
      return Err(PoolError::PoolShuttingDown);
    }

    let task_id = NEXT_POOL_TASK_ID_COUNTER.fetch_add(1, AtomicOrdering::Relaxed);
    let cancellation = TaskCancellation::new();
    let (result_tx, result_rx) = oneshot::channel::<Result<R, PoolError>>();
    let callback: TaskCallback<R> = Box::new(move |token| -> TaskToExecute<R> { Box::pin(callback(token)) });

    let task = ManagedTask::new(task_id, callback, result_tx, cancellation.clone());
    if self.queue.add(Arc::new(task)).is_err() {
      warn!(pool_name = %self.pool_name, %task_id, "Submit: Task queue closed concurrently with submission.");
      return Err(PoolError::PoolShuttingDown);
    }
    debug!(pool_name = %self.pool_name, %task_id, queued = self.queue.len(), "Submitted task to queue.");

    Ok(TaskHandle {
      task_id,
      cancellation,
      result_receiver: Some(result_rx),
    })
  }

  /// Changes the number of workers to `new_size`.
  ///
  /// Excess workers are terminated; a worker removed while running a task
  /// cancels it with the default reason. Queued tasks are never dropped. The
  /// returned future resolves once every removed busy worker has settled its
  /// task; the worker changes themselves take effect before this returns.
  pub fn resize(&self, new_size: usize) -> impl Future<Output = ()> + Send + 'static {
    self.resize_with_reason(new_size, None)
  }

  /// Like [`resize`](Self::resize), rejecting cancelled in-flight tasks with `reason`.
  pub fn resize_with_reason(
    &self,
    new_size: usize,
    reason: Option<String>,
  ) -> impl Future<Output = ()> + Send + 'static {
    let pending = self.apply_resize(new_size, reason);
    let workers = self.workers.clone();
    let pool_name = self.pool_name.clone();
    async move {
      if pending.is_empty() {
        return;
      }
      let waiting = pending.len();
      join_all(pending).await;
      prune_workers(&mut workers.lock());
      debug!(pool_name = %pool_name, waiting, "Resize: removed busy workers have settled.");
    }
  }

  fn apply_resize(&self, new_size: usize, reason: Option<String>) -> Vec<BoxFuture<'static, ()>> {
    if self.shutdown_token.is_cancelled() {
      warn!(pool_name = %self.pool_name, new_size, "Resize: Ignored, pool is shutting down.");
      return Vec::new();
    }

    let mut workers = self.workers.lock();
    let mut live = 0usize;
    let mut pending = Vec::new();
    let mut terminated = 0usize;

    // Mark first, compact after, so indices stay stable while walking.
    for worker in workers.iter() {
      if worker.is_terminated() {
        continue;
      }
      if live < new_size {
        live += 1;
        continue;
      }
      let stopped = worker.terminate(reason.clone());
      terminated += 1;
      if worker.is_busy() {
        trace!(pool_name = %self.pool_name, worker_id = worker.id(), "Resize: terminated busy worker.");
        pending.push(stopped.boxed());
      } else {
        trace!(pool_name = %self.pool_name, worker_id = worker.id(), "Resize: terminated idle worker.");
      }
    }
    prune_workers(&mut workers);

    let spawned = new_size.saturating_sub(live);
    for _ in 0..spawned {
      let worker_id = self.next_worker_id.fetch_add(1, AtomicOrdering::Relaxed);
      let ctx = WorkerContext {
        pool_name: self.pool_name.clone(),
        queue: self.queue.clone(),
        active_tasks: self.active_tasks.clone(),
      };
      workers.push(Worker::spawn(worker_id, ctx, &self.tokio_handle));
    }

    info!(
      pool_name = %self.pool_name,
      new_size,
      spawned,
      terminated,
      awaiting = pending.len(),
      "Pool resized."
    );
    pending
  }

  /// Stops the pool. Subsequent submits fail with [`PoolError::PoolShuttingDown`]
  /// and every task still queued is rejected with it. Resolves once all
  /// workers have exited. Calling it again only waits.
  pub async fn shutdown(&self, mode: ShutdownMode) {
    let already_initiating_shutdown = self.shutdown_token.is_cancelled();

    if !already_initiating_shutdown {
      info!(pool_name = %self.pool_name, "Initiating explicit pool shutdown (mode: {:?}).", mode);
      self.begin_shutdown();
    } else {
      info!(pool_name = %self.pool_name, "Shutdown already in progress or initiated by another call/Drop.");
    }

    let stopping: Vec<BoxFuture<'static, ()>> = {
      let workers = self.workers.lock();
      workers
        .iter()
        .map(|worker| match mode {
          ShutdownMode::Graceful => worker.stopped().boxed(),
          ShutdownMode::ForcefulCancel => worker.terminate(Some(SHUTDOWN_CANCEL_REASON.to_string())).boxed(),
        })
        .collect()
    };
    if mode == ShutdownMode::Graceful {
      info!(pool_name = %self.pool_name, "Graceful shutdown: Allowing active tasks to complete.");
    } else {
      info!(pool_name = %self.pool_name, active = self.active_tasks.len(), "Forceful shutdown: Cancelling all active tasks.");
    }

    join_all(stopping).await;
    self.workers.lock().clear();

    if !already_initiating_shutdown {
      info!(pool_name = %self.pool_name, "Pool shutdown process completed by this call.");
    }
  }

  /// Closes the queue and rejects everything still in it.
  fn begin_shutdown(&self) {
    self.shutdown_token.cancel();
    self.queue.close();
    let rejected = self.queue.drain();
    let count = rejected.len();
    for task in rejected {
      task.reject(PoolError::PoolShuttingDown);
    }
    info!(pool_name = %self.pool_name, rejected = count, "Task queue closed; queued tasks rejected.");
  }
}

/// Drops terminated workers unless they are still settling a task.
fn prune_workers(workers: &mut Vec<Worker>) {
  workers.retain(|worker| !worker.is_terminated() || (worker.is_busy() && !worker.is_stopped()));
}

/// Dropping an unshut pool closes the queue and rejects what is still queued.
/// Running tasks are not cancelled; their workers exit once they settle.
impl<R: Send + 'static> Drop for WorkerPool<R> {
  fn drop(&mut self) {
    if !self.shutdown_token.is_cancelled() {
      info!(
        pool_name = %*self.pool_name,
        "WorkerPool instance dropped. Initiating implicit shutdown (closing queue, rejecting queued tasks)."
      );
      // Workers see the closed queue and exit after their current task.
      self.begin_shutdown();
    } else {
      trace!(
        pool_name = %*self.pool_name,
        "Drop: Shutdown already in progress or completed. No new signals sent."
      );
    }
  }
}
