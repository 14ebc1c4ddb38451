use futures_ackpool::{CancellationToken, ShutdownMode, TaskHandle, WorkerPool};
use std::time::Duration;
use tokio::runtime::Handle;
use tracing::info;

async fn interruptible_task(id: usize, duration_ms: u64, token: CancellationToken) -> String {
  info!("Task {} starting ({}ms), watching its cancellation token.", id, duration_ms);
  tokio::select! {
    _ = token.cancelled() => {
      info!("Task {} saw cancellation, unwinding.", id);
      format!("Task {} unwound", id)
    }
    _ = tokio::time::sleep(Duration::from_millis(duration_ms)) => {
      info!("Task {} completed normally.", id);
      format!("Task {} done", id)
    }
  }
}

#[tokio::main]
async fn main() {
  tracing_subscriber::fmt()
    .with_max_level(tracing::Level::DEBUG)
    .with_target(false)
    .init();
  info!("--- Resize and Shutdown Example ---");

  let pool = WorkerPool::<String>::new(3, Handle::current(), "resize_pool");

  let mut handles: Vec<TaskHandle<String>> = Vec::new();
  for i in 0..8 {
    match pool.submit(move |token| interruptible_task(i, 400, token)) {
      Ok(handle) => handles.push(handle),
      Err(e) => tracing::error!("Failed to submit task {}: {:?}", i, e),
    }
  }

  tokio::time::sleep(Duration::from_millis(100)).await;
  info!(
    "Before resize: workers {}, running {}, queued {}",
    pool.size(),
    pool.active_task_count(),
    pool.queued_task_count()
  );

  // Two of the three running tasks are cancelled; queued tasks stay queued.
  pool.resize_with_reason(1, Some("scaling down".to_string())).await;
  info!(
    "After resize: workers {}, running {}, queued {}",
    pool.size(),
    pool.active_task_count(),
    pool.queued_task_count()
  );

  pool.resize(2).await;
  tokio::time::sleep(Duration::from_millis(500)).await;

  info!("Initiating FORCEFUL shutdown.");
  pool.shutdown(ShutdownMode::ForcefulCancel).await;

  for mut handle in handles {
    let task_id = handle.id();
    match handle.await_result().await {
      Ok(result) => info!("Task {}: {}", task_id, result),
      Err(e) => info!("Task {}: {}", task_id, e),
    }
  }
  info!("--- Resize and Shutdown Example End ---");
}
