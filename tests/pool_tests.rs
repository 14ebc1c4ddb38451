use futures_ackpool::{PoolError, ShutdownMode, WorkerPool, SHUTDOWN_CANCEL_REASON};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::runtime::Handle;
use tokio::time::{sleep, timeout};
use tokio_util::sync::CancellationToken;

// Helper to initialize tracing for tests (call once per test run, not per test function)
fn setup_tracing_for_test() {
  use std::sync::Once;
  use tracing_subscriber::{fmt, EnvFilter};
  static TRACING_INIT: Once = Once::new();

  TRACING_INIT.call_once(|| {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info,futures_ackpool=trace"));

    fmt::Subscriber::builder()
      .with_env_filter(filter)
      .with_test_writer()
      .try_init()
      .ok();
  });
}

#[tokio::test]
async fn test_submit_and_await_basic_task() {
  setup_tracing_for_test();
  let pool = WorkerPool::<String>::new(2, Handle::current(), "test_pool_basic_submit");
  assert_eq!(pool.size(), 2);
  assert_eq!(pool.name(), "test_pool_basic_submit");

  let mut handle = pool
    .submit(|_| async move {
      sleep(Duration::from_millis(20)).await;
      "task1_done".to_string()
    })
    .unwrap();

  assert_eq!(handle.await_result().await, Ok("task1_done".to_string()));
  assert_eq!(handle.await_result().await, Err(PoolError::ResultUnavailable));

  pool.shutdown(ShutdownMode::Graceful).await;
}

#[tokio::test]
async fn test_single_worker_runs_second_task_after_first_settles() {
  setup_tracing_for_test();
  let pool = WorkerPool::<u32>::new(1, Handle::current(), "test_pool_a_then_b");
  let invocations = Arc::new(parking_lot::Mutex::new(Vec::new()));
  let a_settled = Arc::new(AtomicBool::new(false));

  let mut a = {
    let invocations = invocations.clone();
    let a_settled = a_settled.clone();
    pool
      .submit(move |_| async move {
        invocations.lock().push(("A", false));
        sleep(Duration::from_millis(30)).await;
        a_settled.store(true, Ordering::SeqCst);
        111
      })
      .unwrap()
  };
  let mut b = {
    let invocations = invocations.clone();
    let a_settled = a_settled.clone();
    pool
      .submit(move |_| async move {
        invocations.lock().push(("B", a_settled.load(Ordering::SeqCst)));
        222
      })
      .unwrap()
  };

  assert_eq!(a.await_result().await, Ok(111));
  assert_eq!(b.await_result().await, Ok(222));
  assert_eq!(*invocations.lock(), vec![("A", false), ("B", true)]);

  pool.shutdown(ShutdownMode::Graceful).await;
}

#[tokio::test]
async fn test_concurrency_limit_and_queuing() {
  setup_tracing_for_test();
  let pool = WorkerPool::<usize>::new(2, Handle::current(), "test_pool_concurrency_queue");
  let running = Arc::new(AtomicUsize::new(0));
  let peak = Arc::new(AtomicUsize::new(0));
  let start_order = Arc::new(parking_lot::Mutex::new(Vec::new()));

  let mut handles = Vec::new();
  for i in 0..6 {
    let running = running.clone();
    let peak = peak.clone();
    let start_order = start_order.clone();
    handles.push(
      pool
        .submit(move |_| async move {
          start_order.lock().push(i);
          let now = running.fetch_add(1, Ordering::SeqCst) + 1;
          peak.fetch_max(now, Ordering::SeqCst);
          sleep(Duration::from_millis(20)).await;
          running.fetch_sub(1, Ordering::SeqCst);
          i
        })
        .unwrap(),
    );
  }

  sleep(Duration::from_millis(5)).await;
  assert_eq!(pool.active_task_count(), 2);
  assert_eq!(pool.queued_task_count(), 4);

  for (i, mut handle) in handles.into_iter().enumerate() {
    assert_eq!(handle.await_result().await, Ok(i));
  }

  assert_eq!(peak.load(Ordering::SeqCst), 2, "never more callbacks than workers");
  assert_eq!(*start_order.lock(), vec![0, 1, 2, 3, 4, 5], "tasks start in submission order");
  assert_eq!(pool.active_task_count(), 0);
  assert_eq!(pool.queued_task_count(), 0);

  pool.shutdown(ShutdownMode::Graceful).await;
}

#[tokio::test]
async fn test_resize_down_cancels_claimed_tasks_and_keeps_queued_ones() {
  setup_tracing_for_test();
  let pool = WorkerPool::<&'static str>::new(3, Handle::current(), "test_pool_resize_down");
  let release = CancellationToken::new();

  let mut in_flight = Vec::new();
  for _ in 0..3 {
    let release = release.clone();
    in_flight.push(
      pool
        .submit(move |token| async move {
          tokio::select! {
            _ = token.cancelled() => "observed cancellation",
            _ = release.cancelled() => "released",
          }
        })
        .unwrap(),
    );
  }
  let mut queued: Vec<_> = ["q1", "q2"]
    .into_iter()
    .map(|name| pool.submit(move |_| async move { name }).unwrap())
    .collect();

  sleep(Duration::from_millis(10)).await;
  assert_eq!(pool.active_task_count(), 3);
  assert_eq!(pool.queued_task_count(), 2);

  let resized = pool.resize_with_reason(1, Some("scale down".to_string()));
  assert_eq!(pool.size(), 1, "size drops as soon as resize is called");
  timeout(Duration::from_millis(200), resized)
    .await
    .expect("removed workers must settle promptly");
  assert_eq!(pool.queued_task_count(), 2, "resizing down never drops queued tasks");

  release.cancel();

  let mut cancelled = 0;
  let mut released = 0;
  for mut handle in in_flight {
    match handle.await_result().await {
      Err(PoolError::TaskCancelled { reason }) => {
        assert_eq!(reason, "scale down");
        cancelled += 1;
      }
      Ok("released") => released += 1,
      other => panic!("unexpected in-flight outcome: {:?}", other),
    }
  }
  assert_eq!((cancelled, released), (2, 1));

  assert_eq!(queued[0].await_result().await, Ok("q1"));
  assert_eq!(queued[1].await_result().await, Ok("q2"));

  pool.shutdown(ShutdownMode::Graceful).await;
}

#[tokio::test]
async fn test_resize_down_without_reason_uses_default() {
  setup_tracing_for_test();
  let pool = WorkerPool::<u32>::new(1, Handle::current(), "test_pool_resize_default_reason");

  let mut handle = pool
    .submit(|token| async move {
      token.cancelled().await;
      0
    })
    .unwrap();
  sleep(Duration::from_millis(10)).await;

  pool.resize(0).await;
  assert_eq!(
    handle.await_result().await,
    Err(PoolError::TaskCancelled {
      reason: "operation was aborted".to_string()
    })
  );
}

#[tokio::test]
async fn test_resize_is_idempotent() {
  setup_tracing_for_test();
  let pool = WorkerPool::<u32>::new(2, Handle::current(), "test_pool_resize_idempotent");

  pool.resize(4).await;
  pool.resize(4).await;
  assert_eq!(pool.size(), 4);

  pool.resize(1).await;
  pool.resize(1).await;
  assert_eq!(pool.size(), 1);

  let mut handle = pool.submit(|_| async move { 5 }).unwrap();
  assert_eq!(handle.await_result().await, Ok(5));

  pool.shutdown(ShutdownMode::Graceful).await;
}

#[tokio::test]
async fn test_zero_workers_queue_until_resized_up() {
  setup_tracing_for_test();
  let pool = WorkerPool::<u32>::new(1, Handle::current(), "test_pool_zero_workers");
  pool.resize(0).await;
  assert_eq!(pool.size(), 0);

  let mut handle = pool.submit(|_| async move { 9 }).unwrap();
  sleep(Duration::from_millis(20)).await;
  assert_eq!(pool.queued_task_count(), 1);

  pool.resize(1).await;
  assert_eq!(handle.await_result().await, Ok(9));

  pool.shutdown(ShutdownMode::Graceful).await;
}

#[tokio::test]
async fn test_task_panics_are_handled() {
  setup_tracing_for_test();
  let pool = WorkerPool::<String>::new(1, Handle::current(), "test_pool_panic_handling");

  let mut handle_panic = pool
    .submit(|_| async move {
      let fail = true;
      if fail {
        panic!("Task 1 intentionally panicked!");
      }
      "wont_complete".to_string()
    })
    .unwrap();

  match handle_panic.await_result().await {
    Err(PoolError::TaskPanicked(message)) => assert_eq!(message, "Task 1 intentionally panicked!"),
    other => panic!("Expected TaskPanicked error, got {:?}", other),
  }

  // Ensure pool still works for other tasks
  let mut handle_normal = pool.submit(|_| async move { "task2_done".to_string() }).unwrap();
  assert_eq!(handle_normal.await_result().await, Ok("task2_done".to_string()));

  pool.shutdown(ShutdownMode::Graceful).await;
}

#[tokio::test]
async fn test_callback_errors_are_forwarded_verbatim() {
  setup_tracing_for_test();
  let pool = WorkerPool::<Result<u32, String>>::new(1, Handle::current(), "test_pool_callback_errors");

  let mut failing = pool.submit(|_| async move { Err("bad input".to_string()) }).unwrap();
  let mut succeeding = pool.submit(|_| async move { Ok(3) }).unwrap();

  assert_eq!(failing.await_result().await, Ok(Err("bad input".to_string())));
  assert_eq!(succeeding.await_result().await, Ok(Ok(3)));

  pool.shutdown(ShutdownMode::Graceful).await;
}

#[tokio::test]
async fn test_task_cancellation_via_handle() {
  setup_tracing_for_test();
  let pool = WorkerPool::<String>::new(1, Handle::current(), "test_pool_cancel_via_handle");
  let observed = Arc::new(AtomicBool::new(false));

  let mut handle = {
    let observed = observed.clone();
    pool
      .submit(move |token| async move {
        token.cancelled().await;
        observed.store(true, Ordering::SeqCst);
        "output_if_not_cancelled".to_string()
      })
      .unwrap()
  };

  sleep(Duration::from_millis(20)).await;
  handle.cancel_with_reason("user request");
  assert!(handle.is_cancellation_requested());

  assert_eq!(
    handle.await_result().await,
    Err(PoolError::TaskCancelled {
      reason: "user request".to_string()
    })
  );
  assert!(observed.load(Ordering::SeqCst), "the callback sees its token fire");

  pool.shutdown(ShutdownMode::Graceful).await;
}

#[tokio::test]
async fn test_cancelled_queued_task_never_runs() {
  setup_tracing_for_test();
  let pool = WorkerPool::<u32>::new(1, Handle::current(), "test_pool_cancel_queued");
  let ran = Arc::new(AtomicBool::new(false));

  let mut busy = pool
    .submit(|_| async move {
      sleep(Duration::from_millis(30)).await;
      1
    })
    .unwrap();
  let mut queued = {
    let ran = ran.clone();
    pool
      .submit(move |_| async move {
        ran.store(true, Ordering::SeqCst);
        2
      })
      .unwrap()
  };

  queued.cancel();
  assert_eq!(busy.await_result().await, Ok(1));
  assert!(queued.await_result().await.unwrap_err().is_cancelled());
  assert!(!ran.load(Ordering::SeqCst));

  pool.shutdown(ShutdownMode::Graceful).await;
}

#[tokio::test]
async fn test_shutdown_graceful_allows_active_tasks_to_complete() {
  setup_tracing_for_test();
  let pool = WorkerPool::<String>::new(1, Handle::current(), "test_pool_shutdown_graceful");
  let queued_ran = Arc::new(AtomicBool::new(false));

  let mut active = pool
    .submit(|_| async move {
      sleep(Duration::from_millis(50)).await;
      "task1_done_graceful".to_string()
    })
    .unwrap();
  let mut queued = {
    let queued_ran = queued_ran.clone();
    pool
      .submit(move |_| async move {
        queued_ran.store(true, Ordering::SeqCst);
        "task2_queued_wont_run".to_string()
      })
      .unwrap()
  };

  sleep(Duration::from_millis(10)).await;
  pool.shutdown(ShutdownMode::Graceful).await;

  assert_eq!(active.await_result().await, Ok("task1_done_graceful".to_string()));
  assert_eq!(queued.await_result().await, Err(PoolError::PoolShuttingDown));
  assert!(!queued_ran.load(Ordering::SeqCst), "Queued task should not have run.");
  assert_eq!(pool.size(), 0);

  let late = pool.submit(|_| async move { "late".to_string() });
  assert!(matches!(late, Err(PoolError::PoolShuttingDown)));

  // A second shutdown only waits.
  pool.shutdown(ShutdownMode::ForcefulCancel).await;
}

#[tokio::test]
async fn test_shutdown_forceful_cancels_active_tasks() {
  setup_tracing_for_test();
  let pool = WorkerPool::<u32>::new(2, Handle::current(), "test_pool_shutdown_forceful");

  let mut handles: Vec<_> = (0..2)
    .map(|_| {
      pool
        .submit(|token| async move {
          token.cancelled().await;
          0
        })
        .unwrap()
    })
    .collect();

  sleep(Duration::from_millis(10)).await;
  assert_eq!(pool.active_task_count(), 2);

  timeout(Duration::from_millis(200), pool.shutdown(ShutdownMode::ForcefulCancel))
    .await
    .expect("forceful shutdown must not wait for cooperative tasks to finish on their own");

  for handle in handles.iter_mut() {
    assert_eq!(
      handle.await_result().await,
      Err(PoolError::TaskCancelled {
        reason: SHUTDOWN_CANCEL_REASON.to_string()
      })
    );
  }
  assert_eq!(pool.active_task_count(), 0);
}

#[tokio::test]
async fn test_drop_rejects_queued_tasks() {
  setup_tracing_for_test();
  let pool = WorkerPool::<u32>::new(1, Handle::current(), "test_pool_drop_cleanup");

  let mut active = pool
    .submit(|_| async move {
      sleep(Duration::from_millis(30)).await;
      1
    })
    .unwrap();
  let mut queued = pool.submit(|_| async move { 2 }).unwrap();

  sleep(Duration::from_millis(10)).await;
  drop(pool);

  assert_eq!(queued.await_result().await, Err(PoolError::PoolShuttingDown));
  assert_eq!(active.await_result().await, Ok(1), "running tasks finish after the pool is dropped");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_multi_thread_runtime_runs_every_task_once() {
  setup_tracing_for_test();
  let pool = WorkerPool::<usize>::new(4, Handle::current(), "test_pool_multi_thread");
  let runs = Arc::new(AtomicUsize::new(0));

  let mut handles = Vec::new();
  for i in 0..200 {
    let runs = runs.clone();
    handles.push(
      pool
        .submit(move |_| async move {
          runs.fetch_add(1, Ordering::SeqCst);
          i
        })
        .unwrap(),
    );
  }
  for (i, handle) in handles.iter_mut().enumerate() {
    assert_eq!(handle.await_result().await, Ok(i));
  }
  assert_eq!(runs.load(Ordering::SeqCst), 200);

  pool.shutdown(ShutdownMode::Graceful).await;
}

#[tokio::test]
async fn test_idle_resize_cycles_keep_pool_usable() {
  setup_tracing_for_test();
  let pool = WorkerPool::<u32>::new(2, Handle::current(), "test_pool_resize_cycles");

  for _ in 0..50 {
    pool.resize(4).await;
    sleep(Duration::from_millis(1)).await;
    pool.resize(1).await;
  }
  assert_eq!(pool.size(), 1);

  let mut handle = pool.submit(|_| async move { 9 }).unwrap();
  assert_eq!(
    timeout(Duration::from_secs(1), handle.await_result()).await.unwrap(),
    Ok(9)
  );
  assert_eq!(pool.queued_task_count(), 0);
}
