use futures_batch::{BatchError, BatchPool, TaskCompletionInfo, TaskCompletionStatus};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::time::sleep;

// Helper to initialize tracing for tests
fn setup_tracing_for_test() {
  use std::sync::Once;
  use tracing_subscriber::{fmt, util::SubscriberInitExt, EnvFilter};
  static TRACING_INIT: Once = Once::new();

  TRACING_INIT.call_once(|| {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info,futures_batch=trace"));
    fmt::Subscriber::builder()
      .with_env_filter(filter)
      .with_test_writer()
      .finish()
      .try_init()
      .ok();
  });
}

type Collected = Arc<Mutex<Vec<TaskCompletionInfo<u64, String>>>>;

// Helper for collecting notifications in tests
fn create_collecting_handler() -> (Collected, impl Fn(&TaskCompletionInfo<u64, String>) + Send + Sync + 'static) {
  let collected_notifications: Collected = Arc::new(Mutex::new(Vec::new()));
  let collected_notifications_clone = collected_notifications.clone();
  let handler = move |info: &TaskCompletionInfo<u64, String>| {
    tracing::debug!(
      "Test Collecting Handler: Received notification for index: {}, status: {:?}",
      info.index,
      info.status
    );
    collected_notifications_clone.lock().unwrap().push(info.clone());
  };
  (collected_notifications, handler)
}

#[tokio::test]
async fn test_completion_notifier_success() {
  setup_tracing_for_test();
  let pool_name = "test_notifier_success";
  let pool = BatchPool::builder().name(pool_name).concurrency(2).build().unwrap();

  let batch = pool
    .batch(vec![30u64, 10])
    .processor(|x: u64| async move {
      sleep(Duration::from_millis(x)).await;
      Ok::<_, String>(x * 2)
    });
  let (notifications, handler) = create_collecting_handler();
  batch.on_task_complete(handler);

  let results = batch.run().await.unwrap();
  assert_eq!(results, vec![20, 60]);

  let notifs = notifications.lock().unwrap();
  assert_eq!(notifs.len(), 2);
  // Notifications follow completion order, like the results.
  assert_eq!(notifs[0].index, 1);
  assert_eq!(notifs[1].index, 0);
  for info in notifs.iter() {
    assert_eq!(info.batch_id, batch.id());
    assert_eq!(*info.pool_name, pool_name);
    assert_eq!(info.status, TaskCompletionStatus::Succeeded);
    assert_eq!(info.attempts, 1);
    assert!(info.error.is_none());
    assert!(info.completion_time <= std::time::SystemTime::now());
  }
  assert_eq!(notifs[0].output, Some(20));
  assert_eq!(notifs[1].output, Some(60));
  assert!(notifs[1].elapsed >= Duration::from_millis(30));
}

#[tokio::test]
async fn test_completion_notifier_reports_retries_and_failures() {
  setup_tracing_for_test();
  let pool = BatchPool::builder().retry_limit(2).build().unwrap();

  let batch = pool
    .batch(vec![1u64])
    .processor(|_x: u64| async move { Err::<u64, _>("unavailable".to_string()) });
  let (notifications, handler) = create_collecting_handler();
  batch.on_task_complete(handler);

  let outcome = batch.run().await;
  assert!(matches!(outcome, Err(BatchError::Processor { attempts: 3, .. })));

  let notifs = notifications.lock().unwrap();
  assert_eq!(notifs.len(), 1, "retries are not terminal outcomes");
  let info = &notifs[0];
  assert_eq!(info.status, TaskCompletionStatus::Failed);
  assert_eq!(info.attempts, 3);
  assert_eq!(info.output, None);
  assert_eq!(
    info.error,
    Some(BatchError::Processor {
      index: 0,
      attempts: 3,
      error: "unavailable".to_string()
    })
  );
}

#[tokio::test]
async fn test_completion_notifier_timeout_and_panic() {
  setup_tracing_for_test();
  let pool = BatchPool::builder().timeout_limit(30).concurrency(2).build().unwrap();

  let batch = pool.batch(vec![0u64, 1]).processor(|x: u64| async move {
    if x == 0 {
      sleep(Duration::from_millis(500)).await;
    } else {
      panic!("processor panicked on {}", x);
    }
    Ok::<_, String>(x)
  });
  let (notifications, handler) = create_collecting_handler();
  batch.on_task_complete(handler);

  let outcome = batch.run().await;
  // Without stop-on-failure the last terminal failure settles the batch.
  assert!(matches!(outcome, Err(BatchError::Timeout { index: 0, .. })));

  let notifs = notifications.lock().unwrap();
  assert_eq!(notifs.len(), 2);
  assert_eq!(notifs[0].index, 1);
  assert_eq!(notifs[0].status, TaskCompletionStatus::Panicked);
  assert_eq!(notifs[1].index, 0);
  assert_eq!(notifs[1].status, TaskCompletionStatus::TimedOut);
}

#[tokio::test]
async fn test_partial_results_survive_in_side_channel() {
  setup_tracing_for_test();
  let pool = BatchPool::builder().concurrency(1).stop_on_failure(true).build().unwrap();

  let batch = pool.batch(vec![1u64, 2, 3, 4, 5]).processor(|x: u64| async move {
    if x == 3 {
      Err("three is not allowed".to_string())
    } else {
      Ok(x)
    }
  });
  let (notifications, handler) = create_collecting_handler();
  batch.on_task_complete(handler);

  let outcome = batch.run().await;
  assert!(matches!(outcome, Err(BatchError::Processor { index: 2, .. })));

  let notifs = notifications.lock().unwrap();
  let outputs: Vec<Option<u64>> = notifs.iter().map(|info| info.output).collect();
  assert_eq!(outputs, vec![Some(1), Some(2), None]);
}

#[tokio::test]
async fn test_multiple_handlers_and_panicking_handler() {
  setup_tracing_for_test();
  let pool = BatchPool::builder().concurrency(3).build().unwrap();
  let batch = pool
    .batch(0..6u64)
    .processor(|x: u64| async move { Ok::<_, String>(x) });

  batch.on_task_complete(|info: &TaskCompletionInfo<u64, String>| {
    if info.index == 3 {
      panic!("handler panicked on purpose");
    }
  });
  let (first, first_handler) = create_collecting_handler();
  let (second, second_handler) = create_collecting_handler();
  batch.on_task_complete(first_handler);
  batch.on_task_complete(second_handler);

  let results = batch.run().await.unwrap();
  assert_eq!(results.len(), 6);
  assert_eq!(first.lock().unwrap().len(), 6);
  assert_eq!(second.lock().unwrap().len(), 6);
}

#[tokio::test]
async fn test_no_notifications_after_cancel() {
  setup_tracing_for_test();
  let pool = BatchPool::builder().concurrency(1).build().unwrap();
  let batch = pool.batch(vec![10u64, 300, 10, 10]).processor(|x: u64| async move {
    sleep(Duration::from_millis(x)).await;
    Ok::<_, String>(x)
  });
  let (notifications, handler) = create_collecting_handler();
  batch.on_task_complete(handler);

  let run = batch.run();
  sleep(Duration::from_millis(100)).await;
  batch.cancel();
  assert_eq!(run.await, Err(BatchError::Cancelled));

  sleep(Duration::from_millis(300)).await;
  let notifs = notifications.lock().unwrap();
  assert_eq!(notifs.len(), 1);
  assert_eq!(notifs[0].index, 0);
}
