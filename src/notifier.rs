use crate::error::BatchError;

use std::fmt;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::{Duration, SystemTime};

use parking_lot::RwLock;
use tracing::{debug, error, trace};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskCompletionStatus {
  Succeeded,
  Failed,
  TimedOut,
  Panicked,
}

impl<R, E> From<&Result<R, BatchError<E>>> for TaskCompletionStatus {
  fn from(result: &Result<R, BatchError<E>>) -> Self {
    match result {
      Ok(_) => TaskCompletionStatus::Succeeded,
      Err(BatchError::Timeout { .. }) => TaskCompletionStatus::TimedOut,
      Err(BatchError::TaskPanicked { .. }) => TaskCompletionStatus::Panicked,
      Err(_) => TaskCompletionStatus::Failed,
    }
  }
}

/// Terminal outcome of one task, handed to every registered completion handler.
///
/// Successful outputs are delivered here even when the batch later fails, which is the
/// only way to keep them: a failing batch outcome carries just the error.
#[derive(Debug, Clone)]
pub struct TaskCompletionInfo<R, E> {
  pub batch_id: u64,
  pub pool_name: Arc<String>,
  /// Position of the input in the batch's input sequence.
  pub index: usize,
  pub attempts: u32,
  pub status: TaskCompletionStatus,
  pub output: Option<R>,
  pub error: Option<BatchError<E>>,
  pub elapsed: Duration,
  pub completion_time: SystemTime,
}

impl<R: Clone, E: Clone> TaskCompletionInfo<R, E> {
  pub(crate) fn new(
    batch_id: u64,
    pool_name: Arc<String>,
    index: usize,
    attempts: u32,
    elapsed: Duration,
    outcome: &Result<R, BatchError<E>>,
  ) -> Self {
    let (output, error) = match outcome {
      Ok(value) => (Some(value.clone()), None),
      Err(err) => (None, Some(err.clone())),
    };
    Self {
      batch_id,
      pool_name,
      index,
      attempts,
      status: TaskCompletionStatus::from(outcome),
      output,
      error,
      elapsed,
      completion_time: SystemTime::now(),
    }
  }
}

pub(crate) type CompletionHandler<R, E> = Arc<dyn Fn(&TaskCompletionInfo<R, E>) + Send + Sync + 'static>;

/// Registry of completion handlers for one batch.
///
/// Handlers run on the batch driver, one completion at a time and in completion order.
/// A slow handler delays admission of the next task.
pub(crate) struct CompletionNotifier<R, E> {
  handlers: RwLock<Vec<CompletionHandler<R, E>>>,
}

impl<R, E> fmt::Debug for CompletionNotifier<R, E> {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.debug_struct("CompletionNotifier")
      .field("handler_count", &self.handlers.read().len())
      .finish()
  }
}

impl<R, E> CompletionNotifier<R, E> {
  pub(crate) fn new() -> Self {
    Self {
      handlers: RwLock::new(Vec::new()),
    }
  }

  pub(crate) fn add_handler(&self, handler: impl Fn(&TaskCompletionInfo<R, E>) + Send + Sync + 'static) {
    let mut handlers = self.handlers.write();
    handlers.push(Arc::new(handler));
    debug!("Notifier: Added completion handler. Total handlers: {}", handlers.len());
  }

  pub(crate) fn has_handlers(&self) -> bool {
    !self.handlers.read().is_empty()
  }

  pub(crate) fn dispatch(&self, info: &TaskCompletionInfo<R, E>) {
    // Snapshot so a handler may register further handlers without deadlocking.
    let handlers: Vec<CompletionHandler<R, E>> = self.handlers.read().clone();
    if handlers.is_empty() {
      trace!(index = info.index, "No completion handlers registered, dropping notification.");
      return;
    }

    for handler in handlers {
      let result = std::panic::catch_unwind(AssertUnwindSafe(|| handler(info)));
      if result.is_err() {
        error!(
          pool_name = %*info.pool_name,
          batch_id = info.batch_id,
          index = info.index,
          "A completion handler panicked. Ignoring."
        );
      }
    }
  }
}
