use crate::config::{PoolBuilder, PoolConfig};
use crate::error::{BatchError, ConfigError};
use crate::gate::AdmissionGate;
use crate::handle::{BatchOutcome, BatchRun};
use crate::notifier::{CompletionNotifier, TaskCompletionInfo};
use crate::runner::TaskRunner;
use crate::task::{processor_fn, Processor, TaskReport};
use crate::tracker::CompletionTracker;

use std::fmt;
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering as AtomicOrdering};
use std::sync::Arc;

use dashmap::DashMap;
use parking_lot::Mutex;
use tokio::runtime::Handle as TokioHandle;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, info_span, trace, Instrument};

lazy_static::lazy_static! {
  static ref NEXT_BATCH_ID_COUNTER: AtomicU64 = AtomicU64::new(0);
}

/// Configured entry point for running batches.
///
/// A pool only holds configuration; every [`Batch`] created from it gets its own slots,
/// counters and outcome. Cloning is cheap.
#[derive(Debug, Clone)]
pub struct BatchPool {
  config: Arc<PoolConfig>,
}

impl Default for BatchPool {
  fn default() -> Self {
    Self::from_config(PoolConfig::default())
  }
}

impl BatchPool {
  pub fn builder() -> PoolBuilder {
    PoolBuilder::new()
  }

  pub(crate) fn from_config(config: PoolConfig) -> Self {
    Self {
      config: Arc::new(config),
    }
  }

  #[cfg(test)]
  pub(crate) fn config(&self) -> &PoolConfig {
    &self.config
  }

  pub fn name(&self) -> &str {
    &self.config.name
  }

  pub fn concurrency(&self) -> usize {
    self.config.concurrency
  }

  /// Creates a batch over `inputs` with no processor bound yet.
  pub fn batch<I, R, E>(&self, inputs: impl IntoIterator<Item = I>) -> Batch<I, R, E> {
    let inputs: Vec<I> = inputs.into_iter().collect();
    let batch_id = NEXT_BATCH_ID_COUNTER.fetch_add(1, AtomicOrdering::Relaxed);
    debug!(pool_name = %*self.config.name, %batch_id, total = inputs.len(), "Created batch.");

    Batch {
      batch_id,
      tracker: Arc::new(Mutex::new(CompletionTracker::new(inputs.len(), self.config.stop_on_failure))),
      config: self.config.clone(),
      processor: None,
      notifier: Arc::new(CompletionNotifier::new()),
      active_tasks: Arc::new(DashMap::new()),
      cancel_token: CancellationToken::new(),
      run_slot: Mutex::new(RunSlot {
        pending_inputs: Some(inputs),
        run: None,
      }),
    }
  }

  /// Runs `processor` over `inputs` and returns the run's outcome handle.
  pub fn run<I, R, E, F, Fut>(&self, inputs: impl IntoIterator<Item = I>, processor: F) -> BatchRun<R, E>
  where
    I: Clone + Send + Sync + 'static,
    R: Clone + Send + Sync + 'static,
    E: Clone + fmt::Debug + Send + Sync + 'static,
    F: Fn(I) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<R, E>> + Send + 'static,
  {
    self.batch(inputs).processor(processor).run()
  }
}

struct RunSlot<I, R, E> {
  pending_inputs: Option<Vec<I>>,
  run: Option<BatchRun<R, E>>,
}

/// One input sequence bound to one processor, executed at most once.
pub struct Batch<I, R, E> {
  batch_id: u64,
  config: Arc<PoolConfig>,
  processor: Option<Processor<I, R, E>>,
  notifier: Arc<CompletionNotifier<R, E>>,
  tracker: Arc<Mutex<CompletionTracker<R, E>>>,
  active_tasks: Arc<DashMap<usize, u32>>,
  cancel_token: CancellationToken,
  run_slot: Mutex<RunSlot<I, R, E>>,
}

impl<I, R, E> fmt::Debug for Batch<I, R, E> {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.debug_struct("Batch")
      .field("batch_id", &self.batch_id)
      .field("pool_name", &self.config.name)
      .field("has_processor", &self.processor.is_some())
      .field("notifier", &self.notifier)
      .finish_non_exhaustive()
  }
}

impl<I, R, E> Batch<I, R, E> {
  pub fn id(&self) -> u64 {
    self.batch_id
  }

  /// Binds the processing function, replacing any earlier one.
  pub fn processor<F, Fut>(self, processor: F) -> Self
  where
    I: 'static,
    R: 'static,
    E: 'static,
    F: Fn(I) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<R, E>> + Send + 'static,
  {
    self.with_processor(processor_fn(processor))
  }

  pub fn with_processor(mut self, processor: Processor<I, R, E>) -> Self {
    self.processor = Some(processor);
    self
  }

  /// Registers a handler called once per terminal task outcome.
  pub fn on_task_complete(&self, handler: impl Fn(&TaskCompletionInfo<R, E>) + Send + Sync + 'static) {
    self.notifier.add_handler(handler);
  }

  /// Aborts the run: nothing else is admitted, in-flight tasks are cancelled and the
  /// outcome becomes [`BatchError::Cancelled`].
  pub fn cancel(&self) {
    info!(pool_name = %*self.config.name, batch_id = %self.batch_id, "Batch cancellation requested.");
    self.cancel_token.cancel();
  }

  pub fn is_cancelled(&self) -> bool {
    self.cancel_token.is_cancelled()
  }

  pub fn in_flight(&self) -> usize {
    self.tracker.lock().in_flight()
  }

  pub fn finished(&self) -> usize {
    self.tracker.lock().finished()
  }

  pub fn admitted(&self) -> usize {
    self.tracker.lock().admitted()
  }

  /// Highest number of tasks that were in flight at the same time.
  pub fn peak_in_flight(&self) -> usize {
    self.tracker.lock().peak_in_flight()
  }

  /// Input index and current attempt number of every task still running.
  pub fn active_tasks(&self) -> Vec<(usize, u32)> {
    let mut active: Vec<(usize, u32)> = self.active_tasks.iter().map(|entry| (*entry.key(), *entry.value())).collect();
    active.sort_unstable();
    active
  }
}

impl<I, R, E> Batch<I, R, E>
where
  I: Clone + Send + Sync + 'static,
  R: Clone + Send + Sync + 'static,
  E: Clone + fmt::Debug + Send + Sync + 'static,
{
  /// Starts the batch, or joins it if it was already started.
  ///
  /// The work begins immediately on the runtime; awaiting the returned handle is only
  /// needed to observe the outcome.
  pub fn run(&self) -> BatchRun<R, E> {
    let mut slot = self.run_slot.lock();
    if let Some(run) = &slot.run {
      trace!(batch_id = %self.batch_id, "Run already started. Returning existing handle.");
      return run.clone();
    }

    let inputs = slot.pending_inputs.take().unwrap_or_default();
    let run = self.start(inputs);
    slot.run = Some(run.clone());
    run
  }

  fn start(&self, inputs: Vec<I>) -> BatchRun<R, E> {
    let pool_name = self.config.name.clone();

    let processor = match &self.processor {
      Some(processor) => processor.clone(),
      None => {
        error!(pool_name = %*pool_name, batch_id = %self.batch_id, "Run requested without a processor.");
        return BatchRun::settled(self.batch_id, Err(ConfigError::MissingProcessor.into()));
      }
    };

    if inputs.is_empty() {
      info!(pool_name = %*pool_name, batch_id = %self.batch_id, "Empty batch. Settled without admitting anything.");
      let outcome = self
        .tracker
        .lock()
        .settlement()
        .unwrap_or_else(|| Ok(Vec::new()));
      return BatchRun::settled(self.batch_id, outcome);
    }

    let runtime = match &self.config.runtime {
      Some(handle) => handle.clone(),
      None => match TokioHandle::try_current() {
        Ok(handle) => handle,
        Err(_) => {
          error!(pool_name = %*pool_name, batch_id = %self.batch_id, "Run requested outside of a Tokio runtime.");
          return BatchRun::settled(self.batch_id, Err(ConfigError::NoRuntime.into()));
        }
      },
    };

    let driver = BatchDriver {
      batch_id: self.batch_id,
      pool_name: pool_name.clone(),
      inputs,
      gate: AdmissionGate::new(self.config.concurrency),
      runner: Arc::new(TaskRunner::new(processor, self.config.policy, self.active_tasks.clone())),
      tracker: self.tracker.clone(),
      notifier: self.notifier.clone(),
      active_tasks: self.active_tasks.clone(),
      cancel_token: self.cancel_token.clone(),
    };

    let join_handle = runtime.spawn(
      driver
        .drive()
        .instrument(info_span!("batch", name = %*pool_name, batch_id = %self.batch_id)),
    );
    BatchRun::spawned(self.batch_id, join_handle)
  }
}

/// Owns one batch execution: admits inputs in order, collects task reports and settles
/// the outcome.
struct BatchDriver<I, R, E> {
  batch_id: u64,
  pool_name: Arc<String>,
  inputs: Vec<I>,
  gate: AdmissionGate,
  runner: Arc<TaskRunner<I, R, E>>,
  tracker: Arc<Mutex<CompletionTracker<R, E>>>,
  notifier: Arc<CompletionNotifier<R, E>>,
  active_tasks: Arc<DashMap<usize, u32>>,
  cancel_token: CancellationToken,
}

impl<I, R, E> BatchDriver<I, R, E>
where
  I: Clone + Send + Sync + 'static,
  R: Clone + Send + Sync + 'static,
  E: Clone + fmt::Debug + Send + Sync + 'static,
{
  async fn drive(mut self) -> BatchOutcome<R, E> {
    let total = self.inputs.len();
    info!(total, gate = ?self.gate, "Batch started.");

    let mut pending = std::mem::take(&mut self.inputs).into_iter().enumerate();
    let mut next_input = pending.next();
    let mut tasks: JoinSet<TaskReport<R, E>> = JoinSet::new();

    let outcome = loop {
      if let Some(outcome) = self.tracker.lock().settlement() {
        break outcome;
      }

      tokio::select! {
        biased;

        _ = self.cancel_token.cancelled() => {
          self.tracker.lock().cancel();
        }

        joined = tasks.join_next(), if !tasks.is_empty() => {
          match joined {
            Some(Ok(report)) => self.complete(report),
            Some(Err(join_error)) => {
              // Panics are caught by the runner, so this only happens if the task was torn down.
              error!("Task did not report an outcome: {}", join_error);
              self.tracker.lock().record(Err(BatchError::DriverFailed(join_error.to_string())));
            }
            None => {}
          }
        }

        acquired = self.gate.acquire(), if next_input.is_some() => {
          let permit = match acquired {
            Ok(permit) => permit,
            Err(closed) => {
              error!("Admission gate closed: {}", closed);
              self.tracker.lock().cancel();
              continue;
            }
          };
          if let Some((index, input)) = next_input.take() {
            if self.tracker.lock().admit() {
              debug!(%index, available = self.gate.available(), "Admitting task.");
              let runner = self.runner.clone();
              tasks.spawn(
                runner
                  .run(index, input, permit)
                  .instrument(info_span!("batch_task", %index)),
              );
            }
            next_input = pending.next();
          }
        }
      }
    };

    let unadmitted = pending.len() + usize::from(next_input.is_some());
    if !tasks.is_empty() || unadmitted > 0 {
      info!(
        in_flight = tasks.len(),
        unadmitted,
        "Batch aborted. Cancelling in-flight tasks and dropping remaining inputs."
      );
    }
    tasks.shutdown().await;
    self.active_tasks.clear();

    match &outcome {
      Ok(results) => info!(results = results.len(), "Batch completed."),
      Err(err) => info!(error = ?err, "Batch failed."),
    }
    outcome
  }

  fn complete(&self, report: TaskReport<R, E>) {
    let TaskReport {
      index,
      attempts,
      elapsed,
      outcome,
      permit,
    } = report;

    let info = {
      let mut tracker = self.tracker.lock();
      if !tracker.is_running() {
        trace!(%index, "Discarding completion of a task from an aborted batch.");
        return;
      }

      let info = self.notifier.has_handlers().then(|| {
        TaskCompletionInfo::new(self.batch_id, self.pool_name.clone(), index, attempts, elapsed, &outcome)
      });
      tracker.record(outcome);
      debug!(%index, attempts, finished = tracker.finished(), in_flight = tracker.in_flight(), "Task finished.");
      info
    };

    // The slot is handed back only once the completion is on the books.
    drop(permit);

    if let Some(info) = info {
      self.notifier.dispatch(&info);
    }
  }
}
