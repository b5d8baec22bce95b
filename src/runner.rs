use crate::config::{TaskPolicy, TimeoutBehavior};
use crate::error::BatchError;
use crate::gate::SlotPermit;
use crate::task::{Processor, TaskReport};

use std::any::Any;
use std::fmt;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::{Duration, Instant};

use dashmap::DashMap;
use futures::FutureExt;
use tokio::sync::oneshot;
use tracing::{debug, error, trace, warn, Instrument};

/// Why a single attempt did not produce a value.
#[derive(Debug)]
enum AttemptError<E> {
  Processor(E),
  Timeout(Duration),
  Panicked,
}

impl<E> AttemptError<E> {
  fn into_batch_error(self, index: usize, attempts: u32) -> BatchError<E> {
    match self {
      AttemptError::Processor(error) => BatchError::Processor { index, attempts, error },
      AttemptError::Timeout(limit) => BatchError::Timeout { index, attempts, limit },
      AttemptError::Panicked => BatchError::TaskPanicked { index },
    }
  }
}

type CaughtOutcome<R, E> = Result<Result<R, E>, Box<dyn Any + Send>>;

fn settle_caught<R, E>(caught: CaughtOutcome<R, E>) -> Result<R, AttemptError<E>> {
  match caught {
    Ok(Ok(value)) => Ok(value),
    Ok(Err(error)) => Err(AttemptError::Processor(error)),
    Err(_panic_payload) => Err(AttemptError::Panicked),
  }
}

/// Runs one admitted input to its terminal outcome.
///
/// Every attempt is raced against the configured timeout. Processor errors are retried
/// up to `retry_limit` more times; timeouts only when `retry_on_timeout` is set. Panics
/// are never retried.
pub(crate) struct TaskRunner<I, R, E> {
  processor: Processor<I, R, E>,
  policy: TaskPolicy,
  active: Arc<DashMap<usize, u32>>,
}

impl<I, R, E> TaskRunner<I, R, E>
where
  I: Clone + Send + 'static,
  R: Send + 'static,
  E: fmt::Debug + Send + 'static,
{
  pub(crate) fn new(processor: Processor<I, R, E>, policy: TaskPolicy, active: Arc<DashMap<usize, u32>>) -> Self {
    Self {
      processor,
      policy,
      active,
    }
  }

  pub(crate) async fn run(self: Arc<Self>, index: usize, input: I, permit: SlotPermit) -> TaskReport<R, E> {
    let started = Instant::now();
    let max_attempts = self.policy.retry_limit.saturating_add(1);
    let mut attempt: u32 = 1;

    let outcome = loop {
      self.active.insert(index, attempt);

      match self.attempt(input.clone()).await {
        Ok(value) => {
          trace!(%index, attempt, "Task succeeded.");
          break Ok(value);
        }
        Err(err) => {
          let retryable = match &err {
            AttemptError::Processor(_) => true,
            AttemptError::Timeout(_) => self.policy.retry_on_timeout,
            AttemptError::Panicked => false,
          };

          if retryable && attempt < max_attempts {
            warn!(%index, attempt, max_attempts, error = ?err, "Attempt failed. Retrying.");
            if !self.policy.retry_delay.is_zero() {
              tokio::time::sleep(self.policy.retry_delay).await;
            }
            attempt += 1;
            continue;
          }

          if matches!(err, AttemptError::Panicked) {
            error!(%index, attempt, "Processor panicked.");
          } else {
            warn!(%index, attempt, error = ?err, "Task failed terminally.");
          }
          break Err(err.into_batch_error(index, attempt));
        }
      }
    };

    self.active.remove(&index);
    TaskReport {
      index,
      attempts: attempt,
      elapsed: started.elapsed(),
      outcome,
      permit,
    }
  }

  async fn attempt(&self, input: I) -> Result<R, AttemptError<E>> {
    // The processor closure itself may panic before handing back a future.
    let future = match std::panic::catch_unwind(AssertUnwindSafe(|| (self.processor)(input))) {
      Ok(future) => future,
      Err(_) => return Err(AttemptError::Panicked),
    };
    let guarded = AssertUnwindSafe(future).catch_unwind();

    let limit = match self.policy.timeout {
      None => return settle_caught(guarded.await),
      Some(limit) => limit,
    };

    match self.policy.timeout_behavior {
      TimeoutBehavior::Cancel => match tokio::time::timeout(limit, guarded).await {
        Ok(caught) => settle_caught(caught),
        Err(_elapsed) => Err(AttemptError::Timeout(limit)),
      },
      TimeoutBehavior::Detach => {
        let (tx, rx) = oneshot::channel::<CaughtOutcome<R, E>>();
        tokio::spawn(
          async move {
            let caught = guarded.await;
            if tx.send(caught).is_err() {
              debug!("Detached invocation finished after its timeout. Result discarded.");
            }
          }
          .in_current_span(),
        );

        match tokio::time::timeout(limit, rx).await {
          Ok(Ok(caught)) => settle_caught(caught),
          // The detached invocation vanished without reporting, i.e. its runtime is gone.
          Ok(Err(_recv_error)) => Err(AttemptError::Panicked),
          Err(_elapsed) => Err(AttemptError::Timeout(limit)),
        }
      }
    }
  }
}
