use crate::error::BatchError;

use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::task::{Context, Poll};

use futures::future::{BoxFuture, Shared};
use futures::FutureExt;
use tokio::task::JoinHandle;
use tracing::error;

/// Outcome of a batch run: every result in completion order, or the error that settled it.
pub type BatchOutcome<R, E> = Result<Vec<R>, BatchError<E>>;

/// Handle to the one execution of a [`Batch`](crate::Batch).
///
/// Cloning the handle, or calling `run` again on the same batch, yields handles to the
/// same execution. Each of them resolves to a clone of the same outcome.
pub struct BatchRun<R, E> {
  pub(crate) batch_id: u64,
  pub(crate) outcome: Shared<BoxFuture<'static, BatchOutcome<R, E>>>,
}

impl<R, E> Clone for BatchRun<R, E>
where
  R: Clone,
  E: Clone,
{
  fn clone(&self) -> Self {
    Self {
      batch_id: self.batch_id,
      outcome: self.outcome.clone(),
    }
  }
}

impl<R, E> fmt::Debug for BatchRun<R, E>
where
  R: Clone,
  E: Clone,
{
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.debug_struct("BatchRun")
      .field("batch_id", &self.batch_id)
      .field("settled", &self.is_settled())
      .finish()
  }
}

impl<R, E> BatchRun<R, E>
where
  R: Clone + Send + Sync + 'static,
  E: Clone + Send + Sync + 'static,
{
  /// A run decided before any task started (empty input, invalid setup).
  pub(crate) fn settled(batch_id: u64, outcome: BatchOutcome<R, E>) -> Self {
    Self {
      batch_id,
      outcome: futures::future::ready(outcome).boxed().shared(),
    }
  }

  /// A run whose driver was spawned onto a runtime.
  pub(crate) fn spawned(batch_id: u64, driver: JoinHandle<BatchOutcome<R, E>>) -> Self {
    let outcome = async move {
      match driver.await {
        Ok(outcome) => outcome,
        Err(join_error) => {
          error!(%batch_id, "Batch driver did not finish: {}", join_error);
          Err(BatchError::DriverFailed(join_error.to_string()))
        }
      }
    };
    Self {
      batch_id,
      outcome: outcome.boxed().shared(),
    }
  }
}

impl<R, E> BatchRun<R, E>
where
  R: Clone,
  E: Clone,
{
  pub fn batch_id(&self) -> u64 {
    self.batch_id
  }

  /// Whether `self` and `other` observe the same execution.
  pub fn same_run(&self, other: &Self) -> bool {
    self.batch_id == other.batch_id
  }

  /// The outcome, if some clone of this handle has already observed it.
  pub fn peek(&self) -> Option<&BatchOutcome<R, E>> {
    self.outcome.peek()
  }

  pub fn is_settled(&self) -> bool {
    self.peek().is_some()
  }
}

impl<R, E> Future for BatchRun<R, E>
where
  R: Clone,
  E: Clone,
{
  type Output = BatchOutcome<R, E>;

  fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
    self.outcome.poll_unpin(cx)
  }
}
