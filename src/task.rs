use crate::error::BatchError;
use crate::gate::SlotPermit;

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

/// The future a processor returns for one input.
pub type ProcessorFuture<R, E> = Pin<Box<dyn Future<Output = Result<R, E>> + Send + 'static>>;

/// A type-erased processor, shared by every task of a batch.
pub type Processor<I, R, E> = Arc<dyn Fn(I) -> ProcessorFuture<R, E> + Send + Sync + 'static>;

/// Boxes a plain async closure into a [`Processor`].
pub fn processor_fn<I, R, E, F, Fut>(f: F) -> Processor<I, R, E>
where
  I: 'static,
  R: 'static,
  E: 'static,
  F: Fn(I) -> Fut + Send + Sync + 'static,
  Fut: Future<Output = Result<R, E>> + Send + 'static,
{
  Arc::new(move |input| Box::pin(f(input)) as ProcessorFuture<R, E>)
}

/// What a finished task hands back to the driver.
///
/// The slot permit travels with the report so the slot is released only after the
/// driver has recorded the outcome.
pub(crate) struct TaskReport<R, E> {
  pub(crate) index: usize,
  pub(crate) attempts: u32,
  pub(crate) elapsed: Duration,
  pub(crate) outcome: Result<R, BatchError<E>>,
  pub(crate) permit: SlotPermit,
}
