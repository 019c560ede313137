use crate::context::Context;
use crate::error::Error;
use crate::fanout::{Job, RunScope};
use crate::task::{self, BoxedTask};

use std::fmt;
use std::future::Future;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::{Arc, OnceLock};

use futures_intrusive::sync::ManualResetEvent;
use parking_lot::Mutex;

const PENDING: u8 = 0;
const RUNNING: u8 = 1;
const COMPLETED: u8 = 2;
const SKIPPED: u8 = 3;

/// One scheduled task together with its single delivery slot.
///
/// A piper moves from pending to running to completed exactly once, or from
/// pending straight to skipped when the scheduler stops before admitting it.
/// Either way the done signal fires, so readers never block on a piper that
/// will never run: a skipped piper simply has no value and no error.
pub struct Piper<R> {
  state: AtomicU8,
  task: Mutex<Option<BoxedTask<R>>>,
  outcome: OnceLock<Result<R, Error>>,
  done: ManualResetEvent,
}

impl<R> Piper<R>
where
  R: Clone + Default + Send + Sync + 'static,
{
  /// A piper over a task that does not look at its cancellation context.
  pub fn new<F, Fut>(f: F) -> Self
  where
    F: FnOnce() -> Fut + Send + 'static,
    Fut: Future<Output = Result<R, Error>> + Send + 'static,
  {
    Self::from_boxed(task::boxed(f))
  }

  /// A piper over a task that receives the scheduler's stop signal.
  pub fn with_context<F, Fut>(f: F) -> Self
  where
    F: FnOnce(Context) -> Fut + Send + 'static,
    Fut: Future<Output = Result<R, Error>> + Send + 'static,
  {
    Self::from_boxed(task::boxed_with_context(f))
  }

  pub fn from_boxed(task: BoxedTask<R>) -> Self {
    Self {
      state: AtomicU8::new(PENDING),
      task: Mutex::new(Some(task)),
      outcome: OnceLock::new(),
      done: ManualResetEvent::new(false),
    }
  }

  /// `true` once the task body has been claimed for execution.
  pub fn started(&self) -> bool {
    matches!(self.state.load(Ordering::Acquire), RUNNING | COMPLETED)
  }

  /// `true` if the scheduler closed this piper without running it.
  pub fn skipped(&self) -> bool {
    self.state.load(Ordering::Acquire) == SKIPPED
  }

  pub fn is_done(&self) -> bool {
    self.done.is_set()
  }

  /// Resolves once the piper has completed or been skipped.
  pub async fn done(&self) {
    self.done.wait().await
  }

  /// The completed value, if the task finished successfully.
  pub fn value(&self) -> Option<R> {
    match self.outcome.get() {
      Some(Ok(value)) => Some(value.clone()),
      _ => None,
    }
  }

  /// The error the task finished with, if any.
  pub fn error(&self) -> Option<Error> {
    match self.outcome.get() {
      Some(Err(err)) => Some(err.clone()),
      _ => None,
    }
  }

  /// Runs the task body if nobody has claimed it yet, then waits for completion.
  pub(crate) async fn run_task(&self, ctx: Context) {
    if self
      .state
      .compare_exchange(PENDING, RUNNING, Ordering::AcqRel, Ordering::Acquire)
      .is_err()
    {
      self.done.wait().await;
      return;
    }

    let task = self.task.lock().take();
    if let Some(task) = task {
      let _ = self.outcome.set(task(ctx).await);
    }
    self.state.store(COMPLETED, Ordering::Release);
    self.done.set();
  }

  /// Closes a piper that was never admitted.
  pub(crate) fn close_skipped(&self) -> bool {
    if self
      .state
      .compare_exchange(PENDING, SKIPPED, Ordering::AcqRel, Ordering::Acquire)
      .is_err()
    {
      return false;
    }
    drop(self.task.lock().take());
    self.done.set();
    true
  }
}

impl<R> Job for Piper<R>
where
  R: Clone + Default + Send + Sync + 'static,
{
  type Output = R;

  fn execute(self: Arc<Self>, ctx: Context) -> impl Future<Output = ()> + Send + 'static {
    async move { self.run_task(ctx).await }
  }

  fn skip(&self) {
    self.close_skipped();
  }

  fn abandon(&self) {
    self.state.store(COMPLETED, Ordering::Release);
    self.done.set();
  }

  fn is_started(&self) -> bool {
    self.started()
  }

  fn is_done(&self) -> bool {
    Piper::is_done(self)
  }

  fn done(&self) -> impl Future<Output = ()> + Send + '_ {
    self.done.wait()
  }

  fn error(&self) -> Option<Error> {
    Piper::error(self)
  }

  fn value(&self) -> Option<R> {
    Piper::value(self)
  }

  fn from_task(task: BoxedTask<R>, _scope: &RunScope) -> Self {
    Self::from_boxed(task)
  }
}

impl<R> fmt::Debug for Piper<R> {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    let state = match self.state.load(Ordering::Acquire) {
      PENDING => "pending",
      RUNNING => "running",
      COMPLETED => "completed",
      _ => "skipped",
    };
    f.debug_struct("Piper")
      .field("state", &state)
      .field("done", &self.done.is_set())
      .finish_non_exhaustive()
  }
}
