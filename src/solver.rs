use crate::context::Context;
use crate::error::{Error, Errors};
use crate::fanout::{FanOut, Job, RunScope};
use crate::flight::Flight;
use crate::piper::Piper;
use crate::results::Results;
use crate::task;

use std::fmt;
use std::future::Future;
use std::sync::{Arc, OnceLock};

use parking_lot::Mutex;
use tracing::{debug, warn};

/// Builder and query surface over a fan-out of jobs.
///
/// Jobs are collected with the `add*` methods, then the first terminal query
/// (`first_error`, `first_n_errors`, `errors_all`, `resolve`) schedules them
/// exactly once under the configured concurrency bound and context. Every
/// query derives its own child context and cancels it on return, which stops
/// admission of work nobody is waiting for any more.
pub struct Solver<J: Job> {
  pending: Mutex<Vec<Arc<J>>>,
  fanout: OnceLock<FanOut<J>>,
  scope: RunScope,
  concurrency: usize,
  context: Option<Context>,
}

/// A solver over raw tasks.
pub type PiperSolver<R> = Solver<Piper<R>>;

/// A solver over flights.
pub type FliperSolver<T> = Solver<Flight<T>>;

impl<J: Job> Solver<J> {
  pub fn new() -> Self {
    Self {
      pending: Mutex::new(Vec::new()),
      fanout: OnceLock::new(),
      scope: RunScope::new(),
      concurrency: 0,
      context: None,
    }
  }

  /// Limits how many jobs run at once; `0` means unbounded.
  pub fn concurrency(mut self, concurrency: usize) -> Self {
    self.concurrency = concurrency;
    self
  }

  /// Sets the base context; defaults to [`Context::background`].
  pub fn context(mut self, ctx: Context) -> Self {
    self.context = Some(ctx);
    self
  }

  /// Adds a pre-built job.
  ///
  /// Jobs must all be added before the first terminal query; later additions
  /// are never scheduled.
  pub fn add(&self, job: impl Into<Arc<J>>) -> &Self {
    if self.fanout.get().is_some() {
      warn!("Solver already scheduled; job added after the first query is ignored.");
      return self;
    }
    self.pending.lock().push(job.into());
    self
  }

  /// Adds a task that ignores cancellation.
  pub fn add_func<F, Fut>(&self, f: F) -> &Self
  where
    F: FnOnce() -> Fut + Send + 'static,
    Fut: Future<Output = Result<J::Output, Error>> + Send + 'static,
  {
    self.add(J::from_task(task::boxed(f), &self.scope))
  }

  /// Adds a task that receives the run's stop signal.
  pub fn add_func_ctx<F, Fut>(&self, f: F) -> &Self
  where
    F: FnOnce(Context) -> Fut + Send + 'static,
    Fut: Future<Output = Result<J::Output, Error>> + Send + 'static,
  {
    self.add(J::from_task(task::boxed_with_context(f), &self.scope))
  }

  pub fn from_funcs<I, F, Fut>(funcs: I) -> Self
  where
    I: IntoIterator<Item = F>,
    F: FnOnce() -> Fut + Send + 'static,
    Fut: Future<Output = Result<J::Output, Error>> + Send + 'static,
  {
    let solver = Self::new();
    for f in funcs {
      solver.add_func(f);
    }
    solver
  }

  pub fn from_funcs_ctx<I, F, Fut>(funcs: I) -> Self
  where
    I: IntoIterator<Item = F>,
    F: FnOnce(Context) -> Fut + Send + 'static,
    Fut: Future<Output = Result<J::Output, Error>> + Send + 'static,
  {
    let solver = Self::new();
    for f in funcs {
      solver.add_func_ctx(f);
    }
    solver
  }

  /// One task per argument: task `i` runs `f(i, args[i])`.
  pub fn from_args<A, F, Fut>(args: impl IntoIterator<Item = A>, f: F) -> Self
  where
    A: Send + 'static,
    F: Fn(usize, A) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<J::Output, Error>> + Send + 'static,
  {
    let f = Arc::new(f);
    let solver = Self::new();
    for (index, arg) in args.into_iter().enumerate() {
      let f = f.clone();
      solver.add_func(move || f(index, arg));
    }
    solver
  }

  /// Like [`Solver::from_args`], with the run's stop signal as first argument.
  pub fn from_args_ctx<A, F, Fut>(args: impl IntoIterator<Item = A>, f: F) -> Self
  where
    A: Send + 'static,
    F: Fn(Context, usize, A) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<J::Output, Error>> + Send + 'static,
  {
    let f = Arc::new(f);
    let solver = Self::new();
    for (index, arg) in args.into_iter().enumerate() {
      let f = f.clone();
      solver.add_func_ctx(move |ctx| f(ctx, index, arg));
    }
    solver
  }

  /// Number of jobs added so far.
  pub fn len(&self) -> usize {
    match self.fanout.get() {
      Some(fanout) => fanout.len(),
      None => self.pending.lock().len(),
    }
  }

  pub fn is_empty(&self) -> bool {
    self.len() == 0
  }

  fn query_context(&self) -> Context {
    self.context.clone().unwrap_or_default().child()
  }

  /// Schedules the collected jobs on the first call, under `query`.
  fn schedule(&self, query: &Context, error_limit: usize) -> &FanOut<J> {
    self.fanout.get_or_init(|| {
      let jobs = std::mem::take(&mut *self.pending.lock());
      debug!(jobs = jobs.len(), concurrency = self.concurrency, error_limit, "Solver scheduling jobs.");
      let fanout = FanOut::new(jobs);
      let stop = query.child();
      self.scope.publish(stop.clone());
      fanout.start(stop, self.concurrency, error_limit);
      fanout
    })
  }

  /// Runs until the first error, or until the context is cancelled.
  pub async fn first_error(&self) -> Option<Error> {
    let query = self.query_context().guard();
    let fanout = self.schedule(query.context(), 1);
    fanout.first_error(query.context()).await
  }

  /// Runs until `n` errors have been observed (`0` means all of them).
  pub async fn first_n_errors(&self, n: usize) -> Errors {
    let query = self.query_context().guard();
    let fanout = self.schedule(query.context(), n);
    fanout.first_n_errors(query.context(), n).await
  }

  /// Runs every job and collects all errors, stopping only on cancellation.
  pub async fn errors_all(&self) -> Errors {
    self.first_n_errors(0).await
  }

  /// A non-blocking positional snapshot of the results.
  pub fn results(&self) -> Results<J::Output> {
    match self.fanout.get() {
      Some(fanout) => fanout.results(),
      None => {
        let pending = self.pending.lock().len();
        (0..pending).map(|_| J::Output::default()).collect()
      }
    }
  }

  /// Runs until the first error, then returns the snapshot alongside it.
  pub async fn resolve(&self) -> (Results<J::Output>, Option<Error>) {
    let err = self.first_error().await;
    (self.results(), err)
  }

  /// Waits for every admitted job to finish. See [`FanOut::tail`].
  pub async fn tail(&self) {
    if let Some(fanout) = self.fanout.get() {
      fanout.tail().await;
    }
  }
}

impl<J: Job> Default for Solver<J> {
  fn default() -> Self {
    Self::new()
  }
}

impl<J: Job> fmt::Debug for Solver<J> {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.debug_struct("Solver")
      .field("jobs", &self.len())
      .field("concurrency", &self.concurrency)
      .field("scheduled", &self.fanout.get().is_some())
      .field("context", &self.context)
      .finish()
  }
}
