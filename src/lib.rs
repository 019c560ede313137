//! A Tokio-based fan-out scheduler for ordered collections of fallible tasks,
//! with bounded concurrency, error thresholds and cooperative cancellation,
//! plus run-once singleflight futures.

mod context;
mod error;
mod fanout;
mod flight;
mod piper;
pub mod pips;
mod results;
mod solver;
mod task;

pub use context::{Context, ContextGuard};
pub use error::{Error, Errors};
pub use fanout::{FanOut, Flipers, Job, Pipers, RunScope};
pub use flight::Flight;
pub use piper::Piper;
pub use results::{flatten, map, Results};
pub use solver::{FliperSolver, PiperSolver, Solver};
pub use task::{boxed, boxed_with_context, capture, AnyValue, BoxedTask, Capture, TaskFuture};

/// Builds a [`FliperSolver`] with one task per function.
pub fn from_funcs<T, I, F, Fut>(funcs: I) -> FliperSolver<T>
where
  T: Clone + Default + Send + Sync + 'static,
  I: IntoIterator<Item = F>,
  F: FnOnce() -> Fut + Send + 'static,
  Fut: std::future::Future<Output = Result<T, Error>> + Send + 'static,
{
  FliperSolver::from_funcs(funcs)
}

/// Builds a [`FliperSolver`] with one task per argument: task `i` runs `f(i, args[i])`.
pub fn from_args<T, A, F, Fut>(args: impl IntoIterator<Item = A>, f: F) -> FliperSolver<T>
where
  T: Clone + Default + Send + Sync + 'static,
  A: Send + 'static,
  F: Fn(usize, A) -> Fut + Send + Sync + 'static,
  Fut: std::future::Future<Output = Result<T, Error>> + Send + 'static,
{
  FliperSolver::from_args(args, f)
}

/// Like [`from_funcs`], with each function receiving the run's stop signal.
pub fn from_funcs_ctx<T, I, F, Fut>(funcs: I) -> FliperSolver<T>
where
  T: Clone + Default + Send + Sync + 'static,
  I: IntoIterator<Item = F>,
  F: FnOnce(Context) -> Fut + Send + 'static,
  Fut: std::future::Future<Output = Result<T, Error>> + Send + 'static,
{
  FliperSolver::from_funcs_ctx(funcs)
}

/// Like [`from_args`], with the run's stop signal as first argument.
pub fn from_args_ctx<T, A, F, Fut>(args: impl IntoIterator<Item = A>, f: F) -> FliperSolver<T>
where
  T: Clone + Default + Send + Sync + 'static,
  A: Send + 'static,
  F: Fn(Context, usize, A) -> Fut + Send + Sync + 'static,
  Fut: std::future::Future<Output = Result<T, Error>> + Send + 'static,
{
  FliperSolver::from_args_ctx(args, f)
}
