use crate::context::Context;
use crate::error::Error;

use std::any::Any;
use std::future::Future;
use std::sync::{Arc, OnceLock};

use futures::future::BoxFuture;
use futures::FutureExt;

/// The future a task resolves to.
pub type TaskFuture<R> = BoxFuture<'static, Result<R, Error>>;

/// A type-erased, cancellation-aware task body.
pub type BoxedTask<R> = Box<dyn FnOnce(Context) -> TaskFuture<R> + Send + 'static>;

/// Result type for solvers that mix heterogeneous tasks, see [`capture`].
pub type AnyValue = Option<Arc<dyn Any + Send + Sync>>;

/// Boxes a task that does not look at its cancellation context.
pub fn boxed<R, F, Fut>(f: F) -> BoxedTask<R>
where
  F: FnOnce() -> Fut + Send + 'static,
  Fut: Future<Output = Result<R, Error>> + Send + 'static,
{
  Box::new(move |_ctx: Context| f().boxed())
}

/// Boxes a task that receives the scheduler's cancellation context.
pub fn boxed_with_context<R, F, Fut>(f: F) -> BoxedTask<R>
where
  F: FnOnce(Context) -> Fut + Send + 'static,
  Fut: Future<Output = Result<R, Error>> + Send + 'static,
{
  Box::new(move |ctx: Context| f(ctx).boxed())
}

/// A write-once cell a task stores its typed result into.
///
/// Clones share the same cell, so the caller keeps one and hands one to [`capture`].
#[derive(Debug)]
pub struct Capture<T> {
  cell: Arc<OnceLock<T>>,
}

impl<T> Capture<T> {
  pub fn new() -> Self {
    Self { cell: Arc::new(OnceLock::new()) }
  }

  /// The captured value, once the task has succeeded.
  pub fn get(&self) -> Option<&T> {
    self.cell.get()
  }
}

impl<T> Default for Capture<T> {
  fn default() -> Self {
    Self::new()
  }
}

impl<T> Clone for Capture<T> {
  fn clone(&self) -> Self {
    Self { cell: self.cell.clone() }
  }
}

/// Wraps `f` so that its successful value is also written into `target`.
///
/// The returned task yields the value behind [`AnyValue`] so tasks with
/// different result types can share one solver, while callers read the typed
/// value from their own `Capture` instead of downcasting.
pub fn capture<T, F, Fut>(
  target: &Capture<T>,
  f: F,
) -> impl FnOnce() -> BoxFuture<'static, Result<AnyValue, Error>> + Send + 'static
where
  T: Clone + Send + Sync + 'static,
  F: FnOnce() -> Fut + Send + 'static,
  Fut: Future<Output = Result<T, Error>> + Send + 'static,
{
  let target = target.clone();
  move || {
    async move {
      let value = f().await?;
      let _ = target.cell.set(value.clone());
      let erased: Arc<dyn Any + Send + Sync> = Arc::new(value);
      Ok(Some(erased))
    }
    .boxed()
  }
}
