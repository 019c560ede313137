//! Plain fan-out without concurrency limits or error handling: spawn one Tokio
//! task per function and collect every result in input order.

use std::future::Future;
use std::panic;

use tokio::task::JoinHandle;

/// A spawned computation whose result is collected later.
#[derive(Debug)]
pub struct Pip<R> {
  handle: JoinHandle<R>,
}

impl<R: Send + 'static> Pip<R> {
  /// Waits for the result, resuming the task's panic if it panicked.
  pub async fn get(self) -> R {
    match self.handle.await {
      Ok(value) => value,
      Err(err) if err.is_panic() => panic::resume_unwind(err.into_panic()),
      Err(err) => panic!("pip task was aborted: {}", err),
    }
  }
}

pub fn spawn<R, F, Fut>(f: F) -> Pip<R>
where
  R: Send + 'static,
  F: FnOnce() -> Fut + Send + 'static,
  Fut: Future<Output = R> + Send + 'static,
{
  Pip {
    handle: tokio::spawn(async move { f().await }),
  }
}

/// Awaits every pip in order.
pub async fn collect<R: Send + 'static>(pips: impl IntoIterator<Item = Pip<R>>) -> Vec<R> {
  let mut results = Vec::new();
  for pip in pips {
    results.push(pip.get().await);
  }
  results
}

pub async fn from_funcs<R, I, F, Fut>(funcs: I) -> Vec<R>
where
  R: Send + 'static,
  I: IntoIterator<Item = F>,
  F: FnOnce() -> Fut + Send + 'static,
  Fut: Future<Output = R> + Send + 'static,
{
  let pips: Vec<Pip<R>> = funcs.into_iter().map(spawn).collect();
  collect(pips).await
}

/// Runs `f(i, args[i])` for every argument concurrently.
pub async fn from_args<R, A, F, Fut>(args: impl IntoIterator<Item = A>, f: F) -> Vec<R>
where
  R: Send + 'static,
  A: Send + 'static,
  F: Fn(usize, A) -> Fut,
  Fut: Future<Output = R> + Send + 'static,
{
  let pips: Vec<Pip<R>> = args
    .into_iter()
    .enumerate()
    .map(|(index, arg)| Pip {
      handle: tokio::spawn(f(index, arg)),
    })
    .collect();
  collect(pips).await
}
