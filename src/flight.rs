use crate::context::Context;
use crate::error::Error;
use crate::fanout::{Job, RunScope};
use crate::task::BoxedTask;

use std::fmt;
use std::future::Future;
use std::sync::atomic::{AtomicU64, AtomicU8, Ordering};
use std::sync::{Arc, OnceLock};

use futures::future::BoxFuture;
use futures::FutureExt;
use futures_intrusive::sync::ManualResetEvent;
use parking_lot::Mutex;
use tracing::{debug, trace};

const IDLE: u8 = 0;
const RUNNING: u8 = 1;
const DONE: u8 = 2;
const CANCELED: u8 = 3;

type FlightTask<T> = Box<dyn FnOnce() -> BoxFuture<'static, Result<T, Error>> + Send + 'static>;

/// A memoized future that runs its task at most once.
///
/// Whichever of [`run`](Flight::run), [`run_async`](Flight::run_async) or
/// [`cancel`](Flight::cancel) claims the flight first decides its outcome; every
/// later attempt is a no-op. Any number of callers may [`wait`](Flight::wait)
/// on the stored outcome, before or after it is produced.
///
/// A claimed flight always lands: if the running future is dropped or its task
/// panics before producing an outcome, waiters observe [`Error::FlightCanceled`].
pub struct Flight<T> {
  state: AtomicU8,
  task: Mutex<Option<FlightTask<T>>>,
  outcome: OnceLock<Result<T, Error>>,
  done: ManualResetEvent,
  hits: AtomicU64,
}

impl<T> Flight<T>
where
  T: Clone + Send + Sync + 'static,
{
  pub fn new<F, Fut>(f: F) -> Arc<Self>
  where
    F: FnOnce() -> Fut + Send + 'static,
    Fut: Future<Output = Result<T, Error>> + Send + 'static,
  {
    Arc::new(Self::build(f))
  }

  fn build<F, Fut>(f: F) -> Self
  where
    F: FnOnce() -> Fut + Send + 'static,
    Fut: Future<Output = Result<T, Error>> + Send + 'static,
  {
    Self {
      state: AtomicU8::new(IDLE),
      task: Mutex::new(Some(Box::new(move || f().boxed()))),
      outcome: OnceLock::new(),
      done: ManualResetEvent::new(false),
      hits: AtomicU64::new(0),
    }
  }

  fn claim(&self, next: u8) -> bool {
    self
      .state
      .compare_exchange(IDLE, next, Ordering::AcqRel, Ordering::Acquire)
      .is_ok()
  }

  async fn execute(&self) {
    let landing = Landing { flight: self };
    let task = self.task.lock().take();
    let outcome = match task {
      Some(task) => task().await,
      None => Err(Error::FlightCanceled),
    };
    let _ = self.outcome.set(outcome);
    drop(landing);
    trace!("Flight finished.");
  }

  /// Runs the task in the calling task if nobody has claimed the flight yet.
  ///
  /// Returns `true` only for the call that executed the task; in that case
  /// the outcome is already stored when this returns.
  pub async fn run(&self) -> bool {
    if !self.claim(RUNNING) {
      return false;
    }
    self.execute().await;
    true
  }

  /// Spawns the task onto the Tokio runtime if nobody has claimed the flight yet.
  ///
  /// Returns `true` only for the call that spawned the task.
  pub fn run_async(self: &Arc<Self>) -> bool {
    if !self.claim(RUNNING) {
      return false;
    }
    let this = Arc::clone(self);
    tokio::spawn(async move { this.execute().await });
    true
  }

  /// Cancels the flight if it has not been claimed yet.
  ///
  /// On success the task is dropped without running and every waiter observes
  /// [`Error::FlightCanceled`]. A flight that already started cannot be cancelled.
  pub fn cancel(&self) -> bool {
    if !self.claim(CANCELED) {
      return false;
    }
    drop(self.task.lock().take());
    let _ = self.outcome.set(Err(Error::FlightCanceled));
    self.done.set();
    debug!("Flight canceled before start.");
    true
  }

  /// Waits for the outcome; counts one hit per call.
  pub async fn wait(&self) -> Result<T, Error> {
    self.done.wait().await;
    self.hits.fetch_add(1, Ordering::Relaxed);
    self.stored()
  }

  /// Waits for the outcome and passes it to `handler` in the calling task.
  pub async fn on_done<U, F>(&self, handler: F) -> U
  where
    F: FnOnce(Result<T, Error>) -> U,
  {
    self.done.wait().await;
    handler(self.stored())
  }

  /// Resolves once the flight has finished or been cancelled.
  pub async fn done(&self) {
    self.done.wait().await
  }

  pub fn is_done(&self) -> bool {
    self.done.is_set()
  }

  /// The outcome if the flight is done, without waiting and without counting a hit.
  pub fn peek(&self) -> Option<Result<T, Error>> {
    if self.done.is_set() {
      self.outcome.get().cloned()
    } else {
      None
    }
  }

  fn stored(&self) -> Result<T, Error> {
    match self.outcome.get() {
      Some(outcome) => outcome.clone(),
      None => unreachable!("flight signalled done before storing its outcome"),
    }
  }

  pub fn hits(&self) -> u64 {
    self.hits.load(Ordering::Relaxed)
  }

  /// `true` once `run` or `run_async` claimed the flight.
  pub fn started(&self) -> bool {
    matches!(self.state.load(Ordering::Acquire), RUNNING | DONE)
  }

  /// `true` if `cancel` claimed the flight before it started.
  pub fn canceled(&self) -> bool {
    self.state.load(Ordering::Acquire) == CANCELED
  }

  /// A flight that runs this one and feeds its value to `f`.
  ///
  /// An error from this flight is passed through unchanged and `f` is never called.
  pub fn then<U, F, Fut>(self: &Arc<Self>, f: F) -> Arc<Flight<U>>
  where
    U: Clone + Send + Sync + 'static,
    F: FnOnce(T) -> Fut + Send + 'static,
    Fut: Future<Output = Result<U, Error>> + Send + 'static,
  {
    let base = Arc::clone(self);
    Flight::new(move || async move {
      base.run().await;
      let value = base.wait().await?;
      f(value).await
    })
  }

  /// A flight that runs this one and lets `handler` recover from its error.
  ///
  /// A successful value is passed through and `handler` is never called.
  pub fn catch<F, Fut>(self: &Arc<Self>, handler: F) -> Arc<Flight<T>>
  where
    F: FnOnce(Error) -> Fut + Send + 'static,
    Fut: Future<Output = Result<T, Error>> + Send + 'static,
  {
    let base = Arc::clone(self);
    Flight::new(move || async move {
      base.run().await;
      match base.wait().await {
        Ok(value) => Ok(value),
        Err(err) => handler(err).await,
      }
    })
  }

  /// A flight that runs this one and hands the whole outcome to `handler`.
  pub fn handle<U, F, Fut>(self: &Arc<Self>, handler: F) -> Arc<Flight<U>>
  where
    U: Clone + Send + Sync + 'static,
    F: FnOnce(Result<T, Error>) -> Fut + Send + 'static,
    Fut: Future<Output = Result<U, Error>> + Send + 'static,
  {
    let base = Arc::clone(self);
    Flight::new(move || async move {
      base.run().await;
      let outcome = base.wait().await;
      handler(outcome).await
    })
  }
}

impl<T> Flight<T> {
  /// Marks a claimed flight done, storing `FlightCanceled` if it has no outcome yet.
  fn land(&self) {
    if self.outcome.set(Err(Error::FlightCanceled)).is_ok() {
      debug!("Flight abandoned before its task finished.");
    }
    self.state.store(DONE, Ordering::Release);
    self.done.set();
  }
}

/// Lands the flight when the executing future completes, is dropped or unwinds.
struct Landing<'a, T> {
  flight: &'a Flight<T>,
}

impl<T> Drop for Landing<'_, T> {
  fn drop(&mut self) {
    self.flight.land();
  }
}

impl<T> Job for Flight<T>
where
  T: Clone + Default + Send + Sync + 'static,
{
  type Output = T;

  fn execute(self: Arc<Self>, _ctx: Context) -> impl Future<Output = ()> + Send + 'static {
    async move {
      self.run().await;
      self.done.wait().await;
    }
  }

  // Flights may be shared with other holders, so an unadmitted flight stays idle.
  fn skip(&self) {}

  fn abandon(&self) {
    if self.started() {
      self.land();
    }
  }

  fn is_started(&self) -> bool {
    self.started()
  }

  fn is_done(&self) -> bool {
    Flight::is_done(self)
  }

  fn done(&self) -> impl Future<Output = ()> + Send + '_ {
    self.done.wait()
  }

  fn error(&self) -> Option<Error> {
    match self.peek() {
      Some(Err(err)) => Some(err),
      _ => None,
    }
  }

  fn value(&self) -> Option<T> {
    match self.peek() {
      Some(Ok(value)) => Some(value),
      _ => None,
    }
  }

  fn from_task(task: BoxedTask<T>, scope: &RunScope) -> Self {
    let scope = scope.clone();
    Self::build(move || task(scope.context()))
  }
}

impl<T> fmt::Debug for Flight<T> {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    let state = match self.state.load(Ordering::Acquire) {
      IDLE => "idle",
      RUNNING => "running",
      DONE => "done",
      _ => "canceled",
    };
    f.debug_struct("Flight")
      .field("state", &state)
      .field("hits", &self.hits.load(Ordering::Relaxed))
      .finish_non_exhaustive()
  }
}
