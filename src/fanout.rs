use crate::context::Context;
use crate::error::{Error, Errors};
use crate::flight::Flight;
use crate::piper::Piper;
use crate::results::Results;
use crate::task::BoxedTask;

use std::any::Any;
use std::fmt;
use std::future::Future;
use std::panic;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering as AtomicOrdering};
use std::sync::{Arc, OnceLock};

use fibre::mpsc::{self, UnboundedAsyncReceiver};
use futures_intrusive::sync::ManualResetEvent;
use parking_lot::Mutex;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tracing::{debug, error, info_span, trace, Instrument};

lazy_static::lazy_static! {
  static ref NEXT_RUN_ID: AtomicU64 = AtomicU64::new(0);
}

/// A unit of work the fan-out scheduler can admit, skip and observe.
pub trait Job: Send + Sync + 'static {
  type Output: Clone + Default + Send + Sync + 'static;

  /// Runs the job, or joins a run already in progress, and resolves once it is done.
  fn execute(self: Arc<Self>, ctx: Context) -> impl Future<Output = ()> + Send + 'static;

  /// Called for a job the scheduler decided never to start.
  fn skip(&self);

  /// Called after the job's task panicked; must leave the job done.
  fn abandon(&self);

  /// `true` if the job body was claimed, by this scheduler or by anyone else.
  fn is_started(&self) -> bool;

  fn is_done(&self) -> bool;

  fn done(&self) -> impl Future<Output = ()> + Send + '_;

  fn error(&self) -> Option<Error>;

  fn value(&self) -> Option<Self::Output>;

  /// Builds a job from a boxed task, handing it the run context through `scope`.
  fn from_task(task: BoxedTask<Self::Output>, scope: &RunScope) -> Self;
}

/// The stop signal of a run, published for tasks built before the run existed.
#[derive(Clone, Default, Debug)]
pub struct RunScope {
  ctx: Arc<OnceLock<Context>>,
}

impl RunScope {
  pub fn new() -> Self {
    Self::default()
  }

  pub(crate) fn publish(&self, ctx: Context) {
    let _ = self.ctx.set(ctx);
  }

  /// The run's stop signal, or a background context if no run published one.
  pub fn context(&self) -> Context {
    self.ctx.get().cloned().unwrap_or_default()
  }
}

/// Counts failed jobs and trips the stop signal at the threshold.
struct ErrorThreshold {
  limit: usize,
  count: AtomicUsize,
}

impl ErrorThreshold {
  fn new(limit: usize) -> Self {
    Self {
      limit,
      count: AtomicUsize::new(0),
    }
  }

  fn record(&self, stop: &Context, run_id: u64, index: usize) {
    let errors = self.count.fetch_add(1, AtomicOrdering::AcqRel) + 1;
    if self.limit > 0 && errors >= self.limit {
      if !stop.is_cancelled() {
        debug!(run_id, index, errors, limit = self.limit, "Error threshold reached. Stopping admission.");
      }
      stop.cancel();
    } else {
      trace!(run_id, index, errors, "Job failed below error threshold.");
    }
  }
}

/// Holds the payload of the first job panic until a query re-raises it.
struct PanicSlot {
  payload: Mutex<Option<Box<dyn Any + Send>>>,
  raised: ManualResetEvent,
}

impl PanicSlot {
  fn new() -> Self {
    Self {
      payload: Mutex::new(None),
      raised: ManualResetEvent::new(false),
    }
  }

  fn store(&self, payload: Box<dyn Any + Send>) {
    let mut slot = self.payload.lock();
    if slot.is_none() {
      *slot = Some(payload);
    }
    drop(slot);
    self.raised.set();
  }

  fn is_raised(&self) -> bool {
    self.raised.is_set()
  }

  /// Resumes the stored panic. Later callers panic with a generic message.
  fn rethrow(&self) -> ! {
    let payload = self.payload.lock().take();
    match payload {
      Some(payload) => panic::resume_unwind(payload),
      None => panic!("a fan-out job panicked"),
    }
  }
}

/// An ordered collection of jobs scheduled under a concurrency bound.
///
/// Results are positional: index `i` always belongs to job `i`. Errors are
/// reported in completion order.
///
/// A job whose task panics stops admission like a tripped threshold, and the
/// panic is resumed in the caller of the next query or [`FanOut::tail`].
pub struct FanOut<J> {
  jobs: Arc<[Arc<J>]>,
  admitted: Arc<[AtomicBool]>,
  stop: OnceLock<Context>,
  closed: Arc<ManualResetEvent>,
  panic: Arc<PanicSlot>,
}

/// A fan-out over raw tasks.
pub type Pipers<R> = FanOut<Piper<R>>;

/// A fan-out over shared flights.
pub type Flipers<T> = FanOut<Flight<T>>;

impl<J: Job> FanOut<J> {
  /// A fan-out over shared jobs, e.g. flights other callers also hold.
  pub fn new<I>(jobs: I) -> Self
  where
    I: IntoIterator<Item = Arc<J>>,
  {
    let jobs: Arc<[Arc<J>]> = jobs.into_iter().collect();
    let admitted = (0..jobs.len()).map(|_| AtomicBool::new(false)).collect();
    Self {
      jobs,
      admitted,
      stop: OnceLock::new(),
      closed: Arc::new(ManualResetEvent::new(false)),
      panic: Arc::new(PanicSlot::new()),
    }
  }

  /// A fan-out that takes ownership of its jobs.
  pub fn from_jobs<I>(jobs: I) -> Self
  where
    I: IntoIterator<Item = J>,
  {
    Self::new(jobs.into_iter().map(Arc::new))
  }

  pub fn len(&self) -> usize {
    self.jobs.len()
  }

  pub fn is_empty(&self) -> bool {
    self.jobs.is_empty()
  }

  pub fn jobs(&self) -> &[Arc<J>] {
    &self.jobs
  }

  /// `true` once `run` has been called.
  pub fn is_scheduled(&self) -> bool {
    self.stop.get().is_some()
  }

  /// The stop signal of the run, once scheduled.
  pub fn stop_context(&self) -> Option<&Context> {
    self.stop.get()
  }

  /// Starts scheduling under `ctx`. See [`FanOut::start`].
  pub fn run(&self, ctx: &Context, concurrency: usize, error_limit: usize) -> bool {
    self.start(ctx.child(), concurrency, error_limit)
  }

  /// Starts scheduling with `stop` as the run's stop signal.
  ///
  /// With `concurrency == 0` or `concurrency >= len` every job is admitted at
  /// once; otherwise jobs are admitted in order as semaphore permits free up.
  /// Once `error_limit` jobs have failed (`0` disables the limit), or `stop`
  /// is cancelled from outside, no further job is admitted. Running jobs are
  /// never interrupted; they receive `stop` as their context.
  ///
  /// Only the first call schedules; later calls return `false`.
  pub(crate) fn start(&self, stop: Context, concurrency: usize, error_limit: usize) -> bool {
    if self.stop.set(stop.clone()).is_err() {
      trace!("Fan-out already scheduled; ignoring run request.");
      return false;
    }

    let run_id = NEXT_RUN_ID.fetch_add(1, AtomicOrdering::Relaxed);
    let threshold = Arc::new(ErrorThreshold::new(error_limit));
    let span = info_span!("fanout_run", run_id, jobs = self.jobs.len(), concurrency, error_limit);

    if concurrency == 0 || concurrency >= self.jobs.len() {
      let _entered = span.enter();
      debug!("Admitting every job at once.");
      for index in 0..self.jobs.len() {
        if stop.is_cancelled() {
          self.skip(index, run_id);
        } else {
          self.launch(index, None, &stop, &threshold, run_id);
        }
      }
      self.closed.set();
    } else {
      let admission = Admission {
        jobs: self.jobs.clone(),
        admitted: self.admitted.clone(),
        closed: self.closed.clone(),
        panic: self.panic.clone(),
        semaphore: Arc::new(Semaphore::new(concurrency)),
        stop,
        threshold,
        run_id,
      };
      tokio::spawn(admission.run().instrument(span));
    }
    true
  }

  fn launch(
    &self,
    index: usize,
    permit: Option<OwnedSemaphorePermit>,
    stop: &Context,
    threshold: &Arc<ErrorThreshold>,
    run_id: u64,
  ) {
    let launcher = Launcher {
      jobs: &self.jobs,
      admitted: &self.admitted,
      panic: &self.panic,
      stop,
      threshold,
      run_id,
    };
    launcher.launch(index, permit);
  }

  fn skip(&self, index: usize, run_id: u64) {
    trace!(run_id, index, "Skipping job; stop signal already fired.");
    self.jobs[index].skip();
  }

  fn was_admitted(&self, index: usize) -> bool {
    self.admitted[index].load(AtomicOrdering::Acquire) || self.jobs[index].is_started()
  }

  /// A channel that yields every job error in completion order.
  ///
  /// The channel disconnects once every job has either finished or been left
  /// out by the scheduler. Jobs of a fan-out that is never run are waited on
  /// indefinitely.
  pub fn errors_chan(&self) -> UnboundedAsyncReceiver<Error> {
    let (tx, rx) = mpsc::unbounded_async();
    for (index, job) in self.jobs.iter().enumerate() {
      let job = job.clone();
      let admitted = self.admitted.clone();
      let closed = self.closed.clone();
      let mut tx = tx.clone();
      tokio::spawn(async move {
        tokio::select! {
          biased;
          _ = job.done() => {}
          _ = closed.wait() => {
            let admitted = admitted[index].load(AtomicOrdering::Acquire) || job.is_started();
            if !admitted && !job.is_done() {
              return;
            }
            job.done().await;
          }
        }
        if let Some(err) = job.error() {
          let _ = tx.send(err).await;
        }
      });
    }
    rx
  }

  /// Collects up to `limit` errors (`0` collects all) in completion order.
  ///
  /// Returns early when `ctx` is cancelled, with the context's error appended as
  /// the final entry. An empty collection means no job failed.
  ///
  /// # Panics
  ///
  /// Resumes the panic of a job whose task panicked.
  pub async fn first_n_errors(&self, ctx: &Context, limit: usize) -> Errors {
    let mut rx = self.errors_chan();
    let mut errors = Errors::with_capacity(limit.min(self.jobs.len()) + 1);
    loop {
      tokio::select! {
        biased;
        _ = self.panic.raised.wait() => self.panic.rethrow(),
        received = rx.recv() => match received {
          Ok(err) => errors.push(err),
          Err(_) => {
            if self.panic.is_raised() {
              self.panic.rethrow();
            }
            return errors;
          }
        },
        _ = ctx.cancelled() => {
          errors.push(ctx.err().unwrap_or(Error::Canceled));
          return errors;
        }
      }
      if limit > 0 && errors.len() >= limit {
        return errors;
      }
    }
  }

  /// The first error to complete, or `ctx`'s error if it is cancelled first.
  pub async fn first_error(&self, ctx: &Context) -> Option<Error> {
    self.first_n_errors(ctx, 1).await.into_iter().next()
  }

  pub async fn errors_all(&self, ctx: &Context) -> Errors {
    self.first_n_errors(ctx, 0).await
  }

  /// A positional snapshot: completed values, `Default` everywhere else.
  pub fn results(&self) -> Results<J::Output> {
    self
      .jobs
      .iter()
      .map(|job| job.value().unwrap_or_default())
      .collect()
  }

  /// Waits until admission has closed and every admitted job has finished.
  ///
  /// Use after an early-returning query to let running work drain before a
  /// final `results()` read. Returns immediately if the fan-out never ran.
  /// Resumes the panic of a job whose task panicked.
  pub async fn tail(&self) {
    if !self.is_scheduled() {
      return;
    }
    self.closed.wait().await;
    for (index, job) in self.jobs.iter().enumerate() {
      if self.was_admitted(index) {
        job.done().await;
      }
    }
    if self.panic.is_raised() {
      self.panic.rethrow();
    }
  }
}

impl<J> fmt::Debug for FanOut<J> {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    let admitted = self
      .admitted
      .iter()
      .filter(|flag| flag.load(AtomicOrdering::Relaxed))
      .count();
    f.debug_struct("FanOut")
      .field("jobs", &self.jobs.len())
      .field("admitted", &admitted)
      .field("scheduled", &self.stop.get().is_some())
      .field("admission_closed", &self.closed.is_set())
      .field("panicked", &self.panic.is_raised())
      .finish()
  }
}

struct Admission<J> {
  jobs: Arc<[Arc<J>]>,
  admitted: Arc<[AtomicBool]>,
  closed: Arc<ManualResetEvent>,
  panic: Arc<PanicSlot>,
  semaphore: Arc<Semaphore>,
  stop: Context,
  threshold: Arc<ErrorThreshold>,
  run_id: u64,
}

impl<J: Job> Admission<J> {
  async fn run(self) {
    debug!(permits = self.semaphore.available_permits(), "Admission loop started.");
    let mut next = 0;
    while next < self.jobs.len() {
      let permit = tokio::select! {
        biased;
        _ = self.stop.cancelled() => None,
        acquired = self.semaphore.clone().acquire_owned() => acquired.ok(),
      };
      let Some(permit) = permit else {
        break;
      };
      let launcher = Launcher {
        jobs: &self.jobs,
        admitted: &self.admitted,
        panic: &self.panic,
        stop: &self.stop,
        threshold: &self.threshold,
        run_id: self.run_id,
      };
      launcher.launch(next, Some(permit));
      next += 1;
    }

    if next < self.jobs.len() {
      debug!(admitted = next, skipped = self.jobs.len() - next, "Stop signal fired. Skipping remaining jobs.");
    }
    for job in &self.jobs[next..] {
      job.skip();
    }
    self.closed.set();
    trace!("Admission loop finished.");
  }
}

struct Launcher<'a, J> {
  jobs: &'a Arc<[Arc<J>]>,
  admitted: &'a Arc<[AtomicBool]>,
  panic: &'a Arc<PanicSlot>,
  stop: &'a Context,
  threshold: &'a Arc<ErrorThreshold>,
  run_id: u64,
}

impl<J: Job> Launcher<'_, J> {
  /// Spawns job `index`, holding `permit` until it has finished.
  ///
  /// The job body runs in its own Tokio task so a panic surfaces as a
  /// `JoinError` here instead of leaving the job undone.
  fn launch(&self, index: usize, permit: Option<OwnedSemaphorePermit>) {
    self.admitted[index].store(true, AtomicOrdering::Release);
    let job = self.jobs[index].clone();
    let stop = self.stop.clone();
    let threshold = self.threshold.clone();
    let panics = self.panic.clone();
    let run_id = self.run_id;
    trace!(run_id, index, "Admitting job.");

    tokio::spawn(async move {
      let _permit = permit;
      let body = job.clone().execute(stop.clone());
      let joined = tokio::spawn(body.instrument(info_span!("fanout_job", run_id, index))).await;
      match joined {
        Ok(()) => {
          if job.error().is_some() {
            threshold.record(&stop, run_id, index);
          }
        }
        Err(join_err) if join_err.is_panic() => {
          error!(run_id, index, "Job panicked. Stopping admission.");
          panics.store(join_err.into_panic());
          stop.cancel();
          job.abandon();
        }
        Err(_) => {
          debug!(run_id, index, "Job task cancelled by runtime shutdown.");
          job.abandon();
        }
      }
      // The permit drops here, after any stop signal is visible to admission.
    });
  }
}
