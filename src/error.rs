use std::fmt;
use std::sync::Arc;

use thiserror::Error;

/// Errors produced by tasks, contexts and flights.
///
/// `Error` is cheap to clone: a flight hands the same stored error to every waiter.
#[derive(Error, Debug, Clone)]
pub enum Error {
  #[error("context canceled")]
  Canceled,

  #[error("context deadline exceeded")]
  DeadlineExceeded,

  #[error("flight: canceled")]
  FlightCanceled,

  #[error("{0}")]
  Task(Arc<dyn std::error::Error + Send + Sync + 'static>),

  #[error("{0}")]
  Joined(Errors),
}

#[derive(Debug)]
struct Message(String);

impl fmt::Display for Message {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.write_str(&self.0)
  }
}

impl std::error::Error for Message {}

impl Error {
  /// Wraps an arbitrary error returned by a task body.
  pub fn task<E>(err: E) -> Self
  where
    E: std::error::Error + Send + Sync + 'static,
  {
    Error::Task(Arc::new(err))
  }

  /// A task error carrying only a message.
  pub fn msg(message: impl Into<String>) -> Self {
    Error::Task(Arc::new(Message(message.into())))
  }

  /// `true` for errors that report a cancelled context rather than a failed task.
  pub fn is_cancellation(&self) -> bool {
    matches!(self, Error::Canceled | Error::DeadlineExceeded)
  }
}

impl PartialEq for Error {
  fn eq(&self, other: &Self) -> bool {
    match (self, other) {
      (Error::Canceled, Error::Canceled) => true,
      (Error::DeadlineExceeded, Error::DeadlineExceeded) => true,
      (Error::FlightCanceled, Error::FlightCanceled) => true,
      (Error::Task(a), Error::Task(b)) => Arc::ptr_eq(a, b),
      (Error::Joined(a), Error::Joined(b)) => a == b,
      _ => false,
    }
  }
}

/// Errors collected in completion order.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Errors(Vec<Error>);

impl Errors {
  pub fn new() -> Self {
    Self(Vec::new())
  }

  pub fn with_capacity(capacity: usize) -> Self {
    Self(Vec::with_capacity(capacity))
  }

  pub fn push(&mut self, err: Error) {
    self.0.push(err);
  }

  pub fn len(&self) -> usize {
    self.0.len()
  }

  pub fn is_empty(&self) -> bool {
    self.0.is_empty()
  }

  pub fn first(&self) -> Option<&Error> {
    self.0.first()
  }

  pub fn iter(&self) -> std::slice::Iter<'_, Error> {
    self.0.iter()
  }

  pub fn into_vec(self) -> Vec<Error> {
    self.0
  }

  /// Collapses the collection into one error.
  ///
  /// Returns `None` when empty and the error itself when there is exactly one.
  pub fn join(self) -> Option<Error> {
    match self.0.len() {
      0 => None,
      1 => self.0.into_iter().next(),
      _ => Some(Error::Joined(self)),
    }
  }
}

impl fmt::Display for Errors {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    for (i, err) in self.0.iter().enumerate() {
      if i > 0 {
        f.write_str("\n")?;
      }
      write!(f, "{}", err)?;
    }
    Ok(())
  }
}

impl From<Vec<Error>> for Errors {
  fn from(errors: Vec<Error>) -> Self {
    Self(errors)
  }
}

impl FromIterator<Error> for Errors {
  fn from_iter<I: IntoIterator<Item = Error>>(iter: I) -> Self {
    Self(iter.into_iter().collect())
  }
}

impl IntoIterator for Errors {
  type Item = Error;
  type IntoIter = std::vec::IntoIter<Error>;

  fn into_iter(self) -> Self::IntoIter {
    self.0.into_iter()
  }
}

impl<'a> IntoIterator for &'a Errors {
  type Item = &'a Error;
  type IntoIter = std::slice::Iter<'a, Error>;

  fn into_iter(self) -> Self::IntoIter {
    self.0.iter()
  }
}
