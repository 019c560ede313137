use crate::error::Error;

use std::fmt;
use std::sync::{Arc, OnceLock};
use std::time::Duration;

use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::trace;

/// A cancellation signal that remembers why it fired.
///
/// Contexts form a tree: cancelling a parent cancels every child, and a child
/// that was cancelled through its parent reports the parent's reason from
/// [`Context::err`]. Cancellation is single-shot; the first reason wins.
#[derive(Clone)]
pub struct Context {
  inner: Arc<ContextInner>,
}

struct ContextInner {
  token: CancellationToken,
  reason: Arc<OnceLock<Error>>,
  parent: Option<Context>,
  cancellable: bool,
}

impl Context {
  /// A root context that is never cancelled.
  pub fn background() -> Self {
    Self {
      inner: Arc::new(ContextInner {
        token: CancellationToken::new(),
        reason: Arc::default(),
        parent: None,
        cancellable: false,
      }),
    }
  }

  /// A cancellable child of this context.
  pub fn child(&self) -> Self {
    Self {
      inner: Arc::new(ContextInner {
        token: self.inner.token.child_token(),
        reason: Arc::default(),
        parent: Some(self.clone()),
        cancellable: true,
      }),
    }
  }

  /// A child that cancels itself with [`Error::DeadlineExceeded`] after `timeout`.
  ///
  /// Must be called from within a Tokio runtime.
  pub fn with_timeout(&self, timeout: Duration) -> Self {
    self.with_deadline(Instant::now() + timeout)
  }

  /// A child that cancels itself with [`Error::DeadlineExceeded`] at `deadline`.
  ///
  /// Must be called from within a Tokio runtime.
  pub fn with_deadline(&self, deadline: Instant) -> Self {
    let child = self.child();
    // The timer holds only the token and reason cell, not the context chain.
    let token = child.inner.token.clone();
    let reason = child.inner.reason.clone();
    tokio::spawn(async move {
      tokio::select! {
        biased;
        _ = token.cancelled() => {}
        _ = tokio::time::sleep_until(deadline) => {
          trace!("Context deadline reached.");
          fire(&token, &reason, Error::DeadlineExceeded);
        }
      }
    });
    child
  }

  /// Cancels this context and all of its children with [`Error::Canceled`].
  ///
  /// Has no effect on a background context or on an already cancelled one.
  pub fn cancel(&self) {
    self.cancel_with(Error::Canceled);
  }

  fn cancel_with(&self, reason: Error) {
    if self.inner.cancellable {
      fire(&self.inner.token, &self.inner.reason, reason);
    }
  }

  pub fn is_cancelled(&self) -> bool {
    self.inner.token.is_cancelled()
  }

  /// Resolves once the context is cancelled.
  pub async fn cancelled(&self) {
    self.inner.token.cancelled().await
  }

  /// The reason this context was cancelled, or `None` while it is live.
  pub fn err(&self) -> Option<Error> {
    if !self.is_cancelled() {
      return None;
    }
    if let Some(reason) = self.inner.reason.get() {
      return Some(reason.clone());
    }
    self
      .inner
      .parent
      .as_ref()
      .and_then(Context::err)
      .or(Some(Error::Canceled))
  }

  /// The underlying token, for interop with code that speaks `tokio_util`.
  pub fn token(&self) -> CancellationToken {
    self.inner.token.clone()
  }

  /// Returns a guard that cancels this context when dropped.
  pub fn guard(self) -> ContextGuard {
    ContextGuard { ctx: self }
  }
}

/// Records `reason` and cancels `token`, unless it already fired.
fn fire(token: &CancellationToken, cell: &OnceLock<Error>, reason: Error) {
  if token.is_cancelled() {
    return;
  }
  let _ = cell.set(reason);
  token.cancel();
}

impl Default for Context {
  fn default() -> Self {
    Self::background()
  }
}

impl From<CancellationToken> for Context {
  fn from(token: CancellationToken) -> Self {
    Self {
      inner: Arc::new(ContextInner {
        token,
        reason: Arc::default(),
        parent: None,
        cancellable: true,
      }),
    }
  }
}

impl fmt::Debug for Context {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.debug_struct("Context")
      .field("cancelled", &self.is_cancelled())
      .field("cancellable", &self.inner.cancellable)
      .field("has_parent", &self.inner.parent.is_some())
      .finish()
  }
}

/// Cancels the wrapped context on drop.
#[derive(Debug)]
pub struct ContextGuard {
  ctx: Context,
}

impl ContextGuard {
  pub fn context(&self) -> &Context {
    &self.ctx
  }
}

impl Drop for ContextGuard {
  fn drop(&mut self) {
    self.ctx.cancel();
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn background_ignores_cancel() {
    let ctx = Context::background();
    ctx.cancel();
    assert!(!ctx.is_cancelled());
    assert_eq!(ctx.err(), None);
  }

  #[test]
  fn child_inherits_parent_reason() {
    let parent = Context::background().child();
    let child = parent.child();
    parent.cancel();
    assert!(child.is_cancelled());
    assert_eq!(child.err(), Some(Error::Canceled));
  }

  #[test]
  fn cancelling_child_leaves_parent_live() {
    let parent = Context::background().child();
    let child = parent.child();
    child.cancel();
    assert!(child.is_cancelled());
    assert!(!parent.is_cancelled());
  }

  #[test]
  fn guard_cancels_on_drop() {
    let ctx = Context::background().child();
    {
      let _guard = ctx.clone().guard();
    }
    assert_eq!(ctx.err(), Some(Error::Canceled));
  }

  #[tokio::test(start_paused = true)]
  async fn timeout_reports_deadline_exceeded() {
    let ctx = Context::background().with_timeout(Duration::from_millis(20));
    let child = ctx.child();
    assert_eq!(ctx.err(), None);

    child.cancelled().await;
    assert_eq!(ctx.err(), Some(Error::DeadlineExceeded));
    assert_eq!(child.err(), Some(Error::DeadlineExceeded));
  }

  #[tokio::test(start_paused = true)]
  async fn deadline_timer_releases_the_context_chain() {
    let parent = Context::background().child();
    let ctx = parent.with_timeout(Duration::from_secs(3600));
    let token = ctx.token();
    drop(ctx);
    tokio::task::yield_now().await;

    // Only the caller's handle keeps the parent alive; the timer does not.
    assert_eq!(Arc::strong_count(&parent.inner), 1);
    tokio::time::sleep(Duration::from_secs(3601)).await;
    assert!(token.is_cancelled());
  }

  #[tokio::test(start_paused = true)]
  async fn explicit_cancel_beats_later_deadline() {
    let ctx = Context::background().with_timeout(Duration::from_millis(20));
    ctx.cancel();
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(ctx.err(), Some(Error::Canceled));
  }
}
