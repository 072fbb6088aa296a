use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::task::{Context, Poll, ready};

use pin_project::pin_project;
use tokio::time::Sleep;
use tokio_util::sync::{CancellationToken, WaitForCancellationFutureOwned};

use crate::{Condition, Operation};

/// Why a [`Retry`] gave up.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RetryError<E> {
    /// The cancellation token fired before an attempt or while cooling off.
    Cancelled,
    /// The last attempt failed and was either not retryable or the backoff ran out.
    Failed(E),
}

impl<E> RetryError<E> {
    pub fn is_cancelled(&self) -> bool {
        matches!(self, RetryError::Cancelled)
    }

    /// Returns the error of the last attempt, `None` if the retry was cancelled.
    pub fn into_failure(self) -> Option<E> {
        match self {
            RetryError::Cancelled => None,
            RetryError::Failed(e) => Some(e),
        }
    }
}

impl<E: fmt::Display> fmt::Display for RetryError<E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RetryError::Cancelled => write!(f, "retry cancelled"),
            RetryError::Failed(e) => write!(f, "{e}"),
        }
    }
}

impl<E: std::error::Error + 'static> std::error::Error for RetryError<E> {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            RetryError::Cancelled => None,
            RetryError::Failed(e) => Some(e),
        }
    }
}

/// A retry flips between three states. `Idle` is where cancellation is checked before a new
/// attempt is started, so an operation is never started once the token has fired. An attempt
/// that is already `Running` is always driven to completion; only the cool-off can be cut short.
/// ```no_rust
///            (cancelled) -> [Return(Cancelled)]*
///           /
///     (Idle)                  (Ok) -> [Return(Ok)]*
///           \                /
///            (op) -> (Ready)        (Non-retryable | backoff exhausted) -> [Return(Failed)]*
///                            \     /
///                             (Err)
///                                  \
///                                   (Sleeping) -- (cancelled) -> [Return(Cancelled)]*
///                                              \
///                                               (elapsed) -> (Idle)
/// ```
#[pin_project(project = RetryStateProj)]
enum RetryState<F> {
    Idle,
    Running(#[pin] F),
    Sleeping {
        #[pin]
        sleep: Sleep,
        cancelled: Option<Pin<Box<WaitForCancellationFutureOwned>>>,
    },
}

/// Retry retries an operation based on the backoff strategy, optionally until a
/// [`CancellationToken`] fires.
#[pin_project]
pub struct Retry<I, O, C>
where
    O: Operation,
{
    #[pin]
    retry_state: RetryState<O::Future>,
    backoff: I,
    operation: O,
    condition: C,
    cancel_token: Option<CancellationToken>,
}

impl<I, O, C> Retry<I, O, C>
where
    I: Iterator<Item = std::time::Duration>,
    O: Operation,
    C: Condition<O::Error>,
{
    pub fn new<II: IntoIterator<IntoIter = I, Item = I::Item>>(
        backoff: II,
        operation: O,
        condition: C,
    ) -> Self {
        Self {
            retry_state: RetryState::Idle,
            backoff: backoff.into_iter(),
            operation,
            condition,
            cancel_token: None,
        }
    }

    /// Stops retrying once `cancel_token` is cancelled. The token is checked before every
    /// attempt and raced against every cool-off sleep.
    pub fn with_cancellation(mut self, cancel_token: CancellationToken) -> Self {
        self.cancel_token = Some(cancel_token);
        self
    }
}

impl<I, O, C> Future for Retry<I, O, C>
where
    I: Iterator<Item = std::time::Duration>,
    O: Operation,
    C: Condition<O::Error>,
{
    type Output = Result<O::Item, RetryError<O::Error>>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        loop {
            let this = self.as_mut().project();
            let next_state = match this.retry_state.project() {
                RetryStateProj::Idle => {
                    if this
                        .cancel_token
                        .as_ref()
                        .is_some_and(CancellationToken::is_cancelled)
                    {
                        return Poll::Ready(Err(RetryError::Cancelled));
                    }
                    RetryState::Running(this.operation.run())
                }
                RetryStateProj::Running(op) => match ready!(op.poll(cx)) {
                    Ok(item) => return Poll::Ready(Ok(item)),
                    Err(e) => {
                        if !this.condition.can_retry(&e) {
                            return Poll::Ready(Err(RetryError::Failed(e)));
                        }
                        // ran out of backoff, surface the last error
                        let Some(duration) = this.backoff.next() else {
                            return Poll::Ready(Err(RetryError::Failed(e)));
                        };
                        RetryState::Sleeping {
                            sleep: tokio::time::sleep(duration),
                            cancelled: this
                                .cancel_token
                                .as_ref()
                                .map(|token| Box::pin(token.clone().cancelled_owned())),
                        }
                    }
                },
                RetryStateProj::Sleeping { sleep, cancelled } => {
                    if let Some(cancelled) = cancelled
                        && cancelled.as_mut().poll(cx).is_ready()
                    {
                        return Poll::Ready(Err(RetryError::Cancelled));
                    }
                    ready!(sleep.poll(cx));
                    RetryState::Idle
                }
            };
            self.as_mut().project().retry_state.set(next_state);
        }
    }
}
