//! Retries an async [`Operation`] with a backoff [`strategy`] until it succeeds, the
//! [`Condition`] rejects the error, the strategy runs out of delays, or the attached
//! cancellation token fires.

use std::future::Future;

pub mod retry;
pub mod strategy;

/// An operation that can be attempted more than once. Every attempt creates a fresh future.
pub trait Operation {
    type Item;
    type Error;
    type Future: Future<Output = Result<Self::Item, Self::Error>>;

    fn run(&mut self) -> Self::Future;
}

impl<I, E, T, F> Operation for F
where
    T: Future<Output = Result<I, E>>,
    F: FnMut() -> T,
{
    type Item = I;
    type Error = E;
    type Future = T;

    fn run(&mut self) -> Self::Future {
        self()
    }
}

/// Decides whether a failed attempt should be retried.
pub trait Condition<E> {
    fn can_retry(&self, error: &E) -> bool;
}

impl<E, F> Condition<E> for F
where
    F: Fn(&E) -> bool,
{
    fn can_retry(&self, error: &E) -> bool {
        self(error)
    }
}
