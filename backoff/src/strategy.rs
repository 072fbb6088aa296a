//! Backoff strategies are plain iterators of [`std::time::Duration`]. A strategy that never
//! returns `None` retries forever; bound it with [`Iterator::take`].

pub mod exponential;
pub mod fixed;
