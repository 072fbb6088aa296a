//! Per-partition coordination for a consumer group.
//!
//! A [`manager::PartitionManager`] claims exclusive ownership of a single partition through an
//! [`coordinator::OwnershipCoordinator`], works out where to resume from the
//! [`offset::OffsetStore`], attaches a [`reader::PartitionReader`] and relays records and
//! errors to shared output channels until it is interrupted. On the way out it closes the
//! reader and releases the claim.

pub use self::error::{Error, Result};

/// Error type of the crate.
mod error;

/// Identities of partitions and group members.
pub mod partition;

/// Committed offsets and where to start reading.
pub mod offset;

/// Exclusive ownership of partitions across the group.
pub mod coordinator;

/// Streaming readers attached to a single partition.
pub mod reader;

/// Configuration of the partition managers.
pub mod config;

/// Prometheus metrics of the partition managers.
pub mod metrics;

/// The per-partition run loop and its handle.
pub mod manager;

#[cfg(test)]
mod test_utils;
