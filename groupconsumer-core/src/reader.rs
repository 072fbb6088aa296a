use std::pin::Pin;

use async_trait::async_trait;
use bytes::Bytes;
use futures::Stream;
use thiserror::Error;

use crate::error::Result;
use crate::offset::StartOffset;
use crate::partition::PartitionId;

/// A record read from a partition.
#[derive(Debug, Clone, PartialEq)]
pub struct ConsumerRecord {
    pub topic: String,
    pub partition: i32,
    pub offset: i64,
    pub key: Option<Bytes>,
    pub value: Bytes,
    pub headers: Vec<(String, Bytes)>,
    /// Milliseconds since the epoch, if the log keeps timestamps.
    pub timestamp: Option<i64>,
}

/// An error reported by a reader while it is attached. These are relayed downstream as data,
/// they never stop the partition manager.
#[derive(Error, Debug, Clone, PartialEq)]
#[error("Consumer Error on {topic}/{partition} - {message}")]
pub struct ConsumerError {
    pub topic: String,
    pub partition: i32,
    pub message: String,
}

pub type RecordStream = Pin<Box<dyn Stream<Item = ConsumerRecord> + Send>>;

pub type ErrorStream = Pin<Box<dyn Stream<Item = ConsumerError> + Send>>;

/// A streaming reader attached to one partition.
#[async_trait]
pub trait PartitionReader: Send {
    /// The records and the errors of the reader, in the order the reader produced them.
    /// Both streams end once the reader is closed or has nothing more to read.
    fn streams(&mut self) -> (&mut RecordStream, &mut ErrorStream);

    /// Stops reading and releases the resources of the reader.
    async fn close(self: Box<Self>) -> Result<()>;
}

/// Attaches readers to partitions.
#[async_trait]
pub trait ReaderFactory: Send + Sync {
    /// Starts reading `partition` at `start`.
    ///
    /// Fails with [`crate::Error::OffsetOutOfRange`] when `start` is an explicit offset the
    /// log no longer (or not yet) holds.
    async fn attach(
        &self,
        partition: &PartitionId,
        start: StartOffset,
    ) -> Result<Box<dyn PartitionReader>>;
}
