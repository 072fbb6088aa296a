//! An in-memory partitioned log to attach readers to in tests.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use futures::{StreamExt, stream};
use parking_lot::Mutex;
use tokio::sync::mpsc;
use tokio_stream::wrappers::UnboundedReceiverStream;

use crate::error::{Error, Result};
use crate::offset::StartOffset;
use crate::partition::PartitionId;
use crate::reader::{
    ConsumerError, ConsumerRecord, ErrorStream, PartitionReader, ReaderFactory, RecordStream,
};

#[derive(Default)]
struct PartitionLog {
    /// Offset of the first retained record.
    low: i64,
    values: Vec<Bytes>,
}

impl PartitionLog {
    fn high(&self) -> i64 {
        self.low + self.values.len() as i64
    }
}

struct LiveReader {
    partition: PartitionId,
    records: mpsc::UnboundedSender<ConsumerRecord>,
    errors: mpsc::UnboundedSender<ConsumerError>,
}

#[derive(Default)]
struct LogState {
    partitions: HashMap<PartitionId, PartitionLog>,
    live: Vec<LiveReader>,
    attaches: Vec<StartOffset>,
    fail_attaches: usize,
    out_of_range_attaches: usize,
    opened: usize,
    closed: usize,
}

fn record(partition: &PartitionId, offset: i64, value: Bytes) -> ConsumerRecord {
    ConsumerRecord {
        topic: partition.topic.clone(),
        partition: partition.partition,
        offset,
        key: None,
        value,
        headers: vec![],
        timestamp: None,
    }
}

/// A [`ReaderFactory`] over an in-memory log. Attached readers first yield the retained
/// records from their start offset and then every record appended while they are open.
#[derive(Clone, Default)]
pub(crate) struct SimpleLog {
    state: Arc<Mutex<LogState>>,
}

impl SimpleLog {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    /// Appends a record and returns its offset.
    pub(crate) fn append(&self, partition: &PartitionId, value: &str) -> i64 {
        let mut state = self.state.lock();
        let log = state.partitions.entry(partition.clone()).or_default();
        let offset = log.high();
        log.values.push(Bytes::from(value.to_string()));

        let record = record(partition, offset, Bytes::from(value.to_string()));
        state.live.retain(|live| !live.records.is_closed());
        for live in state.live.iter().filter(|live| &live.partition == partition) {
            let _ = live.records.send(record.clone());
        }
        offset
    }

    /// Drops every record below `low`.
    pub(crate) fn truncate(&self, partition: &PartitionId, low: i64) {
        let mut state = self.state.lock();
        let log = state.partitions.entry(partition.clone()).or_default();
        let drop_count = (low - log.low).clamp(0, log.values.len() as i64) as usize;
        log.values.drain(..drop_count);
        log.low = low.max(log.low);
    }

    /// Sends a reader error to every open reader of `partition`.
    pub(crate) fn push_error(&self, partition: &PartitionId, message: &str) {
        let state = self.state.lock();
        for live in state.live.iter().filter(|live| &live.partition == partition) {
            let _ = live.errors.send(ConsumerError {
                topic: partition.topic.clone(),
                partition: partition.partition,
                message: message.to_string(),
            });
        }
    }

    /// Ends the record and error streams of every open reader.
    pub(crate) fn end_streams(&self) {
        self.state.lock().live.clear();
    }

    /// Fail the next N in-range attaches with a transient reader error.
    pub(crate) fn fail_attaches(&self, count: usize) {
        self.state.lock().fail_attaches = count;
    }

    /// Fail the next N attaches as out of range, whatever their start offset.
    pub(crate) fn out_of_range_attaches(&self, count: usize) {
        self.state.lock().out_of_range_attaches = count;
    }

    /// Start offsets of every attach attempt, failed ones included.
    pub(crate) fn attaches(&self) -> Vec<StartOffset> {
        self.state.lock().attaches.clone()
    }

    pub(crate) fn open_readers(&self) -> usize {
        let state = self.state.lock();
        state.opened - state.closed
    }

    pub(crate) fn closed_readers(&self) -> usize {
        self.state.lock().closed
    }
}

#[async_trait]
impl ReaderFactory for SimpleLog {
    async fn attach(
        &self,
        partition: &PartitionId,
        start: StartOffset,
    ) -> Result<Box<dyn PartitionReader>> {
        let mut state = self.state.lock();
        state.attaches.push(start);

        let log = state.partitions.entry(partition.clone()).or_default();
        let (low, high) = (log.low, log.high());
        let from = match start {
            StartOffset::Oldest => low,
            StartOffset::Newest => high,
            StartOffset::At(offset) => offset,
        };

        if state.out_of_range_attaches > 0 || from < low || from > high {
            state.out_of_range_attaches = state.out_of_range_attaches.saturating_sub(1);
            return Err(Error::OffsetOutOfRange {
                partition: partition.clone(),
                offset: from,
            });
        }

        if state.fail_attaches > 0 {
            state.fail_attaches -= 1;
            return Err(Error::Reader("injected attach failure".to_string()));
        }

        let log = state.partitions.entry(partition.clone()).or_default();
        let backlog: Vec<ConsumerRecord> = log.values[(from - log.low) as usize..]
            .iter()
            .zip(from..)
            .map(|(value, offset)| record(partition, offset, value.clone()))
            .collect();

        let (records_tx, records_rx) = mpsc::unbounded_channel();
        let (errors_tx, errors_rx) = mpsc::unbounded_channel();
        state.live.push(LiveReader {
            partition: partition.clone(),
            records: records_tx,
            errors: errors_tx,
        });
        state.opened += 1;

        Ok(Box::new(SimpleReader {
            records: Box::pin(stream::iter(backlog).chain(UnboundedReceiverStream::new(records_rx))),
            errors: Box::pin(UnboundedReceiverStream::new(errors_rx)),
            log: self.clone(),
        }))
    }
}

struct SimpleReader {
    records: RecordStream,
    errors: ErrorStream,
    log: SimpleLog,
}

#[async_trait]
impl PartitionReader for SimpleReader {
    fn streams(&mut self) -> (&mut RecordStream, &mut ErrorStream) {
        (&mut self.records, &mut self.errors)
    }

    async fn close(self: Box<Self>) -> Result<()> {
        self.log.state.lock().closed += 1;
        Ok(())
    }
}
