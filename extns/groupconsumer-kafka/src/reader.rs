use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use groupconsumer_core::offset::StartOffset;
use groupconsumer_core::partition::PartitionId;
use groupconsumer_core::reader::{
    ConsumerError, ConsumerRecord, ErrorStream, PartitionReader, ReaderFactory, RecordStream,
};
use rdkafka::Offset;
use rdkafka::consumer::Consumer;
use rdkafka::message::{Headers, Message};
use rdkafka::topic_partition_list::TopicPartitionList;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_stream::wrappers::ReceiverStream;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::{Error, GroupConsumer, KafkaConfig, Result, create_consumer};

const DEFAULT_FETCH_TIMEOUT: Duration = Duration::from_secs(5);
const DEFAULT_CHANNEL_SIZE: usize = 500;

/// Attaches a dedicated consumer to each partition it is asked for.
#[derive(Debug, Clone)]
pub struct KafkaReaderFactory {
    config: KafkaConfig,
    fetch_timeout: Duration,
    channel_size: usize,
}

impl KafkaReaderFactory {
    pub fn new(config: KafkaConfig) -> Self {
        Self {
            config,
            fetch_timeout: DEFAULT_FETCH_TIMEOUT,
            channel_size: DEFAULT_CHANNEL_SIZE,
        }
    }

    /// Timeout of the metadata calls made while attaching.
    pub fn with_fetch_timeout(mut self, fetch_timeout: Duration) -> Self {
        self.fetch_timeout = fetch_timeout;
        self
    }

    /// Number of records buffered between the consumer and the partition manager.
    pub fn with_channel_size(mut self, channel_size: usize) -> Self {
        self.channel_size = channel_size.max(1);
        self
    }

    async fn watermarks(
        &self,
        consumer: &Arc<GroupConsumer>,
        partition: &PartitionId,
    ) -> Result<(i64, i64)> {
        let consumer = Arc::clone(consumer);
        let topic = partition.topic.clone();
        let id = partition.partition;
        let timeout = self.fetch_timeout;

        // fetch_watermarks blocks on a broker round trip
        tokio::task::spawn_blocking(move || {
            consumer
                .fetch_watermarks(&topic, id, timeout)
                .map_err(|e| Error::Kafka(format!("Failed to fetch watermarks: {e}")))
        })
        .await
        .map_err(|e| Error::Other(format!("Tokio task join error: {e}")))?
    }

    async fn attach_consumer(
        &self,
        partition: &PartitionId,
        start: StartOffset,
    ) -> groupconsumer_core::Result<KafkaPartitionReader> {
        let consumer = Arc::new(create_consumer(&self.config).map_err(reader_error)?);

        let offset = match start {
            StartOffset::Oldest => Offset::Beginning,
            StartOffset::Newest => Offset::End,
            StartOffset::At(offset) => {
                let (low, high) = self
                    .watermarks(&consumer, partition)
                    .await
                    .map_err(reader_error)?;
                if offset < low || offset > high {
                    info!(
                        %partition,
                        offset, low, high, "Start offset is outside the retained range"
                    );
                    return Err(groupconsumer_core::Error::OffsetOutOfRange {
                        partition: partition.clone(),
                        offset,
                    });
                }
                Offset::Offset(offset)
            }
        };

        let mut tpl = TopicPartitionList::new();
        tpl.add_partition_offset(&partition.topic, partition.partition, offset)
            .map_err(|e| reader_error(Error::Kafka(format!("Invalid start offset: {e}"))))?;
        consumer
            .assign(&tpl)
            .map_err(|e| {
                reader_error(Error::Kafka(format!("Failed to assign {partition}: {e}")))
            })?;

        let (records_tx, records_rx) = mpsc::channel(self.channel_size);
        let (errors_tx, errors_rx) = mpsc::channel(self.channel_size);
        let cln_token = CancellationToken::new();
        let handle = tokio::spawn(read_partition(
            consumer,
            partition.clone(),
            records_tx,
            errors_tx,
            cln_token.clone(),
        ));

        Ok(KafkaPartitionReader {
            records: Box::pin(ReceiverStream::new(records_rx)),
            errors: Box::pin(ReceiverStream::new(errors_rx)),
            cln_token,
            handle,
        })
    }
}

fn reader_error(e: Error) -> groupconsumer_core::Error {
    groupconsumer_core::Error::Reader(e.to_string())
}

#[async_trait]
impl ReaderFactory for KafkaReaderFactory {
    async fn attach(
        &self,
        partition: &PartitionId,
        start: StartOffset,
    ) -> groupconsumer_core::Result<Box<dyn PartitionReader>> {
        let reader = self.attach_consumer(partition, start).await?;
        Ok(Box::new(reader))
    }
}

/// Pumps the consumer into the record and error channels until cancelled or until the
/// partition manager stops listening.
async fn read_partition(
    consumer: Arc<GroupConsumer>,
    partition: PartitionId,
    records_tx: mpsc::Sender<ConsumerRecord>,
    errors_tx: mpsc::Sender<ConsumerError>,
    cln_token: CancellationToken,
) {
    debug!(%partition, "Started partition reader");
    loop {
        let next = tokio::select! {
            biased;
            _ = cln_token.cancelled() => break,
            message = consumer.recv() => match message {
                Ok(message) => Ok(to_record(&message)),
                Err(e) => Err(ConsumerError {
                    topic: partition.topic.clone(),
                    partition: partition.partition,
                    message: e.to_string(),
                }),
            },
        };

        let delivered = match next {
            Ok(record) => tokio::select! {
                _ = cln_token.cancelled() => break,
                sent = records_tx.send(record) => sent.is_ok(),
            },
            Err(error) => {
                warn!(%partition, %error, "Failed to read from partition");
                tokio::select! {
                    _ = cln_token.cancelled() => break,
                    sent = errors_tx.send(error) => sent.is_ok(),
                }
            }
        };
        if !delivered {
            break;
        }
    }

    if let Err(e) = consumer.unassign() {
        warn!(%partition, ?e, "Failed to unassign partition");
    }
    debug!(%partition, "Stopped partition reader");
}

fn to_record<M: Message>(message: &M) -> ConsumerRecord {
    let headers = match message.headers() {
        Some(headers) => headers
            .iter()
            .map(|header| {
                (
                    header.key.to_string(),
                    Bytes::copy_from_slice(header.value.unwrap_or_default()),
                )
            })
            .collect(),
        None => vec![],
    };

    ConsumerRecord {
        topic: message.topic().to_string(),
        partition: message.partition(),
        offset: message.offset(),
        key: message.key().map(Bytes::copy_from_slice),
        // The rdkafka doc says that the payload can be None if there is no payload.
        value: message
            .payload()
            .map(Bytes::copy_from_slice)
            .unwrap_or_default(),
        headers,
        timestamp: message.timestamp().to_millis(),
    }
}

/// A consumer assigned to a single partition.
pub struct KafkaPartitionReader {
    records: RecordStream,
    errors: ErrorStream,
    cln_token: CancellationToken,
    handle: JoinHandle<()>,
}

#[async_trait]
impl PartitionReader for KafkaPartitionReader {
    fn streams(&mut self) -> (&mut RecordStream, &mut ErrorStream) {
        (&mut self.records, &mut self.errors)
    }

    async fn close(self: Box<Self>) -> groupconsumer_core::Result<()> {
        self.cln_token.cancel();
        self.handle
            .await
            .map_err(|e| groupconsumer_core::Error::Reader(format!("Reader task failed: {e}")))
    }
}
