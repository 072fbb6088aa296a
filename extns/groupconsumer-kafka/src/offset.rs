use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use groupconsumer_core::offset::OffsetStore;
use groupconsumer_core::partition::PartitionId;
use rdkafka::Offset;
use rdkafka::consumer::Consumer;
use rdkafka::topic_partition_list::TopicPartitionList;
use tracing::debug;

use crate::{Error, GroupConsumer, KafkaConfig, Result, create_consumer};

/// Offsets committed by the consumer group on the brokers.
#[derive(Clone)]
pub struct KafkaOffsetStore {
    consumer: Arc<GroupConsumer>,
    timeout: Duration,
}

impl KafkaOffsetStore {
    pub fn new(config: &KafkaConfig, timeout: Duration) -> Result<Self> {
        Ok(Self {
            consumer: Arc::new(create_consumer(config)?),
            timeout,
        })
    }
}

#[async_trait]
impl OffsetStore for KafkaOffsetStore {
    async fn fetch(&self, partition: &PartitionId) -> groupconsumer_core::Result<i64> {
        let consumer = Arc::clone(&self.consumer);
        let topic = partition.topic.clone();
        let id = partition.partition;
        let timeout = self.timeout;

        // committed_offsets blocks on a broker round trip
        let committed = tokio::task::spawn_blocking(move || {
            let mut tpl = TopicPartitionList::new();
            tpl.add_partition(&topic, id);
            let committed = consumer
                .committed_offsets(tpl, timeout)
                .map_err(|e| Error::Kafka(format!("Failed to get committed offsets: {e}")))?;
            Ok::<_, Error>(
                committed
                    .find_partition(&topic, id)
                    .map(|element| element.offset()),
            )
        })
        .await
        .map_err(|e| Error::Other(format!("Tokio task join error: {e}")))
        .and_then(|result| result)
        .map_err(|e| groupconsumer_core::Error::OffsetStore(e.to_string()))?;

        let offset = match committed {
            Some(Offset::Offset(offset)) => offset,
            // Invalid is what the broker reports for a group that never committed
            _ => -1,
        };
        debug!(%partition, offset, "Fetched committed offset");
        Ok(offset)
    }
}
