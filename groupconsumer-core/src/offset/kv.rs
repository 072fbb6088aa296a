use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use groupconsumer_shared::kv::KVStore;

use super::OffsetStore;
use crate::error::{Error, Result};
use crate::partition::PartitionId;

const OFFSETS_PREFIX: &str = "offsets";

/// Committed offsets kept in a KV bucket as decimal strings under
/// `offsets/<topic>/<partition>`.
#[derive(Clone)]
pub struct KVOffsetStore {
    store: Arc<dyn KVStore>,
}

impl KVOffsetStore {
    pub fn new(store: Arc<dyn KVStore>) -> Self {
        Self { store }
    }

    fn key(partition: &PartitionId) -> String {
        format!("{OFFSETS_PREFIX}/{partition}")
    }

    /// Records `offset` as the committed offset of `partition`. The partition manager never
    /// commits, this is used by whatever acknowledges the relayed records.
    pub async fn commit(&self, partition: &PartitionId, offset: i64) -> Result<()> {
        self.store
            .put(&Self::key(partition), Bytes::from(offset.to_string()))
            .await
            .map_err(|e| {
                Error::OffsetStore(format!("Failed to commit offset for {partition}: {e}"))
            })
    }
}

#[async_trait]
impl OffsetStore for KVOffsetStore {
    async fn fetch(&self, partition: &PartitionId) -> Result<i64> {
        let value = self.store.get(&Self::key(partition)).await.map_err(|e| {
            Error::OffsetStore(format!("Failed to fetch offset for {partition}: {e}"))
        })?;

        let Some(value) = value else {
            return Ok(-1);
        };

        std::str::from_utf8(&value)
            .ok()
            .and_then(|v| v.trim().parse::<i64>().ok())
            .ok_or_else(|| {
                Error::OffsetStore(format!(
                    "Invalid committed offset {value:?} for {partition}"
                ))
            })
    }
}
