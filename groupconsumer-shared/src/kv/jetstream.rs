//! JetStream implementation of the [`KVStore`] trait.

use std::pin::Pin;
use std::task::{Context, Poll};
use std::time::SystemTime;

use async_nats::jetstream::kv::{
    CreateErrorKind, DeleteErrorKind, Entry, Operation, Store, UpdateErrorKind, Watch,
};
use async_trait::async_trait;
use bytes::Bytes;
use futures::{Stream, StreamExt};
use tracing::warn;

use super::{KVEntry, KVError, KVResult, KVStore, KVValue, KVWatchOp, KVWatchStream};

impl From<Entry> for KVEntry {
    fn from(entry: Entry) -> Self {
        let operation = match entry.operation {
            Operation::Put => KVWatchOp::Put,
            Operation::Delete => KVWatchOp::Delete,
            Operation::Purge => KVWatchOp::Purge,
        };

        KVEntry {
            key: entry.key,
            value: entry.value,
            operation,
            revision: entry.revision,
        }
    }
}

/// Adapts a JetStream [`Watch`] into a [`KVWatchStream`]. A watcher error ends the stream,
/// callers treat the end of a watch as "something may have changed" and read again.
struct JetstreamWatchAdapter {
    inner: Watch,
    done: bool,
}

impl Stream for JetstreamWatchAdapter {
    type Item = KVEntry;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        if self.done {
            return Poll::Ready(None);
        }

        match self.inner.poll_next_unpin(cx) {
            Poll::Ready(Some(Ok(entry))) => Poll::Ready(Some(entry.into())),
            Poll::Ready(Some(Err(e))) => {
                warn!(?e, "JetStream watcher failed, ending watch stream");
                self.done = true;
                Poll::Ready(None)
            }
            Poll::Ready(None) => {
                self.done = true;
                Poll::Ready(None)
            }
            Poll::Pending => Poll::Pending,
        }
    }
}

/// JetStream KV Store implementation. Use this as `Arc<dyn KVStore>`.
#[derive(Clone)]
pub struct JetstreamKVStore {
    store: Store,
    name: String,
}

impl JetstreamKVStore {
    pub fn new(store: Store, name: impl Into<String>) -> Self {
        Self {
            store,
            name: name.into(),
        }
    }
}

#[async_trait]
impl KVStore for JetstreamKVStore {
    async fn get(&self, key: &str) -> KVResult<Option<Bytes>> {
        self.store
            .get(key)
            .await
            .map_err(|e| Box::new(e) as KVError)
    }

    async fn entry(&self, key: &str) -> KVResult<Option<KVValue>> {
        let entry = self
            .store
            .entry(key)
            .await
            .map_err(|e| Box::new(e) as KVError)?;

        // the latest write of a deleted key is its delete marker
        Ok(entry
            .filter(|entry| entry.operation == Operation::Put)
            .map(|entry| KVValue {
                value: entry.value,
                revision: entry.revision,
                updated: SystemTime::from(entry.created),
            }))
    }

    async fn create(&self, key: &str, value: Bytes) -> KVResult<Option<u64>> {
        match self.store.create(key, value).await {
            Ok(revision) => Ok(Some(revision)),
            Err(e) if e.kind() == CreateErrorKind::AlreadyExists => Ok(None),
            Err(e) => Err(Box::new(e) as KVError),
        }
    }

    async fn update(&self, key: &str, value: Bytes, revision: u64) -> KVResult<Option<u64>> {
        match self.store.update(key, value, revision).await {
            Ok(revision) => Ok(Some(revision)),
            Err(e) if e.kind() == UpdateErrorKind::WrongLastRevision => Ok(None),
            Err(e) => Err(Box::new(e) as KVError),
        }
    }

    async fn put(&self, key: &str, value: Bytes) -> KVResult<()> {
        self.store
            .put(key, value)
            .await
            .map_err(|e| Box::new(e) as KVError)?;
        Ok(())
    }

    async fn delete(&self, key: &str) -> KVResult<()> {
        self.store
            .delete(key)
            .await
            .map_err(|e| Box::new(e) as KVError)
    }

    async fn delete_revision(&self, key: &str, revision: u64) -> KVResult<bool> {
        match self.store.delete_expect_revision(key, Some(revision)).await {
            Ok(()) => Ok(true),
            Err(e) if e.kind() == DeleteErrorKind::WrongLastRevision => Ok(false),
            Err(e) => Err(Box::new(e) as KVError),
        }
    }

    async fn watch(&self, key: &str) -> KVResult<KVWatchStream> {
        let watch = self
            .store
            .watch(key)
            .await
            .map_err(|e| Box::new(e) as KVError)?;

        Ok(Box::pin(JetstreamWatchAdapter {
            inner: watch,
            done: false,
        }))
    }

    fn name(&self) -> &str {
        &self.name
    }
}

#[cfg(all(test, feature = "nats-tests"))]
mod tests {
    use super::*;
    use async_nats::jetstream;

    async fn test_store(bucket: &str) -> JetstreamKVStore {
        let client = async_nats::connect("localhost:4222").await.unwrap();
        let js_context = jetstream::new(client);
        let _ = js_context.delete_key_value(bucket).await;

        let store = js_context
            .create_key_value(jetstream::kv::Config {
                bucket: bucket.to_string(),
                ..Default::default()
            })
            .await
            .unwrap();
        JetstreamKVStore::new(store, bucket)
    }

    #[tokio::test]
    async fn test_create_is_exclusive() {
        let store = test_store("groupconsumer-test-create").await;

        let revision = store.create("owners/t/0", Bytes::from("a")).await.unwrap();
        assert!(revision.is_some());
        assert_eq!(store.create("owners/t/0", Bytes::from("b")).await.unwrap(), None);
        assert_eq!(
            store.get("owners/t/0").await.unwrap(),
            Some(Bytes::from("a"))
        );

        // a deleted key can be created again
        store.delete("owners/t/0").await.unwrap();
        assert_eq!(store.entry("owners/t/0").await.unwrap(), None);
        assert!(
            store
                .create("owners/t/0", Bytes::from("b"))
                .await
                .unwrap()
                .is_some()
        );
    }

    #[tokio::test]
    async fn test_writes_expect_latest_revision() {
        let store = test_store("groupconsumer-test-revision").await;

        let first = store
            .create("owners/t/2", Bytes::from("a"))
            .await
            .unwrap()
            .unwrap();
        let second = store
            .update("owners/t/2", Bytes::from("a"), first)
            .await
            .unwrap()
            .unwrap();
        assert!(second > first);
        assert_eq!(
            store.entry("owners/t/2").await.unwrap().unwrap().revision,
            second
        );

        // writes against an outdated revision are refused
        assert_eq!(
            store
                .update("owners/t/2", Bytes::from("b"), first)
                .await
                .unwrap(),
            None
        );
        assert!(!store.delete_revision("owners/t/2", first).await.unwrap());
        assert!(store.delete_revision("owners/t/2", second).await.unwrap());
        assert_eq!(store.get("owners/t/2").await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_watch_sees_delete() {
        let store = test_store("groupconsumer-test-watch").await;
        store.put("owners/t/1", Bytes::from("a")).await.unwrap();

        let mut watch = store.watch("owners/t/1").await.unwrap();
        store.delete("owners/t/1").await.unwrap();

        let entry = watch.next().await.unwrap();
        assert_eq!(entry.key, "owners/t/1");
        assert_eq!(entry.operation, KVWatchOp::Delete);
    }
}
