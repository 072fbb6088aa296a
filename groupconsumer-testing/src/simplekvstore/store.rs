use std::collections::HashMap;
use std::sync::Arc;
use std::time::SystemTime;

use async_trait::async_trait;
use bytes::Bytes;
use futures::stream;
use parking_lot::RwLock;
use tokio::sync::broadcast;
use tokio::sync::broadcast::error::RecvError;

use groupconsumer_shared::kv::{
    KVEntry, KVResult, KVStore, KVValue, KVWatchOp, KVWatchStream,
};

use super::error::SimpleKVStoreError;
use super::error_injector::KVErrorInjector;

#[derive(Debug, Default)]
struct KVState {
    data: HashMap<String, KVValue>,
    /// Incremented on every mutation, the latest value of a key carries the revision that
    /// wrote it.
    revision: u64,
    /// Watches requested, failed ones included.
    watches: usize,
}

/// Simple in-memory KV store for testing. Clones share the same data.
#[derive(Clone)]
pub struct SimpleKVStore {
    state: Arc<RwLock<KVState>>,
    name: String,
    error_injector: Arc<KVErrorInjector>,
    watch_sender: broadcast::Sender<KVEntry>,
}

impl std::fmt::Debug for SimpleKVStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SimpleKVStore")
            .field("name", &self.name)
            .field("state", &self.state)
            .finish()
    }
}

impl SimpleKVStore {
    pub fn new(name: impl Into<String>) -> Self {
        let (watch_sender, _) = broadcast::channel(1024);
        Self {
            state: Arc::new(RwLock::new(KVState::default())),
            name: name.into(),
            error_injector: Arc::new(KVErrorInjector::new()),
            watch_sender,
        }
    }

    pub fn error_injector(&self) -> &Arc<KVErrorInjector> {
        &self.error_injector
    }

    pub fn revision(&self) -> u64 {
        self.state.read().revision
    }

    pub fn len(&self) -> usize {
        self.state.read().data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.state.read().data.is_empty()
    }

    pub fn watch_count(&self) -> usize {
        self.state.read().watches
    }

    /// Reads a key without going through the error injector.
    pub fn peek(&self, key: &str) -> Option<Bytes> {
        self.state.read().data.get(key).map(|entry| entry.value.clone())
    }

    /// Revision of the latest write of `key`, without going through the error injector.
    pub fn key_revision(&self, key: &str) -> Option<u64> {
        self.state.read().data.get(key).map(|entry| entry.revision)
    }

    pub fn snapshot(&self) -> HashMap<String, Bytes> {
        self.state
            .read()
            .data
            .iter()
            .map(|(key, entry)| (key.clone(), entry.value.clone()))
            .collect()
    }

    /// Applies a mutation if `expected` accepts the latest value of `key` and notifies
    /// watchers. The notification is sent while the write lock is held so watchers observe
    /// changes in revision order. Returns the revision of the mutation.
    fn mutate_if(
        &self,
        key: &str,
        value: Bytes,
        operation: KVWatchOp,
        expected: impl FnOnce(Option<&KVValue>) -> bool,
    ) -> Option<u64> {
        let mut state = self.state.write();
        if !expected(state.data.get(key)) {
            return None;
        }

        state.revision += 1;
        let revision = state.revision;
        match operation {
            KVWatchOp::Put => {
                state.data.insert(
                    key.to_string(),
                    KVValue {
                        value: value.clone(),
                        revision,
                        updated: SystemTime::now(),
                    },
                );
            }
            KVWatchOp::Delete | KVWatchOp::Purge => {
                state.data.remove(key);
            }
        }
        let _ = self.watch_sender.send(KVEntry {
            key: key.to_string(),
            value,
            operation,
            revision,
        });
        Some(revision)
    }

    /// Revision check for conditional writes.
    fn is_latest(revision: u64) -> impl FnOnce(Option<&KVValue>) -> bool {
        move |current| current.is_some_and(|entry| entry.revision == revision)
    }
}

#[async_trait]
impl KVStore for SimpleKVStore {
    async fn get(&self, key: &str) -> KVResult<Option<Bytes>> {
        Ok(self.entry(key).await?.map(|entry| entry.value))
    }

    async fn entry(&self, key: &str) -> KVResult<Option<KVValue>> {
        if self.error_injector.should_fail_get() {
            return Err(Box::new(SimpleKVStoreError::Get(
                "injected failure".to_string(),
            )));
        }

        Ok(self.state.read().data.get(key).cloned())
    }

    async fn create(&self, key: &str, value: Bytes) -> KVResult<Option<u64>> {
        self.error_injector.apply_create_latency().await;

        if self.error_injector.should_fail_create() {
            return Err(Box::new(SimpleKVStoreError::Create(
                "injected failure".to_string(),
            )));
        }

        Ok(self.mutate_if(key, value, KVWatchOp::Put, |current| current.is_none()))
    }

    async fn update(&self, key: &str, value: Bytes, revision: u64) -> KVResult<Option<u64>> {
        if self.error_injector.should_fail_put() {
            return Err(Box::new(SimpleKVStoreError::Put(
                "injected failure".to_string(),
            )));
        }

        Ok(self.mutate_if(key, value, KVWatchOp::Put, Self::is_latest(revision)))
    }

    async fn put(&self, key: &str, value: Bytes) -> KVResult<()> {
        if self.error_injector.should_fail_put() {
            return Err(Box::new(SimpleKVStoreError::Put(
                "injected failure".to_string(),
            )));
        }

        self.mutate_if(key, value, KVWatchOp::Put, |_| true);
        Ok(())
    }

    async fn delete(&self, key: &str) -> KVResult<()> {
        if self.error_injector.should_fail_delete() {
            return Err(Box::new(SimpleKVStoreError::Delete(
                "injected failure".to_string(),
            )));
        }

        self.mutate_if(key, Bytes::new(), KVWatchOp::Delete, |_| true);
        Ok(())
    }

    async fn delete_revision(&self, key: &str, revision: u64) -> KVResult<bool> {
        if self.error_injector.should_fail_delete() {
            return Err(Box::new(SimpleKVStoreError::Delete(
                "injected failure".to_string(),
            )));
        }

        Ok(self
            .mutate_if(key, Bytes::new(), KVWatchOp::Delete, Self::is_latest(revision))
            .is_some())
    }

    async fn watch(&self, key: &str) -> KVResult<KVWatchStream> {
        self.state.write().watches += 1;
        if self.error_injector.should_fail_watch() {
            return Err(Box::new(SimpleKVStoreError::Watch(
                "injected failure".to_string(),
            )));
        }

        let watcher = Watcher {
            key: key.to_string(),
            updates: self.watch_sender.subscribe(),
            close: self.error_injector.watch_close_receiver(),
            close_after: self.error_injector.close_watch_after_items(),
            emitted: 0,
            closed: self.error_injector.should_close_all_watches(),
        };

        Ok(Box::pin(stream::unfold(watcher, Watcher::next)))
    }

    fn name(&self) -> &str {
        &self.name
    }
}

/// State of a single watch stream.
struct Watcher {
    key: String,
    updates: broadcast::Receiver<KVEntry>,
    close: broadcast::Receiver<()>,
    close_after: usize,
    emitted: usize,
    closed: bool,
}

impl Watcher {
    async fn next(mut self) -> Option<(KVEntry, Self)> {
        loop {
            if self.closed || (self.close_after > 0 && self.emitted >= self.close_after) {
                return None;
            }

            tokio::select! {
                biased;
                _ = self.close.recv() => {
                    self.closed = true;
                }
                update = self.updates.recv() => match update {
                    Ok(entry) if entry.key == self.key => {
                        self.emitted += 1;
                        return Some((entry, self));
                    }
                    Ok(_) => {}
                    // a lagging watcher has missed changes, end it like a lost subscription
                    Err(RecvError::Lagged(_)) | Err(RecvError::Closed) => {
                        self.closed = true;
                    }
                },
            }
        }
    }
}
