//! Generic Key-Value store traits for pluggable coordination backends.
//!
//! The consumer group keeps two kinds of state in a KV bucket: who owns which partition, and
//! the last committed offset of each partition. Offsets only need point reads and writes.
//! Claims are leases: they are created atomically, renewed and removed with writes that only
//! apply to the revision the writer last saw, and watched to learn when they change hands.
//!
//! The trait uses `async_trait` so it can be used as `Arc<dyn KVStore>`.

use std::error::Error as StdError;
use std::pin::Pin;
use std::time::SystemTime;

use async_trait::async_trait;
use bytes::Bytes;
use futures::Stream;

pub mod jetstream;

/// Error type for KV operations (boxed for object safety)
pub type KVError = Box<dyn StdError + Send + Sync + 'static>;

pub type KVResult<T> = Result<T, KVError>;

/// Operation type for KV watch events
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KVWatchOp {
    /// An element has been put/added into the KV store
    Put,
    /// An element has been deleted
    Delete,
    /// The KV bucket has been purged
    Purge,
}

/// A single change observed on a watched key.
#[derive(Debug, Clone)]
pub struct KVEntry {
    pub key: String,
    /// Empty for deletes and purges.
    pub value: Bytes,
    pub operation: KVWatchOp,
    /// Revision of the bucket that recorded the change.
    pub revision: u64,
}

/// The current value of a key together with the write that produced it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KVValue {
    pub value: Bytes,
    /// Revision to pass to [`KVStore::update`] and [`KVStore::delete_revision`].
    pub revision: u64,
    /// When the store recorded the write, on the store's clock.
    pub updated: SystemTime,
}

/// Type alias for the watch stream.
pub type KVWatchStream = Pin<Box<dyn Stream<Item = KVEntry> + Send>>;

#[async_trait]
pub trait KVStore: Send + Sync {
    /// Get the value for a given key, `None` if the key does not exist.
    async fn get(&self, key: &str) -> KVResult<Option<Bytes>>;

    /// Get the value of `key` along with its revision, `None` if the key does not exist.
    async fn entry(&self, key: &str) -> KVResult<Option<KVValue>>;

    /// Atomically create `key` with `value` and return the revision of the write.
    ///
    /// Returns `Ok(None)` without modifying the store if the key already exists.
    async fn create(&self, key: &str, value: Bytes) -> KVResult<Option<u64>>;

    /// Overwrite `key` only if `revision` is still its latest write. Returns the new revision,
    /// or `Ok(None)` if the key was changed or deleted since.
    async fn update(&self, key: &str, value: Bytes, revision: u64) -> KVResult<Option<u64>>;

    /// Insert or update a key-value pair.
    async fn put(&self, key: &str, value: Bytes) -> KVResult<()>;

    /// Delete a key from the KV store.
    async fn delete(&self, key: &str) -> KVResult<()>;

    /// Delete `key` only if `revision` is still its latest write. Returns `Ok(false)` if the
    /// key was changed or deleted since.
    async fn delete_revision(&self, key: &str, revision: u64) -> KVResult<bool>;

    /// Watch `key` for changes made after the watch was created. The stream ends if the
    /// underlying subscription is lost.
    async fn watch(&self, key: &str) -> KVResult<KVWatchStream>;

    /// Get the store name/identifier, typically the bucket name.
    fn name(&self) -> &str;
}
