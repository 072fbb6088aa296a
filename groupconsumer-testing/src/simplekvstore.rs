//! In-memory KV store for testing ownership claims and committed offsets.
//!
//! [`SimpleKVStore`] implements `groupconsumer_shared::kv::KVStore` with the same semantics as
//! the JetStream backed store: `create` is an atomic insert-if-absent, `update` and
//! `delete_revision` only apply to the latest revision of a key, and `watch` only yields
//! changes made after the watch was created. Every operation can be made to fail through the
//! [`KVErrorInjector`].
//!
//! # Example
//! ```ignore
//! use groupconsumer_testing::simplekvstore::SimpleKVStore;
//! use groupconsumer_shared::kv::KVStore;
//! use bytes::Bytes;
//!
//! let store = SimpleKVStore::new("owners");
//! let revision = store.create("owners/orders/0", Bytes::from("instance-a")).await.unwrap();
//! assert_eq!(revision, Some(1));
//! assert_eq!(store.create("owners/orders/0", Bytes::from("instance-b")).await.unwrap(), None);
//!
//! // the next get fails
//! store.error_injector().fail_gets(1);
//! assert!(store.get("owners/orders/0").await.is_err());
//!
//! // every open watch ends, as if the subscription was lost
//! store.error_injector().close_all_watch_streams();
//! ```

mod error;
mod error_injector;
mod store;

pub use error::{Result, SimpleKVStoreError};
pub use error_injector::KVErrorInjector;
pub use store::SimpleKVStore;
