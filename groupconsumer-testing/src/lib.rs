//! Test doubles for the consumer group coordination backends.

/// In-memory KV store with error injection, used in place of a JetStream bucket.
pub mod simplekvstore;
