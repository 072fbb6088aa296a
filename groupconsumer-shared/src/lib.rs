/// Error exposed by the shared library.
pub mod error;

/// Generic KV store used for partition ownership and committed offsets.
pub mod kv;

/// JetStream client configuration and connection helpers.
pub mod jetstream;
