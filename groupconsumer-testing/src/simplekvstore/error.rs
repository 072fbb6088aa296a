use thiserror::Error;

/// Result type for simple KV store operations.
pub type Result<T> = std::result::Result<T, SimpleKVStoreError>;

/// Errors returned by [`super::SimpleKVStore`]. They are only ever produced by injection.
#[derive(Error, Debug, Clone)]
pub enum SimpleKVStoreError {
    #[error("Failed to get value: {0}")]
    Get(String),

    #[error("Failed to create key: {0}")]
    Create(String),

    #[error("Failed to put value: {0}")]
    Put(String),

    #[error("Failed to delete key: {0}")]
    Delete(String),

    #[error("Failed to create watch: {0}")]
    Watch(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        assert_eq!(
            SimpleKVStoreError::Get("timeout".to_string()).to_string(),
            "Failed to get value: timeout"
        );
        assert_eq!(
            SimpleKVStoreError::Create("conflict".to_string()).to_string(),
            "Failed to create key: conflict"
        );
        assert_eq!(
            SimpleKVStoreError::Watch("subscription failed".to_string()).to_string(),
            "Failed to create watch: subscription failed"
        );
    }

    #[test]
    fn test_error_boxes_as_kv_error() {
        let err: groupconsumer_shared::kv::KVError =
            Box::new(SimpleKVStoreError::Delete("injected".to_string()));
        assert_eq!(err.to_string(), "Failed to delete key: injected");
    }
}
