use thiserror::Error;

use crate::partition::{InstanceId, PartitionId};

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Error, Debug, Clone)]
pub enum Error {
    #[error("Coordinator Error - {0}")]
    Coordinator(String),

    #[error("OffsetStore Error - {0}")]
    OffsetStore(String),

    #[error("Reader Error - {0}")]
    Reader(String),

    #[error("Offset {offset} is out of range for {partition}")]
    OffsetOutOfRange { partition: PartitionId, offset: i64 },

    #[error("Instance {instance} is already the owner of {partition}")]
    AlreadyOwner {
        partition: PartitionId,
        instance: InstanceId,
    },

    #[error("Instance {instance} lost its claim on {partition}")]
    LeaseLost {
        partition: PartitionId,
        instance: InstanceId,
    },

    #[error("Cancelled")]
    Cancelled,

    #[error("Config Error - {0}")]
    Config(String),

    #[error("Task Error - {0}")]
    Task(String),

    #[error("Metrics Error - {0}")]
    Metrics(String),
}

impl Error {
    /// Failures of an external call that may succeed when tried again.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Error::Coordinator(_) | Error::OffsetStore(_) | Error::Reader(_)
        )
    }
}

impl From<groupconsumer_shared::error::Error> for Error {
    fn from(value: groupconsumer_shared::error::Error) -> Self {
        use groupconsumer_shared::error::Error as SharedError;
        match value {
            SharedError::Connection(e) | SharedError::Jetstream(e) => Error::Coordinator(e),
            SharedError::Config(e) => Error::Config(e),
            SharedError::Cancelled => Error::Cancelled,
        }
    }
}
