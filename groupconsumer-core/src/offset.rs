use std::fmt;
use std::str::FromStr;

use async_trait::async_trait;

use crate::error::{Error, Result};
use crate::partition::PartitionId;

/// Offsets committed to a KV bucket.
pub mod kv;

/// Where a reader starts consuming a partition.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StartOffset {
    /// The oldest record still retained by the log.
    Oldest,
    /// Only records appended after the reader is attached.
    Newest,
    /// An explicit position.
    At(i64),
}

impl StartOffset {
    /// Start at the committed offset, or at `initial` if nothing has been committed yet
    /// (the store reports a negative offset).
    pub fn resolve(committed: i64, initial: InitialOffset) -> Self {
        if committed < 0 {
            initial.into()
        } else {
            StartOffset::At(committed)
        }
    }
}

impl fmt::Display for StartOffset {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StartOffset::Oldest => f.write_str("oldest"),
            StartOffset::Newest => f.write_str("newest"),
            StartOffset::At(offset) => write!(f, "{offset}"),
        }
    }
}

/// Where to start when there is no usable committed offset, either because nothing was
/// committed or because the committed offset is no longer retained.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum InitialOffset {
    #[default]
    Oldest,
    Newest,
}

impl From<InitialOffset> for StartOffset {
    fn from(value: InitialOffset) -> Self {
        match value {
            InitialOffset::Oldest => StartOffset::Oldest,
            InitialOffset::Newest => StartOffset::Newest,
        }
    }
}

impl FromStr for InitialOffset {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "oldest" | "earliest" => Ok(InitialOffset::Oldest),
            "newest" | "latest" => Ok(InitialOffset::Newest),
            other => Err(Error::Config(format!(
                "invalid initial offset {other:?}, expected oldest or newest"
            ))),
        }
    }
}

/// Reads the last committed offset of a partition.
#[async_trait]
pub trait OffsetStore: Send + Sync {
    /// Returns a negative offset if nothing was ever committed for the partition.
    async fn fetch(&self, partition: &PartitionId) -> Result<i64>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_resolve_start_offset() {
        assert_eq!(
            StartOffset::resolve(-1, InitialOffset::Oldest),
            StartOffset::Oldest
        );
        assert_eq!(
            StartOffset::resolve(-1, InitialOffset::Newest),
            StartOffset::Newest
        );
        assert_eq!(
            StartOffset::resolve(0, InitialOffset::Newest),
            StartOffset::At(0)
        );
        assert_eq!(
            StartOffset::resolve(1234, InitialOffset::Oldest),
            StartOffset::At(1234)
        );
    }

    #[test]
    fn test_parse_initial_offset() {
        assert_eq!("oldest".parse::<InitialOffset>().unwrap(), InitialOffset::Oldest);
        assert_eq!("Earliest".parse::<InitialOffset>().unwrap(), InitialOffset::Oldest);
        assert_eq!("NEWEST".parse::<InitialOffset>().unwrap(), InitialOffset::Newest);
        assert_eq!(" latest ".parse::<InitialOffset>().unwrap(), InitialOffset::Newest);
        assert!(matches!(
            "middle".parse::<InitialOffset>(),
            Err(Error::Config(_))
        ));
        assert_eq!(InitialOffset::default(), InitialOffset::Oldest);
    }

    #[test]
    fn test_start_offset_display() {
        assert_eq!(StartOffset::Oldest.to_string(), "oldest");
        assert_eq!(StartOffset::Newest.to_string(), "newest");
        assert_eq!(StartOffset::At(17).to_string(), "17");
    }
}
