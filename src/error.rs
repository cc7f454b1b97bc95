//! Error types for the partitioning pipeline.

use std::path::PathBuf;
use thiserror::Error;

/// Crate-wide result alias.
pub type Result<T> = std::result::Result<T, ShardError>;

/// Errors produced by tree construction, persistence, and the repair pipeline.
#[derive(Debug, Error)]
pub enum ShardError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("unexpected end of stream")]
    UnexpectedEof,

    #[error("invalid record format")]
    InvalidFormat,

    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    /// The on-disk leaf directory set cannot form a valid tree. There is no
    /// partial-tree fallback; tree shape is load-bearing for every stage.
    #[error("structural corruption: {0}")]
    StructuralCorruption(String),

    #[error("precondition failed: {0}")]
    Precondition(String),

    #[error("metadata file {path}: {reason}")]
    Metadata { path: PathBuf, reason: String },

    #[error("worker pool shut down before task completion")]
    PoolShutdown,

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl ShardError {
    /// True for errors that must abort the whole run rather than one stage.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            ShardError::StructuralCorruption(_) | ShardError::Precondition(_)
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fatal_classification() {
        assert!(ShardError::StructuralCorruption("sibling missing".into()).is_fatal());
        assert!(ShardError::Precondition("output dir not empty".into()).is_fatal());
        assert!(!ShardError::UnexpectedEof.is_fatal());
        assert!(!ShardError::InvalidFormat.is_fatal());
    }

    #[test]
    fn test_io_conversion() {
        let io = std::io::Error::new(std::io::ErrorKind::NotFound, "gone");
        let err: ShardError = io.into();
        assert!(matches!(err, ShardError::Io(_)));
    }
}
