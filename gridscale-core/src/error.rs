//! Error types for GridScale

use thiserror::Error;

/// Result type alias for GridScale operations
pub type Result<T> = std::result::Result<T, GridError>;

/// GridScale error types
#[derive(Error, Debug)]
pub enum GridError {
    /// IO operation failed
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Data corruption detected
    #[error("Data corruption: {0}")]
    Corruption(String),

    /// Checksum mismatch
    #[error("Checksum mismatch: expected {expected}, got {actual}")]
    ChecksumMismatch { expected: u32, actual: u32 },

    /// Invalid data format
    #[error("Invalid format: {0}")]
    InvalidFormat(String),

    /// Compression/decompression error
    #[error("Compression error: {0}")]
    Compression(String),

    /// Encoding or decoding of a payload failed
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    /// Range decomposition received an empty or non-positive range
    #[error("Invalid time range: start={start}, end={end}")]
    InvalidTimeRange { start: i64, end: i64 },

    /// Handle cache is at its limit and nothing could be evicted
    #[error("Chunk cache full: {cached} handles cached, limit {limit}")]
    CacheFull { cached: usize, limit: usize },

    /// Write issued against a handle opened for reading
    #[error("Chunk opened read-only: {0}")]
    ReadOnlyChunk(String),

    /// Candidate chunk has no physical directory
    #[error("Chunk not found: {0}")]
    ChunkNotFound(String),

    /// Merge frame produced neither a row to yield nor a row to discard
    #[error("Merge stalled with {active} active cursors")]
    MergeStalled { active: usize },

    /// Worker received a method it does not implement
    #[error("Unknown method: {0}")]
    UnknownMethod(String),

    /// Worker thread is gone or refused the call
    #[error("Worker {index} unavailable: {reason}")]
    WorkerUnavailable { index: usize, reason: String },

    /// Internal error
    #[error("Internal error: {0}")]
    Internal(String),
}

impl GridError {
    /// Check if error is retryable
    pub fn is_retryable(&self) -> bool {
        matches!(self, GridError::Io(_) | GridError::CacheFull { .. })
    }

    /// Check if error indicates corruption
    pub fn is_corruption(&self) -> bool {
        matches!(
            self,
            GridError::Corruption(_) | GridError::ChecksumMismatch { .. }
        )
    }
}

impl From<bincode::Error> for GridError {
    fn from(e: bincode::Error) -> Self {
        GridError::Serialization(e.to_string())
    }
}

impl From<serde_json::Error> for GridError {
    fn from(e: serde_json::Error) -> Self {
        GridError::Serialization(e.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_retryable_classification() {
        assert!(GridError::CacheFull { cached: 4, limit: 4 }.is_retryable());
        assert!(!GridError::MergeStalled { active: 2 }.is_retryable());
        assert!(!GridError::ReadOnlyChunk("a".into()).is_retryable());
        assert!(GridError::ChecksumMismatch { expected: 1, actual: 2 }.is_corruption());
    }
}
