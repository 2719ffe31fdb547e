//! Storage error types.
//!
//! - `NotFound`: requested game doesn't exist
//! - `Conflict`: event log index did not move forward
//! - `Serialization`: failed to encode/decode a record
//! - `Io`: underlying storage system errors

use thiserror::Error;

/// Errors that can occur during storage operations
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum StorageError {
    /// Game not found
    #[error("game not found: {game_id}")]
    NotFound {
        /// Game ID that was not found
        game_id: String,
    },

    /// Log index conflict
    ///
    /// Appending at an index at or below the latest stored index. Gaps are
    /// allowed; going backwards is not.
    #[error("log index conflict: expected at least {expected}, got {got}")]
    Conflict {
        /// Smallest acceptable index
        expected: u64,
        /// Provided log index
        got: u64,
    },

    /// Serialization or deserialization failed
    #[error("serialization error: {0}")]
    Serialization(String),

    /// I/O error (file system, database, etc.)
    #[error("I/O error: {0}")]
    Io(String),
}

impl From<std::io::Error> for StorageError {
    fn from(err: std::io::Error) -> Self {
        StorageError::Io(err.to_string())
    }
}
