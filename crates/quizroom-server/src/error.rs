//! Server runtime errors.

use std::fmt;

use crate::{question_source::QuestionError, storage::StorageError};

/// Errors that stop the server from starting or running.
#[derive(Debug)]
pub enum ServerError {
    /// Invalid configuration or unreadable question bank
    Config(String),

    /// Listener or socket failure
    Transport(String),

    /// Storage backend could not be opened
    Storage(StorageError),

    /// Unexpected internal failure
    Internal(String),
}

impl fmt::Display for ServerError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Config(msg) => write!(f, "configuration error: {msg}"),
            Self::Transport(msg) => write!(f, "transport error: {msg}"),
            Self::Storage(err) => write!(f, "storage error: {err}"),
            Self::Internal(msg) => write!(f, "internal error: {msg}"),
        }
    }
}

impl std::error::Error for ServerError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Storage(err) => Some(err),
            _ => None,
        }
    }
}

impl From<std::io::Error> for ServerError {
    fn from(err: std::io::Error) -> Self {
        Self::Transport(err.to_string())
    }
}

impl From<StorageError> for ServerError {
    fn from(err: StorageError) -> Self {
        Self::Storage(err)
    }
}

impl From<QuestionError> for ServerError {
    fn from(err: QuestionError) -> Self {
        Self::Config(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn display() {
        let err = ServerError::Config("no questions".to_string());
        assert_eq!(err.to_string(), "configuration error: no questions");

        let err: ServerError = std::io::Error::other("port in use").into();
        assert_eq!(err.to_string(), "transport error: port in use");
    }

    #[test]
    fn storage_is_source() {
        let err: ServerError = StorageError::Io("disk full".to_string()).into();
        assert!(std::error::Error::source(&err).is_some());
    }
}
