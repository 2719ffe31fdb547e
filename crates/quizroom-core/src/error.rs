//! Error types for the quizroom core.
//!
//! Session errors describe why a player's socket was closed. They never
//! reach the room directly; the room only learns that the player
//! disconnected.

use std::{io, time::Duration};

use thiserror::Error;

/// Reasons a player session ends.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SessionError {
    /// No inbound traffic within the idle timeout
    #[error("idle timeout after {elapsed:?}")]
    IdleTimeout {
        /// How long the socket was silent
        elapsed: Duration,
    },

    /// A single socket write exceeded the write timeout
    #[error("write timeout after {elapsed:?}")]
    WriteTimeout {
        /// Configured limit that was exceeded
        elapsed: Duration,
    },

    /// Too many consecutive broadcasts dropped on a full queue
    #[error("session unhealthy after {drops} consecutive drops")]
    Unhealthy {
        /// Consecutive drops observed
        drops: u32,
    },

    /// Peer sent a close frame or the stream ended
    #[error("peer closed: {0}")]
    PeerClosed(String),

    /// Session replaced by a newer connection for the same player
    #[error("superseded by a newer session")]
    Superseded,

    /// Underlying transport error
    #[error("transport error: {0}")]
    Transport(String),
}

impl SessionError {
    /// Returns true if the client should simply reconnect.
    ///
    /// Every session error is recoverable through the reconnection flow
    /// except being superseded, where a newer session already holds the seat.
    pub fn is_transient(&self) -> bool {
        !matches!(self, Self::Superseded)
    }
}

impl From<SessionError> for io::Error {
    fn from(err: SessionError) -> Self {
        let kind = match &err {
            SessionError::IdleTimeout { .. } | SessionError::WriteTimeout { .. } => {
                io::ErrorKind::TimedOut
            },
            SessionError::PeerClosed(_) | SessionError::Superseded => {
                io::ErrorKind::ConnectionAborted
            },
            SessionError::Unhealthy { .. } | SessionError::Transport(_) => io::ErrorKind::Other,
        };
        Self::new(kind, err.to_string())
    }
}

impl From<io::Error> for SessionError {
    fn from(err: io::Error) -> Self {
        Self::Transport(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn timeouts_are_transient() {
        assert!(SessionError::IdleTimeout { elapsed: Duration::from_secs(61) }.is_transient());
        assert!(SessionError::WriteTimeout { elapsed: Duration::from_secs(10) }.is_transient());
        assert!(SessionError::Unhealthy { drops: 5 }.is_transient());
    }

    #[test]
    fn superseded_is_final() {
        assert!(!SessionError::Superseded.is_transient());
    }

    #[test]
    fn io_conversion_keeps_kind() {
        let err: io::Error = SessionError::IdleTimeout { elapsed: Duration::from_secs(61) }.into();
        assert_eq!(err.kind(), io::ErrorKind::TimedOut);
    }
}
