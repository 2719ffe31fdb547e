//! Protocol error types and the client-visible error taxonomy.

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Result alias for protocol decoding.
pub type Result<T> = std::result::Result<T, ProtocolError>;

/// Errors raised while decoding or encoding wire frames.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ProtocolError {
    /// Frame was not valid JSON or lacked the `type` field
    #[error("malformed frame: {0}")]
    Malformed(String),

    /// Known message type whose payload did not match its schema
    #[error("invalid payload for {kind}: {reason}")]
    InvalidPayload {
        /// Message type that failed to parse
        kind: String,
        /// Parser diagnostic
        reason: String,
    },

    /// Encoding a server message failed
    #[error("encode failed: {0}")]
    Encode(String),
}

/// Stable, client-visible error codes carried in `error` frames.
///
/// Serialized in SCREAMING_SNAKE_CASE (`ROOM_FULL`, `STALE`, ...). Clients
/// branch on these values, so variants are never renamed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorCode {
    /// Configuration parameter out of range
    InvalidConfig,
    /// Room code or game id unknown
    NotFound,
    /// Max players reached
    RoomFull,
    /// Room already left the lobby
    AlreadyStarted,
    /// Same player already seated and connected
    DuplicatePlayer,
    /// Submission for a question index that is not current
    Stale,
    /// Duplicate submission for the current round
    AlreadyAnswered,
    /// Reconnect to a finished or unknown game
    UnknownGame,
    /// Reconnect by a player never seated in the game
    UnknownPlayer,
    /// Per-session message rate exceeded
    RateLimited,
    /// Invariant violation; the room has been aborted
    Internal,
    /// Host-only action attempted by another player
    NotHost,
    /// Start requested before enough players are ready
    NotReady,
    /// Room-scoped message from a session without a seat
    NotInRoom,
    /// Known message type with an unparseable payload
    InvalidMessage,
    /// Question source produced no questions for the selection
    NoQuestions,
}

impl ErrorCode {
    /// Wire representation, identical to the serialized form.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::InvalidConfig => "INVALID_CONFIG",
            Self::NotFound => "NOT_FOUND",
            Self::RoomFull => "ROOM_FULL",
            Self::AlreadyStarted => "ALREADY_STARTED",
            Self::DuplicatePlayer => "DUPLICATE_PLAYER",
            Self::Stale => "STALE",
            Self::AlreadyAnswered => "ALREADY_ANSWERED",
            Self::UnknownGame => "UNKNOWN_GAME",
            Self::UnknownPlayer => "UNKNOWN_PLAYER",
            Self::RateLimited => "RATE_LIMITED",
            Self::Internal => "INTERNAL",
            Self::NotHost => "NOT_HOST",
            Self::NotReady => "NOT_READY",
            Self::NotInRoom => "NOT_IN_ROOM",
            Self::InvalidMessage => "INVALID_MESSAGE",
            Self::NoQuestions => "NO_QUESTIONS",
        }
    }

    /// Fatal codes send the client back to the lobby. `STALE` and
    /// `ALREADY_ANSWERED` are silently dropped by the UI.
    pub fn is_fatal(self) -> bool {
        matches!(
            self,
            Self::NotFound | Self::UnknownGame | Self::UnknownPlayer | Self::Internal
        )
    }
}

impl std::fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}
