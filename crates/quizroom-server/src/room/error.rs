//! Client-visible room rejections.

use quizroom_proto::ErrorCode;
use thiserror::Error;

use crate::sequencer::SequencerError;

/// Errors returned by room and registry operations.
///
/// Every variant maps onto exactly one wire [`ErrorCode`]. Validation
/// errors leave room state untouched; `Internal` is only produced after the
/// room has aborted itself.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum RoomError {
    /// Configuration parameter out of range
    #[error("invalid room configuration: {0}")]
    InvalidConfig(String),

    /// Room code or game id unknown
    #[error("room not found: {0}")]
    NotFound(String),

    /// No free seat
    #[error("room is full ({max_players} players)")]
    RoomFull {
        /// Seat limit
        max_players: u32,
    },

    /// Room has left the lobby
    #[error("game already started")]
    AlreadyStarted,

    /// Player already seated and connected
    #[error("player {0} is already in a room")]
    DuplicatePlayer(String),

    /// Submission for a question that is not open
    #[error("question {got} is not current (current is {current})")]
    Stale {
        /// Open question index
        current: u32,
        /// Submitted question index
        got: u32,
    },

    /// Second submission for the round
    #[error("already answered question {0}")]
    AlreadyAnswered(u32),

    /// Reconnect to a finished or unknown game
    #[error("game {0} is not active")]
    UnknownGame(String),

    /// Reconnect by a player who was never seated
    #[error("player {0} is not part of this game")]
    UnknownPlayer(String),

    /// Host-only action
    #[error("only the host can do that")]
    NotHost,

    /// Not enough ready players
    #[error("need at least {needed} ready players, have {ready}")]
    NotReady {
        /// Ready players now
        ready: usize,
        /// Minimum required
        needed: usize,
    },

    /// Session has no seat
    #[error("not in a room")]
    NotInRoom,

    /// Question source came back empty
    #[error("no questions available for this selection")]
    NoQuestions,

    /// Room aborted after an invariant violation
    #[error("internal error: {0}")]
    Internal(String),
}

impl RoomError {
    /// Wire error code.
    pub fn code(&self) -> ErrorCode {
        match self {
            Self::InvalidConfig(_) => ErrorCode::InvalidConfig,
            Self::NotFound(_) => ErrorCode::NotFound,
            Self::RoomFull { .. } => ErrorCode::RoomFull,
            Self::AlreadyStarted => ErrorCode::AlreadyStarted,
            Self::DuplicatePlayer(_) => ErrorCode::DuplicatePlayer,
            Self::Stale { .. } => ErrorCode::Stale,
            Self::AlreadyAnswered(_) => ErrorCode::AlreadyAnswered,
            Self::UnknownGame(_) => ErrorCode::UnknownGame,
            Self::UnknownPlayer(_) => ErrorCode::UnknownPlayer,
            Self::NotHost => ErrorCode::NotHost,
            Self::NotReady { .. } => ErrorCode::NotReady,
            Self::NotInRoom => ErrorCode::NotInRoom,
            Self::NoQuestions => ErrorCode::NoQuestions,
            Self::Internal(_) => ErrorCode::Internal,
        }
    }
}

impl From<SequencerError> for RoomError {
    fn from(err: SequencerError) -> Self {
        Self::Internal(err.to_string())
    }
}
