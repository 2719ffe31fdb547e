//! Server → client messages and the sequenced envelope.
//!
//! Every server frame is `{type, payload, seq, timestamp}`. `seq` is set on
//! room broadcasts and omitted on direct replies (`error`, `pong`,
//! `reconnected`), which are not part of the room's total order.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::errors::{ErrorCode, ProtocolError, Result};

/// Room lifecycle phase as seen by clients.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Phase {
    /// Waiting for players
    Lobby,
    /// Question list frozen, countdown running
    Countdown,
    /// A question is open for answers
    InRound,
    /// Results shown, waiting for the next question
    BetweenRounds,
    /// Game finished normally
    Completed,
    /// Game ended abnormally
    Aborted,
}

impl Phase {
    /// Game has left the lobby and not yet finished.
    pub fn is_in_game(self) -> bool {
        matches!(self, Self::Countdown | Self::InRound | Self::BetweenRounds)
    }

    /// Game is over (normally or not).
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Aborted)
    }
}

/// Messages the server sends.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "payload", rename_all = "snake_case")]
pub enum ServerMessage {
    /// Full lobby view after any membership or config change
    RoomUpdate(RoomUpdate),
    /// Game accepted; question list frozen
    GameStart(GameStart),
    /// Countdown before the first question
    Countdown(Countdown),
    /// A new question is open
    Question(QuestionOpen),
    /// Someone answered (correctness withheld until the round ends)
    PlayerAnswered(PlayerAnswered),
    /// Round resolved
    RoundResult(RoundResult),
    /// Final leaderboard, or abort notice
    GameOver(GameOver),
    /// A player took a seat
    PlayerJoined(PlayerNotice),
    /// A player left the room or forfeited
    PlayerLeft(PlayerNotice),
    /// A seated player lost their connection mid-game
    PlayerDisconnected(PlayerNotice),
    /// A disconnected player is back
    PlayerReconnected(PlayerNotice),
    /// Resync snapshot, sent only to the reconnecting player
    Reconnected(Snapshot),
    /// Rejection of the client's last message
    Error(ErrorPayload),
    /// Reply to `ping`
    Pong(Pong),
}

impl ServerMessage {
    /// Wire `type` of this message.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::RoomUpdate(_) => "room_update",
            Self::GameStart(_) => "game_start",
            Self::Countdown(_) => "countdown",
            Self::Question(_) => "question",
            Self::PlayerAnswered(_) => "player_answered",
            Self::RoundResult(_) => "round_result",
            Self::GameOver(_) => "game_over",
            Self::PlayerJoined(_) => "player_joined",
            Self::PlayerLeft(_) => "player_left",
            Self::PlayerDisconnected(_) => "player_disconnected",
            Self::PlayerReconnected(_) => "player_reconnected",
            Self::Reconnected(_) => "reconnected",
            Self::Error(_) => "error",
            Self::Pong(_) => "pong",
        }
    }

    /// Build an `error` message.
    pub fn error(code: ErrorCode, message: impl Into<String>) -> Self {
        Self::Error(ErrorPayload { code, message: message.into() })
    }
}

/// Public view of a seated player.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PlayerView {
    /// Stable player identifier
    pub player_id: String,
    /// Display name
    pub username: String,
    /// Guest (unauthenticated) player
    pub is_guest: bool,
    /// Current host
    pub is_host: bool,
    /// Ready flag
    pub is_ready: bool,
    /// Has a live session
    pub connected: bool,
    /// Cumulative score
    pub score: u32,
}

/// Payload of `room_update`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RoomUpdate {
    /// Human-readable room code
    pub room_code: String,
    /// Current host
    pub host_player_id: String,
    /// Room phase
    pub phase: Phase,
    /// Seat limit
    pub max_players: u32,
    /// Requested question count
    pub question_count: u32,
    /// Seconds per question
    pub time_limit: u32,
    /// Theme filter
    pub theme_ids: Vec<u32>,
    /// Seated players in join order
    pub players: Vec<PlayerView>,
}

/// Payload of `game_start`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GameStart {
    /// Stable game identifier, used for reconnection
    pub game_id: String,
    /// Human-readable room code
    pub room_code: String,
    /// Questions actually drawn (may be below the requested count)
    pub question_count: u32,
    /// Seconds per question
    pub time_limit: u32,
    /// Countdown length before the first question
    pub countdown_ms: u64,
    /// Seated players in join order
    pub players: Vec<PlayerView>,
}

/// Payload of `countdown`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Countdown {
    /// Whole seconds until the first question
    pub seconds: u32,
    /// Wall-clock milliseconds when the first question opens
    pub starts_at: u64,
}

/// Client-facing question. The correct answer and reference are withheld
/// until the round result.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QuestionView {
    /// Question id from the question source
    pub id: u64,
    /// Prompt text
    pub text: String,
    /// Shuffled answer options
    pub options: Vec<String>,
    /// Theme name, if known
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub theme_name: Option<String>,
    /// Difficulty label
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub difficulty: Option<String>,
}

/// Payload of `question`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QuestionOpen {
    /// Zero-based question index
    pub question_index: u32,
    /// Total questions in this game
    pub question_count: u32,
    /// The question
    pub question: QuestionView,
    /// Wall-clock milliseconds when the round closes
    pub deadline: u64,
    /// Seconds per question
    pub time_limit: u32,
}

/// Payload of `player_answered`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PlayerAnswered {
    /// Player who answered
    pub player_id: String,
    /// Question index answered
    pub question_index: u32,
    /// Connected players that have answered so far
    pub answered_count: u32,
    /// Connected players awaited this round
    pub connected_count: u32,
}

/// Why a round closed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RoundEnd {
    /// Every connected player answered
    AllAnswered,
    /// The deadline elapsed
    Deadline,
}

/// One player's outcome for a round.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PlayerRoundResult {
    /// Player
    pub player_id: String,
    /// Submitted an answer this round
    pub answered: bool,
    /// Answer was correct
    pub correct: bool,
    /// Points awarded this round
    pub delta: u32,
    /// Cumulative score after this round
    pub score: u32,
}

/// Payload of `round_result`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RoundResult {
    /// Index of the resolved question
    pub question_index: u32,
    /// Correct option text
    pub correct_answer: String,
    /// Scripture reference, revealed with the answer
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reference: Option<String>,
    /// Why the round closed
    pub reason: RoundEnd,
    /// Per-player outcomes in join order
    pub results: Vec<PlayerRoundResult>,
    /// Cumulative scores after this round
    pub scores: BTreeMap<String, u32>,
    /// Wall-clock milliseconds of the next transition
    pub next_at: u64,
    /// This was the last question
    pub is_last: bool,
}

/// How the game ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Outcome {
    /// All questions resolved, or lifetime cap reached
    Completed,
    /// Abandoned or failed an internal check
    Aborted,
}

/// One leaderboard row.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LeaderboardEntry {
    /// 1-based rank
    pub placement: u32,
    /// Player
    pub player_id: String,
    /// Display name
    pub username: String,
    /// Final score
    pub score: u32,
    /// Correct answers
    pub correct: u32,
    /// Wrong answers
    pub wrong: u32,
    /// Questions answered
    pub questions_answered: u32,
}

/// Payload of `game_over`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GameOver {
    /// Game identifier
    pub game_id: String,
    /// Completed or aborted
    pub outcome: Outcome,
    /// Abort or early-completion reason
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
    /// Ranked leaderboard
    pub leaderboard: Vec<LeaderboardEntry>,
    /// First place, if anyone scored
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub winner_id: Option<String>,
}

/// Payload of the player membership notices.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PlayerNotice {
    /// Player concerned
    pub player_id: String,
    /// Display name
    pub username: String,
}

/// Payload of `reconnected`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Snapshot {
    /// Game identifier
    pub game_id: String,
    /// Human-readable room code
    pub room_code: String,
    /// Room phase
    pub phase: Phase,
    /// Current question index
    pub current_question: u32,
    /// Total questions in this game
    pub question_count: u32,
    /// Open question, present only while in a round
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub current_question_payload: Option<QuestionView>,
    /// Wall-clock milliseconds of the open round's deadline
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub round_deadline_timestamp: Option<u64>,
    /// Cumulative scores
    pub player_scores: BTreeMap<String, u32>,
    /// Answered flags for the current round
    pub players_answered: BTreeMap<String, bool>,
    /// Latest broadcast seq at snapshot time
    pub current_seq: u64,
    /// Seated players in join order
    pub players: Vec<PlayerView>,
}

/// Payload of `error`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorPayload {
    /// Stable error code
    pub code: ErrorCode,
    /// Human-readable message
    pub message: String,
}

/// Payload of `pong`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Pong {}

/// A server frame: message plus sequencing metadata.
#[derive(Debug, Clone, PartialEq)]
pub struct Envelope {
    /// The message
    pub message: ServerMessage,
    /// Room broadcast sequence; `None` on direct replies
    pub seq: Option<u64>,
    /// Server wall-clock milliseconds
    pub timestamp: u64,
}

#[derive(Serialize)]
struct WireOut<'a> {
    #[serde(flatten)]
    message: &'a ServerMessage,
    #[serde(skip_serializing_if = "Option::is_none")]
    seq: Option<u64>,
    timestamp: u64,
}

#[derive(Deserialize)]
struct WireIn {
    #[serde(rename = "type")]
    kind: String,
    #[serde(default)]
    payload: Value,
    #[serde(default)]
    seq: Option<u64>,
    timestamp: u64,
}

impl Envelope {
    /// Broadcast envelope carrying a room sequence number.
    pub fn sequenced(message: ServerMessage, seq: u64, timestamp: u64) -> Self {
        Self { message, seq: Some(seq), timestamp }
    }

    /// Direct reply outside the room's total order.
    pub fn direct(message: ServerMessage, timestamp: u64) -> Self {
        Self { message, seq: None, timestamp }
    }

    /// Serialize to a JSON text frame.
    ///
    /// # Errors
    ///
    /// Returns `ProtocolError::Encode` if serialization fails.
    pub fn encode(&self) -> Result<String> {
        serde_json::to_string(&WireOut {
            message: &self.message,
            seq: self.seq,
            timestamp: self.timestamp,
        })
        .map_err(|e| ProtocolError::Encode(e.to_string()))
    }

    /// Parse a JSON text frame (client side).
    ///
    /// # Errors
    ///
    /// - `ProtocolError::Malformed` if the outer frame does not parse
    /// - `ProtocolError::InvalidPayload` if the payload does not match `type`
    pub fn decode(text: &str) -> Result<Self> {
        let wire: WireIn =
            serde_json::from_str(text).map_err(|e| ProtocolError::Malformed(e.to_string()))?;

        let mut tagged = serde_json::Map::new();
        tagged.insert("type".to_string(), Value::String(wire.kind.clone()));
        tagged.insert("payload".to_string(), wire.payload);

        let message = serde_json::from_value(Value::Object(tagged)).map_err(|e| {
            ProtocolError::InvalidPayload { kind: wire.kind, reason: e.to_string() }
        })?;

        Ok(Self { message, seq: wire.seq, timestamp: wire.timestamp })
    }
}
