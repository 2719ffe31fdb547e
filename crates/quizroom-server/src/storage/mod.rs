//! Storage abstraction for game records and the event log.
//!
//! Trait-based abstraction for persisting what the event log sink produces:
//! one record per game, one per seated player, and an append-only event log
//! per game. The trait is synchronous (no async); the sink worker calls it
//! from a blocking task so the room hot path never waits on storage.

mod chaotic;
mod error;
mod memory;
mod redb;

pub use chaotic::ChaoticStorage;
pub use error::StorageError;
pub use memory::MemoryStorage;
use serde::{Deserialize, Serialize};

pub use self::redb::RedbStorage;

/// Lifecycle status of a persisted game.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GameStatus {
    /// Room is in the lobby
    Waiting,
    /// Countdown or rounds in progress
    Playing,
    /// Finished normally (or by the lifetime cap)
    Completed,
    /// Aborted by abandonment or an invariant failure
    Abandoned,
}

/// One row of the games table.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GameRecord {
    /// Stable game identifier
    pub game_id: String,
    /// User-visible room code
    pub room_code: String,
    /// Current host
    pub host_player_id: String,
    /// Seat limit
    pub max_players: u32,
    /// Questions in the game (shrinks if the source has fewer)
    pub question_count: u32,
    /// Seconds per question
    pub time_limit: u32,
    /// Selected themes; empty means all
    pub theme_ids: Vec<u32>,
    /// Optional difficulty filter
    pub difficulty: Option<String>,
    /// Lifecycle status
    pub status: GameStatus,
    /// Index of the question in play or last resolved
    pub current_question: u32,
    /// Wall-clock millis at room creation
    pub created_at: u64,
    /// Wall-clock millis at `game_start`
    pub started_at: Option<u64>,
    /// Wall-clock millis at `game_over`
    pub completed_at: Option<u64>,
    /// Top of the leaderboard, if anyone scored
    pub winner_id: Option<String>,
}

/// One row of the `game_players` table.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PlayerRecord {
    /// Owning game
    pub game_id: String,
    /// Stable player identifier
    pub player_id: String,
    /// Authenticated account, if any
    pub user_id: Option<String>,
    /// Display name at join time
    pub username: String,
    /// Anonymous player
    pub is_guest: bool,
    /// Holds the host flag
    pub is_host: bool,
    /// Ready flag
    pub is_ready: bool,
    /// Cumulative score
    pub final_score: u32,
    /// Correct answers
    pub correct: u32,
    /// Wrong answers
    pub wrong: u32,
    /// Answers submitted
    pub questions_answered: u32,
    /// Final rank (1-based), set at `game_over`
    pub placement: Option<u32>,
    /// Wall-clock millis of first seat
    pub joined_at: u64,
    /// Wall-clock millis of leave or quit
    pub left_at: Option<u64>,
    /// Wall-clock millis of the latest disconnect
    pub disconnected_at: Option<u64>,
    /// Wall-clock millis of the latest reconnect
    pub reconnected_at: Option<u64>,
}

/// One row of the `game_events` table.
///
/// `log_index` is assigned by the room and strictly increases per game.
/// Gaps appear when the sink sheds load; storage only rejects indices that
/// do not move forward.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EventRecord {
    /// Owning game
    pub game_id: String,
    /// Per-game position in the event log
    pub log_index: u64,
    /// Event type (`room_created`, `answer_submitted`, broadcast types, ...)
    pub event_type: String,
    /// Player the event concerns
    pub player_id: Option<String>,
    /// Question index the event concerns
    pub question_index: Option<u32>,
    /// JSON-encoded event data
    pub data: String,
    /// Wall-clock millis
    pub timestamp: u64,
    /// Broadcast `seq` when the event mirrors a broadcast
    pub sequence_num: Option<u64>,
}

/// Storage abstraction for games, players and the per-game event log.
///
/// Must be Clone (shared by the sink worker and tests), Send + Sync
/// (thread-safe), and synchronous (no async methods). Implementations share
/// internal state via Arc, so clones access the same underlying storage.
pub trait Storage: Clone + Send + Sync + 'static {
    /// Insert or replace a game record.
    fn upsert_game(&self, game: &GameRecord) -> Result<(), StorageError>;

    /// Load a game record. `None` if the game was never stored.
    fn load_game(&self, game_id: &str) -> Result<Option<GameRecord>, StorageError>;

    /// List all stored game ids. Order is not guaranteed.
    fn list_games(&self) -> Result<Vec<String>, StorageError>;

    /// Insert or replace a player record, keyed by `(game_id, player_id)`.
    fn upsert_player(&self, player: &PlayerRecord) -> Result<(), StorageError>;

    /// All player records for a game, ordered by `player_id`.
    fn load_players(&self, game_id: &str) -> Result<Vec<PlayerRecord>, StorageError>;

    /// Append an event to the game's log.
    ///
    /// # Invariants
    ///
    /// - Pre: `event.log_index` is greater than the latest stored index
    /// - Post: the event is persisted at `event.log_index`
    ///
    /// # Errors
    ///
    /// `StorageError::Conflict` if the index does not move forward.
    fn append_event(&self, event: &EventRecord) -> Result<(), StorageError>;

    /// Latest event log index for a game. `None` if no events stored.
    fn latest_log_index(&self, game_id: &str) -> Result<Option<u64>, StorageError>;

    /// Load events with `log_index >= from`, at most `limit` of them, in
    /// index order.
    fn load_events(
        &self,
        game_id: &str,
        from: u64,
        limit: usize,
    ) -> Result<Vec<EventRecord>, StorageError>;
}

/// Enforce forward-only log indices. Shared by every backend.
pub(crate) fn check_append(latest: Option<u64>, got: u64) -> Result<(), StorageError> {
    match latest {
        Some(latest) if got <= latest => {
            Err(StorageError::Conflict { expected: latest.saturating_add(1), got })
        },
        _ => Ok(()),
    }
}
