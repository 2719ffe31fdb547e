//! Per-player state inside a room.

use quizroom_proto::{LeaderboardEntry, PlayerView};

use crate::{identity::Identity, storage::PlayerRecord};

/// Points awarded for one answer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Award {
    /// Question the answer was for
    pub question_index: u32,
    /// Whether it was right
    pub correct: bool,
    /// Points added to the score
    pub delta: u32,
}

/// A seated player.
///
/// Created on first join and kept across disconnect and reconnect for the
/// whole game. Only lobby departures remove the entry.
#[derive(Debug, Clone)]
pub struct PlayerState<I> {
    /// Stable identity
    pub player_id: String,
    /// Display name
    pub username: String,
    /// Authenticated account, if any
    pub user_id: Option<String>,
    /// Anonymous player
    pub is_guest: bool,
    /// Holds the host flag
    pub is_host: bool,
    /// Ready flag (lobby)
    pub is_ready: bool,
    /// Has a live session bound
    pub connected: bool,
    /// Forfeited with `player_quit`
    pub quit: bool,
    /// Answered the open question
    pub answered_this_round: bool,
    /// Cumulative score
    pub score: u32,
    /// Correct answers
    pub correct: u32,
    /// Wrong answers
    pub wrong: u32,
    /// Every award, in question order
    pub awards: Vec<Award>,
    /// Last inbound activity routed to the room
    pub last_seen: I,
    /// Position in join order; used for host migration and tie-breaks
    pub join_order: u64,
    /// Session currently bound, used to ignore stale disconnects
    pub session_id: Option<u64>,
    /// Wall-clock millis of first seat
    pub joined_at: u64,
    /// Wall-clock millis of quit
    pub left_at: Option<u64>,
    /// Wall-clock millis of latest disconnect
    pub disconnected_at: Option<u64>,
    /// Wall-clock millis of latest reconnect
    pub reconnected_at: Option<u64>,
}

impl<I: Copy> PlayerState<I> {
    /// Fresh, connected, not ready.
    pub fn new(
        identity: &Identity,
        session_id: u64,
        join_order: u64,
        now: I,
        wall_ms: u64,
    ) -> Self {
        Self {
            player_id: identity.player_id.clone(),
            username: identity.username.clone(),
            user_id: identity.user_id.clone(),
            is_guest: identity.is_guest,
            is_host: false,
            is_ready: false,
            connected: true,
            quit: false,
            answered_this_round: false,
            score: 0,
            correct: 0,
            wrong: 0,
            awards: Vec::new(),
            last_seen: now,
            join_order,
            session_id: Some(session_id),
            joined_at: wall_ms,
            left_at: None,
            disconnected_at: None,
            reconnected_at: None,
        }
    }

    /// Still playing: connected and not forfeited.
    pub fn is_active(&self) -> bool {
        self.connected && !self.quit
    }

    /// Answers submitted.
    pub fn questions_answered(&self) -> u32 {
        self.correct + self.wrong
    }

    /// Award for `question_index`, if the player answered it.
    pub fn award_for(&self, question_index: u32) -> Option<&Award> {
        self.awards.iter().find(|a| a.question_index == question_index)
    }

    /// Wire view.
    pub fn view(&self) -> PlayerView {
        PlayerView {
            player_id: self.player_id.clone(),
            username: self.username.clone(),
            is_guest: self.is_guest,
            is_host: self.is_host,
            is_ready: self.is_ready,
            connected: self.is_active(),
            score: self.score,
        }
    }

    /// Leaderboard row.
    pub fn leaderboard_entry(&self, placement: u32) -> LeaderboardEntry {
        LeaderboardEntry {
            placement,
            player_id: self.player_id.clone(),
            username: self.username.clone(),
            score: self.score,
            correct: self.correct,
            wrong: self.wrong,
            questions_answered: self.questions_answered(),
        }
    }

    /// Persisted row.
    pub fn record(&self, game_id: &str, placement: Option<u32>) -> PlayerRecord {
        PlayerRecord {
            game_id: game_id.to_string(),
            player_id: self.player_id.clone(),
            user_id: self.user_id.clone(),
            username: self.username.clone(),
            is_guest: self.is_guest,
            is_host: self.is_host,
            is_ready: self.is_ready,
            final_score: self.score,
            correct: self.correct,
            wrong: self.wrong,
            questions_answered: self.questions_answered(),
            placement,
            joined_at: self.joined_at,
            left_at: self.left_at,
            disconnected_at: self.disconnected_at,
            reconnected_at: self.reconnected_at,
        }
    }
}
