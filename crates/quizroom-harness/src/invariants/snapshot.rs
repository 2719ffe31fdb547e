//! Observable state snapshots for invariant checking.
//!
//! Snapshots capture what clients received and what rooms hold at a point in
//! time. Invariants operate on snapshots rather than live state so a check
//! never races a transition.

use std::{
    collections::BTreeSet,
    fmt::Debug,
    ops::{Add, Sub},
    time::Duration,
};

use quizroom_proto::Envelope;
use quizroom_server::{Award, Room};

/// Snapshot of the whole simulation.
#[derive(Debug, Clone, Default)]
pub struct SystemSnapshot {
    /// Per-client receive histories.
    pub observers: Vec<ObserverSnapshot>,
    /// Server-side room state.
    pub rooms: Vec<RoomSnapshot>,
}

impl SystemSnapshot {
    /// Nothing observed.
    pub fn empty() -> Self {
        Self::default()
    }

    /// Snapshot from client observations only.
    pub fn from_observers(observers: Vec<ObserverSnapshot>) -> Self {
        Self { observers, rooms: Vec::new() }
    }

    /// Add a client observation.
    pub fn add_observer(&mut self, observer: ObserverSnapshot) {
        self.observers.push(observer);
    }

    /// Add a room.
    pub fn add_room(&mut self, room: RoomSnapshot) {
        self.rooms.push(room);
    }

    /// Observation for one player.
    pub fn observer(&self, player_id: &str) -> Option<&ObserverSnapshot> {
        self.observers.iter().find(|o| o.player_id == player_id)
    }
}

/// One client's view: everything received across all of its sessions.
#[derive(Debug, Clone, Default)]
pub struct ObserverSnapshot {
    /// Player the client plays as.
    pub player_id: String,
    /// Frames in arrival order.
    pub received: Vec<Envelope>,
    /// Question indices the client submitted answers for.
    pub submitted: BTreeSet<u32>,
}

/// Server-side scoring state of one room.
#[derive(Debug, Clone, Default)]
pub struct RoomSnapshot {
    /// Game id.
    pub game_id: String,
    /// Seated players.
    pub players: Vec<ScoreSnapshot>,
}

impl RoomSnapshot {
    /// Capture a room's scores and awards.
    pub fn capture<I>(room: &Room<I>) -> Self
    where
        I: Copy + Ord + Debug + Add<Duration, Output = I> + Sub<Output = Duration>,
    {
        Self {
            game_id: room.game_id().to_string(),
            players: room
                .players()
                .iter()
                .map(|p| ScoreSnapshot {
                    player_id: p.player_id.clone(),
                    score: p.score,
                    awards: p.awards.clone(),
                })
                .collect(),
        }
    }
}

/// One player's score and the awards behind it.
#[derive(Debug, Clone, Default)]
pub struct ScoreSnapshot {
    /// Player.
    pub player_id: String,
    /// Cumulative score.
    pub score: u32,
    /// Per-round awards.
    pub awards: Vec<Award>,
}
