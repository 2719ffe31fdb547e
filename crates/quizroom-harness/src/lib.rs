//! Deterministic simulation harness for quizroom testing.
//!
//! Runs the real [`Coordinator`](quizroom_server::Coordinator) under a
//! virtual clock with seeded randomness, so timer races, disconnects and
//! backpressure replay identically from a seed.
//!
//! - [`SimEnv`]: manually advanced clock and ChaCha RNG
//! - [`RecordingOutbound`]: capturing, optionally undersized, write side
//! - [`SimClient`]: a player driving the coordinator without a socket
//! - [`invariants`]: ordering and scoring properties checked over captured
//!   streams. Use [`InvariantRegistry::standard()`] after every scenario.
//! - [`Sim`]: a coordinator plus its environment and a fixed question bank

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod client;
pub mod invariants;
pub mod outbound;
pub mod sim;
pub mod sim_env;

pub use client::{SimClient, TranscriptLine};
pub use invariants::{
    AtMostOnceAdvancement, Invariant, InvariantRegistry, InvariantResult, ObserverSnapshot,
    RoomSnapshot, ScoreIntegrity, ScoreSnapshot, SeqMonotonicity, SnapshotCursor, SystemSnapshot,
    Violation,
};
pub use outbound::RecordingOutbound;
pub use sim::{Sim, question_bank, two_player_room};
pub use sim_env::{SIM_EPOCH_MILLIS, SimEnv, SimInstant};
