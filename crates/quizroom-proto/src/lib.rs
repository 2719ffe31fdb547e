//! Wire protocol for quizroom.
//!
//! JSON text frames over a websocket. Clients send `{type, payload}`; the
//! server answers with `{type, payload, seq, timestamp}` where `seq` is the
//! room's monotonic broadcast sequence.
//!
//! # Components
//!
//! - [`ClientMessage`]: inbound messages, decoded leniently so unknown types
//!   can be ignored
//! - [`ServerMessage`] and [`Envelope`]: outbound messages
//! - [`ErrorCode`]: stable, client-visible error taxonomy
//! - [`SeqTracker`]: the client half of the ordering contract

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod client;
pub mod errors;
pub mod ordering;
pub mod server;

pub use client::{
    Choice, ClientMessage, CreateRoom, Inbound, JoinRoom, PlayerReady, Reconnect, SubmitAnswer,
};
pub use errors::{ErrorCode, ProtocolError, Result};
pub use ordering::{Observed, SeqTracker};
pub use server::{
    Countdown, Envelope, ErrorPayload, GameOver, GameStart, LeaderboardEntry, Outcome, Phase,
    PlayerAnswered, PlayerNotice, PlayerRoundResult, PlayerView, Pong, QuestionOpen, QuestionView,
    RoomUpdate, RoundEnd, RoundResult, ServerMessage, Snapshot,
};
