//! I/O-free building blocks for the quizroom coordinator.
//!
//! Everything here is driven by explicit time parameters and returns values
//! or actions instead of touching sockets, so the same logic runs under the
//! production runtime and the deterministic harness.
//!
//! - [`env::Environment`]: clocks, randomness and sleep
//! - [`liveness::Liveness`]: per-session ping and idle-timeout machine
//! - [`rate_limit::TokenBucket`]: inbound message rate limiting
//! - [`scoring::ScoringConfig`]: answer scoring with clamped time bonus

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod env;
pub mod error;
pub mod liveness;
pub mod rate_limit;
pub mod scoring;

pub use env::Environment;
pub use error::SessionError;
pub use liveness::{Liveness, LivenessAction, LivenessState, SessionConfig};
pub use rate_limit::{RateLimitConfig, TokenBucket};
pub use scoring::ScoringConfig;
