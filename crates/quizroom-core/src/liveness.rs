//! Session liveness state machine.
//!
//! Tracks inbound activity and the outbound ping schedule for one socket.
//! Uses the action pattern: methods take the current time and return actions
//! for the session driver to execute, so the machine itself does no I/O.
//!
//! ```text
//! ┌──────┐  idle timeout / unhealthy / peer close  ┌────────┐
//! │ Open │────────────────────────────────────────>│ Closed │
//! └──────┘                                         └────────┘
//!    │ ^
//!    │ │ tick: SendPing every ping_interval
//!    └─┘ inbound frame: refresh activity
//! ```

use std::{ops::Sub, time::Duration};

use serde::{Deserialize, Serialize};

use crate::{error::SessionError, rate_limit::RateLimitConfig};

/// Interval between transport-level pings.
pub const DEFAULT_PING_INTERVAL: Duration = Duration::from_secs(15);

/// Inbound silence after which the session is closed.
pub const DEFAULT_IDLE_TIMEOUT: Duration = Duration::from_secs(60);

/// Upper bound on a single socket write.
pub const DEFAULT_WRITE_TIMEOUT: Duration = Duration::from_secs(10);

/// Capacity of the per-session outbound queue.
pub const DEFAULT_SEND_QUEUE_CAPACITY: usize = 256;

/// Consecutive dropped broadcasts before the session is declared unhealthy.
pub const DEFAULT_MAX_CONSECUTIVE_DROPS: u32 = 5;

/// Per-session configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionConfig {
    /// Transport ping interval
    pub ping_interval: Duration,
    /// Close after this much inbound silence
    pub idle_timeout: Duration,
    /// Close if a single write takes longer than this
    pub write_timeout: Duration,
    /// Bounded outbound queue size
    pub send_queue_capacity: usize,
    /// Close after this many consecutive drops
    pub max_consecutive_drops: u32,
    /// Inbound message rate limit
    pub rate_limit: RateLimitConfig,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            ping_interval: DEFAULT_PING_INTERVAL,
            idle_timeout: DEFAULT_IDLE_TIMEOUT,
            write_timeout: DEFAULT_WRITE_TIMEOUT,
            send_queue_capacity: DEFAULT_SEND_QUEUE_CAPACITY,
            max_consecutive_drops: DEFAULT_MAX_CONSECUTIVE_DROPS,
            rate_limit: RateLimitConfig::default(),
        }
    }
}

/// Liveness state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LivenessState {
    /// Socket is usable
    Open,
    /// Socket closed (timeout, error, or peer close)
    Closed,
}

/// Actions returned by the liveness machine.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LivenessAction {
    /// Write a transport ping frame
    SendPing,
    /// Close the socket
    Close {
        /// Why the session is closing
        reason: SessionError,
    },
}

/// Liveness tracker for a single session.
///
/// Generic over `Instant` so the harness can drive it with virtual time.
#[derive(Debug, Clone)]
pub struct Liveness<I>
where
    I: Copy + Ord + Sub<Output = Duration> + std::ops::Add<Duration, Output = I>,
{
    state: LivenessState,
    ping_interval: Duration,
    idle_timeout: Duration,
    last_inbound: I,
    last_ping: I,
}

impl<I> Liveness<I>
where
    I: Copy + Ord + Sub<Output = Duration> + std::ops::Add<Duration, Output = I>,
{
    /// Fresh session opened at `now`.
    pub fn new(now: I, config: &SessionConfig) -> Self {
        Self {
            state: LivenessState::Open,
            ping_interval: config.ping_interval,
            idle_timeout: config.idle_timeout,
            last_inbound: now,
            last_ping: now,
        }
    }

    /// Current state.
    pub fn state(&self) -> LivenessState {
        self.state
    }

    /// Record inbound traffic of any kind (text, transport ping or pong).
    pub fn on_inbound(&mut self, now: I) {
        if now > self.last_inbound {
            self.last_inbound = now;
        }
    }

    /// Mark the session closed. Further ticks return nothing.
    pub fn close(&mut self) {
        self.state = LivenessState::Closed;
    }

    /// Inbound silence so far, if it exceeds the idle timeout.
    pub fn check_timeout(&self, now: I) -> Option<Duration> {
        if self.state == LivenessState::Closed {
            return None;
        }
        let elapsed = now - self.last_inbound;
        if elapsed > self.idle_timeout { Some(elapsed) } else { None }
    }

    /// Earliest instant at which [`Liveness::tick`] has work to do.
    pub fn next_wakeup(&self) -> I {
        let ping_at = self.last_ping + self.ping_interval;
        // One tick past the timeout so `elapsed > idle_timeout` holds
        let idle_at = self.last_inbound + self.idle_timeout + Duration::from_millis(1);
        ping_at.min(idle_at)
    }

    /// Process periodic maintenance (idle timeout and ping schedule).
    pub fn tick(&mut self, now: I) -> Vec<LivenessAction> {
        if self.state == LivenessState::Closed {
            return Vec::new();
        }

        if let Some(elapsed) = self.check_timeout(now) {
            self.close();
            return vec![LivenessAction::Close { reason: SessionError::IdleTimeout { elapsed } }];
        }

        if now - self.last_ping >= self.ping_interval {
            self.last_ping = now;
            return vec![LivenessAction::SendPing];
        }

        Vec::new()
    }
}

#[cfg(test)]
mod tests {
    use std::time::Instant;

    use super::*;

    fn config() -> SessionConfig {
        SessionConfig::default()
    }

    #[test]
    fn pings_on_interval() {
        let t0 = Instant::now();
        let mut live = Liveness::new(t0, &config());

        assert!(live.tick(t0 + Duration::from_secs(5)).is_empty());
        assert_eq!(live.tick(t0 + Duration::from_secs(15)), vec![LivenessAction::SendPing]);
        // Not again until another interval has passed
        assert!(live.tick(t0 + Duration::from_secs(20)).is_empty());
        live.on_inbound(t0 + Duration::from_secs(25));
        assert_eq!(live.tick(t0 + Duration::from_secs(30)), vec![LivenessAction::SendPing]);
    }

    #[test]
    fn idle_timeout_closes_even_while_pinging() {
        let t0 = Instant::now();
        let mut live = Liveness::new(t0, &config());

        // Pings alone do not count as activity
        for secs in [15, 30, 45, 60] {
            live.tick(t0 + Duration::from_secs(secs));
        }
        let actions = live.tick(t0 + Duration::from_secs(61));
        assert!(matches!(
            actions.as_slice(),
            [LivenessAction::Close { reason: SessionError::IdleTimeout { .. } }]
        ));
        assert_eq!(live.state(), LivenessState::Closed);
        assert!(live.tick(t0 + Duration::from_secs(120)).is_empty());
    }

    #[test]
    fn inbound_traffic_defers_timeout() {
        let t0 = Instant::now();
        let mut live = Liveness::new(t0, &config());

        live.on_inbound(t0 + Duration::from_secs(50));
        assert!(live.check_timeout(t0 + Duration::from_secs(100)).is_none());
        assert!(live.check_timeout(t0 + Duration::from_secs(111)).is_some());
    }

    #[test]
    fn next_wakeup_is_earliest_deadline() {
        let t0 = Instant::now();
        let live = Liveness::new(t0, &config());
        assert_eq!(live.next_wakeup(), t0 + DEFAULT_PING_INTERVAL);
    }
}
