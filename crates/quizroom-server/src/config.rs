//! Coordinator configuration.
//!
//! Typed config with the production constants as defaults. Everything a
//! room needs is copied into it at creation, so changing the coordinator
//! config never affects rooms already in flight.

use std::time::Duration;

use quizroom_core::{ScoringConfig, SessionConfig};
use quizroom_proto::CreateRoom;

use crate::{event_log::DEFAULT_EVENT_LOG_CAPACITY, room::RoomError};

/// Countdown between `game_start` and the first question.
pub const DEFAULT_COUNTDOWN: Duration = Duration::from_secs(3);

/// Pause between `round_result` and the next question.
pub const DEFAULT_BETWEEN_ROUNDS: Duration = Duration::from_secs(3);

/// How long a game survives with zero connected players.
pub const DEFAULT_ABANDON_GRACE: Duration = Duration::from_secs(60);

/// Hard cap on game duration, measured from `game_start`.
pub const DEFAULT_LIFETIME_CAP: Duration = Duration::from_secs(2 * 60 * 60);

/// Accepted ranges for `create_room` parameters.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RoomLimits {
    /// Smallest question count
    pub min_questions: u32,
    /// Largest question count
    pub max_questions: u32,
    /// Shortest round, seconds
    pub min_time_limit: u32,
    /// Longest round, seconds
    pub max_time_limit: u32,
    /// Smallest seat limit
    pub min_players: u32,
    /// Largest seat limit
    pub max_players: u32,
}

impl Default for RoomLimits {
    fn default() -> Self {
        Self {
            min_questions: 1,
            max_questions: 100,
            min_time_limit: 3,
            max_time_limit: 120,
            min_players: 2,
            max_players: 16,
        }
    }
}

/// Validated room settings.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RoomConfig {
    /// Seat limit
    pub max_players: u32,
    /// Requested question count
    pub question_count: u32,
    /// Seconds per question
    pub time_limit: u32,
    /// Selected themes; empty means all
    pub theme_ids: Vec<u32>,
    /// Optional difficulty filter
    pub difficulty: Option<String>,
}

impl RoomConfig {
    /// Round duration.
    pub fn round_time(&self) -> Duration {
        Duration::from_secs(u64::from(self.time_limit))
    }
}

impl RoomLimits {
    /// Validate a `create_room` request.
    ///
    /// # Errors
    ///
    /// `RoomError::InvalidConfig` naming the first out-of-range parameter.
    pub fn validate(&self, request: &CreateRoom) -> Result<RoomConfig, RoomError> {
        let question_count = within(
            "question_count",
            request.question_count,
            self.min_questions,
            self.max_questions,
        )?;
        let time_limit =
            within("time_limit", request.time_limit, self.min_time_limit, self.max_time_limit)?;
        let max_players =
            within("max_players", request.max_players, self.min_players, self.max_players)?;

        let mut theme_ids = request.theme_ids.clone();
        theme_ids.sort_unstable();
        theme_ids.dedup();

        let difficulty = request
            .difficulty
            .as_deref()
            .map(str::trim)
            .filter(|d| !d.is_empty())
            .map(str::to_ascii_lowercase);

        Ok(RoomConfig { max_players, question_count, time_limit, theme_ids, difficulty })
    }
}

fn within(field: &'static str, value: i64, min: u32, max: u32) -> Result<u32, RoomError> {
    if value < i64::from(min) || value > i64::from(max) {
        return Err(RoomError::InvalidConfig(format!(
            "{field} must be between {min} and {max}, got {value}"
        )));
    }
    u32::try_from(value).map_err(|_| RoomError::InvalidConfig(format!("{field} out of range")))
}

/// Fixed delays driving the room state machine.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TimingConfig {
    /// Countdown before question 0
    pub countdown: Duration,
    /// Pause after each round result
    pub between_rounds: Duration,
    /// Zero-connected grace before abort
    pub abandon_grace: Duration,
    /// Forced completion after this long in game
    pub lifetime_cap: Duration,
}

impl Default for TimingConfig {
    fn default() -> Self {
        Self {
            countdown: DEFAULT_COUNTDOWN,
            between_rounds: DEFAULT_BETWEEN_ROUNDS,
            abandon_grace: DEFAULT_ABANDON_GRACE,
            lifetime_cap: DEFAULT_LIFETIME_CAP,
        }
    }
}

/// Who fires room timers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ClockMode {
    /// Each room gets a clock task that sleeps until its next deadline
    #[default]
    Spawned,
    /// Timers fire only from `Coordinator::run_due_timers` (tests)
    Manual,
}

/// Coordinator configuration.
#[derive(Debug, Clone, PartialEq)]
pub struct CoordinatorConfig {
    /// `create_room` validation ranges
    pub limits: RoomLimits,
    /// State machine delays
    pub timing: TimingConfig,
    /// Answer scoring
    pub scoring: ScoringConfig,
    /// Per-connection settings
    pub session: SessionConfig,
    /// Event log sink capacity
    pub event_log_capacity: usize,
    /// Timer driving
    pub clock: ClockMode,
}

impl Default for CoordinatorConfig {
    fn default() -> Self {
        Self {
            limits: RoomLimits::default(),
            timing: TimingConfig::default(),
            scoring: ScoringConfig::default(),
            session: SessionConfig::default(),
            event_log_capacity: DEFAULT_EVENT_LOG_CAPACITY,
            clock: ClockMode::default(),
        }
    }
}

impl CoordinatorConfig {
    /// Production defaults.
    pub fn new() -> Self {
        Self::default()
    }

    /// Defaults with timers driven by the caller.
    pub fn manual() -> Self {
        Self { clock: ClockMode::Manual, ..Self::new() }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn request(max_players: i64, question_count: i64, time_limit: i64) -> CreateRoom {
        CreateRoom {
            max_players,
            question_count,
            time_limit,
            theme_ids: vec![3, 1, 3],
            difficulty: Some(" Hard ".to_string()),
        }
    }

    #[test]
    fn accepts_bounds() {
        let limits = RoomLimits::default();
        assert!(limits.validate(&request(2, 1, 3)).is_ok());
        assert!(limits.validate(&request(16, 100, 120)).is_ok());
    }

    #[test]
    fn rejects_out_of_range() {
        let limits = RoomLimits::default();
        for bad in [request(1, 10, 10), request(17, 10, 10), request(4, 0, 10)] {
            assert!(matches!(limits.validate(&bad), Err(RoomError::InvalidConfig(_))));
        }
        for bad in [request(4, 101, 10), request(4, -5, 10), request(4, 10, 2), request(4, 10, 121)]
        {
            assert!(matches!(limits.validate(&bad), Err(RoomError::InvalidConfig(_))));
        }
    }

    #[test]
    fn normalizes_selection() {
        let config = RoomLimits::default().validate(&request(4, 10, 10)).unwrap();
        assert_eq!(config.theme_ids, vec![1, 3]);
        assert_eq!(config.difficulty.as_deref(), Some("hard"));
        assert_eq!(config.round_time(), Duration::from_secs(10));
    }

    #[test]
    fn event_log_capacity_default() {
        assert_eq!(CoordinatorConfig::new().event_log_capacity, 4096);
        assert_eq!(CoordinatorConfig::manual().clock, ClockMode::Manual);
    }
}
