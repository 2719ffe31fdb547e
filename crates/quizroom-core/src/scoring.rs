//! Answer scoring.
//!
//! A correct answer earns `base_points` plus a time bonus proportional to
//! the time left in the round. The client-reported elapsed time only feeds
//! the bonus and is clamped to `[0, round_time]`; it never influences when a
//! round ends.

use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Points for a correct answer.
pub const DEFAULT_BASE_POINTS: u32 = 100;

/// Bonus points per full second remaining.
pub const DEFAULT_BONUS_PER_SECOND: u32 = 10;

/// Ceiling on the time bonus.
pub const DEFAULT_MAX_BONUS: u32 = 100;

/// Scoring parameters.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScoringConfig {
    /// Points for a correct answer
    pub base_points: u32,
    /// Bonus per second remaining (`k`)
    pub bonus_per_second: u32,
    /// Upper bound on the bonus
    pub max_bonus: u32,
}

impl Default for ScoringConfig {
    fn default() -> Self {
        Self {
            base_points: DEFAULT_BASE_POINTS,
            bonus_per_second: DEFAULT_BONUS_PER_SECOND,
            max_bonus: DEFAULT_MAX_BONUS,
        }
    }
}

impl ScoringConfig {
    /// Points awarded for one answer.
    ///
    /// Wrong answers score zero. The bonus is
    /// `min(max_bonus, remaining_ms * k / 1000)` where
    /// `remaining = round_time - clamp(client_elapsed, 0, round_time)`.
    pub fn score(&self, correct: bool, round_time: Duration, client_elapsed: Duration) -> u32 {
        if !correct {
            return 0;
        }

        let elapsed = client_elapsed.min(round_time);
        let remaining_ms = (round_time - elapsed).as_millis() as u64;
        let bonus = remaining_ms.saturating_mul(u64::from(self.bonus_per_second)) / 1000;
        let bonus = bonus.min(u64::from(self.max_bonus)) as u32;

        self.base_points.saturating_add(bonus)
    }

    /// Largest delta a single answer can earn.
    pub fn max_delta(&self) -> u32 {
        self.base_points.saturating_add(self.max_bonus)
    }
}
