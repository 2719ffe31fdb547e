//! Chaotic storage wrapper for fault injection testing
//!
//! Storage wrapper that randomly fails operations. Used to verify that the
//! event log worker survives storage failures and that rooms never depend
//! on a successful write.

#![allow(clippy::disallowed_types, reason = "Locking simple RNG state")]

use std::sync::{
    Arc, Mutex, PoisonError,
    atomic::{AtomicUsize, Ordering},
};

use super::{EventRecord, GameRecord, PlayerRecord, Storage, StorageError};

/// Chaotic storage wrapper that randomly injects failures
///
/// Delegates to an underlying storage implementation but fails operations
/// with probability `failure_rate`. The RNG is seeded, so a failing run
/// replays exactly.
#[derive(Clone)]
pub struct ChaoticStorage<S: Storage> {
    inner: S,
    /// Failure rate (0.0 = never fail, 1.0 = always fail)
    failure_rate: f64,
    rng: Arc<Mutex<ChaoticRng>>,
    operation_count: Arc<AtomicUsize>,
    failure_count: Arc<AtomicUsize>,
}

/// Linear congruential generator; fast and reproducible.
struct ChaoticRng {
    state: u64,
}

impl ChaoticRng {
    fn new(seed: u64) -> Self {
        Self { state: seed }
    }

    /// Next value in [0.0, 1.0)
    fn next(&mut self) -> f64 {
        // LCG constants from Numerical Recipes
        const A: u64 = 1_664_525;
        const C: u64 = 1_013_904_223;
        const M: u64 = 1u64 << 32;

        self.state = (A.wrapping_mul(self.state).wrapping_add(C)) % M;
        (self.state as f64) / (M as f64)
    }
}

impl<S: Storage> ChaoticStorage<S> {
    /// Create a new chaotic storage wrapper
    ///
    /// # Panics
    ///
    /// Panics if `failure_rate` is not in [0.0, 1.0]
    pub fn new(inner: S, failure_rate: f64) -> Self {
        Self::with_seed(inner, failure_rate, 0x1234_5678_9ABC_DEF0)
    }

    /// Create with explicit seed for reproducible chaos
    ///
    /// # Panics
    ///
    /// Panics if `failure_rate` is not in [0.0, 1.0]
    pub fn with_seed(inner: S, failure_rate: f64, seed: u64) -> Self {
        assert!(
            (0.0..=1.0).contains(&failure_rate),
            "failure_rate must be between 0.0 and 1.0, got {failure_rate}"
        );

        Self {
            inner,
            failure_rate,
            rng: Arc::new(Mutex::new(ChaoticRng::new(seed))),
            operation_count: Arc::new(AtomicUsize::new(0)),
            failure_count: Arc::new(AtomicUsize::new(0)),
        }
    }

    /// Underlying storage (for checking invariants after chaos).
    pub fn inner(&self) -> &S {
        &self.inner
    }

    /// Total number of storage operations attempted.
    pub fn operation_count(&self) -> usize {
        self.operation_count.load(Ordering::Relaxed)
    }

    /// Number of operations that were failed on purpose.
    pub fn failure_count(&self) -> usize {
        self.failure_count.load(Ordering::Relaxed)
    }

    /// Count the operation and decide whether it fails.
    fn inject(&self) -> Result<(), StorageError> {
        self.operation_count.fetch_add(1, Ordering::Relaxed);

        let roll = self.rng.lock().unwrap_or_else(PoisonError::into_inner).next();
        if roll < self.failure_rate {
            self.failure_count.fetch_add(1, Ordering::Relaxed);
            return Err(StorageError::Io("chaotic failure injection".to_string()));
        }
        Ok(())
    }
}

impl<S: Storage> Storage for ChaoticStorage<S> {
    fn upsert_game(&self, game: &GameRecord) -> Result<(), StorageError> {
        self.inject()?;
        self.inner.upsert_game(game)
    }

    fn load_game(&self, game_id: &str) -> Result<Option<GameRecord>, StorageError> {
        self.inject()?;
        self.inner.load_game(game_id)
    }

    fn list_games(&self) -> Result<Vec<String>, StorageError> {
        self.inject()?;
        self.inner.list_games()
    }

    fn upsert_player(&self, player: &PlayerRecord) -> Result<(), StorageError> {
        self.inject()?;
        self.inner.upsert_player(player)
    }

    fn load_players(&self, game_id: &str) -> Result<Vec<PlayerRecord>, StorageError> {
        self.inject()?;
        self.inner.load_players(game_id)
    }

    fn append_event(&self, event: &EventRecord) -> Result<(), StorageError> {
        self.inject()?;
        self.inner.append_event(event)
    }

    fn latest_log_index(&self, game_id: &str) -> Result<Option<u64>, StorageError> {
        self.inject()?;
        self.inner.latest_log_index(game_id)
    }

    fn load_events(
        &self,
        game_id: &str,
        from: u64,
        limit: usize,
    ) -> Result<Vec<EventRecord>, StorageError> {
        self.inject()?;
        self.inner.load_events(game_id, from, limit)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::MemoryStorage;

    fn event(log_index: u64) -> EventRecord {
        EventRecord {
            game_id: "g".to_string(),
            log_index,
            event_type: "question".to_string(),
            player_id: None,
            question_index: Some(0),
            data: "{}".to_string(),
            timestamp: 0,
            sequence_num: Some(log_index + 1),
        }
    }

    #[test]
    fn test_chaotic_with_zero_failure_rate() {
        let chaotic = ChaoticStorage::new(MemoryStorage::new(), 0.0);

        for i in 0..100 {
            chaotic.append_event(&event(i)).expect("should never fail with 0% failure rate");
        }

        assert_eq!(chaotic.latest_log_index("g").expect("query failed"), Some(99));
        assert_eq!(chaotic.failure_count(), 0);
    }

    #[test]
    fn test_chaotic_with_100_failure_rate() {
        let chaotic = ChaoticStorage::new(MemoryStorage::new(), 1.0);

        assert!(chaotic.append_event(&event(0)).is_err());
        assert!(chaotic.latest_log_index("g").is_err());
        assert_eq!(chaotic.inner().total_event_count(), 0);
    }

    #[test]
    fn test_chaotic_deterministic_with_seed() {
        let run = |seed| {
            let chaotic = ChaoticStorage::with_seed(MemoryStorage::new(), 0.5, seed);
            (0..50).map(|i| chaotic.append_event(&event(i)).is_ok()).collect::<Vec<_>>()
        };

        assert_eq!(run(42), run(42));
    }

    #[test]
    #[should_panic(expected = "failure_rate must be between")]
    fn test_chaotic_rejects_invalid_failure_rate() {
        let _ = ChaoticStorage::new(MemoryStorage::new(), 1.5);
    }
}
