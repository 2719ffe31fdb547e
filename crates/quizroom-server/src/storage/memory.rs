#![allow(clippy::disallowed_types, reason = "Synchronous in-memory operations only")]

use std::{
    collections::{BTreeMap, HashMap},
    sync::{Arc, Mutex, MutexGuard, PoisonError},
};

use super::{EventRecord, GameRecord, PlayerRecord, Storage, StorageError, check_append};

/// In-memory storage implementation for testing and for running without a
/// database.
///
/// All state is wrapped in `Arc<Mutex<>>` so clones share it. A poisoned
/// mutex is recovered rather than propagated; every operation leaves the
/// maps consistent before it can panic.
#[derive(Clone)]
pub struct MemoryStorage {
    inner: Arc<Mutex<MemoryStorageInner>>,
}

#[derive(Default)]
struct MemoryStorageInner {
    games: HashMap<String, GameRecord>,

    /// Players per game, keyed by `player_id` for stable ordering
    players: HashMap<String, BTreeMap<String, PlayerRecord>>,

    /// Events per game in `log_index` order
    events: HashMap<String, Vec<EventRecord>>,
}

impl MemoryStorage {
    /// Create a new empty `MemoryStorage`
    pub fn new() -> Self {
        Self { inner: Arc::new(Mutex::new(MemoryStorageInner::default())) }
    }

    /// Number of stored games.
    pub fn game_count(&self) -> usize {
        self.lock().games.len()
    }

    /// Total number of events across all games.
    pub fn total_event_count(&self) -> usize {
        self.lock().events.values().map(Vec::len).sum()
    }

    fn lock(&self) -> MutexGuard<'_, MemoryStorageInner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl Default for MemoryStorage {
    fn default() -> Self {
        Self::new()
    }
}

impl Storage for MemoryStorage {
    fn upsert_game(&self, game: &GameRecord) -> Result<(), StorageError> {
        self.lock().games.insert(game.game_id.clone(), game.clone());
        Ok(())
    }

    fn load_game(&self, game_id: &str) -> Result<Option<GameRecord>, StorageError> {
        Ok(self.lock().games.get(game_id).cloned())
    }

    fn list_games(&self) -> Result<Vec<String>, StorageError> {
        Ok(self.lock().games.keys().cloned().collect())
    }

    fn upsert_player(&self, player: &PlayerRecord) -> Result<(), StorageError> {
        self.lock()
            .players
            .entry(player.game_id.clone())
            .or_default()
            .insert(player.player_id.clone(), player.clone());
        Ok(())
    }

    fn load_players(&self, game_id: &str) -> Result<Vec<PlayerRecord>, StorageError> {
        Ok(self
            .lock()
            .players
            .get(game_id)
            .map(|players| players.values().cloned().collect())
            .unwrap_or_default())
    }

    fn append_event(&self, event: &EventRecord) -> Result<(), StorageError> {
        let mut inner = self.lock();
        let events = inner.events.entry(event.game_id.clone()).or_default();

        check_append(events.last().map(|e| e.log_index), event.log_index)?;
        events.push(event.clone());

        debug_assert!(events.windows(2).all(|w| w[0].log_index < w[1].log_index));
        Ok(())
    }

    fn latest_log_index(&self, game_id: &str) -> Result<Option<u64>, StorageError> {
        Ok(self.lock().events.get(game_id).and_then(|events| events.last()).map(|e| e.log_index))
    }

    fn load_events(
        &self,
        game_id: &str,
        from: u64,
        limit: usize,
    ) -> Result<Vec<EventRecord>, StorageError> {
        let inner = self.lock();

        let events = inner
            .events
            .get(game_id)
            .ok_or_else(|| StorageError::NotFound { game_id: game_id.to_string() })?;

        let start = events.partition_point(|e| e.log_index < from);
        Ok(events[start..].iter().take(limit).cloned().collect())
    }
}
