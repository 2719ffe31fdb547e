//! Redb-backed durable storage implementation.
//!
//! Uses Redb's ACID transactions with Copy-on-Write for crash safety.
//! Records are CBOR-encoded; keys are laid out so each game's players and
//! events form one contiguous, ordered range.

use std::{path::Path, sync::Arc};

use redb::{Database, ReadableTable, TableDefinition};
use serde::{Serialize, de::DeserializeOwned};

use super::{EventRecord, GameRecord, PlayerRecord, Storage, StorageError, check_append};

/// Table: games
/// Key: `game_id` UTF-8 bytes
/// Value: CBOR-encoded `GameRecord`
const GAMES: TableDefinition<&[u8], &[u8]> = TableDefinition::new("games");

/// Table: `game_players`
/// Key: [`game_id` length: 2 bytes BE][`game_id`][`player_id`]
/// Value: CBOR-encoded `PlayerRecord`
const PLAYERS: TableDefinition<&[u8], &[u8]> = TableDefinition::new("game_players");

/// Table: `game_events`
/// Key: [`game_id` length: 2 bytes BE][`game_id`][`log_index`: 8 bytes BE]
/// Value: CBOR-encoded `EventRecord`
const EVENTS: TableDefinition<&[u8], &[u8]> = TableDefinition::new("game_events");

/// Durable storage backed by Redb.
///
/// Thread-safe through Redb's internal locking. Clone is cheap (Arc).
#[derive(Clone)]
pub struct RedbStorage {
    db: Arc<Database>,
}

impl RedbStorage {
    /// Open or create a Redb database at the given path.
    ///
    /// Creates tables if they don't exist (GAMES, PLAYERS, EVENTS).
    ///
    /// # Errors
    ///
    /// Returns `StorageError::Io` if the database cannot be opened or created.
    pub fn open(path: impl AsRef<Path>) -> Result<Self, StorageError> {
        let db = Database::create(path.as_ref()).map_err(|e| StorageError::Io(e.to_string()))?;

        let txn = db.begin_write().map_err(|e| StorageError::Io(e.to_string()))?;
        {
            let _ = txn.open_table(GAMES).map_err(|e| StorageError::Io(e.to_string()))?;
            let _ = txn.open_table(PLAYERS).map_err(|e| StorageError::Io(e.to_string()))?;
            let _ = txn.open_table(EVENTS).map_err(|e| StorageError::Io(e.to_string()))?;
        }
        txn.commit().map_err(|e| StorageError::Io(e.to_string()))?;

        Ok(Self { db: Arc::new(db) })
    }

    /// Find the latest `log_index` for a game by scanning its key range.
    fn compute_latest_log_index<T: ReadableTable<&'static [u8], &'static [u8]>>(
        table: &T,
        game_id: &str,
    ) -> Result<Option<u64>, StorageError> {
        let start_key = encode_event_key(game_id, 0);
        let end_key = encode_event_key(game_id, u64::MAX);

        let mut results = table
            .range(start_key.as_slice()..=end_key.as_slice())
            .map_err(|e| StorageError::Io(e.to_string()))?;

        match results.next_back() {
            Some(result) => {
                let (key, _) = result.map_err(|e| StorageError::Io(e.to_string()))?;
                Ok(Some(decode_event_index(key.value())?))
            },
            None => Ok(None),
        }
    }

    fn put<V: Serialize>(
        &self,
        table: TableDefinition<'static, &'static [u8], &'static [u8]>,
        key: &[u8],
        value: &V,
    ) -> Result<(), StorageError> {
        let txn = self.db.begin_write().map_err(|e| StorageError::Io(e.to_string()))?;
        {
            let mut table = txn.open_table(table).map_err(|e| StorageError::Io(e.to_string()))?;
            let bytes = encode_value(value)?;
            table.insert(key, bytes.as_slice()).map_err(|e| StorageError::Io(e.to_string()))?;
        }
        txn.commit().map_err(|e| StorageError::Io(e.to_string()))?;
        Ok(())
    }
}

impl Storage for RedbStorage {
    fn upsert_game(&self, game: &GameRecord) -> Result<(), StorageError> {
        self.put(GAMES, game.game_id.as_bytes(), game)
    }

    fn load_game(&self, game_id: &str) -> Result<Option<GameRecord>, StorageError> {
        let txn = self.db.begin_read().map_err(|e| StorageError::Io(e.to_string()))?;
        let table = txn.open_table(GAMES).map_err(|e| StorageError::Io(e.to_string()))?;

        match table.get(game_id.as_bytes()).map_err(|e| StorageError::Io(e.to_string()))? {
            Some(value) => Ok(Some(decode_value(value.value())?)),
            None => Ok(None),
        }
    }

    fn list_games(&self) -> Result<Vec<String>, StorageError> {
        let txn = self.db.begin_read().map_err(|e| StorageError::Io(e.to_string()))?;
        let table = txn.open_table(GAMES).map_err(|e| StorageError::Io(e.to_string()))?;

        let mut games = Vec::new();
        for result in table.iter().map_err(|e| StorageError::Io(e.to_string()))? {
            let (key, _) = result.map_err(|e| StorageError::Io(e.to_string()))?;
            let game_id = String::from_utf8(key.value().to_vec())
                .map_err(|e| StorageError::Serialization(e.to_string()))?;
            games.push(game_id);
        }

        Ok(games)
    }

    fn upsert_player(&self, player: &PlayerRecord) -> Result<(), StorageError> {
        let key = encode_player_key(&player.game_id, &player.player_id)?;
        self.put(PLAYERS, &key, player)
    }

    fn load_players(&self, game_id: &str) -> Result<Vec<PlayerRecord>, StorageError> {
        let txn = self.db.begin_read().map_err(|e| StorageError::Io(e.to_string()))?;
        let table = txn.open_table(PLAYERS).map_err(|e| StorageError::Io(e.to_string()))?;

        let prefix = encode_game_prefix(game_id)?;
        let results = table.range(prefix.as_slice()..).map_err(|e| StorageError::Io(e.to_string()))?;

        let mut players = Vec::new();
        for result in results {
            let (key, value) = result.map_err(|e| StorageError::Io(e.to_string()))?;
            if !key.value().starts_with(&prefix) {
                break;
            }
            players.push(decode_value(value.value())?);
        }

        Ok(players)
    }

    fn append_event(&self, event: &EventRecord) -> Result<(), StorageError> {
        let txn = self.db.begin_write().map_err(|e| StorageError::Io(e.to_string()))?;

        {
            let mut table = txn.open_table(EVENTS).map_err(|e| StorageError::Io(e.to_string()))?;

            let latest = Self::compute_latest_log_index(&table, &event.game_id)?;
            check_append(latest, event.log_index)?;

            let bytes = encode_value(event)?;
            let key = encode_event_key(&event.game_id, event.log_index);
            table
                .insert(key.as_slice(), bytes.as_slice())
                .map_err(|e| StorageError::Io(e.to_string()))?;
        }

        txn.commit().map_err(|e| StorageError::Io(e.to_string()))?;

        Ok(())
    }

    fn latest_log_index(&self, game_id: &str) -> Result<Option<u64>, StorageError> {
        let txn = self.db.begin_read().map_err(|e| StorageError::Io(e.to_string()))?;
        let table = txn.open_table(EVENTS).map_err(|e| StorageError::Io(e.to_string()))?;

        Self::compute_latest_log_index(&table, game_id)
    }

    fn load_events(
        &self,
        game_id: &str,
        from: u64,
        limit: usize,
    ) -> Result<Vec<EventRecord>, StorageError> {
        let txn = self.db.begin_read().map_err(|e| StorageError::Io(e.to_string()))?;
        let table = txn.open_table(EVENTS).map_err(|e| StorageError::Io(e.to_string()))?;

        if Self::compute_latest_log_index(&table, game_id)?.is_none() {
            return Err(StorageError::NotFound { game_id: game_id.to_string() });
        }

        let start_key = encode_event_key(game_id, from);
        let end_key = encode_event_key(game_id, u64::MAX);

        let results = table
            .range(start_key.as_slice()..=end_key.as_slice())
            .map_err(|e| StorageError::Io(e.to_string()))?;

        let mut events = Vec::with_capacity(limit.min(1024));
        for result in results {
            if events.len() >= limit {
                break;
            }
            let (_, value) = result.map_err(|e| StorageError::Io(e.to_string()))?;
            events.push(decode_value(value.value())?);
        }

        Ok(events)
    }
}

fn encode_value<V: Serialize>(value: &V) -> Result<Vec<u8>, StorageError> {
    let mut bytes = Vec::new();
    ciborium::into_writer(value, &mut bytes)
        .map_err(|e| StorageError::Serialization(e.to_string()))?;
    Ok(bytes)
}

fn decode_value<V: DeserializeOwned>(bytes: &[u8]) -> Result<V, StorageError> {
    ciborium::from_reader(bytes).map_err(|e| StorageError::Serialization(e.to_string()))
}

/// Length-prefixed game id, so one game's keys never interleave with a game
/// whose id it prefixes.
fn encode_game_prefix(game_id: &str) -> Result<Vec<u8>, StorageError> {
    let len = u16::try_from(game_id.len())
        .map_err(|_| StorageError::Serialization("game_id longer than 65535 bytes".to_string()))?;
    let mut key = Vec::with_capacity(2 + game_id.len() + 8);
    key.extend_from_slice(&len.to_be_bytes());
    key.extend_from_slice(game_id.as_bytes());
    Ok(key)
}

fn encode_player_key(game_id: &str, player_id: &str) -> Result<Vec<u8>, StorageError> {
    let mut key = encode_game_prefix(game_id)?;
    key.extend_from_slice(player_id.as_bytes());
    Ok(key)
}

/// Layout: [len: 2 bytes BE][`game_id`][`log_index`: 8 bytes BE]
///
/// Big-endian index keeps lexicographic order equal to numeric order. Game
/// ids are generated server-side and far below the prefix limit; an
/// oversized id saturates the length so it cannot alias a real game.
fn encode_event_key(game_id: &str, log_index: u64) -> Vec<u8> {
    let len = u16::try_from(game_id.len()).unwrap_or(u16::MAX);
    let mut key = Vec::with_capacity(2 + game_id.len() + 8);
    key.extend_from_slice(&len.to_be_bytes());
    key.extend_from_slice(game_id.as_bytes());
    key.extend_from_slice(&log_index.to_be_bytes());
    key
}

fn decode_event_index(key: &[u8]) -> Result<u64, StorageError> {
    let tail = key
        .len()
        .checked_sub(8)
        .and_then(|start| key.get(start..))
        .ok_or_else(|| StorageError::Serialization("event key too short".to_string()))?;
    let bytes: [u8; 8] = tail
        .try_into()
        .map_err(|_| StorageError::Serialization("event key too short".to_string()))?;
    Ok(u64::from_be_bytes(bytes))
}
