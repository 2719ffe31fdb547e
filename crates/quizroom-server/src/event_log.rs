//! Event log sink.
//!
//! Rooms record games, players and events here without ever waiting on
//! storage. The sink is a bounded in-memory queue shared by every room in
//! the process; when it is full the oldest entry is dropped and a counter
//! is incremented. A single [`EventLogWorker`] drains it into a
//! [`Storage`] backend from a blocking task.
//!
//! Ordering: entries reach storage in the order rooms pushed them, so a
//! player's `answer_submitted` event always precedes the `round_result` it
//! triggered.

#![allow(clippy::disallowed_types, reason = "Lock is never held across an await")]

use std::{
    collections::VecDeque,
    sync::{
        Arc, Mutex, MutexGuard, PoisonError,
        atomic::{AtomicBool, AtomicU64, Ordering},
    },
};

use tokio::sync::Notify;

use crate::storage::{EventRecord, GameRecord, PlayerRecord, Storage, StorageError};

/// Default sink capacity.
pub const DEFAULT_EVENT_LOG_CAPACITY: usize = 4096;

/// Entries drained per storage batch.
const BATCH_SIZE: usize = 64;

/// One pending write.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LogEntry {
    /// Insert or replace a game record
    Game(GameRecord),
    /// Insert or replace a player record
    Player(PlayerRecord),
    /// Append to a game's event log
    Event(EventRecord),
}

impl LogEntry {
    /// Game the entry belongs to.
    pub fn game_id(&self) -> &str {
        match self {
            Self::Game(g) => &g.game_id,
            Self::Player(p) => &p.game_id,
            Self::Event(e) => &e.game_id,
        }
    }
}

/// Fire-and-forget handle for recording to the event log.
///
/// Cheap to clone. `push` never blocks beyond a short uncontended mutex.
#[derive(Clone)]
pub struct EventSink {
    inner: Arc<SinkInner>,
}

struct SinkInner {
    queue: Mutex<VecDeque<LogEntry>>,
    capacity: usize,
    dropped: AtomicU64,
    closed: AtomicBool,
    notify: Notify,
}

impl std::fmt::Debug for EventSink {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventSink")
            .field("pending", &self.len())
            .field("capacity", &self.inner.capacity)
            .field("dropped", &self.dropped())
            .finish()
    }
}

impl EventSink {
    /// Create a sink holding at most `capacity` pending entries.
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            inner: Arc::new(SinkInner {
                queue: Mutex::new(VecDeque::with_capacity(capacity.min(DEFAULT_EVENT_LOG_CAPACITY))),
                capacity,
                dropped: AtomicU64::new(0),
                closed: AtomicBool::new(false),
                notify: Notify::new(),
            }),
        }
    }

    /// Queue an entry, evicting the oldest one if the sink is full.
    ///
    /// Entries pushed after [`EventSink::close`] are discarded.
    pub fn push(&self, entry: LogEntry) {
        if self.inner.closed.load(Ordering::Acquire) {
            tracing::debug!(game_id = entry.game_id(), "event sink closed, entry discarded");
            return;
        }

        let evicted = {
            let mut queue = self.lock();
            let evicted =
                if queue.len() >= self.inner.capacity { queue.pop_front() } else { None };
            queue.push_back(entry);
            evicted
        };

        if let Some(evicted) = evicted {
            let dropped = self.inner.dropped.fetch_add(1, Ordering::Relaxed) + 1;
            tracing::warn!(
                game_id = evicted.game_id(),
                dropped,
                "event sink full, oldest entry dropped"
            );
        }

        self.inner.notify.notify_one();
    }

    /// Record an event.
    pub fn record_event(&self, event: EventRecord) {
        self.push(LogEntry::Event(event));
    }

    /// Record the latest game state.
    pub fn upsert_game(&self, game: GameRecord) {
        self.push(LogEntry::Game(game));
    }

    /// Record the latest player state.
    pub fn upsert_player(&self, player: PlayerRecord) {
        self.push(LogEntry::Player(player));
    }

    /// Entries evicted because the sink was full.
    pub fn dropped(&self) -> u64 {
        self.inner.dropped.load(Ordering::Relaxed)
    }

    /// Entries waiting for the worker.
    pub fn len(&self) -> usize {
        self.lock().len()
    }

    /// True if nothing is waiting.
    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    /// Stop accepting entries. The worker drains what is queued and exits.
    pub fn close(&self) {
        self.inner.closed.store(true, Ordering::Release);
        self.inner.notify.notify_one();
    }

    /// Take every pending entry without waiting.
    pub fn drain(&self) -> Vec<LogEntry> {
        self.lock().drain(..).collect()
    }

    /// Wait for up to `max` entries.
    ///
    /// Returns `None` once the sink is closed and empty.
    pub async fn next_batch(&self, max: usize) -> Option<Vec<LogEntry>> {
        loop {
            {
                let mut queue = self.lock();
                if !queue.is_empty() {
                    let take = queue.len().min(max.max(1));
                    return Some(queue.drain(..take).collect());
                }
            }

            if self.inner.closed.load(Ordering::Acquire) {
                return None;
            }

            self.inner.notify.notified().await;
        }
    }

    fn lock(&self) -> MutexGuard<'_, VecDeque<LogEntry>> {
        self.inner.queue.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Drains an [`EventSink`] into a storage backend.
pub struct EventLogWorker<S: Storage> {
    sink: EventSink,
    storage: S,
}

impl<S: Storage> EventLogWorker<S> {
    /// Create a worker for `sink` writing to `storage`.
    pub fn new(sink: EventSink, storage: S) -> Self {
        Self { sink, storage }
    }

    /// Run until the sink is closed and drained.
    ///
    /// Storage failures are logged and skipped; they never reach rooms.
    pub async fn run(self) {
        let mut written: u64 = 0;

        while let Some(batch) = self.sink.next_batch(BATCH_SIZE).await {
            let storage = self.storage.clone();
            match tokio::task::spawn_blocking(move || write_batch(&storage, batch)).await {
                Ok(count) => written += count as u64,
                Err(e) => tracing::error!(error = %e, "event log batch task failed"),
            }
        }

        tracing::info!(written, dropped = self.sink.dropped(), "event log worker stopped");
    }
}

/// Write a batch, returning how many entries were stored.
pub fn write_batch<S: Storage>(storage: &S, batch: Vec<LogEntry>) -> usize {
    let mut stored = 0;
    for entry in batch {
        let result = match &entry {
            LogEntry::Game(game) => storage.upsert_game(game),
            LogEntry::Player(player) => storage.upsert_player(player),
            LogEntry::Event(event) => storage.append_event(event),
        };

        match result {
            Ok(()) => stored += 1,
            Err(StorageError::Conflict { expected, got }) => {
                tracing::error!(game_id = entry.game_id(), expected, got, "event log index conflict");
            },
            Err(e) => tracing::error!(game_id = entry.game_id(), error = %e, "event log write failed"),
        }
    }
    stored
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::{ChaoticStorage, MemoryStorage};

    fn event(log_index: u64) -> EventRecord {
        EventRecord {
            game_id: "g".to_string(),
            log_index,
            event_type: "question".to_string(),
            player_id: None,
            question_index: None,
            data: "{}".to_string(),
            timestamp: 0,
            sequence_num: None,
        }
    }

    #[test]
    fn full_sink_drops_oldest() {
        let sink = EventSink::new(3);
        for i in 0..5 {
            sink.record_event(event(i));
        }

        assert_eq!(sink.dropped(), 2);
        let indices: Vec<u64> = sink
            .drain()
            .into_iter()
            .filter_map(|e| match e {
                LogEntry::Event(e) => Some(e.log_index),
                _ => None,
            })
            .collect();
        assert_eq!(indices, vec![2, 3, 4]);
    }

    #[test]
    fn closed_sink_discards() {
        let sink = EventSink::new(8);
        sink.close();
        sink.record_event(event(0));
        assert!(sink.is_empty());
    }

    #[tokio::test]
    async fn worker_drains_then_stops() {
        let sink = EventSink::new(64);
        let storage = MemoryStorage::new();
        for i in 0..10 {
            sink.record_event(event(i));
        }
        sink.close();

        EventLogWorker::new(sink.clone(), storage.clone()).run().await;

        assert_eq!(storage.total_event_count(), 10);
        assert!(sink.next_batch(8).await.is_none());
    }

    #[tokio::test]
    async fn worker_survives_storage_failures() {
        let sink = EventSink::new(64);
        let storage = ChaoticStorage::with_seed(MemoryStorage::new(), 0.5, 7);
        for i in 0..40 {
            sink.record_event(event(i));
        }
        sink.close();

        EventLogWorker::new(sink, storage.clone()).run().await;

        assert_eq!(storage.operation_count(), 40);
        assert_eq!(storage.inner().total_event_count(), 40 - storage.failure_count());
    }
}
