//! Broadcast fabric.
//!
//! Rooms never touch sockets. Each seated, connected player is reachable
//! through an opaque [`Outbound`] handle; reconnection swaps the handle
//! without the room knowing anything about the session behind it.
//!
//! Enqueue never blocks. A full queue drops the frame (clients detect the
//! `seq` gap and resync); too many consecutive drops close the session.

use std::{
    collections::HashMap,
    sync::{
        Arc,
        atomic::{AtomicU32, Ordering},
    },
};

use quizroom_core::{SessionConfig, SessionError};
use tokio::sync::{mpsc, watch};

/// Result of a non-blocking enqueue.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EnqueueResult {
    /// Frame queued for the writer
    Ok,
    /// Queue full, frame discarded
    Dropped,
    /// Session is gone
    Closed,
}

/// Opaque outbound handle for one player session.
pub trait Outbound: Send + Sync + 'static {
    /// Queue a serialized frame without blocking.
    fn enqueue(&self, frame: Arc<str>) -> EnqueueResult;

    /// Close the session. Idempotent; the first reason wins.
    fn close(&self, reason: SessionError);

    /// True once the session has been closed.
    fn is_closed(&self) -> bool;
}

/// Shared close signal for a session's reader, writer and outbound handle.
#[derive(Clone, Debug)]
pub struct SessionCloser {
    state: Arc<watch::Sender<Option<SessionError>>>,
}

impl Default for SessionCloser {
    fn default() -> Self {
        Self::new()
    }
}

impl SessionCloser {
    /// Open signal.
    pub fn new() -> Self {
        let (state, _) = watch::channel(None);
        Self { state: Arc::new(state) }
    }

    /// Close with `reason`. Returns false if already closed.
    pub fn close(&self, reason: SessionError) -> bool {
        self.state.send_if_modified(|current| {
            if current.is_some() {
                return false;
            }
            *current = Some(reason);
            true
        })
    }

    /// True once closed.
    pub fn is_closed(&self) -> bool {
        self.state.borrow().is_some()
    }

    /// Why the session closed, if it has.
    pub fn reason(&self) -> Option<SessionError> {
        self.state.borrow().clone()
    }

    /// Resolve once the session is closed.
    pub async fn closed(&self) -> SessionError {
        let mut rx = self.state.subscribe();
        match rx.wait_for(Option::is_some).await {
            Ok(reason) => reason.clone().unwrap_or(SessionError::Superseded),
            Err(_) => SessionError::Transport("close signal dropped".to_string()),
        }
    }
}

/// Bounded-queue outbound used by websocket sessions.
pub struct QueueOutbound {
    tx: mpsc::Sender<Arc<str>>,
    consecutive_drops: AtomicU32,
    max_consecutive_drops: u32,
    closer: SessionCloser,
}

impl QueueOutbound {
    /// Create the handle plus the writer's receiving half.
    pub fn channel(
        config: &SessionConfig,
        closer: SessionCloser,
    ) -> (Arc<Self>, mpsc::Receiver<Arc<str>>) {
        let (tx, rx) = mpsc::channel(config.send_queue_capacity.max(1));
        let outbound = Arc::new(Self {
            tx,
            consecutive_drops: AtomicU32::new(0),
            max_consecutive_drops: config.max_consecutive_drops.max(1),
            closer,
        });
        (outbound, rx)
    }
}

impl Outbound for QueueOutbound {
    fn enqueue(&self, frame: Arc<str>) -> EnqueueResult {
        if self.closer.is_closed() {
            return EnqueueResult::Closed;
        }

        match self.tx.try_send(frame) {
            Ok(()) => {
                self.consecutive_drops.store(0, Ordering::Relaxed);
                EnqueueResult::Ok
            },
            Err(mpsc::error::TrySendError::Full(_)) => {
                let drops = self.consecutive_drops.fetch_add(1, Ordering::Relaxed) + 1;
                if drops >= self.max_consecutive_drops {
                    self.closer.close(SessionError::Unhealthy { drops });
                }
                EnqueueResult::Dropped
            },
            Err(mpsc::error::TrySendError::Closed(_)) => EnqueueResult::Closed,
        }
    }

    fn close(&self, reason: SessionError) {
        self.closer.close(reason);
    }

    fn is_closed(&self) -> bool {
        self.closer.is_closed()
    }
}

/// Per-room map of player id to outbound handle.
pub struct Fabric {
    room_code: String,
    outbounds: HashMap<String, Arc<dyn Outbound>>,
}

impl std::fmt::Debug for Fabric {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Fabric")
            .field("room_code", &self.room_code)
            .field("bound", &self.outbounds.len())
            .finish()
    }
}

impl Fabric {
    /// Empty fabric for a room.
    pub fn new(room_code: impl Into<String>) -> Self {
        Self { room_code: room_code.into(), outbounds: HashMap::new() }
    }

    /// Bind a player's outbound, returning the handle it replaces.
    pub fn bind(
        &mut self,
        player_id: &str,
        outbound: Arc<dyn Outbound>,
    ) -> Option<Arc<dyn Outbound>> {
        self.outbounds.insert(player_id.to_string(), outbound)
    }

    /// Remove a player's outbound.
    pub fn unbind(&mut self, player_id: &str) -> Option<Arc<dyn Outbound>> {
        self.outbounds.remove(player_id)
    }

    /// True if the player has a bound outbound.
    pub fn is_bound(&self, player_id: &str) -> bool {
        self.outbounds.contains_key(player_id)
    }

    /// Send to one player.
    pub fn send(&self, player_id: &str, frame: Arc<str>) -> EnqueueResult {
        match self.outbounds.get(player_id) {
            Some(outbound) => outbound.enqueue(frame),
            None => EnqueueResult::Closed,
        }
    }

    /// Enqueue a serialized frame to every bound player.
    ///
    /// Returns how many players accepted it.
    pub fn broadcast(&self, seq: u64, frame: &Arc<str>) -> usize {
        let mut delivered = 0;
        for (player_id, outbound) in &self.outbounds {
            match outbound.enqueue(Arc::clone(frame)) {
                EnqueueResult::Ok => delivered += 1,
                EnqueueResult::Dropped => {
                    tracing::warn!(
                        room_code = %self.room_code,
                        player_id = %player_id,
                        seq,
                        "outbound queue full, broadcast dropped"
                    );
                },
                EnqueueResult::Closed => {
                    tracing::debug!(
                        room_code = %self.room_code,
                        player_id = %player_id,
                        seq,
                        "outbound closed, awaiting disconnect"
                    );
                },
            }
        }
        delivered
    }

    /// Number of bound players.
    pub fn len(&self) -> usize {
        self.outbounds.len()
    }

    /// True if no player is bound.
    pub fn is_empty(&self) -> bool {
        self.outbounds.is_empty()
    }

    /// Drop every handle without closing the sessions behind them.
    pub fn clear(&mut self) {
        self.outbounds.clear();
    }
}
