//! Capturing outbound handle.
//!
//! Stands in for a websocket writer. Frames are decoded on arrival and held
//! until the test drains them. An optional capacity models an undersized
//! write side: while that many frames sit undrained, further frames are
//! dropped exactly as a full session queue would drop them.

#![allow(clippy::disallowed_types, reason = "Locks are never held across an await")]

use std::{
    collections::VecDeque,
    sync::{
        Arc, Mutex, MutexGuard, PoisonError,
        atomic::{AtomicU64, Ordering},
    },
};

use quizroom_core::SessionError;
use quizroom_proto::Envelope;
use quizroom_server::{EnqueueResult, Outbound};

/// Outbound that records every delivered frame.
#[derive(Debug, Default)]
pub struct RecordingOutbound {
    pending: Mutex<VecDeque<Envelope>>,
    capacity: Option<usize>,
    closed: Mutex<Option<SessionError>>,
    dropped: AtomicU64,
    malformed: AtomicU64,
}

impl RecordingOutbound {
    /// Unbounded recorder.
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Recorder that drops frames while `capacity` are undrained.
    pub fn bounded(capacity: usize) -> Arc<Self> {
        Arc::new(Self { capacity: Some(capacity), ..Self::default() })
    }

    /// Take every undrained frame, oldest first.
    pub fn take(&self) -> Vec<Envelope> {
        lock(&self.pending).drain(..).collect()
    }

    /// Undrained frame count.
    pub fn pending(&self) -> usize {
        lock(&self.pending).len()
    }

    /// Frames refused because the recorder was full.
    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }

    /// Frames that were not valid server envelopes.
    pub fn malformed(&self) -> u64 {
        self.malformed.load(Ordering::Relaxed)
    }

    /// Why the handle was closed, if it was.
    pub fn close_reason(&self) -> Option<SessionError> {
        lock(&self.closed).clone()
    }
}

impl Outbound for RecordingOutbound {
    fn enqueue(&self, frame: Arc<str>) -> EnqueueResult {
        if self.is_closed() {
            return EnqueueResult::Closed;
        }

        let envelope = match Envelope::decode(&frame) {
            Ok(envelope) => envelope,
            Err(e) => {
                tracing::error!(error = %e, frame = %frame, "undecodable server frame");
                self.malformed.fetch_add(1, Ordering::Relaxed);
                return EnqueueResult::Ok;
            },
        };

        let mut pending = lock(&self.pending);
        if self.capacity.is_some_and(|capacity| pending.len() >= capacity) {
            self.dropped.fetch_add(1, Ordering::Relaxed);
            return EnqueueResult::Dropped;
        }
        pending.push_back(envelope);
        EnqueueResult::Ok
    }

    fn close(&self, reason: SessionError) {
        let mut closed = lock(&self.closed);
        if closed.is_none() {
            *closed = Some(reason);
        }
    }

    fn is_closed(&self) -> bool {
        lock(&self.closed).is_some()
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}
