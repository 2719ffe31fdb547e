//! Client-side ordering of sequenced broadcasts.
//!
//! The server drops broadcasts for slow consumers instead of blocking, so a
//! client can see gaps. [`SeqTracker`] implements the receiving half of that
//! contract: duplicates and stale frames are discarded, frames ahead of the
//! next expected seq are buffered until the gap fills, and a resync snapshot
//! moves the cursor forward wholesale.
//!
//! A client seated after the room's first broadcast never sees the seqs
//! before its arrival. [`SeqTracker::joining`] builds a tracker that takes
//! the first sequenced frame it receives as its starting point.
//!
//! # Invariants
//!
//! - Delivered seqs are strictly increasing and contiguous from the cursor.
//! - Nothing at or below `last_seq` is ever delivered.

use std::collections::BTreeMap;

/// Outcome of offering a frame to the tracker.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Observed<T> {
    /// Frames now ready for processing, in seq order
    Deliver(Vec<T>),
    /// Frame is ahead of the cursor and was buffered
    Buffered,
    /// Frame was at or below the cursor, or already buffered
    Discarded,
}

/// Tracks the largest processed seq and buffers out-of-order frames.
#[derive(Debug, Clone)]
pub struct SeqTracker<T> {
    last_seq: u64,
    /// False until a starting point is known
    anchored: bool,
    pending: BTreeMap<u64, T>,
}

impl<T> Default for SeqTracker<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> SeqTracker<T> {
    /// Tracker that has processed nothing. Room seqs start at 1.
    pub fn new() -> Self {
        Self::starting_at(1)
    }

    /// Tracker whose next expected frame is `seq`.
    pub fn starting_at(seq: u64) -> Self {
        Self { last_seq: seq.saturating_sub(1), anchored: true, pending: BTreeMap::new() }
    }

    /// Tracker for a client joining a room whose broadcasts already started.
    ///
    /// The first sequenced frame observed is delivered and fixes the cursor.
    /// A snapshot `resync` before that anchors it as well.
    pub fn joining() -> Self {
        Self { last_seq: 0, anchored: false, pending: BTreeMap::new() }
    }

    /// Whether the tracker knows where the stream starts.
    pub fn is_anchored(&self) -> bool {
        self.anchored
    }

    /// Largest seq processed so far.
    pub fn last_seq(&self) -> u64 {
        self.last_seq
    }

    /// Number of buffered frames waiting on a gap.
    pub fn pending_len(&self) -> usize {
        self.pending.len()
    }

    /// First missing seq if frames are buffered behind a gap.
    ///
    /// A client stuck on a gap should reconnect and resync from a snapshot.
    pub fn missing(&self) -> Option<u64> {
        if self.pending.is_empty() { None } else { Some(self.last_seq + 1) }
    }

    /// Offer a sequenced frame.
    pub fn observe(&mut self, seq: u64, frame: T) -> Observed<T> {
        if !self.anchored && seq > 0 {
            self.anchored = true;
            self.last_seq = seq - 1;
        }
        if seq <= self.last_seq || self.pending.contains_key(&seq) {
            return Observed::Discarded;
        }

        if seq != self.last_seq + 1 {
            self.pending.insert(seq, frame);
            return Observed::Buffered;
        }

        self.last_seq = seq;
        let mut ready = vec![frame];
        ready.extend(self.drain_contiguous());
        Observed::Deliver(ready)
    }

    /// Adopt a snapshot's `current_seq` as the new cursor.
    ///
    /// Buffered frames at or below the snapshot are stale and dropped; any
    /// buffered frames that now follow contiguously are returned.
    pub fn resync(&mut self, current_seq: u64) -> Vec<T> {
        self.anchored = true;
        self.last_seq = current_seq;
        self.pending = self.pending.split_off(&(current_seq + 1));
        self.drain_contiguous()
    }

    fn drain_contiguous(&mut self) -> Vec<T> {
        let mut ready = Vec::new();
        while let Some(frame) = self.pending.remove(&(self.last_seq + 1)) {
            self.last_seq += 1;
            ready.push(frame);
        }
        ready
    }
}
