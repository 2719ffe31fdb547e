//! Per-room sequencer.
//!
//! Assigns the room's broadcast `seq` (starting at 1, strictly increasing,
//! no gaps) and the event log's `log_index` (starting at 0). Both counters
//! use checked arithmetic; exhaustion is an invariant failure that aborts
//! the room rather than wrapping.

use thiserror::Error;

/// Errors that can occur during sequencing
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SequencerError {
    /// A counter reached `u64::MAX`
    #[error("{counter} counter exhausted")]
    Exhausted {
        /// Which counter overflowed
        counter: &'static str,
    },
}

/// Broadcast and event log counters for one room.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Sequencer {
    next_seq: u64,
    next_log_index: u64,
}

impl Default for Sequencer {
    fn default() -> Self {
        Self::new()
    }
}

impl Sequencer {
    /// Fresh counters: first `seq` is 1, first `log_index` is 0.
    pub fn new() -> Self {
        Self { next_seq: 1, next_log_index: 0 }
    }

    /// Claim the next broadcast sequence number.
    pub fn next_seq(&mut self) -> Result<u64, SequencerError> {
        let seq = self.next_seq;
        self.next_seq = seq.checked_add(1).ok_or(SequencerError::Exhausted { counter: "seq" })?;

        debug_assert!(seq >= 1);
        Ok(seq)
    }

    /// Latest issued `seq`, or 0 before the first broadcast.
    pub fn current_seq(&self) -> u64 {
        self.next_seq - 1
    }

    /// Claim the next event log index.
    pub fn next_log_index(&mut self) -> Result<u64, SequencerError> {
        let index = self.next_log_index;
        self.next_log_index =
            index.checked_add(1).ok_or(SequencerError::Exhausted { counter: "log_index" })?;
        Ok(index)
    }

    #[cfg(test)]
    fn starting_at(next_seq: u64, next_log_index: u64) -> Self {
        Self { next_seq, next_log_index }
    }
}
