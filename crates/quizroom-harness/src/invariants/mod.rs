//! Invariant checking for deterministic simulation testing.
//!
//! Invariants are properties that must always hold during a game. Unlike
//! example-based tests that check specific scenarios, invariants verify
//! behavioral properties across every interleaving a test produces.
//!
//! # Architecture
//!
//! Client receive histories and room scoring state are captured into a
//! [`SystemSnapshot`], then every registered [`Invariant`] runs against it.
//!
//! # Usage
//!
//! ```ignore
//! let registry = InvariantRegistry::standard();
//! let snapshot = SystemSnapshot::from_observers(vec![p1.observe(), p2.observe()]);
//! registry.assert_all(&snapshot, "after game");
//! ```

mod checks;
mod snapshot;

pub use checks::{AtMostOnceAdvancement, ScoreIntegrity, SeqMonotonicity, SnapshotCursor};
pub use snapshot::{ObserverSnapshot, RoomSnapshot, ScoreSnapshot, SystemSnapshot};

/// Outcome of one check.
pub type InvariantResult = Result<(), Violation>;

/// A property that failed, with the observer or room it failed for.
#[derive(Debug, Clone)]
pub struct Violation {
    /// Which check failed
    pub invariant: &'static str,
    /// What was observed
    pub message: String,
}

impl std::fmt::Display for Violation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {}", self.invariant, self.message)
    }
}

impl std::error::Error for Violation {}

/// A property of captured streams and room state.
pub trait Invariant: Send + Sync {
    /// Stable name, used in failure output.
    fn name(&self) -> &'static str;

    /// Check `state`, reporting the first violation found.
    fn check(&self, state: &SystemSnapshot) -> InvariantResult;
}

/// The set of checks a scenario runs after it finishes.
pub struct InvariantRegistry {
    invariants: Vec<Box<dyn Invariant>>,
}

impl Default for InvariantRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl InvariantRegistry {
    /// No checks.
    pub fn new() -> Self {
        Self { invariants: Vec::new() }
    }

    /// Create a registry with the standard room invariants.
    ///
    /// Includes:
    /// - [`SeqMonotonicity`]: observers see strictly increasing seqs
    /// - [`AtMostOnceAdvancement`]: one `round_result` per question
    /// - [`ScoreIntegrity`]: scores are the sum of submitted awards
    /// - [`SnapshotCursor`]: reconnect snapshots never move backwards
    pub fn standard() -> Self {
        let mut registry = Self::new();
        registry.add(SeqMonotonicity);
        registry.add(AtMostOnceAdvancement);
        registry.add(ScoreIntegrity);
        registry.add(SnapshotCursor);
        registry
    }

    /// Register one more check.
    pub fn add<I: Invariant + 'static>(&mut self, invariant: I) {
        self.invariants.push(Box::new(invariant));
    }

    /// Run every check, collecting all violations rather than stopping at
    /// the first.
    pub fn check_all(&self, state: &SystemSnapshot) -> Result<(), Vec<Violation>> {
        let violations: Vec<_> =
            self.invariants.iter().filter_map(|inv| inv.check(state).err()).collect();

        if violations.is_empty() { Ok(()) } else { Err(violations) }
    }

    /// [`check_all`](Self::check_all), panicking with every violation and
    /// `context` in the message.
    #[allow(clippy::panic)]
    pub fn assert_all(&self, state: &SystemSnapshot, context: &str) {
        if let Err(violations) = self.check_all(state) {
            let messages: Vec<_> = violations.iter().map(ToString::to_string).collect();
            panic!("room invariants failed {context}:\n  {}", messages.join("\n  "));
        }
    }

    /// Names of the registered checks, in run order.
    pub fn names(&self) -> Vec<&'static str> {
        self.invariants.iter().map(|inv| inv.name()).collect()
    }

    /// Number of registered checks.
    pub fn len(&self) -> usize {
        self.invariants.len()
    }

    /// True when nothing is registered.
    pub fn is_empty(&self) -> bool {
        self.invariants.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn standard_set_covers_ordering_and_scoring() {
        let registry = InvariantRegistry::standard();
        assert_eq!(registry.len(), 4);
        assert_eq!(
            registry.names(),
            vec!["seq_monotonicity", "at_most_once_advancement", "score_integrity", "snapshot_cursor"]
        );
    }

    #[test]
    fn nothing_observed_nothing_violated() {
        assert!(InvariantRegistry::standard().check_all(&SystemSnapshot::empty()).is_ok());
        assert!(InvariantRegistry::new().is_empty());
    }
}
