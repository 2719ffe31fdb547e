//! Property-based tests for the client ordering contract.
//!
//! Whatever order, duplication, or loss the transport introduces, frames the
//! tracker delivers must be contiguous and strictly increasing.

use proptest::prelude::*;
use quizroom_proto::{Observed, SeqTracker};

/// Strategy: seqs 1..=n, shuffled, with some duplicated and some dropped.
fn delivery_order() -> impl Strategy<Value = (u64, Vec<u64>)> {
    (1u64..60).prop_flat_map(|n| {
        let seqs: Vec<u64> = (1..=n).collect();
        (
            Just(n),
            Just(seqs).prop_shuffle(),
            prop::collection::vec(any::<bool>(), n as usize),
            prop::collection::vec(any::<bool>(), n as usize),
        )
            .prop_map(|(n, shuffled, drop_mask, dup_mask)| {
                let mut out = Vec::new();
                for (i, seq) in shuffled.into_iter().enumerate() {
                    if drop_mask[i] && i % 3 == 0 {
                        continue;
                    }
                    out.push(seq);
                    if dup_mask[i] {
                        out.push(seq);
                    }
                }
                (n, out)
            })
    })
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(200))]

    /// Property: delivered seqs are exactly 1..=k for some k, in order
    #[test]
    fn prop_delivery_is_contiguous((_, arrivals) in delivery_order()) {
        let mut tracker = SeqTracker::new();
        let mut delivered = Vec::new();

        for seq in arrivals {
            if let Observed::Deliver(frames) = tracker.observe(seq, seq) {
                delivered.extend(frames);
            }
        }

        for (i, seq) in delivered.iter().enumerate() {
            prop_assert_eq!(*seq, i as u64 + 1);
        }
        prop_assert_eq!(tracker.last_seq(), delivered.len() as u64);
    }

    /// Property: without loss, everything is eventually delivered exactly once
    #[test]
    fn prop_lossless_delivers_everything(n in 1u64..80, seed in any::<u64>()) {
        let mut seqs: Vec<u64> = (1..=n).collect();
        // Cheap deterministic shuffle
        let mut state = seed | 1;
        for i in (1..seqs.len()).rev() {
            state ^= state << 13;
            state ^= state >> 7;
            state ^= state << 17;
            let j = (state % (i as u64 + 1)) as usize;
            seqs.swap(i, j);
        }

        let mut tracker = SeqTracker::new();
        let mut delivered = Vec::new();
        for seq in seqs {
            if let Observed::Deliver(frames) = tracker.observe(seq, seq) {
                delivered.extend(frames);
            }
        }

        prop_assert_eq!(delivered, (1..=n).collect::<Vec<_>>());
        prop_assert_eq!(tracker.pending_len(), 0);
    }

    /// Property: after resync, nothing at or below the snapshot seq is delivered
    #[test]
    fn prop_resync_never_replays_stale(
        before in prop::collection::vec(1u64..50, 0..30),
        snapshot in 0u64..50,
        after in prop::collection::vec(1u64..80, 0..30),
    ) {
        let mut tracker = SeqTracker::new();
        for seq in before {
            tracker.observe(seq, seq);
        }

        let snapshot = snapshot.max(tracker.last_seq());
        let mut delivered = tracker.resync(snapshot);
        for seq in after {
            if let Observed::Deliver(frames) = tracker.observe(seq, seq) {
                delivered.extend(frames);
            }
        }

        for seq in &delivered {
            prop_assert!(*seq > snapshot);
        }
        for pair in delivered.windows(2) {
            prop_assert_eq!(pair[1], pair[0] + 1);
        }
    }
}
