//! Standard invariant checks.
//!
//! These invariants capture the ordering and scoring guarantees every room
//! gives its observers. They verify WHAT must be true, not specific
//! scenarios.

use std::collections::{BTreeMap, BTreeSet};

use quizroom_proto::ServerMessage;

use super::{Invariant, InvariantResult, SystemSnapshot, Violation};

/// Sequenced frames arrive with strictly increasing `seq`.
///
/// Gaps are allowed (a slow observer may have frames dropped); a repeated or
/// smaller seq is not. Holds across reconnects because a reconnecting client
/// only receives broadcasts newer than its snapshot.
pub struct SeqMonotonicity;

impl Invariant for SeqMonotonicity {
    fn name(&self) -> &'static str {
        "seq_monotonicity"
    }

    fn check(&self, state: &SystemSnapshot) -> InvariantResult {
        for observer in &state.observers {
            let mut last = 0;
            for seq in observer.received.iter().filter_map(|e| e.seq) {
                if seq <= last {
                    return Err(Violation {
                        invariant: self.name(),
                        message: format!(
                            "observer {}: seq {seq} after {last}",
                            observer.player_id
                        ),
                    });
                }
                last = seq;
            }
        }
        Ok(())
    }
}

/// At most one `round_result` per question index.
///
/// No observer sees two results for the same index, and every observer that
/// saw a result for an index saw it at the same seq.
pub struct AtMostOnceAdvancement;

impl Invariant for AtMostOnceAdvancement {
    fn name(&self) -> &'static str {
        "at_most_once_advancement"
    }

    fn check(&self, state: &SystemSnapshot) -> InvariantResult {
        let mut seq_by_index: BTreeMap<u32, Option<u64>> = BTreeMap::new();

        for observer in &state.observers {
            let mut seen = BTreeSet::new();
            for envelope in &observer.received {
                let ServerMessage::RoundResult(result) = &envelope.message else {
                    continue;
                };
                let index = result.question_index;
                if !seen.insert(index) {
                    return Err(Violation {
                        invariant: self.name(),
                        message: format!(
                            "observer {}: second round_result for question {index}",
                            observer.player_id
                        ),
                    });
                }

                let first = *seq_by_index.entry(index).or_insert(envelope.seq);
                if first != envelope.seq {
                    return Err(Violation {
                        invariant: self.name(),
                        message: format!(
                            "question {index} resolved at seq {first:?} and {:?}",
                            envelope.seq
                        ),
                    });
                }
            }
        }
        Ok(())
    }
}

/// Scores are exactly the sum of awarded deltas, and nothing is awarded
/// without a submission.
///
/// Checked server-side against room state and client-side against the
/// stream of `round_result` messages an observer saw without gaps.
pub struct ScoreIntegrity;

impl ScoreIntegrity {
    fn violation(&self, message: String) -> Violation {
        Violation { invariant: self.name(), message }
    }
}

impl Invariant for ScoreIntegrity {
    fn name(&self) -> &'static str {
        "score_integrity"
    }

    fn check(&self, state: &SystemSnapshot) -> InvariantResult {
        for room in &state.rooms {
            for player in &room.players {
                let total: u64 = player.awards.iter().map(|a| u64::from(a.delta)).sum();
                if total != u64::from(player.score) {
                    return Err(self.violation(format!(
                        "game {} player {}: score {} but awards sum to {total}",
                        room.game_id, player.player_id, player.score
                    )));
                }

                let mut indices = BTreeSet::new();
                for award in &player.awards {
                    if !indices.insert(award.question_index) {
                        return Err(self.violation(format!(
                            "game {} player {}: two awards for question {}",
                            room.game_id, player.player_id, award.question_index
                        )));
                    }
                }

                if let Some(observer) = state.observer(&player.player_id) {
                    if let Some(award) =
                        player.awards.iter().find(|a| !observer.submitted.contains(&a.question_index))
                    {
                        return Err(self.violation(format!(
                            "game {} player {}: award for question {} without a submission",
                            room.game_id, player.player_id, award.question_index
                        )));
                    }
                }
            }
        }

        for observer in &state.observers {
            let mut running: BTreeMap<&str, u32> = BTreeMap::new();
            let mut previous: Option<u32> = None;

            for envelope in &observer.received {
                let ServerMessage::RoundResult(result) = &envelope.message else {
                    continue;
                };
                let contiguous = match previous {
                    None => result.question_index == 0,
                    Some(prev) => result.question_index == prev + 1,
                };
                previous = Some(result.question_index);
                if !contiguous {
                    running.clear();
                    continue;
                }

                for entry in &result.results {
                    let before = running.get(entry.player_id.as_str()).copied().unwrap_or(0);
                    let known = result.question_index == 0
                        || running.contains_key(entry.player_id.as_str());
                    if known && entry.score != before + entry.delta {
                        return Err(self.violation(format!(
                            "observer {}: {} scored {} after {before} + {} on question {}",
                            observer.player_id,
                            entry.player_id,
                            entry.score,
                            entry.delta,
                            result.question_index
                        )));
                    }
                    if entry.delta > 0 && !entry.answered {
                        return Err(self.violation(format!(
                            "observer {}: {} awarded {} on question {} without answering",
                            observer.player_id, entry.player_id, entry.delta, result.question_index
                        )));
                    }
                    running.insert(&entry.player_id, entry.score);
                }
            }
        }
        Ok(())
    }
}

/// A reconnect snapshot moves the cursor forward, never back.
///
/// The snapshot's `current_seq` is at least every seq the observer saw
/// before it, and every later broadcast is newer than the snapshot.
pub struct SnapshotCursor;

impl Invariant for SnapshotCursor {
    fn name(&self) -> &'static str {
        "snapshot_cursor"
    }

    fn check(&self, state: &SystemSnapshot) -> InvariantResult {
        for observer in &state.observers {
            let mut highest = 0;
            let mut floor = 0;
            for envelope in &observer.received {
                if let ServerMessage::Reconnected(snapshot) = &envelope.message {
                    if snapshot.current_seq < highest {
                        return Err(Violation {
                            invariant: self.name(),
                            message: format!(
                                "observer {}: snapshot at seq {} after seeing {highest}",
                                observer.player_id, snapshot.current_seq
                            ),
                        });
                    }
                    floor = snapshot.current_seq;
                    continue;
                }

                let Some(seq) = envelope.seq else {
                    continue;
                };
                if seq <= floor {
                    return Err(Violation {
                        invariant: self.name(),
                        message: format!(
                            "observer {}: seq {seq} not newer than snapshot {floor}",
                            observer.player_id
                        ),
                    });
                }
                highest = highest.max(seq);
            }
        }
        Ok(())
    }
}
