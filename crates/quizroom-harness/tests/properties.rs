//! Property-based tests over random interleavings of answers, timer firings,
//! disconnects and reconnects.
//!
//! Every generated run ends with the standard invariants checked against all
//! observer streams and the room's scoring state.

use std::time::Duration;

use proptest::prelude::*;
use quizroom_harness::{InvariantRegistry, Sim, SimClient, two_player_room};
use quizroom_proto::Phase;

#[derive(Debug, Clone)]
enum Op {
    Answer { player: usize, correct: bool, elapsed_ms: u64 },
    Advance(u64),
    Disconnect(usize),
    Reconnect(usize),
    /// Move the clock without firing timers, so the next answer races a due
    /// deadline
    Skew(u64),
}

fn op_strategy() -> impl Strategy<Value = Op> {
    prop_oneof![
        6 => (0..2usize, any::<bool>(), 0..6_000u64)
            .prop_map(|(player, correct, elapsed_ms)| Op::Answer { player, correct, elapsed_ms }),
        4 => (0..6_000u64).prop_map(Op::Advance),
        1 => (0..2usize).prop_map(Op::Disconnect),
        1 => (0..2usize).prop_map(Op::Reconnect),
        1 => (0..6_000u64).prop_map(Op::Skew),
    ]
}

/// Pressure on the write side: `None` is unbounded.
fn capacity_strategy() -> impl Strategy<Value = Option<usize>> {
    prop_oneof![3 => Just(None), 1 => (1..4usize).prop_map(Some)]
}

fn runtime() -> tokio::runtime::Runtime {
    tokio::runtime::Builder::new_current_thread().build().unwrap()
}

async fn run(seed: u64, ops: Vec<Op>, capacity: Option<usize>) -> Result<(), TestCaseError> {
    let sim = Sim::new(seed);
    let c = sim.coordinator();

    let mut players = vec![sim.client("p1"), match capacity {
        Some(capacity) => SimClient::connect_bounded(c, "p2", capacity),
        None => sim.client("p2"),
    }];
    let mut connected = [true, true];

    players[0].create_room(c, two_player_room(3, 5)).await;
    let code = players[0].room_code().unwrap();
    let game_id = players[0].game_id().unwrap().to_string();
    players[1].join(c, &code).await;
    players[1].ready(c).await;
    let room = sim.room(&game_id).await.unwrap();
    prop_assert_eq!(room.lock().await.phase(), Phase::Countdown);

    for op in ops {
        match op {
            Op::Answer { player, correct, elapsed_ms } => {
                let (index, choice) = {
                    let index = room.lock().await.current_question();
                    let choice = if correct {
                        sim.correct_choice(&room).await
                    } else {
                        sim.wrong_choice(&room).await
                    };
                    (index, choice)
                };
                if let Some(choice) = choice {
                    players[player].answer_after(c, index, choice, elapsed_ms).await;
                }
            },
            Op::Advance(ms) => sim.advance(Duration::from_millis(ms)).await,
            Op::Skew(ms) => sim.env().advance(Duration::from_millis(ms)),
            Op::Disconnect(player) if connected[player] => {
                players[player].disconnect(c).await;
                connected[player] = false;
            },
            Op::Disconnect(_) => {},
            Op::Reconnect(player) => {
                players[player].reconnect(c, &game_id).await;
                connected[player] = true;
            },
        }
        for player in &mut players {
            player.poll();
        }
    }

    // Run out the clock: every game completes or is abandoned
    for _ in 0..10 {
        sim.advance(Duration::from_secs(60)).await;
    }
    for player in &mut players {
        player.poll();
    }

    let live = room.lock().await;
    prop_assert!(live.is_finished(), "room still {:?}", live.phase());
    prop_assert!(live.check_invariants().is_ok());
    drop(live);
    prop_assert!(sim.room(&game_id).await.is_none());

    let observers: Vec<&SimClient> = players.iter().collect();
    let snapshot = sim.snapshot(&observers, &[&room]).await;
    if let Err(violations) = InvariantRegistry::standard().check_all(&snapshot) {
        let messages: Vec<String> = violations.iter().map(ToString::to_string).collect();
        return Err(TestCaseError::fail(messages.join("; ")));
    }

    // Processed stream (after gap handling) never repeats or reorders
    for player in &players {
        let processed: Vec<u64> = player.processed().iter().filter_map(|e| e.seq).collect();
        prop_assert!(processed.windows(2).all(|w| w[0] < w[1]), "{:?}", processed);
    }
    Ok(())
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(64))]

    /// Ordering, advancement and scoring invariants hold under arbitrary
    /// interleavings.
    #[test]
    fn prop_room_invariants_hold(
        seed in any::<u64>(),
        ops in prop::collection::vec(op_strategy(), 0..60),
        capacity in capacity_strategy(),
    ) {
        runtime().block_on(run(seed, ops, capacity))?;
    }

    /// Two answers racing the deadline yield exactly one result for the
    /// round, whichever lands first.
    #[test]
    fn prop_deadline_race_resolves_once(
        seed in any::<u64>(),
        first_ms in 4_900..5_100u64,
        second_ms in 0..200u64,
    ) {
        runtime().block_on(async {
            let sim = Sim::new(seed);
            let c = sim.coordinator();
            let mut p1 = sim.client("p1");
            let mut p2 = sim.client("p2");

            p1.create_room(c, two_player_room(1, 5)).await;
            p2.join(c, &p1.room_code().unwrap()).await;
            p2.ready(c).await;
            sim.advance(Duration::from_secs(3)).await;

            let room = sim.room(p1.game_id().unwrap()).await.unwrap();
            let choice = sim.correct_choice(&room).await.unwrap();

            sim.env().advance(Duration::from_millis(first_ms));
            p1.answer(c, 0, choice.clone()).await;
            sim.env().advance(Duration::from_millis(second_ms));
            p2.answer(c, 0, choice).await;
            sim.advance(Duration::from_secs(30)).await;
            p1.poll();
            p2.poll();

            for client in [&p1, &p2] {
                let results = client.kinds().iter().filter(|k| **k == "round_result").count();
                prop_assert_eq!(results, 1);
                prop_assert_eq!(client.kinds().last().copied(), Some("game_over"));
            }

            let snapshot = sim.snapshot(&[&p1, &p2], &[&room]).await;
            prop_assert!(InvariantRegistry::standard().check_all(&snapshot).is_ok());
            Ok(())
        })?;
    }
}
