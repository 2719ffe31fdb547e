//! A coordinator wired to a simulated environment.

use std::{sync::Arc, time::Duration};

use quizroom_proto::{Choice, CreateRoom};
use quizroom_server::{
    ClockMode, Coordinator, CoordinatorConfig, EventSink, QuestionBank, QuestionRecord, RoomHandle,
};

use crate::{
    client::SimClient,
    invariants::{RoomSnapshot, SystemSnapshot},
    sim_env::{SimEnv, SimInstant},
};

/// Event sink capacity; large enough that scenarios never shed entries.
const SIM_EVENT_CAPACITY: usize = 16 * 1024;

/// Coordinator under virtual time.
///
/// Timers only fire from [`Sim::advance`] and [`Sim::tick`]; nothing runs
/// in the background.
#[derive(Clone)]
pub struct Sim {
    env: SimEnv,
    coordinator: Coordinator<SimEnv>,
}

impl Sim {
    /// Manual-clock coordinator over a ten-question bank.
    pub fn new(seed: u64) -> Self {
        Self::with_config(seed, CoordinatorConfig::manual(), question_bank(10))
    }

    /// Coordinator with explicit config and bank.
    ///
    /// The clock mode is forced to manual.
    pub fn with_config(seed: u64, config: CoordinatorConfig, bank: QuestionBank) -> Self {
        let env = SimEnv::with_seed(seed);
        let config = CoordinatorConfig { clock: ClockMode::Manual, ..config };
        let coordinator =
            Coordinator::new(env.clone(), config, Arc::new(bank), EventSink::new(SIM_EVENT_CAPACITY));
        Self { env, coordinator }
    }

    /// The simulated environment.
    pub fn env(&self) -> &SimEnv {
        &self.env
    }

    /// The coordinator under test.
    pub fn coordinator(&self) -> &Coordinator<SimEnv> {
        &self.coordinator
    }

    /// Connect a new client.
    pub fn client(&self, player_id: &str) -> SimClient {
        SimClient::connect(&self.coordinator, player_id)
    }

    /// Fire every due timer without moving time.
    pub async fn tick(&self) {
        self.coordinator.run_due_timers().await;
    }

    /// Move time forward and fire what came due.
    pub async fn advance(&self, by: Duration) {
        self.env.advance(by);
        self.coordinator.run_due_timers().await;
    }

    /// Live room by game id.
    pub async fn room(&self, game_id: &str) -> Option<RoomHandle<SimInstant>> {
        self.coordinator.room_by_game(game_id).await
    }

    /// Correct option index for the room's open question.
    pub async fn correct_choice(&self, room: &RoomHandle<SimInstant>) -> Option<Choice> {
        let room = room.lock().await;
        room.questions()
            .get(room.current_question() as usize)
            .map(|q| Choice::Index(q.correct_index))
    }

    /// A wrong option index for the room's open question.
    pub async fn wrong_choice(&self, room: &RoomHandle<SimInstant>) -> Option<Choice> {
        let room = room.lock().await;
        room.questions()
            .get(room.current_question() as usize)
            .map(|q| Choice::Index((q.correct_index + 1) % q.options.len().max(1)))
    }

    /// Capture observers and rooms for invariant checks.
    pub async fn snapshot(
        &self,
        clients: &[&SimClient],
        rooms: &[&RoomHandle<SimInstant>],
    ) -> SystemSnapshot {
        let mut snapshot =
            SystemSnapshot::from_observers(clients.iter().map(|c| c.observe()).collect());
        for handle in rooms {
            let room = handle.lock().await;
            snapshot.add_room(RoomSnapshot::capture(&*room));
        }
        snapshot
    }
}

/// `count` questions in theme 1, each with three wrong answers.
///
/// Question `n` has id `n`, text `Q{n}` and correct answer `A{n}`.
pub fn question_bank(count: u64) -> QuestionBank {
    QuestionBank::new(
        (1..=count)
            .map(|id| QuestionRecord {
                id,
                theme_id: 1,
                theme_name: Some("Genesis".to_string()),
                text: format!("Q{id}"),
                correct_answer: format!("A{id}"),
                wrong_answers: vec![format!("W{id}a"), format!("W{id}b"), format!("W{id}c")],
                reference: Some(format!("Genesis {id}:1")),
                difficulty: None,
            })
            .collect(),
    )
}

/// Two seats, `question_count` questions of `time_limit` seconds, theme 1.
pub fn two_player_room(question_count: i64, time_limit: i64) -> CreateRoom {
    CreateRoom {
        max_players: 2,
        question_count,
        time_limit,
        theme_ids: vec![1],
        difficulty: None,
    }
}
