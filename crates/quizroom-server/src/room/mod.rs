//! Room state machine.
//!
//! A room is a pure, single-threaded state machine: every method takes the
//! environment explicitly and mutates state synchronously. The coordinator
//! wraps each room in a lock, so whoever holds the lock (a session
//! handler or the room's clock) sees a consistent room.
//!
//! ```text
//!  ┌───────┐ all ready / start_game ┌───────────┐ countdown ┌─────────┐
//!  │ Lobby │───────────────────────>│ Countdown │──────────>│ InRound │<─┐
//!  └───────┘                        └───────────┘           └─────────┘  │
//!                                          all answered / deadline │     │ delay
//!                                                                  v     │
//!  ┌───────────┐        last question resolved, delay      ┌───────────────┐
//!  │ Completed │<──────────────────────────────────────────│ BetweenRounds │
//!  └───────────┘                                           └───────────────┘
//!
//!  any in-game phase ──(nobody connected past grace / invariant failure)──> Aborted
//! ```
//!
//! The room owns a single scheduled transition ([`Room::next_deadline`]).
//! Every transition replaces it, so stale timers cannot fire. Advancement
//! is guarded by the highest resolved question index: resolving the same
//! round twice is a silent no-op, whichever of the deadline and the last
//! answer gets the lock first.

mod error;
mod player;

use std::{
    collections::BTreeMap,
    fmt::Debug,
    ops::{Add, Sub},
    sync::Arc,
    time::Duration,
};

pub use error::RoomError;
pub use player::{Award, PlayerState};
use quizroom_core::{Environment, ScoringConfig, SessionError};
use quizroom_proto::{
    Choice, Countdown, Envelope, ErrorCode, GameOver, GameStart, LeaderboardEntry, Outcome,
    Phase, PlayerAnswered, PlayerNotice, PlayerRoundResult, QuestionOpen, RoomUpdate, RoundEnd,
    RoundResult, ServerMessage, Snapshot,
};
use serde_json::{Value, json};

use crate::{
    config::{RoomConfig, TimingConfig},
    event_log::EventSink,
    fabric::{EnqueueResult, Fabric, Outbound},
    identity::Identity,
    question_source::{Question, QuestionError, QuestionRequest, QuestionSource},
    sequencer::Sequencer,
    storage::{EventRecord, GameRecord, GameStatus},
};

/// Minimum seated players for a game to start.
pub const MIN_PLAYERS_TO_START: usize = 2;

/// Everything a room is created with.
#[derive(Debug, Clone)]
pub struct RoomParams {
    /// User-visible code
    pub room_code: String,
    /// Stable game id
    pub game_id: String,
    /// Validated settings
    pub config: RoomConfig,
    /// State machine delays
    pub timing: TimingConfig,
    /// Answer scoring
    pub scoring: ScoringConfig,
}

/// Result of seating a player through `join_room`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JoinOutcome {
    /// New seat in the lobby
    Joined,
    /// Returning disconnected participant, resynced with a snapshot
    Reconnected,
}

/// The room's one pending transition.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimerKind {
    /// Open question `n`
    OpenRound(u32),
    /// Deadline of question `n`
    CloseRound(u32),
    /// Broadcast `game_over` after the last result
    Finish,
}

#[derive(Debug, Clone, Copy)]
struct Timer<I> {
    at: I,
    kind: TimerKind,
}

#[derive(Debug, Clone, Copy)]
struct Round<I> {
    opened_at: I,
    deadline_ms: u64,
}

/// A quiz room.
#[derive(Debug)]
pub struct Room<I> {
    room_code: String,
    game_id: String,
    config: RoomConfig,
    timing: TimingConfig,
    scoring: ScoringConfig,
    phase: Phase,
    dissolved: bool,
    /// Seated players in join order
    players: Vec<PlayerState<I>>,
    next_join_order: u64,
    questions: Vec<Question>,
    current_question: u32,
    round: Option<Round<I>>,
    /// Highest question index whose result has been broadcast
    resolved: Option<u32>,
    sequencer: Sequencer,
    fabric: Fabric,
    timer: Option<Timer<I>>,
    /// Transition parked while nobody is connected
    held: Option<TimerKind>,
    abandon_at: Option<I>,
    lifetime_deadline: Option<I>,
    events: EventSink,
    /// Players who lost their seat since the last `take_departed`
    departed: Vec<String>,
    created_at: u64,
    started_at: Option<u64>,
    completed_at: Option<u64>,
    winner_id: Option<String>,
}

impl<I> Room<I>
where
    I: Copy + Ord + Debug + Add<Duration, Output = I> + Sub<Output = Duration>,
{
    /// Create a room in the lobby with `host` seated, host flag set.
    ///
    /// The host is marked ready. Broadcasts the first `room_update`.
    pub fn create<E: Environment<Instant = I>>(
        params: RoomParams,
        host: &Identity,
        session_id: u64,
        outbound: Arc<dyn Outbound>,
        events: EventSink,
        env: &E,
    ) -> Result<Self, RoomError> {
        let now = env.now();
        let wall = env.wall_clock_millis();

        let mut room = Self {
            fabric: Fabric::new(params.room_code.clone()),
            room_code: params.room_code,
            game_id: params.game_id,
            config: params.config,
            timing: params.timing,
            scoring: params.scoring,
            phase: Phase::Lobby,
            dissolved: false,
            players: Vec::new(),
            next_join_order: 0,
            questions: Vec::new(),
            current_question: 0,
            round: None,
            resolved: None,
            sequencer: Sequencer::new(),
            timer: None,
            held: None,
            abandon_at: None,
            lifetime_deadline: None,
            events,
            departed: Vec::new(),
            created_at: wall,
            started_at: None,
            completed_at: None,
            winner_id: None,
        };

        let mut player = PlayerState::new(host, session_id, room.claim_join_order(), now, wall);
        player.is_host = true;
        player.is_ready = true;
        room.players.push(player);
        room.fabric.bind(&host.player_id, outbound);

        room.events.upsert_game(room.game_record());
        room.record_player(&host.player_id);
        room.record(
            "room_created",
            Some(host.player_id.clone()),
            None,
            json!({
                "room_code": room.room_code,
                "max_players": room.config.max_players,
                "question_count": room.config.question_count,
                "time_limit": room.config.time_limit,
                "theme_ids": room.config.theme_ids,
            }),
            None,
            wall,
        )?;
        room.broadcast(room.room_update(), env)?;

        tracing::info!(
            room_code = %room.room_code,
            game_id = %room.game_id,
            host = %host.player_id,
            "room created"
        );
        Ok(room)
    }

    /// User-visible room code.
    pub fn room_code(&self) -> &str {
        &self.room_code
    }

    /// Stable game id.
    pub fn game_id(&self) -> &str {
        &self.game_id
    }

    /// Current phase.
    pub fn phase(&self) -> Phase {
        self.phase
    }

    /// Question in play, or last resolved.
    pub fn current_question(&self) -> u32 {
        self.current_question
    }

    /// Latest broadcast `seq`.
    pub fn current_seq(&self) -> u64 {
        self.sequencer.current_seq()
    }

    /// Frozen question list (empty before the countdown).
    pub fn questions(&self) -> &[Question] {
        &self.questions
    }

    /// Validated settings.
    pub fn config(&self) -> &RoomConfig {
        &self.config
    }

    /// True once the room should be removed from the registry.
    pub fn is_finished(&self) -> bool {
        self.dissolved || self.phase.is_terminal()
    }

    /// Seated players in join order.
    pub fn players(&self) -> &[PlayerState<I>] {
        &self.players
    }

    /// Look up a seated player.
    pub fn player(&self, player_id: &str) -> Option<&PlayerState<I>> {
        self.players.iter().find(|p| p.player_id == player_id)
    }

    /// Players connected and not forfeited.
    pub fn connected_count(&self) -> usize {
        self.players.iter().filter(|p| p.is_active()).count()
    }

    /// Players who lost their seat since the last call.
    pub fn take_departed(&mut self) -> Vec<String> {
        std::mem::take(&mut self.departed)
    }

    /// Earliest instant at which [`Room::on_timer`] has work to do.
    pub fn next_deadline(&self) -> Option<I> {
        if self.is_finished() {
            return None;
        }
        [self.timer.map(|t| t.at), self.abandon_at, self.lifetime_deadline]
            .into_iter()
            .flatten()
            .min()
    }

    /// Seat a player arriving through `join_room`.
    ///
    /// A disconnected participant of a game in progress is reconnected
    /// instead of rejected.
    pub fn join<E: Environment<Instant = I>>(
        &mut self,
        identity: &Identity,
        session_id: u64,
        outbound: Arc<dyn Outbound>,
        env: &E,
    ) -> Result<JoinOutcome, RoomError> {
        if let Some(existing) = self.player(&identity.player_id) {
            if existing.quit {
                return Err(RoomError::AlreadyStarted);
            }
            if existing.connected {
                return Err(RoomError::DuplicatePlayer(identity.player_id.clone()));
            }
            self.reconnect(&identity.player_id, session_id, outbound, env)?;
            return Ok(JoinOutcome::Reconnected);
        }

        if self.phase != Phase::Lobby || self.dissolved {
            return Err(RoomError::AlreadyStarted);
        }
        if self.players.len() >= self.config.max_players as usize {
            return Err(RoomError::RoomFull { max_players: self.config.max_players });
        }

        let now = env.now();
        let wall = env.wall_clock_millis();
        let join_order = self.claim_join_order();
        self.players.push(PlayerState::new(identity, session_id, join_order, now, wall));
        self.fabric.bind(&identity.player_id, outbound);
        self.record_player(&identity.player_id);

        let result = self
            .broadcast(
                ServerMessage::PlayerJoined(PlayerNotice {
                    player_id: identity.player_id.clone(),
                    username: identity.username.clone(),
                }),
                env,
            )
            .and_then(|_| self.broadcast(self.room_update(), env))
            .map(|_| ());
        self.settle(result, env)?;

        tracing::info!(
            room_code = %self.room_code,
            player_id = %identity.player_id,
            players = self.players.len(),
            "player joined"
        );
        Ok(JoinOutcome::Joined)
    }

    /// Flip a player's ready flag. Starts the countdown once every seated
    /// player is ready and there are enough of them.
    pub fn set_ready<E: Environment<Instant = I>>(
        &mut self,
        player_id: &str,
        ready: bool,
        questions: &dyn QuestionSource,
        env: &E,
    ) -> Result<(), RoomError> {
        let index = self.seat_index(player_id)?;
        if self.phase != Phase::Lobby {
            return Err(RoomError::AlreadyStarted);
        }

        self.players[index].is_ready = ready;
        self.players[index].last_seen = env.now();
        self.record_player(player_id);
        let result = self.broadcast(self.room_update(), env).map(|_| ());
        self.settle(result, env)?;

        let result = self.start_if_all_ready(questions, env);
        self.settle(result, env)
    }

    /// Host-only start with at least two ready players. Players who are not
    /// ready still play.
    pub fn start_game<E: Environment<Instant = I>>(
        &mut self,
        player_id: &str,
        questions: &dyn QuestionSource,
        env: &E,
    ) -> Result<(), RoomError> {
        let index = self.seat_index(player_id)?;
        if !self.players[index].is_host {
            return Err(RoomError::NotHost);
        }
        if self.phase != Phase::Lobby {
            return Err(RoomError::AlreadyStarted);
        }

        let ready = self.players.iter().filter(|p| p.is_ready).count();
        if ready < MIN_PLAYERS_TO_START {
            return Err(RoomError::NotReady { ready, needed: MIN_PLAYERS_TO_START });
        }

        let result = self.begin_countdown(questions, env);
        self.settle(result, env)
    }

    /// Score an answer for the open question.
    pub fn submit_answer<E: Environment<Instant = I>>(
        &mut self,
        player_id: &str,
        question_index: u32,
        choice: &Choice,
        client_elapsed_ms: u64,
        env: &E,
    ) -> Result<(), RoomError> {
        let index = self.seat_index(player_id)?;
        if self.players[index].quit {
            return Err(RoomError::NotInRoom);
        }
        if self.phase != Phase::InRound || question_index != self.current_question {
            return Err(RoomError::Stale { current: self.current_question, got: question_index });
        }
        if self.players[index].answered_this_round {
            return Err(RoomError::AlreadyAnswered(question_index));
        }

        let Some(question) = self.questions.get(question_index as usize) else {
            let reason = format!("open question {question_index} missing from question list");
            return Err(self.abort_internal(&reason, env));
        };

        let correct = question.is_correct(choice);
        let delta = self.scoring.score(
            correct,
            self.config.round_time(),
            Duration::from_millis(client_elapsed_ms),
        );

        let player = &mut self.players[index];
        player.answered_this_round = true;
        player.last_seen = env.now();
        player.score = player.score.saturating_add(delta);
        if correct {
            player.correct += 1;
        } else {
            player.wrong += 1;
        }
        player.awards.push(Award { question_index, correct, delta });

        tracing::debug!(
            room_code = %self.room_code,
            player_id,
            question_index,
            correct,
            delta,
            "answer scored"
        );

        let wall = env.wall_clock_millis();
        let result = self
            .record(
                "answer_submitted",
                Some(player_id.to_string()),
                Some(question_index),
                json!({
                    "chosen": choice,
                    "correct": correct,
                    "delta": delta,
                    "client_elapsed_ms": client_elapsed_ms,
                }),
                None,
                wall,
            )
            .and_then(|()| {
                self.broadcast(
                    ServerMessage::PlayerAnswered(PlayerAnswered {
                        player_id: player_id.to_string(),
                        question_index,
                        answered_count: self.answered_count() as u32,
                        connected_count: self.connected_count() as u32,
                    }),
                    env,
                )
            })
            .and_then(|_| {
                if self.all_answered() {
                    self.resolve_round(question_index, RoundEnd::AllAnswered, env)
                } else {
                    Ok(())
                }
            });
        self.settle(result, env)
    }

    /// Leave through `leave_room`: removed in the lobby, marked
    /// disconnected in a game (and still able to reconnect).
    pub fn leave<E: Environment<Instant = I>>(
        &mut self,
        player_id: &str,
        questions: &dyn QuestionSource,
        env: &E,
    ) -> Result<(), RoomError> {
        let index = self.seat_index(player_id)?;
        let result = match self.phase {
            Phase::Lobby => self.remove_from_lobby(index, questions, env),
            phase if phase.is_in_game() => {
                if self.players[index].is_active() {
                    self.mark_disconnected(index, env)
                } else {
                    Ok(())
                }
            },
            _ => Err(RoomError::NotInRoom),
        };
        self.settle(result, env)
    }

    /// Forfeit with `player_quit`. The seat is kept for the leaderboard but
    /// the player is never awaited again and cannot reconnect.
    pub fn quit<E: Environment<Instant = I>>(
        &mut self,
        player_id: &str,
        questions: &dyn QuestionSource,
        env: &E,
    ) -> Result<(), RoomError> {
        let index = self.seat_index(player_id)?;
        if self.phase == Phase::Lobby {
            let result = self.remove_from_lobby(index, questions, env);
            return self.settle(result, env);
        }
        if !self.phase.is_in_game() {
            return Err(RoomError::NotInRoom);
        }
        if self.players[index].quit {
            return Ok(());
        }

        let wall = env.wall_clock_millis();
        let player = &mut self.players[index];
        player.quit = true;
        player.connected = false;
        player.session_id = None;
        player.left_at = Some(wall);
        let notice = PlayerNotice { player_id: player.player_id.clone(), username: player.username.clone() };
        let was_host = player.is_host;

        self.fabric.unbind(player_id);
        self.departed.push(player_id.to_string());
        self.record_player(player_id);

        tracing::info!(room_code = %self.room_code, player_id, "player quit");

        let result = self.broadcast(ServerMessage::PlayerLeft(notice), env).and_then(|_| {
            if was_host {
                self.migrate_host(index, env)?;
            }
            self.after_departure(env)
        });
        self.settle(result, env)
    }

    /// A session ended. Ignored unless `session_id` is the player's current
    /// session, so a superseded socket closing late changes nothing.
    pub fn disconnect<E: Environment<Instant = I>>(
        &mut self,
        player_id: &str,
        session_id: u64,
        questions: &dyn QuestionSource,
        env: &E,
    ) -> Result<(), RoomError> {
        let Some(index) = self.players.iter().position(|p| p.player_id == player_id) else {
            return Ok(());
        };
        if self.players[index].session_id != Some(session_id) {
            tracing::debug!(room_code = %self.room_code, player_id, session_id, "stale disconnect ignored");
            return Ok(());
        }

        let result = match self.phase {
            Phase::Lobby => self.remove_from_lobby(index, questions, env),
            phase if phase.is_in_game() => self.mark_disconnected(index, env),
            _ => Ok(()),
        };
        self.settle(result, env)
    }

    /// Rebind a known player to a new session and send them a snapshot.
    ///
    /// A player whose old session is still open is taken over; the old
    /// session is closed as superseded.
    pub fn reconnect<E: Environment<Instant = I>>(
        &mut self,
        player_id: &str,
        session_id: u64,
        outbound: Arc<dyn Outbound>,
        env: &E,
    ) -> Result<(), RoomError> {
        if self.is_finished() {
            return Err(RoomError::UnknownGame(self.game_id.clone()));
        }
        let Some(index) = self.players.iter().position(|p| p.player_id == player_id) else {
            return Err(RoomError::UnknownPlayer(player_id.to_string()));
        };
        if self.players[index].quit {
            return Err(RoomError::UnknownPlayer(player_id.to_string()));
        }

        let now = env.now();
        let wall = env.wall_clock_millis();
        let was_connected = self.players[index].connected;

        let player = &mut self.players[index];
        player.connected = true;
        player.session_id = Some(session_id);
        player.last_seen = now;
        player.reconnected_at = Some(wall);
        let notice = PlayerNotice { player_id: player.player_id.clone(), username: player.username.clone() };

        if let Some(previous) = self.fabric.bind(player_id, outbound) {
            previous.close(SessionError::Superseded);
        }

        if self.abandon_at.take().is_some() {
            tracing::info!(room_code = %self.room_code, player_id, "abandonment cancelled");
        }
        if let Some(kind) = self.held.take() {
            self.timer = Some(Timer { at: now + self.timing.between_rounds, kind });
        }

        let snapshot = self.snapshot();
        self.send_direct(player_id, ServerMessage::Reconnected(snapshot), wall);
        self.record_player(player_id);

        tracing::info!(
            room_code = %self.room_code,
            player_id,
            current_seq = self.current_seq(),
            "player reconnected"
        );

        if was_connected {
            return Ok(());
        }
        let result = self.broadcast(ServerMessage::PlayerReconnected(notice), env).map(|_| ());
        self.settle(result, env)
    }

    /// Fire whatever is due: lifetime cap, abandonment, or the scheduled
    /// transition.
    pub fn on_timer<E: Environment<Instant = I>>(&mut self, env: &E) -> Result<(), RoomError> {
        if self.is_finished() {
            return Ok(());
        }
        let now = env.now();

        if self.lifetime_deadline.is_some_and(|at| now >= at) {
            tracing::info!(room_code = %self.room_code, "lifetime cap reached");
            self.finish(Outcome::Completed, Some("lifetime cap reached"), env);
            return Ok(());
        }

        if self.abandon_at.is_some_and(|at| now >= at) {
            tracing::info!(room_code = %self.room_code, "room abandoned");
            self.finish(Outcome::Aborted, Some("all players disconnected"), env);
            return Ok(());
        }

        let Some(timer) = self.timer.filter(|t| t.at <= now) else {
            return Ok(());
        };
        self.timer = None;

        let result = match timer.kind {
            TimerKind::OpenRound(index) if self.connected_count() == 0 => {
                tracing::debug!(room_code = %self.room_code, index, "nobody connected, round held");
                self.held = Some(timer.kind);
                Ok(())
            },
            TimerKind::OpenRound(index) => self.open_round(index, env),
            TimerKind::CloseRound(index) => self.resolve_round(index, RoundEnd::Deadline, env),
            TimerKind::Finish => {
                self.finish(Outcome::Completed, None, env);
                Ok(())
            },
        };
        self.settle(result, env)
    }

    /// Current view for a reconnecting player.
    pub fn snapshot(&self) -> Snapshot {
        let in_round = self.phase == Phase::InRound;
        Snapshot {
            game_id: self.game_id.clone(),
            room_code: self.room_code.clone(),
            phase: self.phase,
            current_question: self.current_question,
            question_count: self.question_count(),
            current_question_payload: in_round
                .then(|| self.questions.get(self.current_question as usize).map(Question::view))
                .flatten(),
            round_deadline_timestamp: self.round.filter(|_| in_round).map(|r| r.deadline_ms),
            player_scores: self.scores(),
            players_answered: self
                .players
                .iter()
                .map(|p| (p.player_id.clone(), p.answered_this_round))
                .collect(),
            current_seq: self.current_seq(),
            players: self.players.iter().map(PlayerState::view).collect(),
        }
    }

    /// Final ranking: score desc, correct desc, join order.
    pub fn leaderboard(&self) -> Vec<LeaderboardEntry> {
        let mut ranked: Vec<&PlayerState<I>> = self.players.iter().collect();
        ranked.sort_by(|a, b| {
            b.score
                .cmp(&a.score)
                .then(b.correct.cmp(&a.correct))
                .then(a.join_order.cmp(&b.join_order))
        });
        ranked.iter().zip(1u32..).map(|(p, placement)| p.leaderboard_entry(placement)).collect()
    }

    /// Check structural invariants.
    ///
    /// - exactly one host among players still in the game
    /// - every score equals the sum of its awards, one award per question
    /// - the current question exists once the list is frozen
    /// - while live, exactly the connected players have a bound outbound
    pub fn check_invariants(&self) -> Result<(), String> {
        let remaining = self.players.iter().filter(|p| !p.quit).count();
        let hosts = self.players.iter().filter(|p| p.is_host && !p.quit).count();
        if remaining > 0 && hosts != 1 {
            return Err(format!("{hosts} hosts among {remaining} players"));
        }

        for player in &self.players {
            let awarded: u64 = player.awards.iter().map(|a| u64::from(a.delta)).sum();
            if awarded != u64::from(player.score) {
                return Err(format!(
                    "player {} has score {} but awards sum to {awarded}",
                    player.player_id, player.score
                ));
            }
            if player.awards.windows(2).any(|w| w[0].question_index >= w[1].question_index) {
                return Err(format!("player {} awarded twice for one question", player.player_id));
            }
            if player.awards.iter().any(|a| a.question_index > self.current_question) {
                return Err(format!("player {} awarded for an unopened question", player.player_id));
            }
        }

        if !self.is_finished() {
            let unbound =
                self.players.iter().find(|p| p.connected != self.fabric.is_bound(&p.player_id));
            if let Some(player) = unbound {
                return Err(format!(
                    "player {} connected={} disagrees with its outbound binding",
                    player.player_id, player.connected
                ));
            }
            if self.fabric.len() != self.connected_count() {
                return Err(format!(
                    "{} outbounds bound for {} connected players",
                    self.fabric.len(),
                    self.connected_count()
                ));
            }
        }

        if matches!(self.phase, Phase::InRound | Phase::BetweenRounds)
            && self.current_question as usize >= self.questions.len()
        {
            return Err(format!(
                "current question {} out of {} questions",
                self.current_question,
                self.questions.len()
            ));
        }

        Ok(())
    }

    fn begin_countdown<E: Environment<Instant = I>>(
        &mut self,
        source: &dyn QuestionSource,
        env: &E,
    ) -> Result<(), RoomError> {
        let request = QuestionRequest {
            game_id: &self.game_id,
            theme_ids: &self.config.theme_ids,
            difficulty: self.config.difficulty.as_deref(),
            count: self.config.question_count as usize,
        };
        let questions = source.draw(&request).map_err(|e| {
            if !matches!(e, QuestionError::Empty) {
                tracing::error!(room_code = %self.room_code, error = %e, "question source failed");
            }
            RoomError::NoQuestions
        })?;

        let now = env.now();
        let wall = env.wall_clock_millis();

        self.questions = questions;
        self.phase = Phase::Countdown;
        self.current_question = 0;
        self.started_at = Some(wall);
        self.lifetime_deadline = Some(now + self.timing.lifetime_cap);
        self.timer = Some(Timer { at: now + self.timing.countdown, kind: TimerKind::OpenRound(0) });

        let countdown_ms = self.timing.countdown.as_millis() as u64;
        self.broadcast_as(
            "game_start",
            ServerMessage::GameStart(GameStart {
                game_id: self.game_id.clone(),
                room_code: self.room_code.clone(),
                question_count: self.question_count(),
                time_limit: self.config.time_limit,
                countdown_ms,
                players: self.players.iter().map(PlayerState::view).collect(),
            }),
            env,
        )?;
        self.broadcast(
            ServerMessage::Countdown(Countdown {
                seconds: self.timing.countdown.as_secs() as u32,
                starts_at: wall + countdown_ms,
            }),
            env,
        )?;

        self.events.upsert_game(self.game_record());
        for player in &self.players {
            self.events.upsert_player(player.record(&self.game_id, None));
        }

        tracing::info!(
            room_code = %self.room_code,
            game_id = %self.game_id,
            questions = self.questions.len(),
            players = self.players.len(),
            "game starting"
        );
        Ok(())
    }

    fn open_round<E: Environment<Instant = I>>(
        &mut self,
        index: u32,
        env: &E,
    ) -> Result<(), RoomError> {
        let expected = self.resolved.map_or(0, |r| r + 1);
        let ready_phase = matches!(self.phase, Phase::Countdown | Phase::BetweenRounds);
        if !ready_phase || index != expected {
            tracing::debug!(room_code = %self.room_code, index, expected, "stale round open ignored");
            return Ok(());
        }
        let Some(question) = self.questions.get(index as usize) else {
            return Err(RoomError::Internal(format!("question {index} out of range")));
        };
        let view = question.view();

        let now = env.now();
        let wall = env.wall_clock_millis();
        let round_time = self.config.round_time();
        let deadline_ms = wall + round_time.as_millis() as u64;

        self.phase = Phase::InRound;
        self.current_question = index;
        for player in &mut self.players {
            player.answered_this_round = false;
        }
        self.round = Some(Round { opened_at: now, deadline_ms });
        self.timer = Some(Timer { at: now + round_time, kind: TimerKind::CloseRound(index) });

        self.broadcast(
            ServerMessage::Question(QuestionOpen {
                question_index: index,
                question_count: self.question_count(),
                question: view,
                deadline: deadline_ms,
                time_limit: self.config.time_limit,
            }),
            env,
        )?;

        tracing::debug!(room_code = %self.room_code, index, "question opened");
        Ok(())
    }

    /// Broadcast the result of question `index` at most once.
    fn resolve_round<E: Environment<Instant = I>>(
        &mut self,
        index: u32,
        reason: RoundEnd,
        env: &E,
    ) -> Result<(), RoomError> {
        let already = self.resolved.is_some_and(|r| r >= index);
        if self.phase != Phase::InRound || self.current_question != index || already {
            tracing::debug!(room_code = %self.room_code, index, ?reason, "duplicate advancement ignored");
            return Ok(());
        }
        let Some(question) = self.questions.get(index as usize) else {
            return Err(RoomError::Internal(format!("question {index} out of range")));
        };
        let correct_answer = question.correct_answer().to_string();
        let reference = question.reference.clone();

        let now = env.now();
        let wall = env.wall_clock_millis();
        let is_last = index as usize + 1 >= self.questions.len();

        self.resolved = Some(index);
        self.phase = Phase::BetweenRounds;
        if let Some(round) = self.round.take() {
            tracing::debug!(
                room_code = %self.room_code,
                index,
                ?reason,
                elapsed = ?(now - round.opened_at),
                "round resolved"
            );
        }
        let kind = if is_last { TimerKind::Finish } else { TimerKind::OpenRound(index + 1) };
        self.timer = Some(Timer { at: now + self.timing.between_rounds, kind });

        let results = self
            .players
            .iter()
            .map(|p| {
                let award = p.award_for(index);
                PlayerRoundResult {
                    player_id: p.player_id.clone(),
                    answered: award.is_some(),
                    correct: award.is_some_and(|a| a.correct),
                    delta: award.map_or(0, |a| a.delta),
                    score: p.score,
                }
            })
            .collect();

        self.broadcast_as(
            "round_end",
            ServerMessage::RoundResult(RoundResult {
                question_index: index,
                correct_answer,
                reference,
                reason,
                results,
                scores: self.scores(),
                next_at: wall + self.timing.between_rounds.as_millis() as u64,
                is_last,
            }),
            env,
        )?;
        self.events.upsert_game(self.game_record());
        Ok(())
    }

    /// Enter a terminal phase and broadcast `game_over`.
    fn finish<E: Environment<Instant = I>>(
        &mut self,
        outcome: Outcome,
        reason: Option<&str>,
        env: &E,
    ) {
        if self.is_finished() {
            return;
        }

        let wall = env.wall_clock_millis();
        let leaderboard = self.leaderboard();
        let winner_id = leaderboard.first().filter(|e| e.score > 0).map(|e| e.player_id.clone());

        self.phase = match outcome {
            Outcome::Completed => Phase::Completed,
            Outcome::Aborted => Phase::Aborted,
        };
        self.timer = None;
        self.held = None;
        self.abandon_at = None;
        self.lifetime_deadline = None;
        self.round = None;
        self.completed_at = Some(wall);
        self.winner_id.clone_from(&winner_id);

        let event_type = match outcome {
            Outcome::Completed => "game_completed",
            Outcome::Aborted => "game_aborted",
        };
        let message = ServerMessage::GameOver(GameOver {
            game_id: self.game_id.clone(),
            outcome,
            reason: reason.map(str::to_string),
            leaderboard: leaderboard.clone(),
            winner_id,
        });
        if let Err(e) = self.broadcast_as(event_type, message, env) {
            tracing::error!(room_code = %self.room_code, error = %e, "game_over broadcast failed");
        }

        self.events.upsert_game(self.game_record());
        for entry in &leaderboard {
            if let Some(player) = self.player(&entry.player_id) {
                self.events.upsert_player(player.record(&self.game_id, Some(entry.placement)));
            }
        }

        self.departed.extend(self.players.iter().map(|p| p.player_id.clone()));
        self.fabric.clear();

        tracing::info!(
            room_code = %self.room_code,
            game_id = %self.game_id,
            ?outcome,
            reason,
            "game over"
        );
    }

    /// Abort after an invariant failure. Returns the error for the caller.
    fn abort_internal<E: Environment<Instant = I>>(&mut self, reason: &str, env: &E) -> RoomError {
        tracing::error!(room_code = %self.room_code, game_id = %self.game_id, reason, "invariant violated, aborting room");

        if !self.is_finished() {
            let error = ServerMessage::error(ErrorCode::Internal, reason);
            if let Err(e) = self.broadcast(error, env) {
                tracing::error!(room_code = %self.room_code, error = %e, "error broadcast failed");
            }
            self.finish(Outcome::Aborted, Some(reason), env);
        }
        RoomError::Internal(reason.to_string())
    }

    /// Route internal failures and invariant violations to an abort.
    fn settle<E: Environment<Instant = I>>(
        &mut self,
        result: Result<(), RoomError>,
        env: &E,
    ) -> Result<(), RoomError> {
        match result {
            Err(RoomError::Internal(reason)) => Err(self.abort_internal(&reason, env)),
            Err(other) => Err(other),
            Ok(()) if self.is_finished() => Ok(()),
            Ok(()) => match self.check_invariants() {
                Ok(()) => Ok(()),
                Err(reason) => Err(self.abort_internal(&reason, env)),
            },
        }
    }

    /// Start the countdown when every seated player is ready and there are
    /// enough of them.
    fn start_if_all_ready<E: Environment<Instant = I>>(
        &mut self,
        questions: &dyn QuestionSource,
        env: &E,
    ) -> Result<(), RoomError> {
        let all_ready = self.players.iter().all(|p| p.is_ready);
        if self.phase == Phase::Lobby && all_ready && self.players.len() >= MIN_PLAYERS_TO_START {
            self.begin_countdown(questions, env)?;
        }
        Ok(())
    }

    fn remove_from_lobby<E: Environment<Instant = I>>(
        &mut self,
        index: usize,
        questions: &dyn QuestionSource,
        env: &E,
    ) -> Result<(), RoomError> {
        let player = self.players.remove(index);
        let wall = env.wall_clock_millis();
        self.fabric.unbind(&player.player_id);
        self.departed.push(player.player_id.clone());

        let mut record = player.record(&self.game_id, None);
        record.left_at = Some(wall);
        self.events.upsert_player(record);

        tracing::info!(room_code = %self.room_code, player_id = %player.player_id, "player left lobby");

        if self.players.is_empty() {
            self.dissolved = true;
            self.timer = None;
            self.completed_at = Some(wall);
            self.events.upsert_game(self.game_record());
            tracing::info!(room_code = %self.room_code, "last player left, room dissolved");
            return Ok(());
        }

        self.broadcast(
            ServerMessage::PlayerLeft(PlayerNotice {
                player_id: player.player_id.clone(),
                username: player.username.clone(),
            }),
            env,
        )?;
        if player.is_host {
            self.migrate_host(index, env)?;
        }
        self.broadcast(self.room_update(), env)?;

        // The departing player may have been the only one not ready. The
        // departure itself stands even when no questions can be drawn.
        match self.start_if_all_ready(questions, env) {
            Err(RoomError::NoQuestions) => {
                tracing::warn!(room_code = %self.room_code, "all ready after departure but no questions");
                Ok(())
            },
            other => other,
        }
    }

    fn mark_disconnected<E: Environment<Instant = I>>(
        &mut self,
        index: usize,
        env: &E,
    ) -> Result<(), RoomError> {
        let wall = env.wall_clock_millis();
        let player = &mut self.players[index];
        player.connected = false;
        player.session_id = None;
        player.disconnected_at = Some(wall);
        let notice = PlayerNotice { player_id: player.player_id.clone(), username: player.username.clone() };

        self.fabric.unbind(&notice.player_id);
        self.record_player(&notice.player_id);

        tracing::info!(room_code = %self.room_code, player_id = %notice.player_id, "player disconnected");

        self.broadcast(ServerMessage::PlayerDisconnected(notice), env)?;
        self.after_departure(env)
    }

    /// A player stopped being awaited: maybe resolve the round, maybe start
    /// the abandonment clock.
    fn after_departure<E: Environment<Instant = I>>(&mut self, env: &E) -> Result<(), RoomError> {
        if self.phase == Phase::InRound && self.all_answered() {
            self.resolve_round(self.current_question, RoundEnd::AllAnswered, env)?;
        }

        if self.connected_count() == 0 && self.abandon_at.is_none() {
            self.abandon_at = Some(env.now() + self.timing.abandon_grace);
            tracing::info!(
                room_code = %self.room_code,
                grace = ?self.timing.abandon_grace,
                "no players connected, abandonment scheduled"
            );
        }
        Ok(())
    }

    /// Hand the host flag to the oldest-joined remaining player.
    ///
    /// `from` is the departing host's index (already removed in the lobby).
    fn migrate_host<E: Environment<Instant = I>>(
        &mut self,
        from: usize,
        env: &E,
    ) -> Result<(), RoomError> {
        if let Some(old) = self.players.get_mut(from).filter(|p| p.quit) {
            old.is_host = false;
        }
        let Some(next) = self.players.iter_mut().filter(|p| !p.quit).min_by_key(|p| p.join_order)
        else {
            return Ok(());
        };
        next.is_host = true;
        let new_host = next.player_id.clone();

        self.record_player(&new_host);
        self.record(
            "host_changed",
            Some(new_host.clone()),
            None,
            json!({ "host_player_id": new_host }),
            None,
            env.wall_clock_millis(),
        )?;
        self.events.upsert_game(self.game_record());

        tracing::info!(room_code = %self.room_code, host = %new_host, "host migrated");
        Ok(())
    }

    fn broadcast<E: Environment<Instant = I>>(
        &mut self,
        message: ServerMessage,
        env: &E,
    ) -> Result<u64, RoomError> {
        let event_type = message.kind();
        self.broadcast_as(event_type, message, env)
    }

    /// Sequence, serialize once, fan out, then mirror to the event log.
    fn broadcast_as<E: Environment<Instant = I>>(
        &mut self,
        event_type: &'static str,
        message: ServerMessage,
        env: &E,
    ) -> Result<u64, RoomError> {
        let seq = self.sequencer.next_seq()?;
        let timestamp = env.wall_clock_millis();

        let (player_id, question_index) = subject(&message);
        let data = payload_json(&message);
        let frame: Arc<str> = Envelope::sequenced(message, seq, timestamp)
            .encode()
            .map_err(|e| RoomError::Internal(e.to_string()))?
            .into();

        let delivered = self.fabric.broadcast(seq, &frame);
        tracing::debug!(room_code = %self.room_code, seq, event_type, delivered, "broadcast");

        self.record(event_type, player_id, question_index, data, Some(seq), timestamp)?;
        Ok(seq)
    }

    /// Reply to one player outside the room's total order.
    fn send_direct(&self, player_id: &str, message: ServerMessage, timestamp: u64) {
        match Envelope::direct(message, timestamp).encode() {
            Ok(text) => {
                if self.fabric.send(player_id, text.into()) != EnqueueResult::Ok {
                    tracing::warn!(room_code = %self.room_code, player_id, "direct message not delivered");
                }
            },
            Err(e) => tracing::error!(room_code = %self.room_code, error = %e, "direct message encode failed"),
        }
    }

    fn record(
        &mut self,
        event_type: &str,
        player_id: Option<String>,
        question_index: Option<u32>,
        data: Value,
        sequence_num: Option<u64>,
        timestamp: u64,
    ) -> Result<(), RoomError> {
        let log_index = self.sequencer.next_log_index()?;
        self.events.record_event(EventRecord {
            game_id: self.game_id.clone(),
            log_index,
            event_type: event_type.to_string(),
            player_id,
            question_index,
            data: data.to_string(),
            timestamp,
            sequence_num,
        });
        Ok(())
    }

    fn record_player(&self, player_id: &str) {
        if let Some(player) = self.player(player_id) {
            self.events.upsert_player(player.record(&self.game_id, None));
        }
    }

    fn game_record(&self) -> GameRecord {
        let status = match self.phase {
            _ if self.dissolved => GameStatus::Abandoned,
            Phase::Lobby => GameStatus::Waiting,
            Phase::Completed => GameStatus::Completed,
            Phase::Aborted => GameStatus::Abandoned,
            _ => GameStatus::Playing,
        };
        GameRecord {
            game_id: self.game_id.clone(),
            room_code: self.room_code.clone(),
            host_player_id: self
                .players
                .iter()
                .find(|p| p.is_host)
                .map(|p| p.player_id.clone())
                .unwrap_or_default(),
            max_players: self.config.max_players,
            question_count: self.question_count(),
            time_limit: self.config.time_limit,
            theme_ids: self.config.theme_ids.clone(),
            difficulty: self.config.difficulty.clone(),
            status,
            current_question: self.current_question,
            created_at: self.created_at,
            started_at: self.started_at,
            completed_at: self.completed_at,
            winner_id: self.winner_id.clone(),
        }
    }

    fn room_update(&self) -> ServerMessage {
        ServerMessage::RoomUpdate(RoomUpdate {
            room_code: self.room_code.clone(),
            host_player_id: self
                .players
                .iter()
                .find(|p| p.is_host && !p.quit)
                .map(|p| p.player_id.clone())
                .unwrap_or_default(),
            phase: self.phase,
            max_players: self.config.max_players,
            question_count: self.question_count(),
            time_limit: self.config.time_limit,
            theme_ids: self.config.theme_ids.clone(),
            players: self.players.iter().map(PlayerState::view).collect(),
        })
    }

    /// Frozen count once the game starts, requested count before.
    fn question_count(&self) -> u32 {
        if self.questions.is_empty() {
            self.config.question_count
        } else {
            self.questions.len() as u32
        }
    }

    fn scores(&self) -> BTreeMap<String, u32> {
        self.players.iter().map(|p| (p.player_id.clone(), p.score)).collect()
    }

    fn answered_count(&self) -> usize {
        self.players.iter().filter(|p| p.is_active() && p.answered_this_round).count()
    }

    /// Every connected player answered. False with nobody connected.
    fn all_answered(&self) -> bool {
        let mut active = self.players.iter().filter(|p| p.is_active()).peekable();
        active.peek().is_some() && active.all(|p| p.answered_this_round)
    }

    fn seat_index(&self, player_id: &str) -> Result<usize, RoomError> {
        if self.is_finished() {
            return Err(RoomError::NotInRoom);
        }
        self.players.iter().position(|p| p.player_id == player_id).ok_or(RoomError::NotInRoom)
    }

    fn claim_join_order(&mut self) -> u64 {
        let order = self.next_join_order;
        self.next_join_order += 1;
        order
    }
}

/// Player and question a broadcast is about, for the event log.
fn subject(message: &ServerMessage) -> (Option<String>, Option<u32>) {
    match message {
        ServerMessage::PlayerAnswered(m) => (Some(m.player_id.clone()), Some(m.question_index)),
        ServerMessage::PlayerJoined(n)
        | ServerMessage::PlayerLeft(n)
        | ServerMessage::PlayerDisconnected(n)
        | ServerMessage::PlayerReconnected(n) => (Some(n.player_id.clone()), None),
        ServerMessage::Question(q) => (None, Some(q.question_index)),
        ServerMessage::RoundResult(r) => (None, Some(r.question_index)),
        _ => (None, None),
    }
}

fn payload_json(message: &ServerMessage) -> Value {
    serde_json::to_value(message)
        .ok()
        .and_then(|mut tagged| tagged.get_mut("payload").map(Value::take))
        .unwrap_or(Value::Null)
}

#[cfg(test)]
mod tests {
    use std::{
        sync::Mutex,
        time::Instant,
    };

    use super::*;
    use crate::question_source::{QuestionBank, QuestionRecord};

    #[derive(Clone)]
    struct TestEnv {
        start: Instant,
        offset: Arc<Mutex<Duration>>,
    }

    impl TestEnv {
        fn new() -> Self {
            Self { start: Instant::now(), offset: Arc::new(Mutex::new(Duration::ZERO)) }
        }

        fn advance(&self, by: Duration) {
            *self.offset.lock().unwrap() += by;
        }
    }

    impl Environment for TestEnv {
        type Instant = Instant;

        fn now(&self) -> Instant {
            self.start + *self.offset.lock().unwrap()
        }

        fn wall_clock_millis(&self) -> u64 {
            1_700_000_000_000 + self.offset.lock().unwrap().as_millis() as u64
        }

        async fn sleep(&self, _duration: Duration) {}

        fn random_bytes(&self, buffer: &mut [u8]) {
            buffer.fill(7);
        }
    }

    struct Sink(Mutex<Vec<String>>);

    impl Outbound for Sink {
        fn enqueue(&self, frame: Arc<str>) -> EnqueueResult {
            self.0.lock().unwrap().push(frame.to_string());
            EnqueueResult::Ok
        }

        fn close(&self, _reason: SessionError) {}

        fn is_closed(&self) -> bool {
            false
        }
    }

    impl Sink {
        fn kinds(&self) -> Vec<String> {
            self.0
                .lock()
                .unwrap()
                .iter()
                .map(|f| Envelope::decode(f).unwrap().message.kind().to_string())
                .collect()
        }
    }

    fn identity(id: &str) -> Identity {
        Identity { player_id: id.to_string(), username: id.to_uppercase(), user_id: None, is_guest: true }
    }

    fn bank() -> QuestionBank {
        QuestionBank::new(
            (1..=5)
                .map(|id| QuestionRecord {
                    id,
                    theme_id: 1,
                    theme_name: None,
                    text: format!("Q{id}"),
                    correct_answer: format!("A{id}"),
                    wrong_answers: vec!["x".into(), "y".into(), "z".into()],
                    reference: None,
                    difficulty: None,
                })
                .collect(),
        )
    }

    fn room(env: &TestEnv) -> (Room<Instant>, Arc<Sink>, Arc<Sink>) {
        let params = RoomParams {
            room_code: "ABC123".to_string(),
            game_id: "game-1".to_string(),
            config: RoomConfig {
                max_players: 2,
                question_count: 3,
                time_limit: 10,
                theme_ids: vec![1],
                difficulty: None,
            },
            timing: TimingConfig::default(),
            scoring: ScoringConfig::default(),
        };
        let host = Arc::new(Sink(Mutex::new(Vec::new())));
        let guest = Arc::new(Sink(Mutex::new(Vec::new())));
        let mut room =
            Room::create(params, &identity("p1"), 1, host.clone(), EventSink::new(1024), env)
                .unwrap();
        room.join(&identity("p2"), 2, guest.clone(), env).unwrap();
        (room, host, guest)
    }

    fn start(room: &mut Room<Instant>, env: &TestEnv) {
        room.set_ready("p2", true, &bank(), env).unwrap();
        assert_eq!(room.phase(), Phase::Countdown);
        env.advance(TimingConfig::default().countdown);
        room.on_timer(env).unwrap();
        assert_eq!(room.phase(), Phase::InRound);
    }

    fn correct_index(room: &Room<Instant>) -> usize {
        room.questions()[room.current_question() as usize].correct_index
    }

    #[test]
    fn room_full_and_duplicate() {
        let env = TestEnv::new();
        let (mut room, _, _) = room(&env);

        let sink = Arc::new(Sink(Mutex::new(Vec::new())));
        assert_eq!(
            room.join(&identity("p3"), 3, sink.clone(), &env),
            Err(RoomError::RoomFull { max_players: 2 })
        );
        assert_eq!(
            room.join(&identity("p2"), 3, sink, &env),
            Err(RoomError::DuplicatePlayer("p2".to_string()))
        );
    }

    #[test]
    fn all_ready_starts_countdown() {
        let env = TestEnv::new();
        let (mut room, host, _) = room(&env);
        start(&mut room, &env);

        let kinds = host.kinds();
        let tail: Vec<&str> = kinds.iter().rev().take(3).rev().map(String::as_str).collect();
        assert_eq!(tail, vec!["game_start", "countdown", "question"]);
    }

    #[test]
    fn start_game_requires_host_and_ready() {
        let env = TestEnv::new();
        let (mut room, _, _) = room(&env);

        assert_eq!(room.start_game("p2", &bank(), &env), Err(RoomError::NotHost));
        assert_eq!(
            room.start_game("p1", &bank(), &env),
            Err(RoomError::NotReady { ready: 1, needed: 2 })
        );
    }

    #[test]
    fn no_questions_keeps_lobby() {
        let env = TestEnv::new();
        let (mut room, _, _) = room(&env);

        let empty = QuestionBank::default();
        assert_eq!(room.set_ready("p2", true, &empty, &env), Err(RoomError::NoQuestions));
        assert_eq!(room.phase(), Phase::Lobby);
    }

    #[test]
    fn last_answer_resolves_once() {
        let env = TestEnv::new();
        let (mut room, host, _) = room(&env);
        start(&mut room, &env);

        let right = Choice::Index(correct_index(&room));
        room.submit_answer("p1", 0, &right, 1_000, &env).unwrap();
        room.submit_answer("p2", 0, &Choice::Text("nope".into()), 2_000, &env).unwrap();
        assert_eq!(room.phase(), Phase::BetweenRounds);

        // Deadline firing afterwards is a no-op
        env.advance(Duration::from_secs(10));
        room.on_timer(&env).unwrap();

        let results = host.kinds().iter().filter(|k| *k == "round_result").count();
        assert_eq!(results, 1);
        assert_eq!(room.player("p1").unwrap().score, 190);
        assert_eq!(room.player("p2").unwrap().score, 0);
    }

    #[test]
    fn duplicate_and_stale_submissions() {
        let env = TestEnv::new();
        let (mut room, _, _) = room(&env);
        start(&mut room, &env);

        let right = Choice::Index(correct_index(&room));
        room.submit_answer("p1", 0, &right, 0, &env).unwrap();
        assert_eq!(
            room.submit_answer("p1", 0, &right, 0, &env),
            Err(RoomError::AlreadyAnswered(0))
        );
        assert_eq!(
            room.submit_answer("p2", 1, &right, 0, &env),
            Err(RoomError::Stale { current: 0, got: 1 })
        );
        assert_eq!(room.player("p1").unwrap().score, 200);
    }

    #[test]
    fn deadline_resolves_with_zero_deltas() {
        let env = TestEnv::new();
        let (mut room, _, _) = room(&env);
        start(&mut room, &env);

        env.advance(Duration::from_secs(10));
        room.on_timer(&env).unwrap();
        assert_eq!(room.phase(), Phase::BetweenRounds);

        env.advance(TimingConfig::default().between_rounds);
        room.on_timer(&env).unwrap();
        assert_eq!(room.phase(), Phase::InRound);
        assert_eq!(room.current_question(), 1);
        assert!(room.players().iter().all(|p| p.score == 0));
    }

    #[test]
    fn disconnect_stops_awaiting_player() {
        let env = TestEnv::new();
        let (mut room, _, _) = room(&env);
        start(&mut room, &env);

        let right = Choice::Index(correct_index(&room));
        room.submit_answer("p1", 0, &right, 0, &env).unwrap();
        room.disconnect("p2", 2, &bank(), &env).unwrap();

        assert_eq!(room.phase(), Phase::BetweenRounds);
        assert!(!room.player("p2").unwrap().connected);
    }

    #[test]
    fn stale_session_disconnect_is_ignored() {
        let env = TestEnv::new();
        let (mut room, _, _) = room(&env);
        start(&mut room, &env);

        room.disconnect("p2", 99, &bank(), &env).unwrap();
        assert!(room.player("p2").unwrap().connected);
    }

    #[test]
    fn reconnect_gets_snapshot_then_live_stream() {
        let env = TestEnv::new();
        let (mut room, _, _) = room(&env);
        start(&mut room, &env);
        room.disconnect("p2", 2, &bank(), &env).unwrap();

        let fresh = Arc::new(Sink(Mutex::new(Vec::new())));
        room.reconnect("p2", 3, fresh.clone(), &env).unwrap();

        let frames: Vec<Envelope> =
            fresh.0.lock().unwrap().iter().map(|f| Envelope::decode(f).unwrap()).collect();
        let ServerMessage::Reconnected(snapshot) = &frames[0].message else {
            panic!("expected snapshot first, got {:?}", frames[0].message);
        };
        assert_eq!(frames[0].seq, None);
        assert_eq!(snapshot.current_question, 0);
        assert!(snapshot.current_question_payload.is_some());
        assert_eq!(frames[1].seq, Some(snapshot.current_seq + 1));
    }

    #[test]
    fn reconnect_errors() {
        let env = TestEnv::new();
        let (mut room, _, _) = room(&env);
        start(&mut room, &env);

        let sink = Arc::new(Sink(Mutex::new(Vec::new())));
        assert_eq!(
            room.reconnect("stranger", 5, sink.clone(), &env),
            Err(RoomError::UnknownPlayer("stranger".to_string()))
        );

        room.quit("p2", &bank(), &env).unwrap();
        assert_eq!(
            room.reconnect("p2", 5, sink, &env),
            Err(RoomError::UnknownPlayer("p2".to_string()))
        );
    }

    #[test]
    fn lobby_host_leaving_migrates_host() {
        let env = TestEnv::new();
        let (mut room, _, guest) = room(&env);

        room.leave("p1", &bank(), &env).unwrap();
        assert!(room.player("p2").unwrap().is_host);
        assert!(guest.kinds().contains(&"player_left".to_string()));

        room.leave("p2", &bank(), &env).unwrap();
        assert!(room.is_finished());
        assert_eq!(room.take_departed(), vec!["p1".to_string(), "p2".to_string()]);
    }

    fn three_seat_lobby(env: &TestEnv) -> (Room<Instant>, Arc<Sink>) {
        let (mut room, host, _) = room(env);
        room.config.max_players = 3;
        room.join(&identity("p3"), 3, Arc::new(Sink(Mutex::new(Vec::new()))), env).unwrap();
        room.set_ready("p2", true, &bank(), env).unwrap();
        assert_eq!(room.phase(), Phase::Lobby);
        (room, host)
    }

    #[test]
    fn last_unready_leaving_starts_countdown() {
        let env = TestEnv::new();
        let (mut room, host) = three_seat_lobby(&env);

        room.leave("p3", &bank(), &env).unwrap();

        assert_eq!(room.phase(), Phase::Countdown);
        let kinds = host.kinds();
        let tail: Vec<&str> = kinds.iter().rev().take(4).rev().map(String::as_str).collect();
        assert_eq!(tail, vec!["player_left", "room_update", "game_start", "countdown"]);
    }

    #[test]
    fn last_unready_dropping_starts_countdown() {
        let env = TestEnv::new();
        let (mut room, _) = three_seat_lobby(&env);

        room.disconnect("p3", 3, &bank(), &env).unwrap();
        assert_eq!(room.phase(), Phase::Countdown);
        assert!(room.player("p3").is_none());
    }

    #[test]
    fn departure_without_questions_stays_in_lobby() {
        let env = TestEnv::new();
        let (mut room, _) = three_seat_lobby(&env);

        room.quit("p3", &QuestionBank::default(), &env).unwrap();
        assert_eq!(room.phase(), Phase::Lobby);
        assert_eq!(room.players().len(), 2);
    }

    #[test]
    fn abandonment_aborts_after_grace() {
        let env = TestEnv::new();
        let (mut room, _, _) = room(&env);
        start(&mut room, &env);
        env.advance(Duration::from_secs(10));
        room.on_timer(&env).unwrap();

        room.disconnect("p1", 1, &bank(), &env).unwrap();
        room.disconnect("p2", 2, &bank(), &env).unwrap();

        // The next round is held while nobody is connected
        env.advance(Duration::from_secs(30));
        room.on_timer(&env).unwrap();
        assert_eq!(room.phase(), Phase::BetweenRounds);

        env.advance(Duration::from_secs(30));
        room.on_timer(&env).unwrap();
        assert_eq!(room.phase(), Phase::Aborted);
        assert!(room.next_deadline().is_none());
    }

    #[test]
    fn full_game_ranks_players() {
        let env = TestEnv::new();
        let (mut room, host, _) = room(&env);
        start(&mut room, &env);

        for index in 0..3 {
            let right = Choice::Index(correct_index(&room));
            room.submit_answer("p2", index, &right, 0, &env).unwrap();
            room.submit_answer("p1", index, &Choice::Index(99), 0, &env).unwrap();
            env.advance(TimingConfig::default().between_rounds);
            room.on_timer(&env).unwrap();
        }

        assert_eq!(room.phase(), Phase::Completed);
        let board = room.leaderboard();
        assert_eq!(board[0].player_id, "p2");
        assert_eq!(board[0].placement, 1);
        assert_eq!(board[1].placement, 2);
        assert_eq!(host.kinds().last().map(String::as_str), Some("game_over"));
    }

    #[test]
    fn lifetime_cap_forces_completion() {
        let env = TestEnv::new();
        let (mut room, _, _) = room(&env);
        start(&mut room, &env);

        env.advance(TimingConfig::default().lifetime_cap);
        room.on_timer(&env).unwrap();
        assert_eq!(room.phase(), Phase::Completed);
    }
}
