//! Session-facing coordinator.
//!
//! Routes decoded client messages to rooms, owns the registry and drives
//! each room's clock. All room mutation goes through the room's async mutex,
//! whether it is triggered by a session or by the clock.
//!
//! Lock order is room, then registry. The registry lock is never held while
//! waiting on a room.

use std::sync::{
    Arc,
    atomic::{AtomicU64, Ordering},
};

use quizroom_core::Environment;
use quizroom_proto::{ClientMessage, CreateRoom, Envelope, Pong, ServerMessage};
use tokio::sync::{Mutex, MutexGuard, Notify, RwLock};

use crate::{
    config::{ClockMode, CoordinatorConfig},
    event_log::EventSink,
    fabric::{EnqueueResult, Outbound},
    identity::Identity,
    question_source::QuestionSource,
    registry::RoomRegistry,
    room::{JoinOutcome, Room, RoomError, RoomParams},
};

/// Upper bound on cascaded transitions per [`Coordinator::run_due_timers`]
/// call.
const MAX_TIMER_PASSES: usize = 64;

/// Shared handle to a live room.
#[derive(Debug)]
pub struct RoomHandle<I> {
    room: Arc<Mutex<Room<I>>>,
    wake: Arc<Notify>,
    game_id: Arc<str>,
    room_code: Arc<str>,
}

impl<I> Clone for RoomHandle<I> {
    fn clone(&self) -> Self {
        Self {
            room: Arc::clone(&self.room),
            wake: Arc::clone(&self.wake),
            game_id: Arc::clone(&self.game_id),
            room_code: Arc::clone(&self.room_code),
        }
    }
}

impl<I> RoomHandle<I> {
    fn new(room: Room<I>, room_code: &str, game_id: &str) -> Self {
        Self {
            room: Arc::new(Mutex::new(room)),
            wake: Arc::new(Notify::new()),
            game_id: Arc::from(game_id),
            room_code: Arc::from(room_code),
        }
    }

    /// Stable game id.
    pub fn game_id(&self) -> &str {
        &self.game_id
    }

    /// Room code.
    pub fn room_code(&self) -> &str {
        &self.room_code
    }

    /// Lock the room for inspection.
    pub async fn lock(&self) -> MutexGuard<'_, Room<I>> {
        self.room.lock().await
    }
}

/// One open connection, as seen by the coordinator.
pub struct SessionHandle {
    /// Process-unique session id
    pub session_id: u64,
    /// Who is connected
    pub identity: Identity,
    /// Where frames for this session go
    pub outbound: Arc<dyn Outbound>,
    /// Game this session is bound to
    pub game_id: Option<String>,
}

impl std::fmt::Debug for SessionHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionHandle")
            .field("session_id", &self.session_id)
            .field("player_id", &self.identity.player_id)
            .field("game_id", &self.game_id)
            .finish_non_exhaustive()
    }
}

struct Inner<E: Environment> {
    env: E,
    config: CoordinatorConfig,
    registry: RwLock<RoomRegistry<RoomHandle<E::Instant>>>,
    questions: Arc<dyn QuestionSource>,
    events: EventSink,
    next_session: AtomicU64,
}

/// Routes sessions to rooms.
///
/// Cheap to clone; every clone shares the same registry.
pub struct Coordinator<E: Environment> {
    inner: Arc<Inner<E>>,
}

impl<E: Environment> Clone for Coordinator<E> {
    fn clone(&self) -> Self {
        Self { inner: Arc::clone(&self.inner) }
    }
}

impl<E: Environment> Coordinator<E> {
    /// Coordinator with no rooms.
    pub fn new(
        env: E,
        config: CoordinatorConfig,
        questions: Arc<dyn QuestionSource>,
        events: EventSink,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                env,
                config,
                registry: RwLock::new(RoomRegistry::new()),
                questions,
                events,
                next_session: AtomicU64::new(1),
            }),
        }
    }

    /// The environment rooms run under.
    pub fn env(&self) -> &E {
        &self.inner.env
    }

    /// Active configuration.
    pub fn config(&self) -> &CoordinatorConfig {
        &self.inner.config
    }

    /// The shared event sink.
    pub fn events(&self) -> &EventSink {
        &self.inner.events
    }

    /// Live rooms.
    pub async fn room_count(&self) -> usize {
        self.inner.registry.read().await.len()
    }

    /// Live room by code.
    pub async fn room_by_code(&self, room_code: &str) -> Option<RoomHandle<E::Instant>> {
        self.inner.registry.read().await.lookup_by_code(room_code)
    }

    /// Live room by game id.
    pub async fn room_by_game(&self, game_id: &str) -> Option<RoomHandle<E::Instant>> {
        self.inner.registry.read().await.lookup_by_game(game_id)
    }

    /// Register a new connection.
    pub fn open_session(&self, identity: Identity, outbound: Arc<dyn Outbound>) -> SessionHandle {
        let session_id = self.inner.next_session.fetch_add(1, Ordering::Relaxed);
        tracing::debug!(session_id, player_id = %identity.player_id, "session opened");
        SessionHandle { session_id, identity, outbound, game_id: None }
    }

    /// Handle one client message. Rejections are replied to the session as
    /// direct `error` frames.
    pub async fn handle(&self, session: &mut SessionHandle, message: ClientMessage) {
        let kind = message.kind();
        let result = match message {
            ClientMessage::Ping => {
                self.reply(session, ServerMessage::Pong(Pong {}));
                Ok(())
            },
            ClientMessage::CreateRoom(request) => self.create_room(session, &request).await,
            ClientMessage::JoinRoom(request) => self.join_room(session, &request.room_code).await,
            ClientMessage::PlayerReady(ready) => {
                let questions = Arc::clone(&self.inner.questions);
                self.in_room(session, |room, player_id, env| {
                    room.set_ready(player_id, ready.ready, questions.as_ref(), env)
                })
                .await
            },
            ClientMessage::StartGame => {
                let questions = Arc::clone(&self.inner.questions);
                self.in_room(session, |room, player_id, env| {
                    room.start_game(player_id, questions.as_ref(), env)
                })
                .await
            },
            ClientMessage::SubmitAnswer(answer) => {
                self.in_room(session, |room, player_id, env| {
                    room.submit_answer(
                        player_id,
                        answer.question_index,
                        &answer.chosen,
                        answer.client_elapsed_ms,
                        env,
                    )
                })
                .await
            },
            ClientMessage::LeaveRoom => {
                let questions = Arc::clone(&self.inner.questions);
                let result = self
                    .in_room(session, |room, player_id, env| {
                        room.leave(player_id, questions.as_ref(), env)
                    })
                    .await;
                if result.is_ok() {
                    session.game_id = None;
                }
                result
            },
            ClientMessage::PlayerQuit => {
                let questions = Arc::clone(&self.inner.questions);
                let result = self
                    .in_room(session, |room, player_id, env| {
                        room.quit(player_id, questions.as_ref(), env)
                    })
                    .await;
                if result.is_ok() {
                    session.game_id = None;
                }
                result
            },
            ClientMessage::Reconnect(request) => self.reconnect(session, &request.game_id).await,
        };

        if let Err(e) = result {
            tracing::debug!(
                session_id = session.session_id,
                player_id = %session.identity.player_id,
                kind,
                code = ?e.code(),
                error = %e,
                "request rejected"
            );
            self.reply(session, ServerMessage::error(e.code(), e.to_string()));
        }
    }

    /// The session's connection is gone.
    pub async fn disconnect(&self, session: &mut SessionHandle) {
        tracing::debug!(session_id = session.session_id, player_id = %session.identity.player_id, "session closed");

        let Some(game_id) = session.game_id.take() else {
            return;
        };
        let Some(handle) = self.room_by_game(&game_id).await else {
            return;
        };

        let mut room = handle.room.lock().await;
        if let Err(e) = room.disconnect(
            &session.identity.player_id,
            session.session_id,
            self.inner.questions.as_ref(),
            &self.inner.env,
        ) {
            tracing::warn!(game_id = %game_id, error = %e, "disconnect handling failed");
        }
        self.settle(&handle, &mut room).await;
    }

    /// Fire every due room transition (for [`ClockMode::Manual`]).
    ///
    /// Repeats while transitions keep coming due, so zero-length delays
    /// cascade within one call.
    pub async fn run_due_timers(&self) {
        for _ in 0..MAX_TIMER_PASSES {
            let handles = self.inner.registry.read().await.handles();
            let now = self.inner.env.now();
            let mut fired = false;

            for handle in handles {
                let mut room = handle.room.lock().await;
                if room.next_deadline().is_some_and(|at| at <= now) {
                    fired = true;
                    if let Err(e) = room.on_timer(&self.inner.env) {
                        tracing::warn!(game_id = %handle.game_id, error = %e, "room timer failed");
                    }
                    self.settle(&handle, &mut room).await;
                }
            }

            if !fired {
                return;
            }
        }
    }

    async fn create_room(
        &self,
        session: &mut SessionHandle,
        request: &CreateRoom,
    ) -> Result<(), RoomError> {
        let config = self.inner.config.limits.validate(request)?;
        self.ensure_not_playing_elsewhere(&session.identity.player_id, None).await?;

        let env = &self.inner.env;
        let handle = {
            let mut registry = self.inner.registry.write().await;
            let room_code = registry.allocate_code(env)?;
            let game_id = registry.mint_game_id(env)?;

            let params = RoomParams {
                room_code: room_code.clone(),
                game_id: game_id.clone(),
                config,
                timing: self.inner.config.timing.clone(),
                scoring: self.inner.config.scoring,
            };
            let room = Room::create(
                params,
                &session.identity,
                session.session_id,
                Arc::clone(&session.outbound),
                self.inner.events.clone(),
                env,
            )?;

            let handle = RoomHandle::new(room, &room_code, &game_id);
            registry.insert(&room_code, &game_id, handle.clone());
            registry.seat(&session.identity.player_id, &game_id);
            handle
        };

        session.game_id = Some(handle.game_id.to_string());
        self.spawn_clock(handle);
        Ok(())
    }

    async fn join_room(&self, session: &mut SessionHandle, room_code: &str) -> Result<(), RoomError> {
        let player_id = session.identity.player_id.clone();
        let handle = self
            .room_by_code(room_code)
            .await
            .ok_or_else(|| RoomError::NotFound(room_code.to_string()))?;
        self.ensure_not_playing_elsewhere(&player_id, Some(&handle.game_id)).await?;

        let mut room = handle.room.lock().await;
        let result = room.join(
            &session.identity,
            session.session_id,
            Arc::clone(&session.outbound),
            &self.inner.env,
        );
        if let Ok(outcome) = result {
            self.inner.registry.write().await.seat(&player_id, &handle.game_id);
            session.game_id = Some(handle.game_id.to_string());
            if outcome == JoinOutcome::Reconnected {
                tracing::info!(game_id = %handle.game_id, player_id, "join treated as reconnect");
            }
        }
        self.settle(&handle, &mut room).await;
        result.map(|_| ())
    }

    async fn reconnect(&self, session: &mut SessionHandle, game_id: &str) -> Result<(), RoomError> {
        let player_id = session.identity.player_id.clone();
        let handle = self
            .room_by_game(game_id)
            .await
            .ok_or_else(|| RoomError::UnknownGame(game_id.to_string()))?;
        self.ensure_not_playing_elsewhere(&player_id, Some(game_id)).await?;

        let mut room = handle.room.lock().await;
        let result = room.reconnect(
            &player_id,
            session.session_id,
            Arc::clone(&session.outbound),
            &self.inner.env,
        );
        if result.is_ok() {
            self.inner.registry.write().await.seat(&player_id, game_id);
            session.game_id = Some(game_id.to_string());
        }
        self.settle(&handle, &mut room).await;
        result
    }

    /// Run a room operation for the session's current room.
    async fn in_room<F>(&self, session: &SessionHandle, op: F) -> Result<(), RoomError>
    where
        F: FnOnce(&mut Room<E::Instant>, &str, &E) -> Result<(), RoomError>,
    {
        let game_id = session.game_id.as_deref().ok_or(RoomError::NotInRoom)?;
        let handle = self.room_by_game(game_id).await.ok_or(RoomError::NotInRoom)?;

        let mut room = handle.room.lock().await;
        let result = op(&mut room, &session.identity.player_id, &self.inner.env);
        self.settle(&handle, &mut room).await;
        result
    }

    /// Reject a player who is live in a different room.
    ///
    /// A player seated but disconnected elsewhere may move on; their old seat
    /// stays behind as disconnected.
    async fn ensure_not_playing_elsewhere(
        &self,
        player_id: &str,
        target_game: Option<&str>,
    ) -> Result<(), RoomError> {
        let other = {
            let registry = self.inner.registry.read().await;
            registry
                .seat_of(player_id)
                .filter(|game_id| Some(*game_id) != target_game)
                .and_then(|game_id| registry.lookup_by_game(game_id))
        };
        let Some(other) = other else {
            return Ok(());
        };

        let room = other.room.lock().await;
        if room.player(player_id).is_some_and(|p| p.is_active()) {
            return Err(RoomError::DuplicatePlayer(player_id.to_string()));
        }
        Ok(())
    }

    /// Apply a room's departures to the registry, drop it if finished, and
    /// wake its clock.
    async fn settle(&self, handle: &RoomHandle<E::Instant>, room: &mut Room<E::Instant>) {
        let departed = room.take_departed();
        let finished = room.is_finished();

        if !departed.is_empty() || finished {
            let mut registry = self.inner.registry.write().await;
            for player_id in &departed {
                registry.unseat(player_id, &handle.game_id);
            }
            if finished && registry.drop_room(&handle.game_id).is_some() {
                tracing::info!(
                    game_id = %handle.game_id,
                    room_code = %handle.room_code,
                    phase = ?room.phase(),
                    "room removed"
                );
            }
        }

        handle.wake.notify_one();
    }

    /// Send a direct reply outside any room's order.
    pub(crate) fn reply(&self, session: &SessionHandle, message: ServerMessage) {
        let envelope = Envelope::direct(message, self.inner.env.wall_clock_millis());
        match envelope.encode() {
            Ok(text) => {
                if session.outbound.enqueue(text.into()) != EnqueueResult::Ok {
                    tracing::debug!(session_id = session.session_id, "direct reply not delivered");
                }
            },
            Err(e) => tracing::error!(error = %e, "direct reply encode failed"),
        }
    }

    fn spawn_clock(&self, handle: RoomHandle<E::Instant>) {
        if self.inner.config.clock == ClockMode::Manual {
            return;
        }
        let coordinator = self.clone();
        tokio::spawn(async move { coordinator.run_clock(handle).await });
    }

    /// Sleep until the room's next deadline, or until woken by an operation
    /// that may have moved it, then fire what is due.
    async fn run_clock(self, handle: RoomHandle<E::Instant>) {
        loop {
            let deadline = {
                let room = handle.room.lock().await;
                if room.is_finished() {
                    break;
                }
                room.next_deadline()
            };

            let Some(at) = deadline else {
                handle.wake.notified().await;
                continue;
            };

            let now = self.inner.env.now();
            if at > now {
                tokio::select! {
                    () = self.inner.env.sleep(at - now) => {},
                    () = handle.wake.notified() => continue,
                }
            }

            let mut room = handle.room.lock().await;
            if let Err(e) = room.on_timer(&self.inner.env) {
                tracing::warn!(game_id = %handle.game_id, error = %e, "room timer failed");
            }
            self.settle(&handle, &mut room).await;
        }

        tracing::debug!(game_id = %handle.game_id, "room clock stopped");
    }
}
