//! Simulated player.
//!
//! Drives a [`Coordinator`] the way a websocket session would, minus the
//! socket: messages go straight to `Coordinator::handle` and frames come back
//! through a [`RecordingOutbound`]. The client keeps its full receive history
//! across reconnects and runs a [`SeqTracker`] over it, so tests can assert
//! both the raw stream and what an ordering-aware client would process.

use std::{collections::BTreeSet, sync::Arc};

use quizroom_core::SessionError;
use quizroom_proto::{
    Choice, ClientMessage, CreateRoom, Envelope, ErrorCode, JoinRoom, Observed, PlayerReady,
    Reconnect, SeqTracker, ServerMessage, SubmitAnswer,
};
use quizroom_server::{Coordinator, Identity, Outbound, SessionHandle};
use serde::Serialize;

use crate::{invariants::ObserverSnapshot, outbound::RecordingOutbound, sim_env::SimEnv};

/// One received frame, reduced to what ordering tests care about.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TranscriptLine {
    /// Broadcast sequence, `None` for direct replies
    pub seq: Option<u64>,
    /// Wire `type`
    pub kind: &'static str,
}

/// A player connected to a simulated coordinator.
#[derive(Debug)]
pub struct SimClient {
    session: SessionHandle,
    outbound: Arc<RecordingOutbound>,
    capacity: Option<usize>,
    received: Vec<Envelope>,
    processed: Vec<Envelope>,
    tracker: SeqTracker<Envelope>,
    submitted: BTreeSet<u32>,
}

impl SimClient {
    /// Open a session for `player_id`.
    pub fn connect(coordinator: &Coordinator<SimEnv>, player_id: &str) -> Self {
        Self::open(coordinator, player_id, None)
    }

    /// Open a session whose write side holds at most `capacity` undrained
    /// frames.
    pub fn connect_bounded(
        coordinator: &Coordinator<SimEnv>,
        player_id: &str,
        capacity: usize,
    ) -> Self {
        Self::open(coordinator, player_id, Some(capacity))
    }

    fn open(coordinator: &Coordinator<SimEnv>, player_id: &str, capacity: Option<usize>) -> Self {
        let identity = Identity::guest(Some(player_id), Some(player_id), player_id);
        let outbound = recorder(capacity);
        let session = coordinator.open_session(identity, outbound.clone());
        Self {
            session,
            outbound,
            capacity,
            received: Vec::new(),
            processed: Vec::new(),
            tracker: SeqTracker::joining(),
            submitted: BTreeSet::new(),
        }
    }

    /// Stable player id.
    pub fn player_id(&self) -> &str {
        &self.session.identity.player_id
    }

    /// Game the current session is bound to.
    pub fn game_id(&self) -> Option<&str> {
        self.session.game_id.as_deref()
    }

    /// Session id of the current connection.
    pub fn session_id(&self) -> u64 {
        self.session.session_id
    }

    /// The current connection's outbound handle.
    pub fn outbound(&self) -> &Arc<RecordingOutbound> {
        &self.outbound
    }

    /// Send one message and collect whatever it produced for this client.
    pub async fn send(&mut self, coordinator: &Coordinator<SimEnv>, message: ClientMessage) {
        if let ClientMessage::SubmitAnswer(answer) = &message {
            self.submitted.insert(answer.question_index);
        }
        coordinator.handle(&mut self.session, message).await;
        self.poll();
    }

    /// `create_room` with the given settings.
    pub async fn create_room(&mut self, coordinator: &Coordinator<SimEnv>, request: CreateRoom) {
        self.send(coordinator, ClientMessage::CreateRoom(request)).await;
    }

    /// `join_room` by code.
    pub async fn join(&mut self, coordinator: &Coordinator<SimEnv>, room_code: &str) {
        let request = JoinRoom { room_code: room_code.to_string() };
        self.send(coordinator, ClientMessage::JoinRoom(request)).await;
    }

    /// `player_ready {ready: true}`.
    pub async fn ready(&mut self, coordinator: &Coordinator<SimEnv>) {
        self.send(coordinator, ClientMessage::PlayerReady(PlayerReady::default())).await;
    }

    /// `submit_answer` for `question_index`, reported as instant.
    pub async fn answer(
        &mut self,
        coordinator: &Coordinator<SimEnv>,
        question_index: u32,
        chosen: Choice,
    ) {
        self.answer_after(coordinator, question_index, chosen, 0).await;
    }

    /// `submit_answer` reporting `client_elapsed_ms` since the question
    /// appeared.
    pub async fn answer_after(
        &mut self,
        coordinator: &Coordinator<SimEnv>,
        question_index: u32,
        chosen: Choice,
        client_elapsed_ms: u64,
    ) {
        let answer = SubmitAnswer { question_index, chosen, client_elapsed_ms };
        self.send(coordinator, ClientMessage::SubmitAnswer(answer)).await;
    }

    /// `reconnect` to `game_id` over a fresh connection.
    pub async fn reconnect(&mut self, coordinator: &Coordinator<SimEnv>, game_id: &str) {
        self.reopen(coordinator);
        let request = Reconnect { game_id: game_id.to_string() };
        self.send(coordinator, ClientMessage::Reconnect(request)).await;
    }

    /// Replace the connection without telling the coordinator the old one
    /// ended, as happens when a socket dies silently.
    pub fn reopen(&mut self, coordinator: &Coordinator<SimEnv>) {
        self.poll();
        let outbound = recorder(self.capacity);
        let session = coordinator.open_session(self.session.identity.clone(), outbound.clone());
        self.outbound = outbound;
        self.session = session;
    }

    /// Close the socket and tell the coordinator.
    pub async fn disconnect(&mut self, coordinator: &Coordinator<SimEnv>) {
        self.poll();
        self.outbound.close(SessionError::PeerClosed("client closed".to_string()));
        coordinator.disconnect(&mut self.session).await;
    }

    /// Drain the outbound into the history. Returns the number of new frames.
    pub fn poll(&mut self) -> usize {
        let frames = self.outbound.take();
        let count = frames.len();
        for envelope in frames {
            self.absorb(envelope);
        }
        count
    }

    fn absorb(&mut self, envelope: Envelope) {
        self.received.push(envelope.clone());

        if let ServerMessage::Reconnected(snapshot) = &envelope.message {
            let current_seq = snapshot.current_seq;
            self.processed.push(envelope);
            let ready = self.tracker.resync(current_seq);
            self.processed.extend(ready);
            return;
        }

        match envelope.seq {
            Some(seq) => {
                if let Observed::Deliver(ready) = self.tracker.observe(seq, envelope) {
                    self.processed.extend(ready);
                }
            },
            None => self.processed.push(envelope),
        }
    }

    /// Every frame received, in arrival order.
    pub fn received(&self) -> &[Envelope] {
        &self.received
    }

    /// Frames an ordering-aware client would have processed, in order.
    pub fn processed(&self) -> &[Envelope] {
        &self.processed
    }

    /// The client's sequence tracker.
    pub fn tracker(&self) -> &SeqTracker<Envelope> {
        &self.tracker
    }

    /// Wire types received, in arrival order.
    pub fn kinds(&self) -> Vec<&'static str> {
        self.received.iter().map(|e| e.message.kind()).collect()
    }

    /// Received messages of one wire type.
    pub fn messages_of(&self, kind: &str) -> Vec<&ServerMessage> {
        self.received.iter().map(|e| &e.message).filter(|m| m.kind() == kind).collect()
    }

    /// First received message of one wire type.
    pub fn first_message(&self, kind: &str) -> Option<&ServerMessage> {
        self.received.iter().map(|e| &e.message).find(|m| m.kind() == kind)
    }

    /// Latest received message of one wire type.
    pub fn last_message(&self, kind: &str) -> Option<&ServerMessage> {
        self.received.iter().rev().map(|e| &e.message).find(|m| m.kind() == kind)
    }

    /// Error codes received, in order.
    pub fn errors(&self) -> Vec<ErrorCode> {
        self.received
            .iter()
            .filter_map(|e| match &e.message {
                ServerMessage::Error(error) => Some(error.code),
                _ => None,
            })
            .collect()
    }

    /// Seq and type of every frame received.
    pub fn transcript(&self) -> Vec<TranscriptLine> {
        self.received.iter().map(|e| TranscriptLine { seq: e.seq, kind: e.message.kind() }).collect()
    }

    /// Room code from the latest `room_update`.
    pub fn room_code(&self) -> Option<String> {
        self.received.iter().rev().find_map(|e| match &e.message {
            ServerMessage::RoomUpdate(update) => Some(update.room_code.clone()),
            _ => None,
        })
    }

    /// Question indices this client has submitted answers for.
    pub fn submitted(&self) -> &BTreeSet<u32> {
        &self.submitted
    }

    /// Observable state for invariant checks.
    pub fn observe(&self) -> ObserverSnapshot {
        ObserverSnapshot {
            player_id: self.player_id().to_string(),
            received: self.received.clone(),
            submitted: self.submitted.clone(),
        }
    }
}

fn recorder(capacity: Option<usize>) -> Arc<RecordingOutbound> {
    match capacity {
        Some(capacity) => RecordingOutbound::bounded(capacity),
        None => RecordingOutbound::new(),
    }
}
