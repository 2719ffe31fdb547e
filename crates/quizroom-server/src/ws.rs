//! Websocket transport.
//!
//! One task pair per connection:
//!
//! - the reader decodes text frames, applies the rate limit, and hands
//!   messages to the [`Coordinator`]
//! - the writer drains the session's bounded queue, sends transport pings and
//!   enforces the idle and write timeouts
//!
//! Both halves share a [`SessionCloser`]; whichever side fails first records
//! the reason and the other side exits. The coordinator is then told the
//! session is gone.

#![allow(clippy::disallowed_types, reason = "Liveness lock is never held across an await")]

use std::{
    sync::{Arc, Mutex, MutexGuard, PoisonError},
    time::Duration,
};

use axum::{
    Router,
    extract::{
        Query, State,
        ws::{CloseFrame, Message, WebSocket, WebSocketUpgrade, close_code},
    },
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::get,
};
use bytes::Bytes;
use futures::{Sink, SinkExt, StreamExt, stream::SplitStream};
use quizroom_core::{
    Environment, Liveness, LivenessAction, SessionConfig, SessionError, TokenBucket,
};
use quizroom_proto::{ClientMessage, ErrorCode, Inbound, ServerMessage};
use tokio::sync::mpsc;

use crate::{
    coordinator::{Coordinator, SessionHandle},
    fabric::{QueueOutbound, SessionCloser},
    identity::{Authenticator, ConnectParams, Identity, generate_player_id},
};

/// Shared state for the websocket routes.
pub struct AppState<E: Environment> {
    /// Room coordinator
    pub coordinator: Coordinator<E>,
    /// Resolves connections to identities
    pub auth: Arc<dyn Authenticator>,
}

impl<E: Environment> Clone for AppState<E> {
    fn clone(&self) -> Self {
        Self { coordinator: self.coordinator.clone(), auth: Arc::clone(&self.auth) }
    }
}

/// Router serving the game websocket at `/ws`.
pub fn router<E: Environment>(state: AppState<E>) -> Router {
    Router::new().route("/ws", get(ws_handler::<E>)).with_state(state)
}

async fn ws_handler<E: Environment>(
    ws: WebSocketUpgrade,
    Query(params): Query<ConnectParams>,
    State(state): State<AppState<E>>,
) -> Response {
    let fallback_id = generate_player_id(state.coordinator.env().random_u128());
    match state.auth.authenticate(&params, &fallback_id) {
        Ok(identity) => ws.on_upgrade(move |socket| run_session(socket, state, identity)),
        Err(e) => {
            tracing::info!(error = %e, "connection rejected");
            (StatusCode::UNAUTHORIZED, e.to_string()).into_response()
        },
    }
}

/// Drive one websocket connection until it closes.
pub async fn run_session<E: Environment>(socket: WebSocket, state: AppState<E>, identity: Identity) {
    let coordinator = state.coordinator;
    let env = coordinator.env().clone();
    let config = coordinator.config().session.clone();

    let closer = SessionCloser::new();
    let (outbound, rx) = QueueOutbound::channel(&config, closer.clone());
    let mut session = coordinator.open_session(identity, outbound);
    let liveness = Arc::new(Mutex::new(Liveness::new(env.now(), &config)));

    tracing::info!(
        session_id = session.session_id,
        player_id = %session.identity.player_id,
        "websocket connected"
    );

    let (sink, stream) = socket.split();
    let writer = tokio::spawn(write_loop(
        sink,
        rx,
        closer.clone(),
        Arc::clone(&liveness),
        env.clone(),
        config.clone(),
    ));

    let reason = read_loop(stream, &coordinator, &mut session, &closer, &liveness, &env, &config).await;
    closer.close(reason);
    let reason = closer.reason().unwrap_or(SessionError::PeerClosed(String::new()));

    coordinator.disconnect(&mut session).await;
    if let Err(e) = writer.await {
        tracing::error!(session_id = session.session_id, error = %e, "writer task failed");
    }

    tracing::info!(
        session_id = session.session_id,
        player_id = %session.identity.player_id,
        reason = %reason,
        "websocket closed"
    );
}

async fn read_loop<E: Environment>(
    mut stream: SplitStream<WebSocket>,
    coordinator: &Coordinator<E>,
    session: &mut SessionHandle,
    closer: &SessionCloser,
    liveness: &Mutex<Liveness<E::Instant>>,
    env: &E,
    config: &SessionConfig,
) -> SessionError {
    let mut bucket = TokenBucket::new(env.now(), config.rate_limit);

    loop {
        let frame = tokio::select! {
            reason = closer.closed() => return reason,
            frame = stream.next() => frame,
        };

        let message = match frame {
            Some(Ok(message)) => message,
            Some(Err(e)) => return SessionError::Transport(e.to_string()),
            None => return SessionError::PeerClosed("stream ended".to_string()),
        };
        lock(liveness).on_inbound(env.now());

        match message {
            Message::Text(text) => {
                if !bucket.try_acquire(env.now()) {
                    tracing::debug!(session_id = session.session_id, "rate limited");
                    coordinator.reply(
                        session,
                        ServerMessage::error(ErrorCode::RateLimited, "too many messages"),
                    );
                    continue;
                }

                match ClientMessage::decode(text.as_str()) {
                    Ok(Inbound::Message(message)) => coordinator.handle(session, message).await,
                    Ok(Inbound::Unknown(kind)) => {
                        tracing::debug!(session_id = session.session_id, kind, "unknown message type ignored");
                    },
                    Err(e) => {
                        tracing::debug!(session_id = session.session_id, error = %e, "invalid message");
                        coordinator.reply(
                            session,
                            ServerMessage::error(ErrorCode::InvalidMessage, e.to_string()),
                        );
                    },
                }
            },
            Message::Binary(_) => {
                coordinator.reply(
                    session,
                    ServerMessage::error(ErrorCode::InvalidMessage, "binary frames are not supported"),
                );
            },
            Message::Ping(_) | Message::Pong(_) => {},
            Message::Close(frame) => {
                let reason = frame.map(|f| f.reason.as_str().to_string()).unwrap_or_default();
                return SessionError::PeerClosed(reason);
            },
        }
    }
}

/// Drain the outbound queue into `sink`.
///
/// Liveness is ticked at the top of every iteration, so pings and the idle
/// check run on schedule even while the queue never empties.
async fn write_loop<E, S>(
    mut sink: S,
    mut rx: mpsc::Receiver<Arc<str>>,
    closer: SessionCloser,
    liveness: Arc<Mutex<Liveness<E::Instant>>>,
    env: E,
    config: SessionConfig,
) where
    E: Environment,
    S: Sink<Message> + Unpin,
    S::Error: std::fmt::Display,
{
    loop {
        let (actions, wake_at) = {
            let mut live = lock(&liveness);
            let actions = live.tick(env.now());
            (actions, live.next_wakeup())
        };

        let mut ping = None;
        for action in actions {
            match action {
                LivenessAction::SendPing => ping = Some(Message::Ping(Bytes::new())),
                LivenessAction::Close { reason } => {
                    closer.close(reason);
                },
            }
        }

        let outgoing = match ping {
            Some(ping) => ping,
            None => {
                let now = env.now();
                let wait = if wake_at > now { wake_at - now } else { Duration::ZERO };

                tokio::select! {
                    biased;

                    reason = closer.closed() => {
                        send_close(&mut sink, &reason, &env, config.write_timeout).await;
                        return;
                    },
                    frame = rx.recv() => match frame {
                        Some(frame) => Message::Text(frame.as_ref().into()),
                        None => return,
                    },
                    () = env.sleep(wait) => continue,
                }
            },
        };

        tokio::select! {
            result = sink.send(outgoing) => {
                if let Err(e) = result {
                    closer.close(SessionError::Transport(e.to_string()));
                    return;
                }
            },
            () = env.sleep(config.write_timeout) => {
                closer.close(SessionError::WriteTimeout { elapsed: config.write_timeout });
                return;
            },
        }
    }
}

/// Best-effort close frame.
async fn send_close<E, S>(sink: &mut S, reason: &SessionError, env: &E, timeout: Duration)
where
    E: Environment,
    S: Sink<Message> + Unpin,
    S::Error: std::fmt::Display,
{
    let code = match reason {
        SessionError::IdleTimeout { .. } | SessionError::WriteTimeout { .. } => close_code::AWAY,
        SessionError::Unhealthy { .. } => close_code::POLICY,
        SessionError::Superseded => close_code::NORMAL,
        SessionError::PeerClosed(_) | SessionError::Transport(_) => return,
    };
    let frame = CloseFrame { code, reason: reason.to_string().into() };

    tokio::select! {
        result = sink.send(Message::Close(Some(frame))) => {
            if let Err(e) = result {
                tracing::debug!(error = %e, "close frame not sent");
            }
        },
        () = env.sleep(timeout) => {},
    }
}

fn lock<I>(liveness: &Mutex<Liveness<I>>) -> MutexGuard<'_, Liveness<I>>
where
    I: Copy + Ord + std::ops::Sub<Output = Duration> + std::ops::Add<Duration, Output = I>,
{
    liveness.lock().unwrap_or_else(PoisonError::into_inner)
}
