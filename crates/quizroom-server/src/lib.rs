//! Quizroom production server.
//!
//! Real-time multiplayer quiz coordinator: players connect over websockets,
//! gather in rooms, and answer the same timed questions while the server
//! keeps every room's state authoritative and its broadcasts totally ordered.
//!
//! # Architecture
//!
//! Rooms ([`Room`]) are synchronous state machines driven through an
//! explicit [`Environment`](quizroom_core::Environment), so the same code
//! runs under the production runtime and the deterministic harness. The
//! [`Coordinator`] wraps each room in an async mutex, routes session
//! messages to it and runs its clock. Rooms reach players only through
//! [`Outbound`] handles and record to storage only through the
//! [`EventSink`], so neither sockets nor disks can stall a room.
//!
//! # Components
//!
//! - [`Coordinator`]: session routing, room registry, room clocks
//! - [`Room`]: lobby, countdown, rounds, scoring, reconnection
//! - [`Fabric`]: per-room fan-out of serialized frames
//! - [`EventSink`] and [`EventLogWorker`]: asynchronous event log
//! - [`Storage`]: redb-backed and in-memory persistence
//! - [`QuestionSource`]: frozen, deterministic question draws
//! - [`Server`]: axum websocket runtime using [`SystemEnv`]

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod config;
pub mod coordinator;
mod error;
pub mod event_log;
pub mod fabric;
pub mod identity;
pub mod question_source;
pub mod registry;
pub mod room;
pub mod sequencer;
pub mod storage;
mod system_env;
pub mod ws;

use std::{future::Future, net::SocketAddr, path::PathBuf, sync::Arc};

pub use config::{ClockMode, CoordinatorConfig, RoomConfig, RoomLimits, TimingConfig};
pub use coordinator::{Coordinator, RoomHandle, SessionHandle};
pub use error::ServerError;
pub use event_log::{EventLogWorker, EventSink, LogEntry};
pub use fabric::{EnqueueResult, Fabric, Outbound, QueueOutbound, SessionCloser};
pub use identity::{AnonymousAuth, AuthError, Authenticator, ConnectParams, Identity};
pub use question_source::{Question, QuestionBank, QuestionError, QuestionRecord, QuestionSource};
pub use registry::RoomRegistry;
pub use room::{Award, JoinOutcome, PlayerState, Room, RoomError, RoomParams, TimerKind};
pub use sequencer::{Sequencer, SequencerError};
pub use storage::{
    ChaoticStorage, EventRecord, GameRecord, GameStatus, MemoryStorage, PlayerRecord,
    RedbStorage, Storage, StorageError,
};
pub use system_env::SystemEnv;
use tokio::{net::TcpListener, task::JoinHandle};
pub use ws::AppState;

/// Server configuration for the production runtime.
#[derive(Debug, Clone)]
pub struct ServerRuntimeConfig {
    /// Address to bind to (e.g., "0.0.0.0:8080")
    pub bind_address: String,
    /// JSON question bank; an empty bank makes every start fail with
    /// `NO_QUESTIONS`
    pub questions_path: Option<PathBuf>,
    /// redb event log file; in-memory storage when unset
    pub db_path: Option<PathBuf>,
    /// Room, timing, scoring and session settings
    pub coordinator: CoordinatorConfig,
}

impl Default for ServerRuntimeConfig {
    fn default() -> Self {
        Self {
            bind_address: "0.0.0.0:8080".to_string(),
            questions_path: None,
            db_path: None,
            coordinator: CoordinatorConfig::default(),
        }
    }
}

/// Production quizroom server.
pub struct Server {
    listener: TcpListener,
    coordinator: Coordinator<SystemEnv>,
    worker: JoinHandle<()>,
}

impl Server {
    /// Load questions, open storage, start the event log worker and bind.
    pub async fn bind(config: ServerRuntimeConfig) -> Result<Self, ServerError> {
        let questions = match &config.questions_path {
            Some(path) => QuestionBank::load(path)?,
            None => QuestionBank::default(),
        };
        if questions.is_empty() {
            tracing::warn!("question bank is empty, games cannot start");
        } else {
            tracing::info!(questions = questions.len(), "question bank loaded");
        }

        let events = EventSink::new(config.coordinator.event_log_capacity);
        let worker = match &config.db_path {
            Some(path) => {
                let storage = RedbStorage::open(path)?;
                tracing::info!(path = %path.display(), "event log opened");
                tokio::spawn(EventLogWorker::new(events.clone(), storage).run())
            },
            None => {
                tracing::warn!("no database configured, event log kept in memory");
                tokio::spawn(EventLogWorker::new(events.clone(), MemoryStorage::new()).run())
            },
        };

        let coordinator =
            Coordinator::new(SystemEnv::new(), config.coordinator, Arc::new(questions), events);
        let listener = TcpListener::bind(&config.bind_address).await?;

        Ok(Self { listener, coordinator, worker })
    }

    /// Local address the server is bound to.
    pub fn local_addr(&self) -> Result<SocketAddr, ServerError> {
        Ok(self.listener.local_addr()?)
    }

    /// The coordinator behind the websocket routes.
    pub fn coordinator(&self) -> &Coordinator<SystemEnv> {
        &self.coordinator
    }

    /// Serve until ctrl-c.
    pub async fn run(self) -> Result<(), ServerError> {
        self.run_until(shutdown_signal()).await
    }

    /// Serve until `shutdown` resolves, then flush the event log.
    pub async fn run_until<F>(self, shutdown: F) -> Result<(), ServerError>
    where
        F: Future<Output = ()> + Send + 'static,
    {
        tracing::info!(addr = %self.local_addr()?, "server listening");

        let app = ws::router(AppState {
            coordinator: self.coordinator.clone(),
            auth: Arc::new(AnonymousAuth),
        });
        axum::serve(self.listener, app).with_graceful_shutdown(shutdown).await?;

        tracing::info!("shutting down, flushing event log");
        self.coordinator.events().close();
        self.worker.await.map_err(|e| ServerError::Internal(e.to_string()))?;
        Ok(())
    }
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!(error = %e, "ctrl-c handler failed");
        std::future::pending::<()>().await;
    }
}
