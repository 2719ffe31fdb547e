//! Quizroom server binary.
//!
//! # Usage
//!
//! ```bash
//! # Development: in-memory event log
//! quizroom-server --bind 0.0.0.0:8080 --questions questions.json
//!
//! # Persistent event log
//! quizroom-server --questions questions.json --db quizroom.redb
//! ```

use std::{path::PathBuf, time::Duration};

use clap::Parser;
use quizroom_server::{CoordinatorConfig, Server, ServerRuntimeConfig, TimingConfig};
use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

/// Quizroom multiplayer quiz server
#[derive(Parser, Debug)]
#[command(name = "quizroom-server")]
#[command(about = "Real-time multiplayer quiz coordinator")]
#[command(version)]
struct Args {
    /// Address to bind to
    #[arg(short, long, default_value = "0.0.0.0:8080")]
    bind: String,

    /// Question bank (JSON array of question records)
    #[arg(short, long)]
    questions: Option<PathBuf>,

    /// redb file for the event log
    #[arg(long)]
    db: Option<PathBuf>,

    /// Seconds of countdown before the first question
    #[arg(long, default_value = "3")]
    countdown_secs: u64,

    /// Seconds between a round result and the next question
    #[arg(long, default_value = "3")]
    between_rounds_secs: u64,

    /// Seconds a game survives with nobody connected
    #[arg(long, default_value = "60")]
    abandon_grace_secs: u64,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "info")]
    log_level: String,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&args.log_level));

    tracing_subscriber::registry().with(fmt::layer()).with(filter).init();

    tracing::info!(bind = %args.bind, "quizroom server starting");

    let coordinator = CoordinatorConfig {
        timing: TimingConfig {
            countdown: Duration::from_secs(args.countdown_secs),
            between_rounds: Duration::from_secs(args.between_rounds_secs),
            abandon_grace: Duration::from_secs(args.abandon_grace_secs),
            ..TimingConfig::default()
        },
        ..CoordinatorConfig::default()
    };

    let config = ServerRuntimeConfig {
        bind_address: args.bind,
        questions_path: args.questions,
        db_path: args.db,
        coordinator,
    };

    let server = Server::bind(config).await?;
    server.run().await?;

    Ok(())
}
