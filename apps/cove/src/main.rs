//! Cove: start or join a 1:1 peer call, signaled through Redis.

use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tracing::info;

use call_session::transport::webrtc::WebRtcTransport;
use call_session::{IceConfig, Session, SessionRole};
use signal_store::{RedisStore, SignalStore};

#[derive(Parser)]
#[command(name = "cove", about = "Peer-to-peer calls over a shared signaling store")]
struct Cli {
    /// Redis URL backing the signaling channel
    #[arg(long, env = "COVE_SIGNAL_URL", default_value = "redis://127.0.0.1:6379")]
    signal_url: String,

    /// TTL applied to signaling keys, in seconds
    #[arg(long, default_value_t = 3600)]
    ttl_seconds: u64,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Start a new session and print the code to share
    Create,
    /// Join a session by its code
    Join { session_id: String },
}

#[tokio::main]
async fn main() -> Result<()> {
    if std::env::var("RUST_LOG").is_err() {
        std::env::set_var("RUST_LOG", "warn");
    }
    tracing_subscriber::fmt::init();

    let cli = Cli::parse();

    let store: Arc<dyn SignalStore> = Arc::new(
        RedisStore::new(&cli.signal_url, cli.ttl_seconds)
            .await
            .with_context(|| format!("failed to connect to {}", cli.signal_url))?,
    );

    let session = match cli.command {
        Commands::Create => {
            let transport =
                WebRtcTransport::connect(&IceConfig::default(), SessionRole::Initiator, Vec::new())
                    .await?;
            let session = Session::create(store, transport).await?;
            println!("Session code: {}", session.id());
            session
        }
        Commands::Join { session_id } => {
            let transport =
                WebRtcTransport::connect(&IceConfig::default(), SessionRole::Joiner, Vec::new())
                    .await?;
            Session::join(store, transport, &session_id).await?
        }
    };
    info!(session = %session.id(), role = ?session.role(), "session started");

    run_until_done(&session).await;
    session.hang_up().await;
    println!("{}", session.status());
    Ok(())
}

/// Print status changes until the session ends or the user interrupts.
async fn run_until_done(session: &Session) {
    let mut states = session.subscribe();
    println!("{}", session.status());
    loop {
        tokio::select! {
            changed = states.changed() => {
                if changed.is_err() {
                    return;
                }
                let state = *states.borrow_and_update();
                println!("{}", session.status());
                if state.is_terminal() {
                    return;
                }
            }
            _ = tokio::signal::ctrl_c() => {
                return;
            }
        }
    }
}
