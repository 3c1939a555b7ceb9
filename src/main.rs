//! chunkcast: single-file transfer over TCP
//!
//! One side listens and sends, the other connects and receives:
//! - `chunkcast send` serves the source file to each receiver that connects
//! - `chunkcast receive` writes the stream to the destination file
//!
//! Features:
//! - Length-prefixed framing, or the legacy `EOF` sentinel for old peers
//! - Single-use or long-running sender with concurrent sessions
//! - Per-operation I/O timeouts
//! - Configuration via CLI arguments or TOML file

mod config;
mod error;
mod protocol;
mod receiver;
mod sender;
mod session;

use config::{Config, Role};
use session::TransferOutcome;
use std::process::ExitCode;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

/// Setup, file, I/O or protocol failure.
const EXIT_FAILURE: u8 = 1;
/// The receiver got a stream without an end marker.
const EXIT_TRUNCATED: u8 = 3;

#[tokio::main]
async fn main() -> ExitCode {
    // Load configuration
    let config = match Config::load() {
        Ok(config) => config,
        Err(e) => {
            eprintln!("{e}");
            return ExitCode::from(EXIT_FAILURE);
        }
    };

    // Initialize logging
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&config.log_level));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .init();

    info!(
        buffer_size = config.transfer.buffer_size,
        framing = ?config.transfer.framing,
        timeout = ?config.transfer.timeout,
        "Starting chunkcast"
    );

    match config.role {
        Role::Send(sender) => run_send(sender, config.transfer).await,
        Role::Receive(receiver) => run_receive(receiver, config.transfer).await,
    }
}

async fn run_send(sender: config::SenderConfig, transfer: config::TransferConfig) -> ExitCode {
    match sender::run_sender(sender, transfer, ctrl_c()).await {
        Ok(summary) if summary.failed == 0 => ExitCode::SUCCESS,
        Ok(summary) => {
            error!(failed = summary.failed, "Some sessions failed");
            ExitCode::from(EXIT_FAILURE)
        }
        Err(e) => {
            error!(error = %e, "Sender failed");
            ExitCode::from(EXIT_FAILURE)
        }
    }
}

async fn run_receive(
    receiver: config::ReceiverConfig,
    transfer: config::TransferConfig,
) -> ExitCode {
    match receiver::run_receiver(&receiver, &transfer).await {
        Ok(report) => match report.outcome {
            TransferOutcome::Completed => ExitCode::SUCCESS,
            TransferOutcome::PeerClosed => ExitCode::from(EXIT_TRUNCATED),
        },
        Err(e) => {
            error!(error = %e, "Receiver failed");
            ExitCode::from(EXIT_FAILURE)
        }
    }
}

/// Resolves on Ctrl-C; never resolves if the handler cannot be installed.
async fn ctrl_c() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        error!(error = %e, "Failed to listen for Ctrl-C");
        std::future::pending::<()>().await;
    }
}
