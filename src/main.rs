#![allow(dead_code)]

mod auth;
mod broker;
mod cli;
mod config;
mod logging;
mod protocol;
mod server;

use std::net::SocketAddr;

use clap::Parser;
use tracing::{info, warn};

use cli::{Cli, Command};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();

    match cli.command {
        // No subcommand or explicit `start` both launch the server.
        None | Some(Command::Start) => run_server().await,
        Some(Command::Version) => {
            cli::handle_version();
            Ok(())
        }
    }
}

async fn run_server() -> Result<(), Box<dyn std::error::Error>> {
    init_logging_from_env()?;
    let settings = config::Settings::from_env()?;

    let state = server::AppState::new(&settings);
    let app = server::router(state);

    let listener = tokio::net::TcpListener::bind(settings.bind).await?;
    info!(
        target: "ws",
        addr = %settings.bind,
        "wristlink v{} listening",
        env!("CARGO_PKG_VERSION")
    );

    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(shutdown_signal())
    .await?;

    info!(target: "ws", "relay shut down");
    Ok(())
}

/// Initialize logging based on the WRISTLINK_DEV environment variable.
fn init_logging_from_env() -> Result<(), logging::LoggingError> {
    let log_config = if std::env::var("WRISTLINK_DEV")
        .map(|v| !v.is_empty() && v != "0" && v.to_lowercase() != "false")
        .unwrap_or(false)
    {
        logging::LogConfig::development()
    } else {
        logging::LogConfig::production()
    };
    logging::init_logging(log_config)
}

/// Wait for either Ctrl+C or SIGTERM (Unix only).
#[cfg(unix)]
async fn shutdown_signal() {
    use tokio::signal::unix::{signal, SignalKind};

    match signal(SignalKind::terminate()) {
        Ok(mut sigterm) => {
            tokio::select! {
                _ = tokio::signal::ctrl_c() => info!(target: "ws", "shutdown: ctrl-c"),
                _ = sigterm.recv() => info!(target: "ws", "shutdown: SIGTERM"),
            }
        }
        Err(err) => {
            warn!(
                target: "ws",
                "failed to install SIGTERM handler: {err}; falling back to Ctrl+C only"
            );
            if tokio::signal::ctrl_c().await.is_ok() {
                info!(target: "ws", "shutdown: ctrl-c");
            }
        }
    }
}

/// On non-Unix platforms, only Ctrl+C is available.
#[cfg(not(unix))]
async fn shutdown_signal() {
    if tokio::signal::ctrl_c().await.is_ok() {
        info!(target: "ws", "shutdown: ctrl-c");
    }
}
