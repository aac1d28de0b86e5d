//! kindle-bridge: shows backend text on an e-ink reader
//!
//! Components:
//! - Relay: one raw socket exchange per HTTP request, HTML-escaped
//! - Backend: the line-oriented text service the relay talks to
//! - Composer: turns activity events into sentences for the backend
//! - Poller: periodic fetch-and-display loop
//!
//! Features:
//! - Reader page with a serialised refresh loop
//! - Atomic display file updates
//! - Configuration via CLI arguments or TOML file

mod backend;
mod compose;
mod config;
mod display;
mod escape;
mod poller;
mod relay;
mod server;

use backend::{feed_lines, Backend};
use compose::{feed_events, Composer, HostDict};
use config::{Command, Config};
use display::DisplayFile;
use poller::{Poller, TerminalScreen};
use relay::{Relay, RelayOutcome, RelayRequest};
use server::Server;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    // Load configuration
    let config = Config::load()?;

    // Initialize logging
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&config.log_level));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(false)
        .init();

    match config.command.clone() {
        Command::Serve { .. } => run_server(config).await,
        Command::Backend { .. } => run_backend(config).await,
        Command::Poll { .. } => run_poller(config).await,
        Command::Fetch => run_fetch(config).await,
        Command::Write { text } => run_write(config, &text).await,
    }
}

/// Cancel `token` on Ctrl-C.
fn cancel_on_ctrl_c(token: CancellationToken) {
    tokio::spawn(async move {
        match tokio::signal::ctrl_c().await {
            Ok(()) => info!("Shutting down"),
            Err(e) => warn!(error = %e, "Failed to listen for Ctrl-C"),
        }
        token.cancel();
    });
}

async fn run_server(config: Config) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    info!(
        listen = %config.http.listen,
        backend_host = %config.relay.host,
        backend_port = config.relay.port,
        connect_timeout_ms = config.relay.connect_timeout_ms,
        "Starting kindle-bridge server"
    );

    let relay = Relay::new(RelayRequest::from_config(&config.relay));
    let server = Server::new(config.http, config.display, relay);

    let cancel = CancellationToken::new();
    cancel_on_ctrl_c(cancel.clone());
    server.run(cancel).await
}

async fn run_backend(config: Config) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    info!(
        listen = %config.backend.listen,
        max_connections = config.backend.max_connections,
        events = config.backend.events,
        "Starting kindle-bridge backend"
    );

    let events = config.backend.events;
    let backend = Backend::new(config.backend);
    let board = std::sync::Arc::clone(backend.board());

    if events {
        // Every stdin line is an activity event, composed into a sentence
        let composer = Composer::new(HostDict::new(config.hosts), board);
        tokio::spawn(async move {
            if let Err(e) = feed_events(tokio::io::stdin(), &composer).await {
                warn!(error = %e, "Failed to read events from stdin");
            }
        });
    } else {
        // Every stdin line becomes the latest message
        tokio::spawn(async move {
            if let Err(e) = feed_lines(tokio::io::stdin(), &board).await {
                warn!(error = %e, "Failed to read messages from stdin");
            }
        });
    }

    let cancel = CancellationToken::new();
    cancel_on_ctrl_c(cancel.clone());
    backend.run(cancel).await
}

async fn run_poller(config: Config) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    let mut poller = Poller::new(&config.poller, TerminalScreen::stdout())?;

    let cancel = CancellationToken::new();
    cancel_on_ctrl_c(cancel.clone());
    poller.run(cancel).await;
    Ok(())
}

async fn run_fetch(config: Config) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    use tokio::io::AsyncWriteExt;

    let relay = Relay::new(RelayRequest::from_config(&config.relay));
    let outcome = relay.fetch_text().await;
    if let RelayOutcome::Text(response) = &outcome {
        debug!(bytes = response.bytes_read, end = ?response.end, "Relay exchange finished");
    }
    let body = outcome.into_body();

    let mut stdout = tokio::io::stdout();
    stdout.write_all(body.as_bytes()).await?;
    stdout.flush().await?;
    Ok(())
}

async fn run_write(
    config: Config,
    text: &str,
) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    let file = DisplayFile::new(config.display.path());
    file.write(text).await?;
    info!(path = %file.path().display(), "Display file updated");
    Ok(())
}
