//! Tether server: entry point.
//!
//! ```text
//! tether-server                    Serve with tether-server.json
//! tether-server --config <path>    Load a custom config file
//! tether-server --gen-config       Write the default config and exit
//! tether-server --no-console       Do not read operator commands from stdin
//! ```

use std::path::PathBuf;
use std::sync::Arc;

use clap::Parser;
use tokio::sync::mpsc;
use tracing::{debug, info};

use tether_core::logging::{self, LogConfig};
use tether_core::{AppConfig, CredentialVault};
use tether_server::console::run_console;
use tether_server::{Server, ServerEvent, TetherService};

// ── CLI ──────────────────────────────────────────────────────────

#[derive(Parser, Debug)]
#[command(name = "tether-server", about = "Tether RPC server and broadcast hub")]
struct Cli {
    /// Path to the JSON configuration file.
    #[arg(short, long, default_value = "tether-server.json")]
    config: PathBuf,

    /// Write the default configuration to the config path and exit.
    #[arg(long)]
    gen_config: bool,

    /// Do not read operator commands from stdin.
    #[arg(long)]
    no_console: bool,
}

// ── Main ─────────────────────────────────────────────────────────

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();

    if cli.gen_config {
        AppConfig::write_default(&cli.config)?;
        println!("wrote {}", cli.config.display());
        return Ok(());
    }

    let config = AppConfig::load(&cli.config);
    logging::init(&LogConfig::from(&config))?;

    info!("tether-server v{}", env!("CARGO_PKG_VERSION"));
    info!("storage root: {}", config.storage_root_path().display());
    info!("chunk size: {} bytes", config.chunk_size());

    let (events_tx, mut events_rx) = mpsc::unbounded_channel();
    let service = TetherService::from_config(&config, &CredentialVault::for_current_user())?
        .with_events(events_tx);
    let hub = service.hub().clone();
    let server = Server::bind((config.host.as_str(), config.port), Arc::new(service)).await?;
    let shutdown = server.shutdown_token();

    tokio::spawn(async move {
        while let Some(event) = events_rx.recv().await {
            match event {
                ServerEvent::UploadCompleted { peer, path, size } => {
                    info!(%peer, %path, size, "upload completed");
                }
                ServerEvent::UploadFailed { peer, path, error } => {
                    info!(%peer, ?path, %error, "upload failed");
                }
                ServerEvent::JsonReceived { peer, envelope } => {
                    info!(%peer, kind = %envelope.kind, id = %envelope.id, "json: {}", envelope.json);
                }
                other => debug!(?other, "server event"),
            }
        }
    });

    let ctrl_c = shutdown.clone();
    tokio::spawn(async move {
        tokio::signal::ctrl_c().await.ok();
        info!("Ctrl-C received, shutting down");
        ctrl_c.cancel();
    });

    if !cli.no_console {
        let stdin = tokio::io::BufReader::new(tokio::io::stdin());
        tokio::spawn(run_console(stdin, hub, shutdown.clone()));
    }

    server.run().await?;
    Ok(())
}
