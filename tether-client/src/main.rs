//! Tether client: entry point.
//!
//! ```text
//! tether-client send <type> <json>            Send a JSON envelope and print the ack
//! tether-client upload <file> [--as <name>]   Upload a file
//! tether-client download <remote> <dest>      Download a file
//! tether-client list [dir]                    List files on the server
//! tether-client screenshot [--monitor N] <out>
//! tether-client watch                         Stay connected and print pushed events
//! tether-client stress <op> [-n N]            Run a synthetic workload
//! tether-client seal-secret <secret>          Store the shared secret in the config
//! ```

use std::path::PathBuf;
use std::sync::Arc;

use clap::{Parser, Subcommand};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use tether_core::logging::{self, LogConfig};
use tether_core::{AppConfig, ChannelPool, CredentialVault, EndpointIdentity, Secret};
use tether_client::{
    ClientSession, MixWeights, ReconnectSupervisor, SessionEvent, SessionOptions, StressConfig,
    StressHarness, StressOperation, SupervisorConfig,
};

// ── CLI ──────────────────────────────────────────────────────────

#[derive(Parser, Debug)]
#[command(name = "tether-client", about = "Tether RPC client")]
struct Cli {
    /// Path to the JSON configuration file.
    #[arg(short, long, default_value = "tether-client.json")]
    config: PathBuf,

    /// Write the default configuration to the config path and exit.
    #[arg(long)]
    gen_config: bool,

    /// Name reported to the server.
    #[arg(long, default_value = "tether-client")]
    name: String,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Send a JSON envelope and wait for its ack.
    Send { kind: String, json: String },
    /// Upload a local file.
    Upload {
        file: PathBuf,
        /// Name to store the file under.
        #[arg(long = "as")]
        remote_name: Option<String>,
    },
    /// Download a file from the storage root.
    Download { remote: String, dest: PathBuf },
    /// List files in a directory beneath the storage root.
    List {
        #[arg(default_value = "")]
        directory: String,
    },
    /// Capture a monitor and save it as a BMP.
    Screenshot {
        output: PathBuf,
        #[arg(long, default_value_t = 0)]
        monitor: u32,
    },
    /// Stay connected, reconnecting when the link drops, and print events.
    Watch {
        /// Seconds between reconnect attempts.
        #[arg(long, default_value_t = 3)]
        retry_secs: u64,
    },
    /// Run a synthetic workload and print the report.
    Stress {
        /// json, upload, download or mixed.
        operation: StressOperation,
        #[arg(short = 'n', long, default_value_t = 100)]
        iterations: u32,
        #[arg(long, default_value_t = 256 * 1024)]
        payload_size: usize,
        #[arg(long, default_value_t = 42)]
        seed: u64,
    },
    /// Seal a shared secret into the configuration file.
    SealSecret { secret: String },
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

    let mut config = AppConfig::load(&cli.config);
    logging::init(&LogConfig::from(&config))?;
    let vault = CredentialVault::for_current_user();

    let Some(command) = cli.command else {
        println!("nothing to do; see --help");
        return Ok(());
    };

    if let Command::SealSecret { secret } = &command {
        config.set_secret(&vault, &Secret::from(secret.as_str()))?;
        config.save(&cli.config)?;
        println!("secret sealed into {}", cli.config.display());
        return Ok(());
    }

    let options = SessionOptions::from_config(&config, config.secret(&vault)?).with_client_name(&cli.name);
    let endpoint = config.endpoint();
    info!("tether-client v{} -> {endpoint}", env!("CARGO_PKG_VERSION"));
    execute(command, client_pool(), endpoint, options).await
}

fn client_pool() -> Arc<ChannelPool> {
    let pool = Arc::new(ChannelPool::tcp());
    pool.start_sweeper();
    pool
}

/// Run `command`, then close every pooled channel whatever the outcome.
async fn execute(
    command: Command,
    pool: Arc<ChannelPool>,
    endpoint: EndpointIdentity,
    options: SessionOptions,
) -> Result<(), Box<dyn std::error::Error>> {
    let result = match command {
        Command::Watch { retry_secs } => watch(pool.clone(), endpoint, options, retry_secs).await,
        command => run(command, pool.clone(), endpoint, options).await,
    };
    pool.shutdown();
    result
}

/// One-shot commands over a single session.
async fn run(
    command: Command,
    pool: Arc<ChannelPool>,
    endpoint: EndpointIdentity,
    options: SessionOptions,
) -> Result<(), Box<dyn std::error::Error>> {
    let (session, events) = ClientSession::connect(pool, endpoint, options).await?;
    if session.is_lost() {
        session.close();
        return Err("connection lost during handshake".into());
    }
    tokio::spawn(log_events(events));

    match command {
        Command::Send { kind, json } => {
            let ack = session.send_json(kind, json).await?;
            match ack.error {
                None if ack.success => println!("ack {}", ack.id),
                error => println!("nack {}: {}", ack.id, error.unwrap_or_default()),
            }
        }
        Command::Upload { file, remote_name } => {
            let status = session.upload(&file, remote_name.as_deref()).await?;
            println!("uploaded {}", status.path);
        }
        Command::Download { remote, dest } => {
            let size = session.download(&remote, &dest).await?;
            println!("downloaded {size} bytes to {}", dest.display());
        }
        Command::List { directory } => {
            for file in session.list(&directory).await? {
                println!("{file}");
            }
        }
        Command::Screenshot { output, monitor } => {
            let image = session.screenshot(monitor).await?;
            tokio::fs::write(&output, &image).await?;
            println!("saved {} bytes to {}", image.len(), output.display());
        }
        Command::Stress {
            operation,
            iterations,
            payload_size,
            seed,
        } => {
            let stress = StressConfig {
                operation,
                iterations,
                payload_size,
                seed,
                weights: MixWeights::default(),
                ..StressConfig::default()
            };
            let report = StressHarness::new(&session, stress).run().await?;
            println!("{report}");
        }
        Command::Watch { .. } | Command::SealSecret { .. } => {}
    }

    session.close();
    Ok(())
}

/// Keep the session's event queue drained while a command runs.
async fn log_events(mut events: mpsc::UnboundedReceiver<SessionEvent>) {
    while let Some(event) = events.recv().await {
        match event {
            SessionEvent::Progress {
                direction,
                name,
                percent,
            } => debug!(?direction, %name, percent, "progress"),
            SessionEvent::ConnectionLost { reason } => warn!(%reason, "connection lost"),
            other => debug!(?other, "session event"),
        }
    }
}

async fn watch(
    pool: Arc<ChannelPool>,
    endpoint: EndpointIdentity,
    options: SessionOptions,
    retry_secs: u64,
) -> Result<(), Box<dyn std::error::Error>> {
    let config = SupervisorConfig {
        reconnect_delay: std::time::Duration::from_secs(retry_secs),
        ..SupervisorConfig::default()
    };
    let (supervisor, mut events) = ReconnectSupervisor::new(pool, endpoint, options, config);
    supervisor.connect().await?;

    let mut states = supervisor.watch_state();
    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => break,
            changed = states.changed() => {
                if changed.is_err() {
                    break;
                }
                let state = states.borrow_and_update().clone();
                info!(?state, "connection state");
            }
            event = events.recv() => match event {
                Some(SessionEvent::JsonReceived(envelope)) => {
                    println!("json [{}] {}", envelope.kind, envelope.json);
                }
                Some(SessionEvent::BytesReceived(message)) => {
                    println!("bytes [{}] {} bytes", message.kind, message.data.len());
                }
                Some(SessionEvent::FileReceived { name, size, saved_to }) => match saved_to {
                    Some(path) => println!("file {name} ({size} bytes) -> {}", path.display()),
                    None => println!("file {name} ({size} bytes)"),
                },
                Some(SessionEvent::FileFailed { name, error }) => warn!(%name, %error, "broadcast file failed"),
                Some(SessionEvent::Progress { .. }) => {}
                Some(SessionEvent::ConnectionLost { reason }) => warn!(%reason, "connection lost"),
                None => break,
            },
        }
    }
    supervisor.disconnect();
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    use tether_core::AuthGuard;
    use tether_server::{BroadcastHub, FileStore, Server, TetherService};
    use tokio_util::sync::CancellationToken;

    async fn serve(dir: &std::path::Path, secret: &str) -> (EndpointIdentity, CancellationToken) {
        let service = TetherService::new(
            Arc::new(BroadcastHub::new(64 * 1024)),
            FileStore::new(dir, "", 64 * 1024),
            AuthGuard::from_secret(Some(Secret::from(secret))),
        );
        let server = Server::bind("127.0.0.1:0", Arc::new(service)).await.unwrap();
        let addr = server.local_addr().unwrap();
        let shutdown = server.shutdown_token();
        tokio::spawn(server.run());
        (EndpointIdentity::new(addr.ip().to_string(), addr.port()), shutdown)
    }

    fn options(secret: &str) -> SessionOptions {
        SessionOptions::default()
            .with_client_name("cli-test")
            .with_secret(Secret::from(secret))
    }

    #[tokio::test]
    async fn command_leaves_no_pooled_channel_behind() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("a.txt"), b"a").unwrap();
        let (endpoint, shutdown) = serve(dir.path(), "s3cret").await;

        let pool = client_pool();
        let list = Command::List { directory: String::new() };
        execute(list, pool.clone(), endpoint, options("s3cret")).await.unwrap();
        assert!(pool.is_empty());
        shutdown.cancel();
    }

    #[tokio::test]
    async fn failed_command_still_shuts_the_pool_down() {
        let dir = tempfile::tempdir().unwrap();
        let (endpoint, shutdown) = serve(dir.path(), "s3cret").await;

        let pool = client_pool();
        let send = Command::Send {
            kind: "t".into(),
            json: "{}".into(),
        };
        let outcome = tokio::time::timeout(
            Duration::from_secs(10),
            execute(send, pool.clone(), endpoint, options("guess")),
        )
        .await
        .unwrap();
        assert!(outcome.is_err());
        assert!(pool.is_empty());
        shutdown.cancel();
    }

    #[tokio::test]
    async fn event_log_drains_until_the_session_is_gone() {
        let (tx, rx) = mpsc::unbounded_channel();
        for percent in 0..=100u8 {
            tx.send(SessionEvent::Progress {
                direction: tether_client::Direction::Upload,
                name: "big.bin".into(),
                percent,
            })
            .unwrap();
        }
        let drain = tokio::spawn(log_events(rx));
        drop(tx);
        tokio::time::timeout(Duration::from_secs(2), drain).await.unwrap().unwrap();
    }
}
