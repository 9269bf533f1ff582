//! castline-host entry point.
//!
//! ```text
//! castline-host list                              List monitors and windows
//! castline-host run --source monitor:0 --peer 10.0.0.5:5004
//! castline-host --synthetic run ...               Stream a test pattern
//! castline-host --config <path> ...               Load a custom config TOML
//! castline-host --gen-config                      Write default config to stdout
//! ```

use std::net::SocketAddr;
use std::path::PathBuf;

use clap::{Parser, Subcommand};
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use castline_core::SessionState;
use castline_host::config::HostConfig;
use castline_host::service::{HostService, RunRequest};

// ── CLI ──────────────────────────────────────────────────────────

#[derive(Parser, Debug)]
#[command(name = "castline-host", about = "Desktop capture to RTP/H.264 streamer")]
struct Cli {
    /// Path to configuration TOML file.
    #[arg(short, long, default_value = "castline.toml")]
    config: PathBuf,

    /// Print the default configuration to stdout and exit.
    #[arg(long)]
    gen_config: bool,

    /// Capture a generated test pattern instead of the desktop.
    #[arg(long)]
    synthetic: bool,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// List capturable monitors and windows.
    List,
    /// Stream a source until Ctrl-C.
    Run {
        /// Source id from `list` (defaults to the config's capture.source).
        #[arg(long)]
        source: Option<String>,
        /// SFU ingest address (defaults to the config's network.peer).
        #[arg(long)]
        peer: Option<SocketAddr>,
        #[arg(long)]
        bitrate_kbps: Option<u32>,
        #[arg(long)]
        fps: Option<u32>,
    },
}

// ── Main ─────────────────────────────────────────────────────────

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();

    // --gen-config: dump defaults and exit.
    if cli.gen_config {
        let text = toml::to_string_pretty(&HostConfig::default())?;
        println!("{text}");
        return Ok(());
    }

    let config = HostConfig::load(&cli.config);

    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(&config.logging.level));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    info!("castline-host v{}", env!("CARGO_PKG_VERSION"));
    let host = HostService::new(&config, cli.synthetic);

    match cli.command.unwrap_or(Command::List) {
        Command::List => {
            let sources = host.list_sources()?;
            if sources.is_empty() {
                println!("no capturable sources");
            }
            for source in sources.iter() {
                println!("{source}");
            }
        }
        Command::Run {
            source,
            peer,
            bitrate_kbps,
            fps,
        } => {
            let request = RunRequest {
                source: source.unwrap_or_else(|| config.capture.source.clone()),
                peer: match peer {
                    Some(peer) => peer,
                    None => config.network.peer.parse()?,
                },
                bitrate_kbps: bitrate_kbps.unwrap_or(config.encoder.bitrate_kbps),
                fps: fps.unwrap_or(config.capture.fps),
            };
            let shutdown = async {
                tokio::signal::ctrl_c().await.ok();
                info!("Ctrl-C received, shutting down");
            };
            match host.run(request, shutdown).await? {
                SessionState::Failed => {
                    error!("session failed");
                    std::process::exit(1);
                }
                state => info!(%state, "session ended"),
            }
        }
    }

    Ok(())
}
