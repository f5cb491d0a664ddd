use std::{path::PathBuf, process::ExitCode, sync::Arc, time::Duration};

use clap::Parser;
use rs_swarm::{
    ClientConfig, Session, SessionState, TrackerDiscovery, config::generate_peer_id,
};
use tracing::{Level, error, info};
use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

const STATUS_INTERVAL: Duration = Duration::from_millis(1500);

/// Download the content described by a manifest file.
#[derive(Parser, Debug)]
#[command(version, about, long_about = None)]
struct Args {
    /// Path to the .torrent manifest.
    manifest: PathBuf,

    /// Root directory for downloaded files.
    #[arg(short, long, default_value = "downloads")]
    download_dir: PathBuf,

    /// Directory for completion checkpoints.
    #[arg(long, default_value = ".torrents_info")]
    checkpoint_dir: PathBuf,

    /// Port advertised to trackers.
    #[arg(short, long, default_value_t = 6881)]
    port: u16,

    /// Console log level. `RUST_LOG` takes precedence when set.
    #[arg(long, value_enum, default_value_t = CliLogLevel::Info)]
    log_level: CliLogLevel,
}

#[derive(Debug, Clone, Copy, clap::ValueEnum)]
enum CliLogLevel {
    Error,
    Warn,
    Info,
    Debug,
    Trace,
}

impl CliLogLevel {
    fn as_tracing_level(self) -> Level {
        match self {
            CliLogLevel::Error => Level::ERROR,
            CliLogLevel::Warn => Level::WARN,
            CliLogLevel::Info => Level::INFO,
            CliLogLevel::Debug => Level::DEBUG,
            CliLogLevel::Trace => Level::TRACE,
        }
    }
}

fn init_tracing(level: Level) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(level.to_string()));
    tracing_subscriber::registry()
        .with(fmt::layer().with_target(false))
        .with(filter)
        .init();
}

#[tokio::main]
async fn main() -> ExitCode {
    let args = Args::parse();
    init_tracing(args.log_level.as_tracing_level());

    let config = ClientConfig {
        download_dir: args.download_dir,
        checkpoint_dir: args.checkpoint_dir,
        peer_id: generate_peer_id(),
        port: args.port,
        ..ClientConfig::default()
    };
    let discovery = Arc::new(TrackerDiscovery::from_config(&config));
    let session = match Session::from_file(&args.manifest, &config, discovery) {
        Ok(session) => session,
        Err(e) => {
            error!(manifest = %args.manifest.display(), error = %e, "could not open session");
            return ExitCode::FAILURE;
        }
    };

    if session.state() == SessionState::Downloaded {
        info!(name = session.manifest().name(), "already downloaded");
        return ExitCode::SUCCESS;
    }
    session.start();

    let mut ticker = tokio::time::interval(STATUS_INTERVAL);
    loop {
        tokio::select! {
            _ = session.wait_until_downloaded() => break,
            _ = tokio::signal::ctrl_c() => {
                session.pause();
                info!("interrupted, progress is checkpointed");
                return ExitCode::from(130);
            }
            _ = ticker.tick() => {
                let status = session.status();
                info!(
                    progress = %format!("{:.1}%", status.progress * 100.0),
                    peers = status.peers,
                    rate = %format!("{:.1} KiB/s", status.throughput / 1024.0),
                    "downloading"
                );
            }
        }
    }

    info!(name = session.manifest().name(), "download finished");
    ExitCode::SUCCESS
}
