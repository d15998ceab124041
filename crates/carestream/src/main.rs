//! Carestream daemon - SSE relay for care-plan generation backends

use std::path::{Path, PathBuf};

use clap::{Parser, Subcommand};
use tracing_subscriber::{EnvFilter, layer::SubscriberExt, util::SubscriberInitExt};

use carestream::config::Config;
use carestream::error::Result;
use carestream::relay::RelayServer;

/// Carestream - an SSE relay that reframes and repairs care-plan event streams
#[derive(Parser)]
#[command(name = "carestream")]
#[command(about = "An SSE relay that reframes and repairs care-plan event streams")]
#[command(version)]
pub struct Cli {
    /// Path to config file
    #[arg(long, short = 'c', global = true)]
    pub config: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Option<Command>,
}

#[derive(Subcommand)]
pub enum Command {
    /// Start the relay server (default command)
    #[command(name = "serve")]
    Serve,
}

#[tokio::main]
async fn main() {
    if let Err(e) = run().await {
        eprintln!("Error: {e}");
        std::process::exit(1);
    }
}

async fn run() -> Result<()> {
    init_logging();

    let cli = Cli::parse();

    match cli.command {
        None | Some(Command::Serve) => serve(cli.config).await,
    }
}

fn init_logging() {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("info,carestream=debug"));

    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer())
        .init();
}

fn load_config(config_path: Option<PathBuf>) -> Result<Config> {
    let mut config = if let Some(path) = config_path {
        tracing::info!("Loading config from: {}", path.display());
        read_config_file(&path)?
    } else {
        let default_paths = [
            dirs::home_dir().map(|h| h.join(".carestream").join("config.toml")),
            dirs::config_dir().map(|c| c.join("carestream").join("config.toml")),
            Some(PathBuf::from("config.toml")),
        ];

        let mut found = None;
        for path in default_paths.iter().flatten() {
            if path.exists() {
                tracing::info!("Loading config from: {}", path.display());
                found = Some(read_config_file(path)?);
                break;
            }
        }

        found.unwrap_or_else(|| {
            tracing::info!("No config file found, using defaults");
            Config::default()
        })
    };

    config.apply_env_overrides();
    Ok(config)
}

fn read_config_file(path: &Path) -> Result<Config> {
    let content = std::fs::read_to_string(path).map_err(|e| {
        carestream::CarestreamError::Config(format!(
            "Failed to read config file {}: {}",
            path.display(),
            e
        ))
    })?;
    toml::from_str(&content)
        .map_err(|e| carestream::CarestreamError::Config(format!("Failed to parse config: {e}")))
}

async fn serve(config_path: Option<PathBuf>) -> Result<()> {
    tracing::info!("Starting Carestream daemon");

    let config = load_config(config_path)?;
    tracing::debug!("Config loaded: {:?}", config);

    let server = RelayServer::new(config);
    server.serve().await?;

    tracing::info!("Carestream daemon stopped");
    Ok(())
}
