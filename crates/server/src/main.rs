//! Termlink server binary.

use std::path::PathBuf;

use anyhow::Result;
use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;

use termlink_server::config::{default_config_path, Config};

#[derive(Parser)]
#[command(name = "termlink-server", version, about = "Terminal sessions over an authenticated WebSocket")]
struct Cli {
    /// Path to the configuration file.
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Increase log verbosity (repeatable).
    #[arg(short, long, global = true, action = clap::ArgAction::Count)]
    verbose: u8,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Start the server (default).
    Serve {
        /// Override the listener port.
        #[arg(long)]
        port: Option<u16>,

        /// Override the long-lived auth token.
        #[arg(long)]
        token: Option<String>,
    },

    /// Print the effective configuration as TOML.
    Config,

    /// Write a default configuration file.
    Init {
        /// Overwrite an existing file.
        #[arg(long)]
        force: bool,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let mut config = match &cli.config {
        Some(path) => Config::load(path)?,
        None => Config::load_default()?,
    };
    config.apply_env_overrides();

    init_tracing(&config, cli.verbose);

    match cli.command.unwrap_or(Commands::Serve {
        port: None,
        token: None,
    }) {
        Commands::Serve { port, token } => {
            if let Some(port) = port {
                config.server.port = port;
            }
            if let Some(token) = token {
                config.auth.token = token;
            }
            config.validate()?;
            termlink_server::run(config).await
        }
        Commands::Config => {
            println!("{}", config.to_toml()?);
            Ok(())
        }
        Commands::Init { force } => {
            let path = cli.config.unwrap_or_else(default_config_path);
            if path.exists() && !force {
                anyhow::bail!("config file already exists: {} (use --force)", path.display());
            }
            Config::default().save(&path)?;
            println!("wrote {}", path.display());
            Ok(())
        }
    }
}

fn init_tracing(config: &Config, verbose: u8) {
    let level = match verbose {
        0 => config.server.log_level.clone(),
        1 => "debug".to_string(),
        _ => "trace".to_string(),
    };
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));
    tracing_subscriber::fmt().with_env_filter(filter).init();
}
