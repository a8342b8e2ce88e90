use anyhow::Result;
use clap::{Parser, Subcommand};
use std::path::PathBuf;

use tryout::config::{DEFAULT_CONFIG_FILE, TryoutConfig};

mod cmd;

#[derive(Parser)]
#[command(name = "tryout")]
#[command(version, about = "Staged AI-led work sessions that end in a shareable evidence pack")]
pub struct Cli {
    #[arg(short, long, global = true)]
    pub verbose: bool,

    /// Path to tryout.toml
    #[arg(long, global = true, env = "TRYOUT_CONFIG")]
    pub config: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Run the HTTP API
    Serve {
        /// Port to serve on (overrides [server].port)
        #[arg(short, long)]
        port: Option<u16>,

        /// Database path (overrides [database].path)
        #[arg(long)]
        db_path: Option<PathBuf>,

        /// Enable dev mode (permissive CORS, listen on all interfaces)
        #[arg(long)]
        dev: bool,
    },
    /// Create or migrate the database file
    InitDb {
        #[arg(long)]
        db_path: Option<PathBuf>,
    },
    /// View, validate or scaffold tryout.toml
    Config {
        #[command(subcommand)]
        command: Option<ConfigCommands>,
    },
    /// Print a stored session with its event-log-derived stage progress
    Inspect {
        session_id: String,

        #[arg(long)]
        db_path: Option<PathBuf>,
    },
}

#[derive(Subcommand, Clone)]
pub enum ConfigCommands {
    /// Show current configuration
    Show,
    /// Validate configuration and show any warnings
    Validate,
    /// Write a default tryout.toml
    Init,
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();
    let cli = Cli::parse();
    let config_path = cli
        .config
        .clone()
        .unwrap_or_else(|| PathBuf::from(DEFAULT_CONFIG_FILE));

    // Config commands report on the file itself, so they run before loading it.
    if let Commands::Config { command } = &cli.command {
        return cmd::cmd_config(&config_path, command.clone());
    }

    let config = TryoutConfig::load_or_default(&config_path)?;
    tryout::logging::init(&config.logging, cli.verbose);

    match cli.command {
        Commands::Serve { port, db_path, dev } => {
            cmd::cmd_serve(config, port, db_path, dev).await?;
        }
        Commands::InitDb { db_path } => cmd::cmd_init_db(&config, db_path)?,
        Commands::Inspect {
            session_id,
            db_path,
        } => cmd::cmd_inspect(&config, &session_id, db_path)?,
        Commands::Config { .. } => {}
    }

    Ok(())
}
