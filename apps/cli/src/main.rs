//! blockget CLI - resumable segmented downloads
//!
//! Drives the blockget engine from a terminal: start, resume, pause on
//! Ctrl-C, list and delete missions.

mod commands;
mod output;
mod progress;

use anyhow::Result;
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

/// blockget - Resumable Segmented Downloader
#[derive(Parser)]
#[command(name = "blockget")]
#[command(author, version, about, long_about = None)]
#[command(propagate_version = true)]
struct Cli {
    /// Data directory for blockget
    #[arg(long, env = "BLOCKGET_DATA_DIR")]
    data_dir: Option<PathBuf>,

    /// Output format
    #[arg(long, default_value = "human")]
    output: OutputFormat,

    /// Verbose output
    #[arg(short, long)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Clone, Copy, Debug, clap::ValueEnum)]
enum OutputFormat {
    Human,
    Json,
    Table,
}

#[derive(Subcommand)]
enum Commands {
    /// Download a URL, resumable across restarts
    Get {
        /// URL to download
        url: String,

        /// Directory to save into
        #[arg(short, long)]
        dir: Option<PathBuf>,

        /// File name (derived from the URL if omitted)
        #[arg(short, long)]
        name: Option<String>,

        /// Number of parallel workers
        #[arg(short, long)]
        threads: Option<u32>,

        /// Mark the mission as audio
        #[arg(long)]
        audio: bool,
    },

    /// List missions, newest first
    List {
        /// Filter by status
        #[arg(short, long)]
        status: Option<String>,

        /// Show all details
        #[arg(short, long)]
        all: bool,
    },

    /// Show mission info
    Info {
        /// Mission index or ID
        mission: String,
    },

    /// Resume a paused mission and wait for it
    Resume {
        /// Mission index or ID
        mission: String,

        /// Clear a stored error and try again
        #[arg(long)]
        retry: bool,
    },

    /// Delete a mission and its files
    Delete {
        /// Mission index or ID
        mission: String,

        /// Skip the confirmation prompt
        #[arg(short, long)]
        yes: bool,
    },

    /// Show/update settings
    Config {
        #[command(subcommand)]
        action: Option<ConfigAction>,
    },

    /// Generate shell completions
    Completions {
        /// Shell to generate completions for
        shell: clap_complete::Shell,
    },
}

#[derive(Subcommand)]
enum ConfigAction {
    /// Get a config value
    Get {
        /// Config key
        key: String,
    },

    /// Set a config value
    Set {
        /// Config key
        key: String,

        /// Config value
        value: String,
    },

    /// Show all config
    Show,

    /// Reset to defaults
    Reset,
}

fn init_logging(verbose: bool) {
    let filter = if verbose {
        EnvFilter::new("blockget_core=debug,blockget=debug")
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn"))
    };

    tracing_subscriber::registry()
        .with(fmt::layer().with_writer(std::io::stderr).with_target(false))
        .with(filter)
        .init();
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_logging(cli.verbose);

    if let Commands::Completions { shell } = cli.command {
        use clap::CommandFactory;
        clap_complete::generate(shell, &mut Cli::command(), "blockget", &mut std::io::stdout());
        return Ok(());
    }

    // Determine data directory
    let data_dir = cli.data_dir.unwrap_or_else(|| {
        dirs::data_dir()
            .map(|d| d.join("blockget"))
            .unwrap_or_else(|| PathBuf::from(".blockget"))
    });

    // Initialize core
    let core = blockget_core::BlockgetCore::new(data_dir).await?;

    // Execute command
    match cli.command {
        Commands::Get {
            url,
            dir,
            name,
            threads,
            audio,
        } => {
            let request = blockget_core::MissionRequest {
                url,
                location: dir,
                name,
                is_audio: audio,
                threads,
            };
            commands::get(&core, request, cli.output).await?
        }

        Commands::List { status, all } => {
            commands::list_missions(&core, status, all, cli.output).await?
        }

        Commands::Info { mission } => commands::show_info(&core, &mission, cli.output).await?,

        Commands::Resume { mission, retry } => {
            commands::resume(&core, &mission, retry, cli.output).await?
        }

        Commands::Delete { mission, yes } => {
            commands::delete_mission(&core, &mission, yes, cli.output).await?
        }

        Commands::Config { action } => commands::config_action(&core, action, cli.output).await?,

        Commands::Completions { .. } => {}
    }

    Ok(())
}
