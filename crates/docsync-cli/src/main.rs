//! docsync CLI
//!
//! Command-line interface for docsync - offline-first document trees
//! replicated through storage directories.

use std::path::PathBuf;

use anyhow::Result;
use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;

use docsync_core::Config;

mod commands;
mod output;

use output::{Output, OutputFormat};

/// Default seconds `docsync sync` waits for every storage to catch up
const DEFAULT_SYNC_TIMEOUT_SECS: u64 = 30;

#[derive(Parser)]
#[command(name = "docsync")]
#[command(about = "docsync - Offline-first document sync")]
#[command(version)]
#[command(propagate_version = true)]
struct Cli {
    /// Output as JSON
    #[arg(long, global = true)]
    json: bool,

    /// Quiet mode - minimal output
    #[arg(short, long, global = true)]
    quiet: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Initialize a data directory (first-time setup)
    Init {
        /// Join an existing tree by providing its root document ID
        #[arg(long)]
        join: Option<String>,
    },
    /// Show status (root doc ID, storage usage)
    Status,
    /// Sync the local tree with a remote directory
    Sync {
        /// Remote directory (defaults to remote_dir from config)
        #[arg(short, long)]
        remote: Option<PathBuf>,
        /// Give up after this many seconds
        #[arg(long, default_value_t = DEFAULT_SYNC_TIMEOUT_SECS)]
        timeout: u64,
    },
    /// Set a field in a document
    Set {
        key: String,
        value: String,
        /// Sub-document ID (defaults to the root document)
        #[arg(short, long)]
        doc: Option<String>,
    },
    /// Print a field of a document
    Get {
        key: String,
        /// Sub-document ID (defaults to the root document)
        #[arg(short, long)]
        doc: Option<String>,
    },
    /// Manage sub-documents
    Subdoc {
        #[command(subcommand)]
        command: SubdocCommands,
    },
    /// Show or set configuration
    Config {
        #[command(subcommand)]
        command: Option<ConfigCommands>,
    },
}

#[derive(Subcommand)]
enum SubdocCommands {
    /// Create a sub-document
    #[command(alias = "create")]
    Add {
        /// Parent document ID (defaults to the root document)
        #[arg(short, long)]
        parent: Option<String>,
    },
    /// List sub-documents
    #[command(alias = "ls")]
    List {
        /// Parent document ID (defaults to the root document)
        #[arg(short, long)]
        parent: Option<String>,
    },
}

#[derive(Subcommand)]
enum ConfigCommands {
    /// Show current configuration
    Show,
    /// Set a configuration value
    Set {
        /// Configuration key (data_dir, remote_dir, retry_delay_secs)
        key: String,
        /// Configuration value
        value: String,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    init_logging();

    let cli = Cli::parse();
    let output = Output::new(OutputFormat::from_flags(cli.json, cli.quiet));

    // Config commands must work even when the stored config is broken
    let command = match cli.command {
        Commands::Config { command } => {
            return match command {
                Some(ConfigCommands::Show) | None => commands::config::show(&output),
                Some(ConfigCommands::Set { key, value }) => {
                    commands::config::set(key, value, &output)
                }
            };
        }
        other => other,
    };

    let config = Config::load()?;

    match command {
        Commands::Init { join } => commands::init::init(&config, join, &output),
        Commands::Status => commands::status::show(&config, &output),
        Commands::Sync { remote, timeout } => {
            commands::sync::sync(&config, remote, timeout, &output).await
        }
        Commands::Set { key, value, doc } => {
            commands::doc::set(&config, key, value, doc, &output).await
        }
        Commands::Get { key, doc } => commands::doc::get(&config, key, doc, &output).await,
        Commands::Subdoc { command } => match command {
            SubdocCommands::Add { parent } => commands::subdoc::add(&config, parent, &output).await,
            SubdocCommands::List { parent } => {
                commands::subdoc::list(&config, parent, &output).await
            }
        },
        Commands::Config { .. } => Ok(()),
    }
}

/// Log to stderr, filtered by DOCSYNC_LOG (defaults to warnings only)
fn init_logging() {
    let env_filter =
        EnvFilter::try_from_env("DOCSYNC_LOG").unwrap_or_else(|_| EnvFilter::new("warn"));

    // Ignore error if already initialized
    let _ = tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_target(false)
        .with_writer(std::io::stderr)
        .try_init();
}
