//! RowSync CLI
//!
//! Command-line tools for the on-disk state of RowSync participants.
//!
//! # Commands
//!
//! - `inspect-batch` - Show the manifest of a batch directory
//! - `verify-batch` - Check a batch directory against its manifest
//! - `scopes` - List the scopes (and history) of a scope store
//! - `purge-batches` - Remove abandoned batch directories

mod commands;

use clap::{Parser, Subcommand};
use std::path::PathBuf;
use tracing_subscriber::EnvFilter;

/// RowSync command-line tools.
#[derive(Parser)]
#[command(name = "rowsync")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Enable verbose output
    #[arg(global = true, short, long)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Show the manifest of a batch directory
    InspectBatch {
        /// Batch directory (the one holding batch.info)
        dir: PathBuf,

        /// Output format (text, json)
        #[arg(short, long, default_value = "text")]
        format: String,
    },

    /// Check every part of a batch directory against its manifest
    VerifyBatch {
        /// Batch directory (the one holding batch.info)
        dir: PathBuf,
    },

    /// List the scopes of a scope store
    Scopes {
        /// Scope store directory
        #[arg(short, long)]
        store: PathBuf,

        /// Also print the server history of each scope
        #[arg(long)]
        history: bool,
    },

    /// Remove batch directories older than a cutoff
    PurgeBatches {
        /// Directory holding the batch directories
        #[arg(short, long)]
        root: PathBuf,

        /// Minimum age in seconds
        #[arg(short, long, default_value = "3600")]
        older_than: u64,

        /// Dry run - list what would be removed
        #[arg(short, long)]
        dry_run: bool,
    },

    /// Show version information
    Version,
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();

    let filter = if cli.verbose {
        EnvFilter::new("debug")
    } else {
        EnvFilter::new("info")
    };
    tracing_subscriber::fmt().with_env_filter(filter).init();

    match cli.command {
        Commands::InspectBatch { dir, format } => {
            commands::inspect_batch::run(&dir, &format)?;
        }
        Commands::VerifyBatch { dir } => {
            commands::verify_batch::run(&dir)?;
        }
        Commands::Scopes { store, history } => {
            commands::scopes::run(&store, history)?;
        }
        Commands::PurgeBatches {
            root,
            older_than,
            dry_run,
        } => {
            commands::purge_batches::run(&root, older_than, dry_run)?;
        }
        Commands::Version => {
            println!("RowSync CLI v{}", env!("CARGO_PKG_VERSION"));
        }
    }

    Ok(())
}
