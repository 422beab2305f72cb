//! amqplog CLI
//!
//! Offline inspection of an amqplog log directory.
//!
//! # Commands
//!
//! - `inspect` - List every log with its durability, entry count and end
//! - `dump-index` - Dump a queue's index records, optionally resolved
//!   against the exchange logs

mod commands;
mod error;

use clap::{Parser, Subcommand};
use error::{CliError, CliResult};
use std::path::PathBuf;
use tracing_subscriber::EnvFilter;

/// amqplog command-line tools.
#[derive(Parser)]
#[command(name = "amqplog")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Path to the log directory
    #[arg(global = true, short, long)]
    path: Option<PathBuf>,

    /// Enable verbose output
    #[arg(global = true, short, long)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// List every log in the directory
    Inspect {
        /// Output format (text, json)
        #[arg(short, long, default_value = "text")]
        format: String,
    },

    /// Dump the index records of one queue
    DumpIndex {
        /// Virtual host of the queue
        #[arg(long, default_value = amqplog_core::DEFAULT_VHOST)]
        vhost: String,

        /// Queue name
        #[arg(short, long)]
        queue: String,

        /// Output format (text, json)
        #[arg(short, long, default_value = "text")]
        format: String,

        /// Read each record's routing key and body length from its exchange log
        #[arg(short, long)]
        resolve: bool,
    },

    /// Show version information
    Version,
}

fn main() -> CliResult<()> {
    let cli = Cli::parse();

    let filter = if cli.verbose {
        EnvFilter::new("debug")
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"))
    };
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();

    match cli.command {
        Commands::Inspect { format } => {
            let path = cli.path.ok_or(CliError::PathRequired("inspect"))?;
            commands::inspect::run(&path, &format)?;
        }
        Commands::DumpIndex {
            vhost,
            queue,
            format,
            resolve,
        } => {
            let path = cli.path.ok_or(CliError::PathRequired("dump-index"))?;
            commands::dump_index::run(&path, &vhost, &queue, &format, resolve)?;
        }
        Commands::Version => {
            println!("amqplog CLI v{}", env!("CARGO_PKG_VERSION"));
        }
    }

    Ok(())
}
