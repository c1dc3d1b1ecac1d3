use std::path::PathBuf;

use clap::{Parser, Subcommand};

#[derive(Parser)]
#[command(name = "ticksync")]
#[command(about = "Operate a ticksync central node")]
#[command(version)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,

    /// Optional path to the central database file
    #[arg(long, global = true, value_name = "PATH")]
    pub db_path: Option<PathBuf>,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Run one lookup materializer pass
    Materialize,
    /// Show the lookup watermark of every pulled record type
    Watermarks {
        /// Output as JSON
        #[arg(long)]
        json: bool,
    },
    /// List devices waiting for a sync turn
    Queue {
        /// Output as JSON
        #[arg(long)]
        json: bool,
    },
    /// List recent sync sessions
    Sessions {
        /// Number of sessions to show
        #[arg(short, long, default_value = "20")]
        limit: u32,
        /// Output as JSON
        #[arg(long)]
        json: bool,
    },
    /// Drop lookup tombstones every device has pulled past
    Prune,
    /// Error open sessions that have been idle past the timeout
    CloseLapsed,
    /// Keep the lookup table up to date until interrupted
    Worker,
}
