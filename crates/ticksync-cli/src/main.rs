//! ticksync CLI - Operator tooling for a central sync node
//!
//! Inspect the device queue and sessions, run the lookup materializer and
//! clean up after devices.

mod cli;
mod commands;
mod error;


use clap::Parser;

use crate::cli::{Cli, Commands};
use crate::commands::common::{open_manager, resolve_db_path};
use crate::commands::maintenance::{run_close_lapsed, run_prune};
use crate::commands::materialize::run_materialize;
use crate::commands::queue::run_queue;
use crate::commands::sessions::run_sessions;
use crate::commands::watermarks::run_watermarks;
use crate::commands::worker::run_worker;
use crate::error::CliError;

#[tokio::main]
async fn main() {
    if let Err(error) = run().await {
        eprintln!("Error: {error}");
        std::process::exit(1);
    }
}

async fn run() -> Result<(), CliError> {
    #[cfg(debug_assertions)]
    dotenvy::dotenv().ok();

    let directive = "ticksync=info"
        .parse::<tracing_subscriber::filter::Directive>()
        .map_err(|error| CliError::Config(format!("invalid log directive: {error}")))?;
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env().add_directive(directive))
        .init();

    let cli = Cli::parse();
    let db_path = resolve_db_path(cli.db_path)?;
    let manager = open_manager(&db_path).await?;

    match cli.command {
        Commands::Materialize => run_materialize(&manager).await?,
        Commands::Watermarks { json } => run_watermarks(&manager, json).await?,
        Commands::Queue { json } => run_queue(&manager, json).await?,
        Commands::Sessions { limit, json } => run_sessions(&manager, limit, json).await?,
        Commands::Prune => run_prune(&manager).await?,
        Commands::CloseLapsed => run_close_lapsed(&manager).await?,
        Commands::Worker => run_worker(manager).await?,
    }

    Ok(())
}
