//! hmp-updated: module update daemon entry point.
//!
//! Without a subcommand the daemon runs the boot-time module check, starts
//! the update queue runtime and serves until SIGTERM or SIGINT.

mod commands;

use clap::Parser;
use tracing_subscriber::EnvFilter;

fn main() {
    let cli = commands::Cli::parse();

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    if cli.log_json {
        tracing_subscriber::fmt()
            .json()
            .with_env_filter(filter)
            .init();
    } else {
        tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_target(false)
            .init();
    }

    if let Err(e) = commands::dispatch(cli) {
        eprintln!("Error: {e:#}");
        std::process::exit(1);
    }
}
