//! ForgeMesh CLI — run a mesh node or push a message into a running mesh.

mod cli;
mod cmd;
mod config;
mod ui;

use crate::cli::*;
use clap::Parser;

fn init_tracing_stderr() {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .init();
}

/// Build a Tokio runtime or exit.
pub(crate) fn runtime() -> tokio::runtime::Runtime {
    match tokio::runtime::Runtime::new() {
        Ok(rt) => rt,
        Err(e) => {
            ui::error(&format!("Failed to create Tokio runtime: {e}"));
            std::process::exit(1);
        }
    }
}

fn main() {
    let cli = Cli::parse();
    init_tracing_stderr();

    match cli.command {
        Commands::Init { force } => cmd::init::cmd_init(cli.config, force),
        Commands::Start(args) => cmd::start::cmd_start(cli.config, args),
        Commands::Send(args) => cmd::send::cmd_send(cli.config, args),
    }
}
