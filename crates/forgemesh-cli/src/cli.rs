//! Clap CLI definitions for ForgeMesh.

use clap::{Args, Parser, Subcommand};
use forgemesh_types::agent::MessagePriority;
use forgemesh_types::config::BootstrapPeer;
use std::path::PathBuf;

pub const AFTER_HELP: &str = "\
\x1b[1;36mExamples:\x1b[0m
  forgemesh init                                   Write ~/.forgemesh/config.toml
  forgemesh start --agent writer                   Run a node hosting 'writer'
  forgemesh start --agent reader --peer 10.0.0.2:23001
  forgemesh send --peer 10.0.0.2:23001 --from cli --to writer \"hello\"";

/// ForgeMesh — peer-to-peer messaging between agents on different hosts.
#[derive(Parser)]
#[command(name = "forgemesh", version, after_help = AFTER_HELP)]
pub struct Cli {
    /// Path to config file.
    #[arg(long, global = true)]
    pub config: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Write a default config to ~/.forgemesh/config.toml.
    Init {
        /// Replace an existing config (the old file is kept as a backup).
        #[arg(long)]
        force: bool,
    },
    /// Run a mesh node until Ctrl+C.
    Start(StartArgs),
    /// Deliver one agent message through a running peer, then exit.
    Send(SendArgs),
}

#[derive(Args, Debug, Default)]
pub struct StartArgs {
    /// Agent hosted by this node (repeatable).
    #[arg(long = "agent", value_name = "ID")]
    pub agents: Vec<String>,
    /// Additional bootstrap peer (repeatable).
    #[arg(long = "peer", value_name = "HOST:PORT")]
    pub peers: Vec<BootstrapPeer>,
    /// Override the listen port.
    #[arg(long)]
    pub port: Option<u16>,
    /// Override the listen host.
    #[arg(long)]
    pub host: Option<String>,
    /// Override the node ID.
    #[arg(long)]
    pub node_id: Option<String>,
}

#[derive(Args, Debug)]
pub struct SendArgs {
    /// Peer to deliver through.
    #[arg(long, value_name = "HOST:PORT")]
    pub peer: BootstrapPeer,
    /// Sending agent.
    #[arg(long)]
    pub from: String,
    /// Receiving agent (must be hosted by a reachable peer).
    #[arg(long)]
    pub to: String,
    /// Message priority: low, normal, high, urgent.
    #[arg(long, default_value_t = MessagePriority::Normal)]
    pub priority: MessagePriority,
    /// Message body.
    pub content: String,
}
