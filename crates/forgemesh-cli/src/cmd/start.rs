//! `forgemesh start` — run a node and its messenger until Ctrl+C.

use crate::cli::StartArgs;
use crate::config::load_config;
use crate::ui;
use forgemesh_types::config::NodeConfig;
use forgemesh_wire::{AgentMessenger, MeshNode, MessengerEvent, NodeEvent};
use std::path::PathBuf;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};

pub fn cmd_start(config_path: Option<PathBuf>, args: StartArgs) {
    let config = apply_overrides(load_config(config_path.as_deref()), &args);
    crate::runtime().block_on(run(config, args.agents));
}

/// Command-line flags win over the config file; `--peer` adds to its peers.
fn apply_overrides(mut config: NodeConfig, args: &StartArgs) -> NodeConfig {
    if let Some(port) = args.port {
        config.port = port;
    }
    if let Some(host) = &args.host {
        config.host = host.clone();
    }
    if let Some(node_id) = &args.node_id {
        config.node_id = node_id.clone();
    }
    for peer in &args.peers {
        if !config.bootstrap_peers.contains(peer) {
            config.bootstrap_peers.push(peer.clone());
        }
    }
    config
}

async fn run(config: NodeConfig, agents: Vec<String>) {
    let retry_interval = config.retry_interval();
    let node = MeshNode::new(config);
    for agent in agents {
        node.register_agent(agent);
    }
    let messenger = AgentMessenger::new(node.clone());

    let addr = match node.start().await {
        Ok(addr) => addr,
        Err(e) => {
            ui::error(&format!("Failed to start node: {e}"));
            std::process::exit(1);
        }
    };

    ui::banner();
    ui::blank();
    ui::kv("Node", node.node_id());
    ui::kv("Listening", &addr.to_string());
    ui::kv("Agents", &node.local_agents().join(", "));
    ui::blank();
    ui::hint("Press Ctrl+C to stop the node");
    ui::blank();

    tokio::spawn(log_node_events(node.clone()));
    tokio::spawn(log_deliveries(messenger.clone()));

    if retry_interval.is_zero() {
        warn!("retry_interval_ms is 0; queued messages will not be retried");
        let _ = tokio::signal::ctrl_c().await;
    } else {
        let mut ticker =
            tokio::time::interval_at(tokio::time::Instant::now() + retry_interval, retry_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    let pending = messenger.pending_count();
                    if pending > 0 {
                        let sent = messenger.retry_pending();
                        debug!(pending, sent, "Outbox retry");
                    }
                }
                _ = tokio::signal::ctrl_c() => break,
            }
        }
    }

    info!("Shutting down");
    node.stop().await;
    ui::success("Node stopped");
}

async fn log_node_events(node: MeshNode) {
    let mut events = node.subscribe();
    loop {
        match events.recv().await {
            Ok(NodeEvent::PeerConnected(peer)) => {
                info!(peer = %peer.node_id, agents = ?peer.agents, "Peer connected");
            }
            Ok(NodeEvent::PeerDisconnected { node_id }) => {
                info!(peer = %node_id, "Peer disconnected");
            }
            Ok(NodeEvent::Stopped { .. }) => break,
            Ok(_) => {}
            Err(tokio::sync::broadcast::error::RecvError::Lagged(n)) => {
                warn!(skipped = n, "Node event log lagged");
            }
            Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
        }
    }
}

async fn log_deliveries(messenger: AgentMessenger) {
    let mut events = messenger.subscribe();
    loop {
        match events.recv().await {
            Ok(event) => {
                let msg = event.message();
                match &event {
                    MessengerEvent::Delivered(_) => info!(
                        from = %msg.from_agent_id,
                        to = %msg.to_agent_id,
                        priority = %msg.priority,
                        content = %msg.content,
                        "Message delivered"
                    ),
                    MessengerEvent::Queued(_) => {
                        info!(from = %msg.from_agent_id, to = %msg.to_agent_id, "Message queued")
                    }
                }
            }
            Err(tokio::sync::broadcast::error::RecvError::Lagged(n)) => {
                warn!(skipped = n, "Delivery log lagged");
            }
            Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
        }
    }
}
