//! `forgemesh send` — join the mesh briefly to deliver one message.

use crate::cli::SendArgs;
use crate::config::load_config;
use crate::ui;
use forgemesh_types::config::NodeConfig;
use forgemesh_types::error::{MeshError, MeshResult};
use forgemesh_wire::{AgentMessenger, MeshNode, SendOptions};
use std::path::PathBuf;
use std::time::Duration;
use tracing::info;

/// How often to check whether the target agent has been announced.
const ROUTE_POLL_INTERVAL: Duration = Duration::from_millis(50);

pub fn cmd_send(config_path: Option<PathBuf>, args: SendArgs) {
    let config = transient_config(load_config(config_path.as_deref()), &args);
    match crate::runtime().block_on(send_once(config, args)) {
        Ok(message_id) => ui::success(&format!("Sent message {message_id}")),
        Err(e) => {
            ui::error(&e.to_string());
            std::process::exit(1);
        }
    }
}

/// A throwaway identity on an ephemeral port, dialing only the given peer.
///
/// The node ID is derived from the configured one so a `send` run next to a
/// long-running node never collides with it.
fn transient_config(base: NodeConfig, args: &SendArgs) -> NodeConfig {
    let suffix = uuid::Uuid::new_v4().simple().to_string();
    NodeConfig {
        node_id: format!("{}-send-{}", base.node_id, &suffix[..8]),
        host: "127.0.0.1".to_string(),
        port: 0,
        bootstrap_peers: vec![args.peer.clone()],
        ..base
    }
}

async fn send_once(config: NodeConfig, args: SendArgs) -> MeshResult<String> {
    if args.from.trim().is_empty() || args.to.trim().is_empty() {
        return Err(MeshError::InvalidInput(
            "--from and --to must not be empty".to_string(),
        ));
    }

    let wait = config.connection_timeout();
    let node = MeshNode::new(config);
    node.register_agent(args.from.clone());
    let messenger = AgentMessenger::new(node.clone());

    node.start()
        .await
        .map_err(|e| MeshError::Network(e.to_string()))?;

    let routed = tokio::time::timeout(wait, async {
        while node.registry().find_peers_with_agent(&args.to).is_empty() {
            tokio::time::sleep(ROUTE_POLL_INTERVAL).await;
        }
    })
    .await
    .is_ok();

    let result = if routed {
        let message = messenger.send(
            &args.from,
            &args.to,
            args.content,
            SendOptions::default().with_priority(args.priority),
        );
        if messenger.pending_count() == 0 {
            info!(message_id = %message.id, to = %args.to, peer = %args.peer, "Message handed to peer");
            Ok(message.id)
        } else {
            Err(MeshError::Network(format!(
                "connection to {} dropped before the message was sent",
                args.peer
            )))
        }
    } else {
        Err(MeshError::Network(format!(
            "no peer reachable through {} hosts agent '{}'",
            args.peer, args.to
        )))
    };

    // Stopping flushes queued frames before the sockets close.
    node.stop().await;
    result
}
