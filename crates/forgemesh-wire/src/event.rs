//! Typed events published by the registry, the node, and the messenger.
//!
//! Each component owns its own `tokio::sync::broadcast` channel; subscribers
//! call `subscribe()` on the component. Events sent while nobody listens are
//! dropped.

use crate::message::MeshMessage;
use crate::registry::PeerInfo;
use forgemesh_types::agent::AgentMessage;
use std::net::SocketAddr;

/// Capacity of every component's broadcast channel.
pub(crate) const EVENT_CHANNEL_CAPACITY: usize = 1024;

/// Liveness transitions recorded by the [`PeerRegistry`](crate::PeerRegistry).
#[derive(Debug, Clone)]
pub enum PeerEvent {
    /// A previously unseen peer registered.
    Joined(PeerInfo),
    /// A known peer re-registered.
    Updated(PeerInfo),
    /// A peer was explicitly disconnected.
    Left(PeerInfo),
    /// A peer was deleted from the registry.
    Removed(PeerInfo),
    /// A connected peer missed its heartbeat deadline.
    Stale(PeerInfo),
}

impl PeerEvent {
    pub fn name(&self) -> &'static str {
        match self {
            Self::Joined(_) => "peer:joined",
            Self::Updated(_) => "peer:updated",
            Self::Left(_) => "peer:left",
            Self::Removed(_) => "peer:removed",
            Self::Stale(_) => "peer:stale",
        }
    }

    pub fn peer(&self) -> &PeerInfo {
        match self {
            Self::Joined(p) | Self::Updated(p) | Self::Left(p) | Self::Removed(p) | Self::Stale(p) => p,
        }
    }
}

/// Events published by a [`MeshNode`](crate::MeshNode).
#[derive(Debug, Clone)]
pub enum NodeEvent {
    /// The listener is bound and the heartbeat loop is running.
    Started { node_id: String, addr: SocketAddr },
    /// The node shut down.
    Stopped { node_id: String },
    /// A peer announced itself.
    PeerConnected(PeerInfo),
    /// The last connection to a peer closed.
    PeerDisconnected { node_id: String },
    /// An inbound message was processed by every registered handler.
    ///
    /// Subscribers interested in one type filter on
    /// [`MeshMessage::message_type`].
    Message(MeshMessage),
}

impl NodeEvent {
    pub fn name(&self) -> &'static str {
        match self {
            Self::Started { .. } => "started",
            Self::Stopped { .. } => "stopped",
            Self::PeerConnected(_) => "peer:connected",
            Self::PeerDisconnected { .. } => "peer:disconnected",
            Self::Message(_) => "message",
        }
    }
}

/// Events published by an [`AgentMessenger`](crate::AgentMessenger).
#[derive(Debug, Clone)]
pub enum MessengerEvent {
    /// A message landed in a local agent's inbox.
    Delivered(AgentMessage),
    /// A message could not be routed and was put in the sender's outbox.
    Queued(AgentMessage),
}

impl MessengerEvent {
    pub fn name(&self) -> &'static str {
        match self {
            Self::Delivered(_) => "message",
            Self::Queued(_) => "queued",
        }
    }

    pub fn message(&self) -> &AgentMessage {
        match self {
            Self::Delivered(m) | Self::Queued(m) => m,
        }
    }
}
