//! ForgeMesh wire protocol — peer-to-peer agent messaging over TCP.
//!
//! Nodes exchange length-prefixed JSON frames. Each node keeps a registry of
//! known peers and the agents they host, and an [`AgentMessenger`] on top of
//! it routes agent messages to whichever peer hosts the recipient.
//!
//! ## Protocol
//!
//! Each frame is a 4-byte big-endian length followed by a JSON
//! [`MeshMessage`] envelope. A node that dials a peer sends its `announce`
//! first; the accepting side replies with its own.

pub mod error;
pub mod event;
pub mod handler;
pub mod message;
pub mod messenger;
pub mod node;
pub mod registry;

pub use error::{HandlerError, WireError};
pub use event::{MessengerEvent, NodeEvent, PeerEvent};
pub use handler::{FnHandler, MessageHandler};
pub use message::{MeshMessage, MeshPayload, MessageType};
pub use messenger::{AgentMessenger, SendOptions};
pub use node::{MeshNode, NodeInfo};
pub use registry::{PeerInfo, PeerRegistry, PeerStatus};
