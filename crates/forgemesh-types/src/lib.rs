//! Core types for the ForgeMesh peer network.
//!
//! This crate defines the data structures shared between the wire protocol,
//! the node runtime, and the command-line front end. It contains no I/O.

pub mod agent;
pub mod config;
pub mod error;

pub use agent::{AgentMessage, MessagePriority};
pub use config::{BootstrapPeer, NodeConfig};
pub use error::{MeshError, MeshResult};
