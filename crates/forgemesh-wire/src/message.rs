//! Wire protocol message types.
//!
//! Every frame exchanged between ForgeMesh nodes carries one [`MeshMessage`]
//! envelope encoded as JSON:
//!
//! ```json
//! { "id": "…", "type": "announce", "payload": { … },
//!   "sourceNodeId": "…", "targetNodeId": "…", "timestamp": 1700000000000 }
//! ```
//!
//! On TCP each JSON body is prefixed with a 4-byte big-endian length header.

use crate::error::WireError;
use chrono::Utc;
use forgemesh_types::agent::MessagePriority;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Current wall-clock time in epoch milliseconds.
pub fn now_millis() -> i64 {
    Utc::now().timestamp_millis()
}

/// The closed set of message types.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum MessageType {
    #[serde(rename = "discover")]
    Discover,
    #[serde(rename = "announce")]
    Announce,
    #[serde(rename = "heartbeat")]
    Heartbeat,
    #[serde(rename = "agent:list")]
    AgentList,
    #[serde(rename = "agent:info")]
    AgentInfo,
    #[serde(rename = "agent:message")]
    AgentMessage,
    #[serde(rename = "agent:transfer")]
    AgentTransfer,
    #[serde(rename = "task:assign")]
    TaskAssign,
    #[serde(rename = "task:status")]
    TaskStatus,
    #[serde(rename = "task:result")]
    TaskResult,
    #[serde(rename = "error")]
    Error,
    #[serde(rename = "ack")]
    Ack,
}

impl MessageType {
    /// Every message type, in protocol order.
    pub const ALL: [MessageType; 12] = [
        Self::Discover,
        Self::Announce,
        Self::Heartbeat,
        Self::AgentList,
        Self::AgentInfo,
        Self::AgentMessage,
        Self::AgentTransfer,
        Self::TaskAssign,
        Self::TaskStatus,
        Self::TaskResult,
        Self::Error,
        Self::Ack,
    ];

    /// The name used on the wire.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Discover => "discover",
            Self::Announce => "announce",
            Self::Heartbeat => "heartbeat",
            Self::AgentList => "agent:list",
            Self::AgentInfo => "agent:info",
            Self::AgentMessage => "agent:message",
            Self::AgentTransfer => "agent:transfer",
            Self::TaskAssign => "task:assign",
            Self::TaskStatus => "task:status",
            Self::TaskResult => "task:result",
            Self::Error => "error",
            Self::Ack => "ack",
        }
    }
}

impl std::fmt::Display for MessageType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A node advertising its identity, address, and hosted agents.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AnnouncePayload {
    pub node_id: String,
    pub host: String,
    pub port: u16,
    pub agents: Vec<String>,
}

/// An agent-to-agent message in transit.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AgentMessagePayload {
    pub from_agent_id: String,
    pub to_agent_id: String,
    pub content: String,
    #[serde(default)]
    pub priority: MessagePriority,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metadata: Option<HashMap<String, serde_json::Value>>,
}

/// Progress state reported by `task:status`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TaskState {
    Pending,
    Running,
    Completed,
    Failed,
}

/// Message payloads, one variant per [`MessageType`].
///
/// Serialized adjacently tagged, so the variant name becomes the envelope's
/// `type` field and the fields become its `payload` object.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "payload")]
pub enum MeshPayload {
    /// Ask a node to identify itself.
    #[serde(rename = "discover", rename_all = "camelCase")]
    Discover { node_id: String },
    /// Identity, address, and hosted agents of the sender.
    #[serde(rename = "announce")]
    Announce(AnnouncePayload),
    /// Liveness beacon.
    #[serde(rename = "heartbeat", rename_all = "camelCase")]
    Heartbeat { node_id: String, timestamp: i64 },
    /// Request the receiver's agent list (answered with an announce).
    #[serde(rename = "agent:list", rename_all = "camelCase")]
    AgentList { node_id: String },
    /// Request details about one agent.
    #[serde(rename = "agent:info", rename_all = "camelCase")]
    AgentInfo { agent_id: String },
    /// Deliver a message to an agent hosted by the receiver.
    #[serde(rename = "agent:message")]
    AgentMessage(AgentMessagePayload),
    /// Move an exported agent to another node.
    #[serde(rename = "agent:transfer", rename_all = "camelCase")]
    AgentTransfer {
        agent_id: String,
        target_node_id: String,
        /// Base64-encoded agent export.
        data: String,
    },
    /// Hand a task to an agent.
    #[serde(rename = "task:assign", rename_all = "camelCase")]
    TaskAssign {
        task_id: String,
        agent_id: String,
        #[serde(rename = "type")]
        task_type: String,
        #[serde(default)]
        payload: serde_json::Value,
    },
    /// Report task progress.
    #[serde(rename = "task:status", rename_all = "camelCase")]
    TaskStatus {
        task_id: String,
        status: TaskState,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        progress: Option<f64>,
    },
    /// Report task completion.
    #[serde(rename = "task:result", rename_all = "camelCase")]
    TaskResult {
        task_id: String,
        success: bool,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        result: Option<serde_json::Value>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        error: Option<String>,
    },
    /// An application-level error addressed to a peer.
    #[serde(rename = "error")]
    Error { code: String, message: String },
    /// Acknowledges receipt of a message.
    #[serde(rename = "ack", rename_all = "camelCase")]
    Ack { message_id: String },
}

impl MeshPayload {
    /// The message type this payload belongs to.
    pub fn message_type(&self) -> MessageType {
        match self {
            Self::Discover { .. } => MessageType::Discover,
            Self::Announce(_) => MessageType::Announce,
            Self::Heartbeat { .. } => MessageType::Heartbeat,
            Self::AgentList { .. } => MessageType::AgentList,
            Self::AgentInfo { .. } => MessageType::AgentInfo,
            Self::AgentMessage(_) => MessageType::AgentMessage,
            Self::AgentTransfer { .. } => MessageType::AgentTransfer,
            Self::TaskAssign { .. } => MessageType::TaskAssign,
            Self::TaskStatus { .. } => MessageType::TaskStatus,
            Self::TaskResult { .. } => MessageType::TaskResult,
            Self::Error { .. } => MessageType::Error,
            Self::Ack { .. } => MessageType::Ack,
        }
    }
}

/// A wire protocol message (envelope).
///
/// Immutable once built: fields are only reachable through accessors.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MeshMessage {
    id: String,
    #[serde(flatten)]
    payload: MeshPayload,
    source_node_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    target_node_id: Option<String>,
    timestamp: i64,
}

impl MeshMessage {
    /// Build an envelope with a fresh ID, stamped with the current time.
    pub fn new(payload: MeshPayload, source_node_id: impl Into<String>) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            payload,
            source_node_id: source_node_id.into(),
            target_node_id: None,
            timestamp: now_millis(),
        }
    }

    /// Address the envelope to a specific node.
    pub fn with_target(mut self, target_node_id: impl Into<String>) -> Self {
        self.target_node_id = Some(target_node_id.into());
        self
    }

    /// Use a caller-supplied ID instead of the generated one.
    pub fn with_id(mut self, id: impl Into<String>) -> Self {
        self.id = id.into();
        self
    }

    /// Use a caller-supplied timestamp instead of the current time.
    pub fn with_timestamp(mut self, timestamp: i64) -> Self {
        self.timestamp = timestamp;
        self
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn message_type(&self) -> MessageType {
        self.payload.message_type()
    }

    pub fn payload(&self) -> &MeshPayload {
        &self.payload
    }

    pub fn source_node_id(&self) -> &str {
        &self.source_node_id
    }

    pub fn target_node_id(&self) -> Option<&str> {
        self.target_node_id.as_deref()
    }

    pub fn timestamp(&self) -> i64 {
        self.timestamp
    }

    /// Encode as JSON text. An absent target is omitted, not emitted as null.
    pub fn to_json(&self) -> Result<String, WireError> {
        Ok(serde_json::to_string(self)?)
    }

    /// Parse JSON text into an envelope.
    ///
    /// The payload must match the shape of its `type`; anything else is a
    /// protocol error.
    pub fn from_json(text: &str) -> Result<Self, WireError> {
        Ok(serde_json::from_str(text)?)
    }

    /// Build an `ack` for this message, addressed back to its sender.
    pub fn create_ack(&self, source_node_id: impl Into<String>) -> MeshMessage {
        MeshMessage::new(
            MeshPayload::Ack {
                message_id: self.id.clone(),
            },
            source_node_id,
        )
        .with_target(self.source_node_id.clone())
    }

    /// Build an `error` reply for this message, addressed back to its sender.
    pub fn create_error(
        &self,
        source_node_id: impl Into<String>,
        code: impl Into<String>,
        message: impl Into<String>,
    ) -> MeshMessage {
        MeshMessage::new(
            MeshPayload::Error {
                code: code.into(),
                message: message.into(),
            },
            source_node_id,
        )
        .with_target(self.source_node_id.clone())
    }
}

/// Maximum single frame size (16 MB).
pub const MAX_MESSAGE_SIZE: u32 = 16 * 1024 * 1024;

/// Encode a message to bytes (4-byte big-endian length + JSON).
pub fn encode_message(msg: &MeshMessage) -> Result<Vec<u8>, WireError> {
    let json = serde_json::to_vec(msg)?;
    let len = u32::try_from(json.len()).map_err(|_| WireError::MessageTooLarge {
        size: u32::MAX,
        max: MAX_MESSAGE_SIZE,
    })?;
    if len > MAX_MESSAGE_SIZE {
        return Err(WireError::MessageTooLarge {
            size: len,
            max: MAX_MESSAGE_SIZE,
        });
    }
    let mut bytes = Vec::with_capacity(4 + json.len());
    bytes.extend_from_slice(&len.to_be_bytes());
    bytes.extend_from_slice(&json);
    Ok(bytes)
}

/// Decode the length prefix from a 4-byte header.
pub fn decode_length(header: &[u8; 4]) -> u32 {
    u32::from_be_bytes(*header)
}

/// Parse a JSON body into a MeshMessage.
pub fn decode_message(body: &[u8]) -> Result<MeshMessage, WireError> {
    Ok(serde_json::from_slice(body)?)
}
