//! Agent-to-agent message types.

use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use uuid::Uuid;

/// Delivery priority of an agent message.
///
/// Variants are declared in ascending urgency so the derived `Ord` can be
/// used directly when sorting an inbox (highest first).
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MessagePriority {
    /// Background chatter.
    Low,
    /// The default.
    #[default]
    Normal,
    /// Should be read before normal traffic.
    High,
    /// Jumps the queue.
    Urgent,
}

impl MessagePriority {
    /// Wire name of the priority.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Low => "low",
            Self::Normal => "normal",
            Self::High => "high",
            Self::Urgent => "urgent",
        }
    }
}

impl std::fmt::Display for MessagePriority {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for MessagePriority {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "low" => Ok(Self::Low),
            "normal" => Ok(Self::Normal),
            "high" => Ok(Self::High),
            "urgent" => Ok(Self::Urgent),
            other => Err(format!("unknown priority '{other}'")),
        }
    }
}

/// A message from one agent to another.
///
/// A message lives either in the recipient's inbox or in the sender's
/// outbox, never in both.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AgentMessage {
    /// Unique message ID (local to the node holding the message).
    pub id: String,
    /// Sending agent.
    pub from_agent_id: String,
    /// Receiving agent.
    pub to_agent_id: String,
    /// Message body.
    pub content: String,
    /// Delivery priority.
    pub priority: MessagePriority,
    /// Creation time (epoch milliseconds).
    pub timestamp: i64,
    /// Optional caller-supplied context.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metadata: Option<HashMap<String, serde_json::Value>>,
    /// Whether the recipient has read the message.
    #[serde(default)]
    pub read: bool,
}

impl AgentMessage {
    /// Create an unread message with a fresh ID, stamped with the current time.
    pub fn new(
        from_agent_id: impl Into<String>,
        to_agent_id: impl Into<String>,
        content: impl Into<String>,
        priority: MessagePriority,
    ) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            from_agent_id: from_agent_id.into(),
            to_agent_id: to_agent_id.into(),
            content: content.into(),
            priority,
            timestamp: Utc::now().timestamp_millis(),
            metadata: None,
            read: false,
        }
    }

    /// Attach metadata.
    pub fn with_metadata(mut self, metadata: Option<HashMap<String, serde_json::Value>>) -> Self {
        self.metadata = metadata;
        self
    }

    /// Override the creation time.
    pub fn with_timestamp(mut self, timestamp: i64) -> Self {
        self.timestamp = timestamp;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_priority_ordering() {
        assert!(MessagePriority::Urgent > MessagePriority::High);
        assert!(MessagePriority::High > MessagePriority::Normal);
        assert!(MessagePriority::Normal > MessagePriority::Low);
        assert_eq!(MessagePriority::default(), MessagePriority::Normal);
    }

    #[test]
    fn test_priority_parse() {
        assert_eq!("URGENT".parse::<MessagePriority>().unwrap(), MessagePriority::Urgent);
        assert_eq!("low".parse::<MessagePriority>().unwrap(), MessagePriority::Low);
        assert!("critical".parse::<MessagePriority>().is_err());
    }

    #[test]
    fn test_new_message_is_unread() {
        let msg = AgentMessage::new("a", "b", "hi", MessagePriority::High);
        assert!(!msg.read);
        assert!(!msg.id.is_empty());
        assert!(msg.timestamp > 0);
        assert!(msg.metadata.is_none());
    }

    #[test]
    fn test_message_json_shape() {
        let msg = AgentMessage::new("writer", "reader", "payload", MessagePriority::Urgent)
            .with_timestamp(42);
        let json: serde_json::Value = serde_json::to_value(&msg).unwrap();
        assert_eq!(json["fromAgentId"], "writer");
        assert_eq!(json["toAgentId"], "reader");
        assert_eq!(json["priority"], "urgent");
        assert_eq!(json["timestamp"], 42);
        assert!(json.get("metadata").is_none());
    }
}
