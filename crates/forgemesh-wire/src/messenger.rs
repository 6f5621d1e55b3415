//! Agent messenger — store-and-forward messaging between agents.
//!
//! [`AgentMessenger::send`] delivers straight into a local inbox when the
//! recipient lives on this node, hands the message to a connected peer that
//! advertises the recipient otherwise, and parks it in the sender's outbox
//! when neither works. Parked messages go out on the next successful
//! [`AgentMessenger::retry_pending`]; nothing here schedules that call.
//!
//! Delivery is one hop only. A message arriving for an agent this node does
//! not host is dropped.

use crate::error::HandlerError;
use crate::event::{MessengerEvent, EVENT_CHANNEL_CAPACITY};
use crate::handler::MessageHandler;
use crate::message::{AgentMessagePayload, MeshMessage, MeshPayload, MessageType};
use crate::node::MeshNode;

use async_trait::async_trait;
use dashmap::DashMap;
use forgemesh_types::agent::{AgentMessage, MessagePriority};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use tokio::sync::broadcast;
use tracing::{debug, info, warn};

/// Capacity of each per-agent delivery channel.
const AGENT_CHANNEL_CAPACITY: usize = 256;

/// Optional parameters of [`AgentMessenger::send`].
#[derive(Debug, Clone, Default)]
pub struct SendOptions {
    pub priority: MessagePriority,
    pub metadata: Option<HashMap<String, serde_json::Value>>,
}

impl SendOptions {
    pub fn with_priority(mut self, priority: MessagePriority) -> Self {
        self.priority = priority;
        self
    }

    pub fn with_metadata(mut self, metadata: HashMap<String, serde_json::Value>) -> Self {
        self.metadata = Some(metadata);
        self
    }
}

type Mailboxes = HashMap<String, Vec<AgentMessage>>;

struct MessengerState {
    /// Delivered messages, keyed by recipient.
    inbox: Mutex<Mailboxes>,
    /// Unsent messages, keyed by sender.
    outbox: Mutex<Mailboxes>,
    events: broadcast::Sender<MessengerEvent>,
    agent_channels: DashMap<String, broadcast::Sender<AgentMessage>>,
}

impl MessengerState {
    fn deliver(&self, message: AgentMessage) {
        debug!(
            message_id = %message.id,
            from = %message.from_agent_id,
            to = %message.to_agent_id,
            priority = %message.priority,
            "Delivering to inbox"
        );
        {
            let mut inbox = self.inbox.lock().unwrap_or_else(|e| e.into_inner());
            let messages = inbox.entry(message.to_agent_id.clone()).or_default();
            messages.push(message.clone());
            sort_inbox(messages);
        }

        if let Some(channel) = self.agent_channels.get(&message.to_agent_id) {
            let _ = channel.send(message.clone());
        }
        let _ = self.events.send(MessengerEvent::Delivered(message));
    }

    fn enqueue(&self, message: AgentMessage) {
        info!(
            message_id = %message.id,
            from = %message.from_agent_id,
            to = %message.to_agent_id,
            "No route to agent, message queued"
        );
        self.outbox
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .entry(message.from_agent_id.clone())
            .or_default()
            .push(message.clone());
        let _ = self.events.send(MessengerEvent::Queued(message));
    }
}

/// Highest priority first; older first within a priority. The sort is stable.
fn sort_inbox(messages: &mut [AgentMessage]) {
    messages.sort_by(|a, b| {
        b.priority
            .cmp(&a.priority)
            .then_with(|| a.timestamp.cmp(&b.timestamp))
    });
}

/// Agent-facing messaging API on top of a [`MeshNode`].
///
/// Cloning is cheap; clones share the same inboxes and outboxes.
#[derive(Clone)]
pub struct AgentMessenger {
    node: MeshNode,
    state: Arc<MessengerState>,
}

impl AgentMessenger {
    /// Wrap a node and register the inbound `agent:message` handler on it.
    pub fn new(node: MeshNode) -> Self {
        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        let state = Arc::new(MessengerState {
            inbox: Mutex::new(HashMap::new()),
            outbox: Mutex::new(HashMap::new()),
            events,
            agent_channels: DashMap::new(),
        });
        node.on(
            MessageType::AgentMessage,
            Arc::new(InboundAgentMessages {
                state: state.clone(),
            }),
        );
        Self { node, state }
    }

    pub fn node(&self) -> &MeshNode {
        &self.node
    }

    /// Send a message from one agent to another.
    ///
    /// Always returns the message. Whether it was delivered, handed to a peer,
    /// or queued is reported through [`subscribe`](Self::subscribe) and
    /// [`get_outbox`](Self::get_outbox), never as an error.
    pub fn send(
        &self,
        from_agent_id: &str,
        to_agent_id: &str,
        content: impl Into<String>,
        options: SendOptions,
    ) -> AgentMessage {
        let message = AgentMessage::new(from_agent_id, to_agent_id, content, options.priority)
            .with_metadata(options.metadata);

        if self.node.is_local_agent(to_agent_id) {
            self.state.deliver(message.clone());
        } else if !self.route(&message) {
            self.state.enqueue(message.clone());
        }
        message
    }

    /// Hand a message to the first connected peer advertising its recipient.
    fn route(&self, message: &AgentMessage) -> bool {
        let peers = self.node.registry().find_peers_with_agent(&message.to_agent_id);
        let Some(peer) = peers.first() else {
            return false;
        };

        let envelope = MeshMessage::new(
            MeshPayload::AgentMessage(AgentMessagePayload {
                from_agent_id: message.from_agent_id.clone(),
                to_agent_id: message.to_agent_id.clone(),
                content: message.content.clone(),
                priority: message.priority,
                metadata: message.metadata.clone(),
            }),
            self.node.node_id(),
        )
        .with_target(&peer.node_id)
        .with_timestamp(message.timestamp);

        let sent = self.node.send(&peer.node_id, &envelope);
        debug!(
            message_id = %message.id,
            to = %message.to_agent_id,
            peer = %peer.node_id,
            sent,
            "Routing agent message"
        );
        sent
    }

    /// Messages delivered to an agent, in inbox order.
    pub fn get_inbox(&self, agent_id: &str) -> Vec<AgentMessage> {
        let inbox = self.state.inbox.lock().unwrap_or_else(|e| e.into_inner());
        inbox.get(agent_id).cloned().unwrap_or_default()
    }

    pub fn get_unread(&self, agent_id: &str) -> Vec<AgentMessage> {
        let inbox = self.state.inbox.lock().unwrap_or_else(|e| e.into_inner());
        inbox
            .get(agent_id)
            .map(|messages| messages.iter().filter(|m| !m.read).cloned().collect())
            .unwrap_or_default()
    }

    /// Mark one message read. Returns `false` if no such message exists.
    pub fn mark_read(&self, agent_id: &str, message_id: &str) -> bool {
        let mut inbox = self.state.inbox.lock().unwrap_or_else(|e| e.into_inner());
        match inbox
            .get_mut(agent_id)
            .and_then(|messages| messages.iter_mut().find(|m| m.id == message_id))
        {
            Some(message) => {
                message.read = true;
                true
            }
            None => false,
        }
    }

    /// Mark every message in an inbox read. Returns how many changed.
    pub fn mark_all_read(&self, agent_id: &str) -> usize {
        let mut inbox = self.state.inbox.lock().unwrap_or_else(|e| e.into_inner());
        let Some(messages) = inbox.get_mut(agent_id) else {
            return 0;
        };
        let mut changed = 0;
        for message in messages.iter_mut().filter(|m| !m.read) {
            message.read = true;
            changed += 1;
        }
        changed
    }

    /// Remove one message from an inbox. Returns `false` if it was not there.
    pub fn delete(&self, agent_id: &str, message_id: &str) -> bool {
        let mut inbox = self.state.inbox.lock().unwrap_or_else(|e| e.into_inner());
        let Some(messages) = inbox.get_mut(agent_id) else {
            return false;
        };
        let before = messages.len();
        messages.retain(|m| m.id != message_id);
        messages.len() != before
    }

    pub fn clear_inbox(&self, agent_id: &str) {
        self.state
            .inbox
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .remove(agent_id);
    }

    /// Messages sent by an agent that are still waiting for a route.
    pub fn get_outbox(&self, agent_id: &str) -> Vec<AgentMessage> {
        let outbox = self.state.outbox.lock().unwrap_or_else(|e| e.into_inner());
        outbox.get(agent_id).cloned().unwrap_or_default()
    }

    /// Total number of queued messages across all senders.
    pub fn pending_count(&self) -> usize {
        let outbox = self.state.outbox.lock().unwrap_or_else(|e| e.into_inner());
        outbox.values().map(Vec::len).sum()
    }

    /// Try to send every queued message again. Returns how many went out.
    ///
    /// Messages that still have no route stay queued in their original order.
    pub fn retry_pending(&self) -> usize {
        let mut outbox = self.state.outbox.lock().unwrap_or_else(|e| e.into_inner());
        let mut sent = 0;
        for queue in outbox.values_mut() {
            queue.retain(|message| {
                if self.route(message) {
                    sent += 1;
                    false
                } else {
                    true
                }
            });
        }
        outbox.retain(|_, queue| !queue.is_empty());

        if sent > 0 {
            let remaining: usize = outbox.values().map(Vec::len).sum();
            info!(sent, remaining, "Retried queued agent messages");
        }
        sent
    }

    /// Subscribe to delivery and queueing events for every agent.
    pub fn subscribe(&self) -> broadcast::Receiver<MessengerEvent> {
        self.state.events.subscribe()
    }

    /// Subscribe to messages delivered to one agent.
    pub fn subscribe_agent(&self, agent_id: &str) -> broadcast::Receiver<AgentMessage> {
        self.state
            .agent_channels
            .entry(agent_id.to_string())
            .or_insert_with(|| broadcast::channel(AGENT_CHANNEL_CAPACITY).0)
            .subscribe()
    }
}

/// Node handler for inbound `agent:message` envelopes.
struct InboundAgentMessages {
    state: Arc<MessengerState>,
}

#[async_trait]
impl MessageHandler for InboundAgentMessages {
    async fn handle(&self, node: &MeshNode, message: &MeshMessage) -> Result<(), HandlerError> {
        let MeshPayload::AgentMessage(payload) = message.payload() else {
            return Ok(());
        };

        if !node.is_local_agent(&payload.to_agent_id) {
            warn!(
                to = %payload.to_agent_id,
                from = %payload.from_agent_id,
                source = %message.source_node_id(),
                "Agent message for an agent not hosted here, dropping"
            );
            return Ok(());
        }

        let delivered = AgentMessage::new(
            payload.from_agent_id.clone(),
            payload.to_agent_id.clone(),
            payload.content.clone(),
            payload.priority,
        )
        .with_metadata(payload.metadata.clone())
        .with_timestamp(message.timestamp());
        self.state.deliver(delivered);
        Ok(())
    }
}
