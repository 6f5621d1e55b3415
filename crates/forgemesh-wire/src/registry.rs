//! Peer registry — tracks known peers, their liveness, and their agents.
//!
//! The [`PeerRegistry`] is a thread-safe, cloneable handle. Every clone shares
//! the same peer map and event channel, so the node's connection tasks and the
//! messenger always see one consistent view.
//!
//! Each peer cycles through `unknown → connected ⇄ disconnected` until it is
//! explicitly removed; there is no terminal state.

use crate::event::{PeerEvent, EVENT_CHANNEL_CAPACITY};
use crate::message::{now_millis, AnnouncePayload};
use forgemesh_types::config::DEFAULT_STALE_TIMEOUT_MS;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, RwLock};
use std::time::Duration;
use tokio::sync::broadcast;
use tracing::debug;

/// Liveness state of a peer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PeerStatus {
    /// Registered or heard from within the stale timeout.
    Connected,
    /// Connection closed or heartbeat missed; kept for a possible comeback.
    Disconnected,
    /// Restored from a snapshot and not yet reconfirmed.
    Unknown,
}

/// An entry representing a single known peer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PeerInfo {
    pub node_id: String,
    pub host: String,
    pub port: u16,
    pub status: PeerStatus,
    /// Last time the peer registered or sent a heartbeat (epoch ms).
    pub last_seen: i64,
    /// Agents hosted by the peer.
    pub agents: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metadata: Option<HashMap<String, serde_json::Value>>,
}

impl PeerInfo {
    pub fn hosts_agent(&self, agent_id: &str) -> bool {
        self.agents.iter().any(|a| a == agent_id)
    }
}

/// Input to [`PeerRegistry::register`].
#[derive(Debug, Clone, PartialEq)]
pub struct PeerRegistration {
    pub node_id: String,
    pub host: String,
    pub port: u16,
    pub agents: Vec<String>,
    pub metadata: Option<HashMap<String, serde_json::Value>>,
}

impl From<AnnouncePayload> for PeerRegistration {
    fn from(announce: AnnouncePayload) -> Self {
        Self {
            node_id: announce.node_id,
            host: announce.host,
            port: announce.port,
            agents: announce.agents,
            metadata: None,
        }
    }
}

/// Aggregate view of the registry.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RegistryStats {
    pub total: usize,
    pub connected: usize,
    pub disconnected: usize,
    /// Distinct agents across connected peers.
    pub total_agents: usize,
}

/// Thread-safe registry of all known peers.
#[derive(Debug, Clone)]
pub struct PeerRegistry {
    peers: Arc<RwLock<HashMap<String, PeerInfo>>>,
    stale_timeout: Duration,
    events: broadcast::Sender<PeerEvent>,
}

impl PeerRegistry {
    /// Create a new empty registry with the default stale timeout (60s).
    pub fn new() -> Self {
        Self::with_stale_timeout(Duration::from_millis(DEFAULT_STALE_TIMEOUT_MS))
    }

    /// Create a new empty registry with a custom stale timeout.
    pub fn with_stale_timeout(stale_timeout: Duration) -> Self {
        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        Self {
            peers: Arc::new(RwLock::new(HashMap::new())),
            stale_timeout,
            events,
        }
    }

    pub fn stale_timeout(&self) -> Duration {
        self.stale_timeout
    }

    /// Subscribe to liveness events.
    pub fn subscribe(&self) -> broadcast::Receiver<PeerEvent> {
        self.events.subscribe()
    }

    fn emit(&self, event: PeerEvent) {
        debug!(event = event.name(), peer = %event.peer().node_id, "Peer event");
        let _ = self.events.send(event);
    }

    /// Register a new peer or refresh a known one.
    ///
    /// Either way the peer ends up connected with `last_seen = now`. A new
    /// peer emits `Joined`; a known one emits `Updated`.
    pub fn register(&self, registration: PeerRegistration) {
        let mut seen = HashSet::new();
        let agents = registration
            .agents
            .into_iter()
            .filter(|a| seen.insert(a.clone()))
            .collect();
        let peer = PeerInfo {
            node_id: registration.node_id,
            host: registration.host,
            port: registration.port,
            status: PeerStatus::Connected,
            last_seen: now_millis(),
            agents,
            metadata: registration.metadata,
        };

        let existed = {
            let mut peers = self.peers.write().unwrap_or_else(|e| e.into_inner());
            peers.insert(peer.node_id.clone(), peer.clone()).is_some()
        };

        if existed {
            self.emit(PeerEvent::Updated(peer));
        } else {
            self.emit(PeerEvent::Joined(peer));
        }
    }

    /// Mark a peer as disconnected (but keep its entry).
    pub fn disconnect(&self, node_id: &str) {
        let snapshot = {
            let mut peers = self.peers.write().unwrap_or_else(|e| e.into_inner());
            peers.get_mut(node_id).map(|peer| {
                peer.status = PeerStatus::Disconnected;
                peer.clone()
            })
        };
        if let Some(peer) = snapshot {
            self.emit(PeerEvent::Left(peer));
        }
    }

    /// Remove a peer entirely.
    pub fn remove(&self, node_id: &str) -> Option<PeerInfo> {
        let removed = {
            let mut peers = self.peers.write().unwrap_or_else(|e| e.into_inner());
            peers.remove(node_id)
        };
        if let Some(peer) = &removed {
            self.emit(PeerEvent::Removed(peer.clone()));
        }
        removed
    }

    /// Record a sign of life: refreshes `last_seen` and marks the peer connected.
    pub fn heartbeat(&self, node_id: &str) {
        let mut peers = self.peers.write().unwrap_or_else(|e| e.into_inner());
        if let Some(peer) = peers.get_mut(node_id) {
            peer.last_seen = now_millis();
            peer.status = PeerStatus::Connected;
        }
    }

    /// Disconnect every connected peer silent for longer than the stale timeout.
    ///
    /// Returns the IDs of the peers that transitioned on this call.
    pub fn prune_stale(&self) -> Vec<String> {
        self.prune_stale_at(now_millis())
    }

    /// [`prune_stale`](Self::prune_stale) against an explicit clock.
    pub fn prune_stale_at(&self, now: i64) -> Vec<String> {
        let timeout = i64::try_from(self.stale_timeout.as_millis()).unwrap_or(i64::MAX);
        let stale: Vec<PeerInfo> = {
            let mut peers = self.peers.write().unwrap_or_else(|e| e.into_inner());
            peers
                .values_mut()
                .filter(|p| p.status == PeerStatus::Connected && now - p.last_seen > timeout)
                .map(|p| {
                    p.status = PeerStatus::Disconnected;
                    p.clone()
                })
                .collect()
        };

        let ids = stale.iter().map(|p| p.node_id.clone()).collect();
        for peer in stale {
            self.emit(PeerEvent::Stale(peer));
        }
        ids
    }

    /// Get a snapshot of a specific peer.
    pub fn get(&self, node_id: &str) -> Option<PeerInfo> {
        let peers = self.peers.read().unwrap_or_else(|e| e.into_inner());
        peers.get(node_id).cloned()
    }

    /// Get all peers regardless of status.
    pub fn get_all(&self) -> Vec<PeerInfo> {
        let peers = self.peers.read().unwrap_or_else(|e| e.into_inner());
        peers.values().cloned().collect()
    }

    /// Get connected peers only.
    pub fn get_connected(&self) -> Vec<PeerInfo> {
        let peers = self.peers.read().unwrap_or_else(|e| e.into_inner());
        peers
            .values()
            .filter(|p| p.status == PeerStatus::Connected)
            .cloned()
            .collect()
    }

    /// Connected peers advertising the given agent.
    pub fn find_peers_with_agent(&self, agent_id: &str) -> Vec<PeerInfo> {
        let peers = self.peers.read().unwrap_or_else(|e| e.into_inner());
        peers
            .values()
            .filter(|p| p.status == PeerStatus::Connected && p.hosts_agent(agent_id))
            .cloned()
            .collect()
    }

    pub fn stats(&self) -> RegistryStats {
        let peers = self.peers.read().unwrap_or_else(|e| e.into_inner());
        let mut stats = RegistryStats {
            total: peers.len(),
            ..RegistryStats::default()
        };
        let mut agents = HashSet::new();
        for peer in peers.values() {
            match peer.status {
                PeerStatus::Connected => {
                    stats.connected += 1;
                    agents.extend(peer.agents.iter().map(String::as_str));
                }
                PeerStatus::Disconnected => stats.disconnected += 1,
                PeerStatus::Unknown => {}
            }
        }
        stats.total_agents = agents.len();
        stats
    }

    pub fn len(&self) -> usize {
        let peers = self.peers.read().unwrap_or_else(|e| e.into_inner());
        peers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Snapshot the whole peer map as JSON.
    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        let mut peers = self.get_all();
        peers.sort_by(|a, b| a.node_id.cmp(&b.node_id));
        serde_json::to_string(&peers)
    }

    /// Load peers from a snapshot.
    ///
    /// Accepts the array written by [`to_json`](Self::to_json) as well as an
    /// array of `[nodeId, peer]` pairs; in the pair form the key wins over
    /// the entry's own `nodeId`.
    ///
    /// Restored peers are always `Unknown`: liveness from a previous process
    /// must be reconfirmed by a heartbeat or announce. No events are emitted.
    pub fn restore(&self, data: &str) -> Result<usize, serde_json::Error> {
        let entries: Vec<SnapshotEntry> = serde_json::from_str(data)?;
        let count = entries.len();
        let mut peers = self.peers.write().unwrap_or_else(|e| e.into_inner());
        for entry in entries {
            let mut peer = match entry {
                SnapshotEntry::Peer(peer) => peer,
                SnapshotEntry::Keyed(node_id, mut peer) => {
                    peer.node_id = node_id;
                    peer
                }
            };
            peer.status = PeerStatus::Unknown;
            peers.insert(peer.node_id.clone(), peer);
        }
        Ok(count)
    }
}

/// One element of a registry snapshot.
#[derive(Deserialize)]
#[serde(untagged)]
enum SnapshotEntry {
    Peer(PeerInfo),
    Keyed(String, PeerInfo),
}

impl Default for PeerRegistry {
    fn default() -> Self {
        Self::new()
    }
}
