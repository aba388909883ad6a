use std::sync::{Arc, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};

use chrono::Utc;
use serde::{Deserialize, Serialize};

/// A node cell shared between the registry, the supervisor and the monitor.
/// The `Arc` is the node's identity: merges mutate in place, so anything
/// holding a clone keeps observing the same node across updates.
pub type SharedNode = Arc<RwLock<Node>>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NodeState {
    New,
    Alive,
    Dead,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConnectionState {
    Opening,
    Open,
    Closing,
    Closed,
}

/// One cluster member as observed by this client.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Node {
    pub address: String,
    pub ip: String,
    pub port: u16,
    pub node_state: NodeState,
    pub connection_state: ConnectionState,
    /// Milliseconds since UNIX_EPOCH.
    pub created_at: i64,
    /// Timestamp of the most recent inbound message attributed to this node.
    pub last_update: i64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub dead_since: Option<i64>,
    pub is_leader: bool,
    pub used: Option<f64>,
    pub available: Option<f64>,
}

impl Node {
    pub fn from_update(address: String, update: &NodeUpdate, now: i64) -> Node {
        let (split_ip, split_port) = split_address(&address);
        Node {
            ip: update.ip.clone().unwrap_or(split_ip),
            port: update.port.unwrap_or(split_port),
            address,
            node_state: NodeState::New,
            connection_state: ConnectionState::Closed,
            created_at: now,
            last_update: now,
            dead_since: None,
            is_leader: update.is_leader.unwrap_or(false),
            used: update.used,
            available: update.available,
        }
    }

    /// Merge wire attributes into this node and stamp `last_update`.
    pub fn merge(&mut self, update: &NodeUpdate, now: i64) {
        if let Some(ip) = &update.ip {
            self.ip = ip.clone();
        }
        if let Some(port) = update.port {
            self.port = port;
        }
        if let Some(is_leader) = update.is_leader {
            self.is_leader = is_leader;
        }
        if let Some(used) = update.used {
            self.used = Some(used);
        }
        if let Some(available) = update.available {
            self.available = Some(available);
        }
        self.last_update = now;
    }
}

/// Partial node attributes as they arrive on the wire. Peers send extra
/// fields this client never consumes, so unknown keys are ignored.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NodeUpdate {
    pub address: Option<String>,
    pub ip: Option<String>,
    pub port: Option<u16>,
    pub is_leader: Option<bool>,
    pub used: Option<f64>,
    pub available: Option<f64>,
}

impl NodeUpdate {
    /// Canonical `"ip:port"` key, either given directly or derived.
    pub fn address(&self) -> Option<String> {
        match (&self.address, &self.ip, self.port) {
            (Some(address), _, _) => Some(address.clone()),
            (None, Some(ip), Some(port)) => Some(format!("{ip}:{port}")),
            _ => None,
        }
    }
}

pub fn split_address(address: &str) -> (String, u16) {
    match address.rsplit_once(':') {
        Some((ip, port)) => (ip.to_string(), port.parse().unwrap_or(0)),
        None => (address.to_string(), 0),
    }
}

pub fn now_millis() -> i64 {
    Utc::now().timestamp_millis()
}

pub fn read_node(node: &SharedNode) -> RwLockReadGuard<'_, Node> {
    node.read().unwrap_or_else(PoisonError::into_inner)
}

pub fn write_node(node: &SharedNode) -> RwLockWriteGuard<'_, Node> {
    node.write().unwrap_or_else(PoisonError::into_inner)
}
