//! Network map snapshot types
//!
//! A [`NetMap`] describes the local node and every visible peer at one point
//! in time. Snapshots are immutable: a topology change produces a new one.

use crate::state::MachineStatus;
use serde::{Deserialize, Serialize};

/// Identity fields shared by the self node and peers
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "camelCase")]
pub struct NetMapNode {
    /// Display name, usually a fully qualified DNS name with a trailing dot
    pub name: String,
    /// Overlay addresses in the order the control plane assigned them
    pub addresses: Vec<String>,
    /// Long-lived machine identity
    pub machine_key: String,
    /// Node identity, rotates on re-authentication
    pub node_key: String,
}

impl NetMapNode {
    /// First DNS label of the node name (`"peer-1"` for `"peer-1.mesh.example."`)
    pub fn short_name(&self) -> &str {
        self.name.split('.').next().unwrap_or_default()
    }

    fn matches_host(&self, host: &str) -> bool {
        let host = host.trim_end_matches('.');
        if host.is_empty() {
            return false;
        }
        self.name.trim_end_matches('.') == host
            || self.short_name() == host
            || self.addresses.iter().any(|addr| addr == host)
    }
}

/// The local node
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "camelCase")]
pub struct SelfNode {
    #[serde(flatten)]
    pub node: NetMapNode,
    pub machine_status: MachineStatus,
}

/// A remote node visible in the network map
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "camelCase")]
pub struct PeerNode {
    #[serde(flatten)]
    pub node: NetMapNode,
    /// `None` when the control plane has not reported liveness
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub online: Option<bool>,
    /// Whether the peer accepts remote shell sessions over the overlay
    #[serde(rename = "tailscaleSSHEnabled", default)]
    pub ssh_enabled: bool,
}

/// Topology snapshot
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "camelCase")]
pub struct NetMap {
    #[serde(rename = "self")]
    pub self_node: SelfNode,
    #[serde(default)]
    pub peers: Vec<PeerNode>,
    /// The node key has been revoked; no traffic may be sent
    #[serde(default)]
    pub locked_out: bool,
}

impl NetMap {
    /// Decode the serialized form delivered by a backend
    pub fn from_json(json: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(json)
    }

    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }

    /// Resolve a host string to a peer.
    ///
    /// Matches the full name (with or without the trailing dot), the first
    /// DNS label, or any overlay address. The first matching peer wins.
    pub fn find_peer(&self, host: &str) -> Option<&PeerNode> {
        self.peers.iter().find(|peer| peer.node.matches_host(host))
    }
}
