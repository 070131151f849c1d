//! Latest-topology repository

use meshlink_proto::{NetMap, PeerNode, SelfNode};
use std::sync::{Arc, RwLock};
use tracing::{debug, warn};

/// Holds the most recently committed [`NetMap`] snapshot.
///
/// Snapshots are swapped whole; readers take a clone of the `Arc` and never
/// observe a half-applied update.
#[derive(Debug, Default)]
pub struct NetMapRepository {
    current: RwLock<Option<Arc<NetMap>>>,
}

impl NetMapRepository {
    pub fn new() -> Self {
        Self::default()
    }

    /// Decode and commit a serialized snapshot.
    ///
    /// Returns the committed snapshot. A malformed payload is dropped and
    /// the previous snapshot stays in place.
    pub fn apply(&self, payload: &str) -> Option<Arc<NetMap>> {
        match NetMap::from_json(payload) {
            Ok(netmap) => {
                debug!(
                    "Committing network map: self={} peers={} locked_out={}",
                    netmap.self_node.node.name,
                    netmap.peers.len(),
                    netmap.locked_out
                );
                let netmap = Arc::new(netmap);
                self.replace(netmap.clone());
                Some(netmap)
            }
            Err(e) => {
                warn!("Dropping malformed network map: {}", e);
                None
            }
        }
    }

    pub fn replace(&self, netmap: Arc<NetMap>) {
        *self.current.write().unwrap_or_else(|e| e.into_inner()) = Some(netmap);
    }

    /// Current snapshot, if one was ever received
    pub fn snapshot(&self) -> Option<Arc<NetMap>> {
        self.current
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    pub fn get_self(&self) -> Option<SelfNode> {
        self.snapshot().map(|netmap| netmap.self_node.clone())
    }

    /// Peers in delivery order; empty before the first snapshot
    pub fn get_peers(&self) -> Vec<PeerNode> {
        self.snapshot()
            .map(|netmap| netmap.peers.clone())
            .unwrap_or_default()
    }

    pub fn is_locked_out(&self) -> bool {
        self.snapshot().is_some_and(|netmap| netmap.locked_out)
    }
}
