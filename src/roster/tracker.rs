//! Roster Tracker
//!
//! Der Relay schickt bei jeder Änderung einen vollständigen Snapshot
//! (`user-list`), keinen Diff. Der zuletzt empfangene Snapshot gilt.

use crate::identity::default_display_name;
use crate::signaling::{Peer, PeerId};
use std::collections::HashMap;

/// Bekannte Peers, ohne den eigenen Client
#[derive(Debug, Clone)]
pub struct RosterTracker {
    local_id: PeerId,
    peers: HashMap<PeerId, Peer>,
}

impl RosterTracker {
    pub fn new(local_id: PeerId) -> Self {
        Self {
            local_id,
            peers: HashMap::new(),
        }
    }

    /// Ersetzt den Roster durch einen neuen Snapshot
    ///
    /// Defekte Einträge werden verworfen. Gibt den neuen Roster zurück.
    pub fn apply_snapshot(&mut self, entries: Vec<serde_json::Value>) -> Vec<Peer> {
        let mut peers = HashMap::with_capacity(entries.len());
        for entry in entries {
            let mut peer: Peer = match serde_json::from_value(entry) {
                Ok(peer) => peer,
                Err(e) => {
                    tracing::warn!("Dropping malformed roster entry: {}", e);
                    continue;
                }
            };
            if peer.id.is_empty() {
                tracing::warn!("Dropping roster entry without client id");
                continue;
            }
            if peer.id == self.local_id {
                continue;
            }
            if peer.name.trim().is_empty() {
                peer.name = default_display_name(&peer.id);
            }
            peers.insert(peer.id.clone(), peer);
        }

        tracing::debug!("Roster updated: {} peers", peers.len());
        self.peers = peers;
        self.peers()
    }

    /// Aktueller Roster, nach ID sortiert
    pub fn peers(&self) -> Vec<Peer> {
        let mut peers: Vec<Peer> = self.peers.values().cloned().collect();
        peers.sort_by(|a, b| a.id.cmp(&b.id));
        peers
    }

    pub fn get(&self, id: &PeerId) -> Option<&Peer> {
        self.peers.get(id)
    }

    pub fn display_name(&self, id: &PeerId) -> Option<&str> {
        self.peers.get(id).map(|p| p.name.as_str())
    }

    pub fn len(&self) -> usize {
        self.peers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.peers.is_empty()
    }
}
