//! Ephemeral presence of the other sessions editing a document.
//!
//! ```text
//! update_presence()                      client-join / client-presence
//!       │                                           │
//!       ▼                                           ▼
//! set_local() + announce()             PresenceRoom::handle_event()
//!       │                                           │
//!       ▼                                           ▼
//! client-join (first) / client-presence   clients() ─► subscribers
//! ```
//!
//! Presence is never persisted. The map is last-writer-wins keyed by
//! `clientId`.

use std::collections::BTreeMap;

use serde_json::Value;

use crate::protocol::{ClientInfo, SyncEvent};

/// Presence of every known session of one document, including our own.
#[derive(Debug, Clone)]
pub struct PresenceRoom {
    local: ClientInfo,
    /// Whether the local session has announced itself on the current connection.
    joined: bool,
    /// Remote sessions keyed by client id.
    peers: BTreeMap<String, ClientInfo>,
}

impl PresenceRoom {
    pub fn new(user_id: impl Into<String>, client_id: impl Into<String>) -> Self {
        Self {
            local: ClientInfo {
                user_id: user_id.into(),
                client_id: client_id.into(),
                presence: None,
            },
            joined: false,
            peers: BTreeMap::new(),
        }
    }

    pub fn local(&self) -> &ClientInfo {
        &self.local
    }

    /// Applies a presence event from a sibling session.
    ///
    /// Returns whether the visible client list changed. Events about our
    /// own client id and non-presence events are ignored.
    pub fn handle_event(&mut self, event: &SyncEvent) -> bool {
        match event {
            SyncEvent::ClientJoin { info } | SyncEvent::ClientPresence { info } => {
                if info.client_id == self.local.client_id {
                    return false;
                }
                let previous = self.peers.insert(info.client_id.clone(), info.clone());
                previous.as_ref() != Some(info)
            }
            SyncEvent::ClientLeave { client_id, .. } => {
                if *client_id == self.local.client_id {
                    return false;
                }
                self.peers.remove(client_id).is_some()
            }
            _ => false,
        }
    }

    /// Stores new local presence; call [`announce`](Self::announce) to publish it.
    pub fn set_local(&mut self, presence: Value) {
        self.local.presence = Some(presence);
    }

    /// `client-join` the first time on a connection, `client-presence` after.
    pub fn announce(&mut self) -> SyncEvent {
        let info = self.local.clone();
        if self.joined {
            SyncEvent::ClientPresence { info }
        } else {
            self.joined = true;
            SyncEvent::ClientJoin { info }
        }
    }

    pub fn leave_event(&self) -> SyncEvent {
        SyncEvent::ClientLeave {
            user_id: self.local.user_id.clone(),
            client_id: self.local.client_id.clone(),
        }
    }

    pub fn is_joined(&self) -> bool {
        self.joined
    }

    pub fn has_local_presence(&self) -> bool {
        self.local.presence.is_some()
    }

    /// Forgets every remote session and the join state, e.g. after a disconnect.
    pub fn reset(&mut self) -> bool {
        self.joined = false;
        let changed = !self.peers.is_empty();
        self.peers.clear();
        changed
    }

    /// Every known session, ours first, then remote ones by client id.
    pub fn clients(&self) -> Vec<ClientInfo> {
        std::iter::once(self.local.clone())
            .chain(self.peers.values().cloned())
            .collect()
    }

    pub fn peer(&self, client_id: &str) -> Option<&ClientInfo> {
        self.peers.get(client_id)
    }

    pub fn peer_count(&self) -> usize {
        self.peers.len()
    }
}
