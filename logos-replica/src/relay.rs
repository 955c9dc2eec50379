//! Per-document relay state and fan-out.
//!
//! Every document with at least one open connection has one
//! [`DocumentRelay`]: its [`DocStore`], a tokio broadcast channel shared by
//! all of its connections, and the set of connections. Store appends and
//! broadcasts happen under the document's store lock, so all connections
//! observe accepted batches in syncId order.
//!
//! Each connection gets an independent receiver that buffers up to
//! `capacity` messages; a receiver that falls further behind is lagged and
//! must be disconnected by its owner. Accepted batches are relayed as
//! frames of at most `frame_budget` bytes.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use tokio::sync::{broadcast, Mutex, RwLock};
use uuid::Uuid;

use crate::commit::{Commit, SyncId};
use crate::protocol::{SyncEvent, MAX_PAYLOAD_BYTES};
use crate::storage::{AddResult, CommitsPage, DocStore, DocStoreFactory, StoreError};

/// Who should not receive a relayed message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Exclude {
    /// Only the originating connection (presence).
    Connection(Uuid),
    /// Every connection of the originating user's local store (commits).
    LocalStore { user_id: String, local_store_id: String },
}

/// Pre-encoded frames fanned out to a document's connections.
#[derive(Debug, Clone)]
pub struct RelayMessage {
    pub exclude: Exclude,
    /// Written in order; one accepted batch may span several frames.
    pub frames: Vec<String>,
}

impl RelayMessage {
    pub fn is_for(&self, connection: Uuid, peer: Option<&PeerInfo>) -> bool {
        match &self.exclude {
            Exclude::Connection(id) => *id != connection,
            Exclude::LocalStore {
                user_id,
                local_store_id,
            } => peer.map_or(true, |p| {
                p.user_id != *user_id || p.local_store_id != *local_store_id
            }),
        }
    }
}

/// An authenticated connection of a document.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PeerInfo {
    pub user_id: String,
    pub local_store_id: String,
}

/// Statistics for monitoring relay health.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RelayStats {
    pub messages_sent: u64,
    pub batches_accepted: u64,
    pub active_connections: usize,
}

/// Atomic counters, so the broadcast path never takes a lock for stats.
#[derive(Default)]
struct AtomicRelayStats {
    messages_sent: AtomicU64,
    batches_accepted: AtomicU64,
}

pub struct DocumentRelay {
    doc_id: String,
    store: Mutex<Box<dyn DocStore>>,
    sender: broadcast::Sender<Arc<RelayMessage>>,
    /// Open connections; `None` until the connection authenticates.
    connections: RwLock<HashMap<Uuid, Option<PeerInfo>>>,
    capacity: usize,
    frame_budget: usize,
    stats: AtomicRelayStats,
}

impl DocumentRelay {
    pub fn new(doc_id: impl Into<String>, store: Box<dyn DocStore>, capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self {
            doc_id: doc_id.into(),
            store: Mutex::new(store),
            sender,
            connections: RwLock::new(HashMap::new()),
            capacity,
            frame_budget: MAX_PAYLOAD_BYTES,
            stats: AtomicRelayStats::default(),
        }
    }

    /// Caps the encoded size of relayed `commits` frames.
    pub fn with_frame_budget(mut self, frame_budget: usize) -> Self {
        self.frame_budget = frame_budget;
        self
    }

    pub fn doc_id(&self) -> &str {
        &self.doc_id
    }

    pub fn frame_budget(&self) -> usize {
        self.frame_budget
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    async fn join(&self, connection: Uuid) {
        self.connections.write().await.insert(connection, None);
    }

    /// Removes a connection; returns how many remain.
    async fn leave(&self, connection: &Uuid) -> usize {
        let mut connections = self.connections.write().await;
        connections.remove(connection);
        connections.len()
    }

    /// Marks `connection` authenticated, reads its backlog and subscribes it.
    ///
    /// Both happen under the store lock: a batch accepted concurrently is
    /// either in the backlog or in the receiver, never both or neither.
    pub async fn subscribe(
        &self,
        connection: Uuid,
        peer: PeerInfo,
        since: Option<SyncId>,
        page_size: usize,
    ) -> Result<(Vec<CommitsPage>, broadcast::Receiver<Arc<RelayMessage>>), StoreError> {
        let store = self.store.lock().await;
        let mut pages = Vec::new();
        let mut cursor = since;
        loop {
            let page = store.get_commits_event(cursor, page_size)?;
            if page.commits.is_empty() {
                break;
            }
            cursor = page.sync_id;
            let has_more = page.has_more;
            pages.push(page);
            if !has_more {
                break;
            }
        }
        let receiver = self.sender.subscribe();
        self.connections.write().await.insert(connection, Some(peer));
        Ok((pages, receiver))
    }

    /// Appends a batch and fans accepted commits out to every other local store.
    pub async fn submit(&self, peer: &PeerInfo, commits: &[Commit]) -> Result<AddResult, StoreError> {
        let mut store = self.store.lock().await;
        let result = store.add(commits)?;
        let frames = result.broadcast_frames(self.frame_budget);
        if !frames.is_empty() {
            self.stats.batches_accepted.fetch_add(1, Ordering::Relaxed);
            self.broadcast(
                Exclude::LocalStore {
                    user_id: peer.user_id.clone(),
                    local_store_id: peer.local_store_id.clone(),
                },
                &frames,
            );
        }
        Ok(result)
    }

    /// Fans an event out to every connection but `from`.
    pub fn relay_from(&self, from: Uuid, event: &SyncEvent) -> usize {
        self.broadcast(Exclude::Connection(from), std::slice::from_ref(event))
    }

    fn broadcast(&self, exclude: Exclude, events: &[SyncEvent]) -> usize {
        let mut frames = Vec::with_capacity(events.len());
        for event in events {
            match event.encode() {
                Ok(text) => frames.push(text),
                Err(e) => {
                    log::error!("not relaying {} on {}: {e}", event.kind(), self.doc_id);
                    return 0;
                }
            }
        }
        self.stats.messages_sent.fetch_add(1, Ordering::Relaxed);
        self.sender
            .send(Arc::new(RelayMessage { exclude, frames }))
            .unwrap_or(0)
    }

    pub async fn head(&self) -> Result<Option<String>, StoreError> {
        self.store.lock().await.head()
    }

    pub async fn commit_count(&self) -> Result<u64, StoreError> {
        self.store.lock().await.commit_count()
    }

    pub async fn connection_count(&self) -> usize {
        self.connections.read().await.len()
    }

    pub async fn stats(&self) -> RelayStats {
        RelayStats {
            messages_sent: self.stats.messages_sent.load(Ordering::Relaxed),
            batches_accepted: self.stats.batches_accepted.load(Ordering::Relaxed),
            active_connections: self.connection_count().await,
        }
    }

    async fn close_store(&self) {
        if let Err(e) = self.store.lock().await.close() {
            log::warn!("closing store of {} failed: {e}", self.doc_id);
        }
    }
}

/// Maps document ids to live relays.
///
/// A relay is created with the first connection of its document and
/// evicted, store closed, when its last connection leaves.
pub struct RelayRegistry {
    relays: RwLock<HashMap<String, Arc<DocumentRelay>>>,
    factory: Arc<dyn DocStoreFactory>,
    capacity: usize,
    frame_budget: usize,
}

impl RelayRegistry {
    pub fn new(factory: Arc<dyn DocStoreFactory>, capacity: usize) -> Self {
        Self {
            relays: RwLock::new(HashMap::new()),
            factory,
            capacity,
            frame_budget: MAX_PAYLOAD_BYTES,
        }
    }

    /// Frame budget handed to every relay this registry opens.
    pub fn with_frame_budget(mut self, frame_budget: usize) -> Self {
        self.frame_budget = frame_budget;
        self
    }

    /// Registers `connection` with the relay of `doc_id`, opening it if needed.
    pub async fn join(&self, doc_id: &str, connection: Uuid) -> Result<Arc<DocumentRelay>, StoreError> {
        let mut relays = self.relays.write().await;
        let relay = match relays.get(doc_id) {
            Some(relay) => Arc::clone(relay),
            None => {
                let store = self.factory.open(doc_id)?;
                let relay = Arc::new(
                    DocumentRelay::new(doc_id, store, self.capacity).with_frame_budget(self.frame_budget),
                );
                relays.insert(doc_id.to_string(), Arc::clone(&relay));
                log::info!("relay for {doc_id} opened");
                relay
            }
        };
        relay.join(connection).await;
        Ok(relay)
    }

    /// Unregisters `connection`; evicts the relay if it was the last one.
    ///
    /// Returns whether the relay was evicted.
    pub async fn release(&self, doc_id: &str, connection: &Uuid) -> bool {
        let mut relays = self.relays.write().await;
        let Some(relay) = relays.get(doc_id).cloned() else {
            return false;
        };
        if relay.leave(connection).await > 0 {
            return false;
        }
        relays.remove(doc_id);
        relay.close_store().await;
        log::info!("relay for {doc_id} evicted (no connections)");
        true
    }

    pub async fn get(&self, doc_id: &str) -> Option<Arc<DocumentRelay>> {
        self.relays.read().await.get(doc_id).cloned()
    }

    pub async fn relay_count(&self) -> usize {
        self.relays.read().await.len()
    }

    pub async fn active_documents(&self) -> Vec<String> {
        let mut docs: Vec<String> = self.relays.read().await.keys().cloned().collect();
        docs.sort();
        docs
    }
}
