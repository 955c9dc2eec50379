//! Relay-side persistent commit storage.
//!
//! Architecture:
//! ```text
//! ┌──────────────┐   add(batch)    ┌──────────────────┐
//! │ DocumentRelay│ ──────────────► │ dyn DocStore     │
//! │ (per doc)    │ ◄────────────── │  plan_batch()    │
//! └──────────────┘  acks/refErrors └────────┬─────────┘
//!                                           │ one atomic write
//!                         ┌─────────────────┴─────────────────┐
//!                         ▼                                   ▼
//!                 ┌───────────────┐              ┌──────────────────────┐
//!                 │ MemoryDocStore│              │ RocksDocStore        │
//!                 │ (tests)       │              │ CF "commits"         │
//!                 └───────────────┘              │ CF "sync_log"        │
//!                                                │ CF "metadata"        │
//!                                                └──────────────────────┘
//! ```
//!
//! Every backend shares the acceptance rules in [`batch`]: the whole batch
//! is decided in memory, then persisted in one write.

pub mod batch;
pub mod memory;
pub mod rocks;

use std::collections::BTreeMap;
use std::path::PathBuf;

use thiserror::Error;

use crate::commit::{AckCommit, Commit, RefError, SyncId};
use crate::protocol::{commit_frames, SyncEvent};

pub use batch::{plan_batch, reject_all, BatchPlan, DocHead};
pub use memory::{MemoryDocStore, MemoryStoreFactory};
pub use rocks::{RocksDocStore, RocksStoreFactory};

/// Storage errors.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum StoreError {
    #[error("database error: {0}")]
    Database(String),
    #[error("serialization error: {0}")]
    Serialization(String),
    #[error("deserialization error: {0}")]
    Deserialization(String),
    #[error("compression error: {0}")]
    Compression(String),
    #[error("store for {0} is closed")]
    Closed(String),
}

impl From<rocksdb::Error> for StoreError {
    fn from(e: rocksdb::Error) -> Self {
        StoreError::Database(e.to_string())
    }
}

/// RocksDB tuning.
#[derive(Debug, Clone)]
pub struct StoreConfig {
    /// Database directory path
    pub path: PathBuf,
    /// Block cache size in bytes (default: 256MB)
    pub block_cache_size: usize,
    /// Bloom filter bits per key (default: 10)
    pub bloom_filter_bits: i32,
    /// fsync every batch write (default: true, acks are promises)
    pub sync_writes: bool,
    /// Max open files for RocksDB (default: 512)
    pub max_open_files: i32,
    /// Write buffer size per column family (default: 64MB)
    pub write_buffer_size: usize,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            path: PathBuf::from("replica_data"),
            block_cache_size: 256 * 1024 * 1024,
            bloom_filter_bits: 10,
            sync_writes: true,
            max_open_files: 512,
            write_buffer_size: 64 * 1024 * 1024,
        }
    }
}

impl StoreConfig {
    /// Small caches, no fsync.
    pub fn for_testing(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            block_cache_size: 8 * 1024 * 1024,
            bloom_filter_bits: 10,
            sync_writes: false,
            max_open_files: 64,
            write_buffer_size: 4 * 1024 * 1024,
        }
    }
}

/// One page of history, in `(syncId, syncIndex)` order.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct CommitsPage {
    pub commits: Vec<Commit>,
    /// SyncId of the last returned commit, or the latest one when caught up.
    pub sync_id: Option<SyncId>,
    pub has_more: bool,
}

impl CommitsPage {
    /// `commits` events of at most `budget` bytes each.
    pub fn into_frames(self, budget: usize) -> Vec<SyncEvent> {
        commit_frames(self.commits, self.sync_id, budget)
    }
}

/// Outcome of [`DocStore::add`].
#[derive(Debug, Clone, Default, PartialEq)]
pub struct AddResult {
    pub acks: Vec<AckCommit>,
    pub ref_errors: BTreeMap<String, RefError>,
    /// Set when at least one commit was newly accepted.
    pub sync_id: Option<SyncId>,
    /// Newly accepted commits with their server metadata, in syncIndex order.
    pub accepted: Vec<Commit>,
}

impl AddResult {
    /// The `ack` event for the submitting connection.
    pub fn ack_event(&self) -> SyncEvent {
        SyncEvent::Ack {
            acks: self.acks.clone(),
            ref_errors: self.ref_errors.clone(),
            sync_id: self.sync_id,
        }
    }

    /// The `commits` events for sibling connections; empty if nothing was accepted.
    pub fn broadcast_frames(&self, budget: usize) -> Vec<SyncEvent> {
        if self.accepted.is_empty() {
            return Vec::new();
        }
        commit_frames(self.accepted.clone(), self.sync_id, budget)
    }
}

/// Append-only commit log of one document.
pub trait DocStore: Send {
    fn doc_id(&self) -> &str;

    /// Commits with syncId strictly greater than `since`.
    ///
    /// A page stops at the first syncId boundary at or after `limit`
    /// commits, so resuming from its `sync_id` never skips a commit.
    fn get_commits_event(&self, since: Option<SyncId>, limit: usize) -> Result<CommitsPage, StoreError>;

    /// Decides and persists a batch. Per-commit failures land in `ref_errors`.
    fn add(&mut self, commits: &[Commit]) -> Result<AddResult, StoreError>;

    /// Current main-branch head.
    fn head(&self) -> Result<Option<String>, StoreError>;

    fn commit_count(&self) -> Result<u64, StoreError>;

    /// Removes every record of the document.
    fn delete(&mut self) -> Result<(), StoreError>;

    fn close(&mut self) -> Result<(), StoreError>;
}

/// Opens per-document stores.
pub trait DocStoreFactory: Send + Sync {
    fn open(&self, doc_id: &str) -> Result<Box<dyn DocStore>, StoreError>;
}

/// Collects one page from `(syncId, commit)` entries in log order.
pub(crate) fn collect_page<I>(
    entries: I,
    limit: usize,
    latest: Option<SyncId>,
) -> Result<CommitsPage, StoreError>
where
    I: Iterator<Item = Result<(SyncId, Commit), StoreError>>,
{
    let mut page = CommitsPage::default();
    let mut entries = entries.peekable();
    while let Some(entry) = entries.next() {
        let (sync_id, commit) = entry?;
        page.commits.push(commit);
        page.sync_id = Some(sync_id);
        if page.commits.len() < limit.max(1) {
            continue;
        }
        match entries.peek() {
            Some(Ok((next, _))) if *next == sync_id => {}
            Some(_) => {
                page.has_more = true;
                break;
            }
            None => break,
        }
    }
    if page.commits.is_empty() {
        page.sync_id = latest;
    }
    Ok(page)
}
