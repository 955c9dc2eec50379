//! Client-side commit persistence.
//!
//! A [`CommitRepository`] holds every commit a coordinator knows about.
//! A commit counts as acknowledged once relay metadata has been folded into
//! it, so resending "everything unacknowledged" after a reconnect is a
//! query, not extra bookkeeping.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use crate::commit::{AckCommit, Commit, SyncId};
use crate::error::SyncError;
use crate::metadata;

pub trait CommitRepository: Send {
    /// Every stored commit, parents before children.
    fn load(&mut self) -> Result<Vec<Commit>, SyncError>;

    /// Stores commits; already-known refs are skipped.
    fn add_commits(&mut self, commits: &[Commit]) -> Result<(), SyncError>;

    /// Folds relay metadata into stored commits.
    ///
    /// Leaves the cursor alone: an `ack` may overtake sibling commits with
    /// lower syncIds that have not been delivered yet.
    fn acknowledge(&mut self, acks: &[AckCommit]) -> Result<(), SyncError>;

    /// Commits without relay metadata, in storage order.
    fn unacknowledged(&mut self) -> Result<Vec<Commit>, SyncError>;

    /// SyncId up to which every relay commit is held locally.
    fn last_sync_id(&self) -> Option<SyncId>;

    /// Records a cursor delivered with a `commits` event.
    fn set_last_sync_id(&mut self, sync_id: SyncId) -> Result<(), SyncError>;

    fn close(&mut self) -> Result<(), SyncError>;
}

#[derive(Debug, Default)]
struct RepoState {
    order: Vec<String>,
    commits: HashMap<String, Commit>,
    last_sync_id: Option<SyncId>,
    closed: bool,
}

impl RepoState {
    fn check_open(&self) -> Result<(), SyncError> {
        if self.closed {
            Err(SyncError::Repository("repository is closed".into()))
        } else {
            Ok(())
        }
    }
}

/// In-memory repository. Clones share state, so a test can "reopen" it by
/// handing a clone to a fresh coordinator.
#[derive(Debug, Clone, Default)]
pub struct MemoryRepository {
    state: Arc<Mutex<RepoState>>,
}

impl MemoryRepository {
    pub fn new() -> Self {
        Self::default()
    }

    /// Clears the closed flag so the same storage can be reused.
    pub fn reopen(&self) -> Self {
        if let Ok(mut state) = self.state.lock() {
            state.closed = false;
        }
        self.clone()
    }

    pub fn len(&self) -> usize {
        self.state.lock().map(|s| s.order.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn with_state<T>(&self, f: impl FnOnce(&mut RepoState) -> Result<T, SyncError>) -> Result<T, SyncError> {
        let mut state = self
            .state
            .lock()
            .map_err(|_| SyncError::Repository("repository lock poisoned".into()))?;
        f(&mut state)
    }
}

impl CommitRepository for MemoryRepository {
    fn load(&mut self) -> Result<Vec<Commit>, SyncError> {
        self.with_state(|state| {
            state.check_open()?;
            Ok(state
                .order
                .iter()
                .filter_map(|r| state.commits.get(r).cloned())
                .collect())
        })
    }

    fn add_commits(&mut self, commits: &[Commit]) -> Result<(), SyncError> {
        self.with_state(|state| {
            state.check_open()?;
            for commit in commits {
                if state.commits.contains_key(&commit.ref_id) {
                    continue;
                }
                state.order.push(commit.ref_id.clone());
                state.commits.insert(commit.ref_id.clone(), commit.clone());
            }
            Ok(())
        })
    }

    fn acknowledge(&mut self, acks: &[AckCommit]) -> Result<(), SyncError> {
        self.with_state(|state| {
            state.check_open()?;
            for ack in acks {
                if let Some(commit) = state.commits.get_mut(&ack.ref_id) {
                    commit.metadata = metadata::merge_json(&commit.metadata, &ack.metadata);
                }
            }
            Ok(())
        })
    }

    fn unacknowledged(&mut self) -> Result<Vec<Commit>, SyncError> {
        self.with_state(|state| {
            state.check_open()?;
            Ok(state
                .order
                .iter()
                .filter_map(|r| state.commits.get(r))
                .filter(|c| c.server_metadata().is_none())
                .cloned()
                .collect())
        })
    }

    fn last_sync_id(&self) -> Option<SyncId> {
        self.state.lock().ok().and_then(|s| s.last_sync_id)
    }

    fn set_last_sync_id(&mut self, sync_id: SyncId) -> Result<(), SyncError> {
        self.with_state(|state| {
            state.last_sync_id = state.last_sync_id.max(Some(sync_id));
            Ok(())
        })
    }

    fn close(&mut self) -> Result<(), SyncError> {
        self.with_state(|state| {
            state.closed = true;
            Ok(())
        })
    }
}
