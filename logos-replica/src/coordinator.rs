//! Client-side orchestrator for one (document, user, client) session.
//!
//! ```text
//! edit_document() ──► CommitGraph ──► pending ──(debounce)──► flush()
//!                                                      │
//!                                       ┌──────────────┴───────────┐
//!                                       ▼                          ▼
//!                              CommitRepository              Remote (commits)
//!
//! Remote events ──► apply_remote_event() ──► graph insert ──► MergeEngine
//!                                                   │
//!                                                   ▼
//!                                  subscribers (doc / clients / sync status)
//! ```
//!
//! All mutable state sits behind one lock. Subscribers are notified after
//! the lock is released.

use std::sync::{Arc, Mutex, MutexGuard, Weak};
use std::time::Duration;

use serde_json::Value;
use tokio::runtime::Handle;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use crate::commit::{AckCommit, Commit, RefError, Snapshot, SyncId};
use crate::delta;
use crate::error::{ErrorCode, SyncError};
use crate::graph::CommitGraph;
use crate::hash::RefScheme;
use crate::merge::{MergeEngine, MergeFn};
use crate::metadata;
use crate::presence::PresenceRoom;
use crate::protocol::{
    commit_frames, ClientInfo, ConnectState, ErrorInfo, ReadState, SaveState, SyncEvent, SyncStatus,
    MAX_PAYLOAD_BYTES,
};
use crate::repository::CommitRepository;
use crate::subscription::{Subscribers, Subscription};

/// Coordinator configuration.
#[derive(Debug, Clone)]
pub struct CoordinatorConfig {
    pub doc_id: String,
    pub user_id: String,
    pub client_id: String,
    /// Identifies the local store; the relay skips echoing to the same user+store.
    pub local_store_id: String,
    /// Debounce window for outgoing batches.
    pub flush_delay: Duration,
    pub scheme: RefScheme,
    /// Outgoing `commits` events are split to stay under this many bytes.
    pub max_frame_bytes: usize,
}

impl CoordinatorConfig {
    pub fn new(
        doc_id: impl Into<String>,
        user_id: impl Into<String>,
        client_id: impl Into<String>,
    ) -> Self {
        let client_id = client_id.into();
        Self {
            doc_id: doc_id.into(),
            user_id: user_id.into(),
            local_store_id: client_id.clone(),
            client_id,
            flush_delay: Duration::from_millis(100),
            scheme: RefScheme::default(),
            max_frame_bytes: MAX_PAYLOAD_BYTES,
        }
    }

    /// Short debounce for tests.
    pub fn for_testing(doc_id: &str, user_id: &str, client_id: &str) -> Self {
        Self {
            flush_delay: Duration::from_millis(10),
            ..Self::new(doc_id, user_id, client_id)
        }
    }
}

/// What a [`RemoteConnector`] needs to open a session.
#[derive(Debug, Clone, PartialEq)]
pub struct RemoteParams {
    pub doc_id: String,
    pub user_id: String,
    pub client_id: String,
    pub local_store_id: String,
    pub last_sync_cursor: Option<SyncId>,
}

/// An open connection to a relay.
///
/// `send` must not block; implementations queue and write in the background.
pub trait Remote: Send {
    fn send(&self, event: SyncEvent) -> Result<(), SyncError>;
    fn shutdown(&self);
}

/// Opens [`Remote`]s. Incoming events, including synthesized
/// `remote-state` changes, are delivered on `events`.
pub trait RemoteConnector: Send + Sync {
    fn connect(
        &self,
        params: RemoteParams,
        events: mpsc::UnboundedSender<SyncEvent>,
    ) -> Result<Box<dyn Remote>, SyncError>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    /// Nothing buffered and no relay configured.
    Idle,
    /// Local edits wait for the debounce timer.
    Buffering,
    /// Commits were sent and are not acknowledged yet.
    Flushing,
    /// Every local commit is acknowledged.
    Synced,
    /// The relay is unreachable; commits are kept locally.
    Offline,
}

struct State {
    phase: Phase,
    graph: CommitGraph,
    merge: MergeEngine,
    head: Option<String>,
    value: Value,
    /// Commits created locally and not yet flushed.
    pending: Vec<Commit>,
    timer: Option<JoinHandle<()>>,
    repository: Box<dyn CommitRepository>,
    remote: Option<Box<dyn Remote>>,
    remote_ready: bool,
    presence: PresenceRoom,
    status: SyncStatus,
    events_task: Option<JoinHandle<()>>,
    closed: bool,
}

struct Published {
    doc: Value,
    clients: Vec<ClientInfo>,
    status: SyncStatus,
}

impl State {
    fn published(&self) -> Published {
        Published {
            doc: self.value.clone(),
            clients: self.presence.clients(),
            status: self.status.clone(),
        }
    }

    fn snapshot(&self) -> Snapshot {
        Snapshot {
            sync_cursor: self.repository.last_sync_id(),
            heads: self.graph.heads(),
        }
    }

    fn send(&mut self, event: SyncEvent) {
        let Some(remote) = &self.remote else {
            return;
        };
        if let Err(e) = remote.send(event) {
            log::warn!("remote send failed: {e}");
            self.remote_ready = false;
        }
    }

    fn outstanding(&mut self) -> bool {
        match self.repository.unacknowledged() {
            Ok(commits) => !commits.is_empty(),
            Err(e) => {
                log::error!("failed to read unacknowledged commits: {e}");
                true
            }
        }
    }

    /// Recomputes the phase from the buffers and connectivity.
    fn settle(&mut self) {
        self.phase = if !self.pending.is_empty() {
            Phase::Buffering
        } else if self.remote.is_none() {
            Phase::Idle
        } else if !self.remote_ready {
            Phase::Offline
        } else if self.outstanding() {
            self.status.save = SaveState::Saving;
            Phase::Flushing
        } else {
            self.status.save = SaveState::Saved;
            Phase::Synced
        };
    }

    fn record_error(&mut self, code: ErrorCode, message: String) {
        self.status.last_error = Some(ErrorInfo {
            code,
            message,
            fatal: false,
            reconnect: false,
        });
    }
}

struct Shared {
    config: CoordinatorConfig,
    runtime: Handle,
    state: Mutex<State>,
    doc: Subscribers<Value>,
    clients: Subscribers<Vec<ClientInfo>>,
    status: Subscribers<SyncStatus>,
}

/// Handle to a running coordinator. Clones share the same session.
#[derive(Clone)]
pub struct Coordinator {
    shared: Arc<Shared>,
}

impl std::fmt::Debug for Coordinator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Coordinator")
            .field("doc_id", &self.shared.config.doc_id)
            .field("client_id", &self.shared.config.client_id)
            .finish()
    }
}

impl Coordinator {
    /// Loads the repository, reconciles its heads and connects the remote.
    ///
    /// Must be called from within a tokio runtime.
    pub fn open(
        config: CoordinatorConfig,
        merge_fn: Arc<dyn MergeFn>,
        mut repository: Box<dyn CommitRepository>,
        connector: Option<Arc<dyn RemoteConnector>>,
    ) -> Result<Coordinator, SyncError> {
        let runtime = Handle::try_current().map_err(|_| SyncError::NoRuntime)?;

        let mut graph = CommitGraph::new();
        let stored = repository.load()?;
        let loaded = stored.len();
        let outcome = graph.insert_all(stored)?;
        if !outcome.deferred.is_empty() {
            log::warn!(
                "{}: {} stored commits still miss a parent",
                config.doc_id,
                outcome.deferred.len()
            );
        }

        let presence = PresenceRoom::new(config.user_id.clone(), config.client_id.clone());
        let state = State {
            phase: Phase::Idle,
            graph,
            merge: MergeEngine::new(merge_fn, config.scheme),
            head: None,
            value: Value::Null,
            pending: Vec::new(),
            timer: None,
            repository,
            remote: None,
            remote_ready: false,
            presence: presence.clone(),
            status: SyncStatus::default(),
            events_task: None,
            closed: false,
        };

        let shared = Arc::new(Shared {
            config,
            runtime,
            state: Mutex::new(state),
            doc: Subscribers::new(Value::Null),
            clients: Subscribers::new(presence.clients()),
            status: Subscribers::new(SyncStatus::default()),
        });

        let published = {
            let mut state = shared.lock();
            shared.reconcile(&mut state)?;
            log::info!(
                "opened {} with {loaded} stored commits, head {:?}",
                shared.config.doc_id,
                state.head
            );

            if let Some(connector) = connector {
                let (tx, rx) = mpsc::unbounded_channel();
                let resume = state.snapshot();
                log::debug!(
                    "{}: resuming after {:?} with heads {:?}",
                    shared.config.doc_id,
                    resume.sync_cursor,
                    resume.heads
                );
                let params = RemoteParams {
                    doc_id: shared.config.doc_id.clone(),
                    user_id: shared.config.user_id.clone(),
                    client_id: shared.config.client_id.clone(),
                    local_store_id: shared.config.local_store_id.clone(),
                    last_sync_cursor: resume.sync_cursor,
                };
                state.remote = Some(connector.connect(params, tx)?);
                state.status.connect = ConnectState::Connecting;
                state.events_task = Some(shared.spawn_event_loop(rx));
            }
            state.settle();
            state.published()
        };
        shared.publish(published);

        Ok(Coordinator { shared })
    }

    pub fn config(&self) -> &CoordinatorConfig {
        &self.shared.config
    }

    /// Records a local edit as a commit on top of the current head.
    ///
    /// Returns the new ref, or `None` when `value` equals the current document.
    pub fn edit_document(&self, value: Value, metadata: Value) -> Result<Option<String>, SyncError> {
        let shared = &self.shared;
        let (ref_id, published) = {
            let mut state = shared.lock();
            if state.closed {
                return Err(SyncError::Closed);
            }
            let Some(change) = delta::diff(&state.value, &value) else {
                return Ok(None);
            };
            let delta = change.to_json();
            let base = state.head.clone();
            let ref_id = shared
                .config
                .scheme
                .compute(base.as_deref(), None, &delta, &metadata);
            let commit = Commit {
                ref_id: ref_id.clone(),
                base_ref: base,
                merge_ref: None,
                delta,
                metadata,
            };

            state.graph.insert(commit.clone())?;
            state.graph.cache_value(&ref_id, value.clone());
            state.head = Some(ref_id.clone());
            state.value = value;
            state.pending.push(commit);
            shared.arm_timer(&mut state);
            state.settle();
            (ref_id, state.published())
        };
        shared.publish(published);
        Ok(Some(ref_id))
    }

    /// Sets the local presence payload and announces it when connected.
    pub fn update_presence(&self, presence: Value) -> Result<(), SyncError> {
        let published = {
            let mut state = self.shared.lock();
            if state.closed {
                return Err(SyncError::Closed);
            }
            state.presence.set_local(presence);
            if state.remote_ready {
                let event = state.presence.announce();
                state.send(event);
            }
            state.published()
        };
        self.shared.publish(published);
        Ok(())
    }

    /// Flushes buffered edits immediately instead of waiting for the timer.
    pub fn flush_now(&self) -> Result<(), SyncError> {
        let published = {
            let mut state = self.shared.lock();
            if state.closed {
                return Err(SyncError::Closed);
            }
            if let Some(timer) = state.timer.take() {
                timer.abort();
            }
            self.shared.flush_locked(&mut state);
            state.settle();
            state.published()
        };
        self.shared.publish(published);
        Ok(())
    }

    /// Applies one event received from the relay.
    ///
    /// The connector's event loop calls this; custom transports may too.
    pub fn apply_remote_event(&self, event: SyncEvent) {
        self.shared.handle_event(event);
    }

    pub fn phase(&self) -> Phase {
        self.shared.lock().phase
    }

    /// Current materialized document.
    pub fn doc(&self) -> Value {
        self.shared.lock().value.clone()
    }

    pub fn head_ref(&self) -> Option<String> {
        self.shared.lock().head.clone()
    }

    pub fn heads(&self) -> Vec<String> {
        self.shared.lock().graph.heads()
    }

    pub fn commit(&self, ref_id: &str) -> Option<Commit> {
        self.shared.lock().graph.get(ref_id).cloned()
    }

    pub fn sync_status(&self) -> SyncStatus {
        self.shared.lock().status.clone()
    }

    /// Resume point: the relay cursor and the current heads.
    pub fn snapshot(&self) -> Snapshot {
        self.shared.lock().snapshot()
    }

    pub fn clients(&self) -> Vec<ClientInfo> {
        self.shared.lock().presence.clients()
    }

    pub fn is_closed(&self) -> bool {
        self.shared.lock().closed
    }

    pub fn subscribe_doc<F>(&self, callback: F) -> Subscription
    where
        F: Fn(&Value) + Send + Sync + 'static,
    {
        self.shared.doc.subscribe(callback)
    }

    pub fn subscribe_clients<F>(&self, callback: F) -> Subscription
    where
        F: Fn(&Vec<ClientInfo>) + Send + Sync + 'static,
    {
        self.shared.clients.subscribe(callback)
    }

    pub fn subscribe_sync_status<F>(&self, callback: F) -> Subscription
    where
        F: Fn(&SyncStatus) + Send + Sync + 'static,
    {
        self.shared.status.subscribe(callback)
    }

    /// Persists buffered edits, leaves the document and closes everything.
    ///
    /// Sends are best-effort. Calling it twice is a no-op.
    pub fn shutdown(&self) -> Result<(), SyncError> {
        let shared = &self.shared;
        let result = {
            let mut state = shared.lock();
            if state.closed {
                return Ok(());
            }
            state.closed = true;
            if let Some(timer) = state.timer.take() {
                timer.abort();
            }
            shared.flush_locked(&mut state);
            if state.remote_ready && state.presence.is_joined() {
                let leave = state.presence.leave_event();
                state.send(leave);
            }
            if let Some(remote) = state.remote.take() {
                remote.shutdown();
            }
            if let Some(task) = state.events_task.take() {
                task.abort();
            }
            state.remote_ready = false;
            state.repository.close()
        };
        shared.doc.clear();
        shared.clients.clear();
        shared.status.clear();
        log::info!(
            "coordinator {}/{} shut down",
            shared.config.doc_id,
            shared.config.client_id
        );
        result
    }
}

impl Shared {
    fn lock(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn publish(&self, published: Published) {
        self.doc.publish(published.doc);
        self.clients.publish(published.clients);
        self.status.publish(published.status);
    }

    fn spawn_event_loop(self: &Arc<Self>, mut rx: mpsc::UnboundedReceiver<SyncEvent>) -> JoinHandle<()> {
        let weak: Weak<Shared> = Arc::downgrade(self);
        self.runtime.spawn(async move {
            while let Some(event) = rx.recv().await {
                let Some(shared) = weak.upgrade() else {
                    break;
                };
                shared.handle_event(event);
            }
        })
    }

    fn arm_timer(self: &Arc<Self>, state: &mut State) {
        if state.timer.is_some() || state.closed {
            return;
        }
        let weak = Arc::downgrade(self);
        let delay = self.config.flush_delay;
        state.timer = Some(self.runtime.spawn(async move {
            tokio::time::sleep(delay).await;
            if let Some(shared) = weak.upgrade() {
                shared.on_timer();
            }
        }));
    }

    fn on_timer(&self) {
        let published = {
            let mut state = self.lock();
            state.timer = None;
            if state.closed {
                return;
            }
            self.flush_locked(&mut state);
            state.settle();
            state.published()
        };
        self.publish(published);
    }

    /// Writes buffered commits to the repository and, when ready, the relay.
    fn flush_locked(&self, state: &mut State) {
        let batch = std::mem::take(&mut state.pending);
        if batch.is_empty() {
            return;
        }
        if let Err(e) = state.repository.add_commits(&batch) {
            log::error!("{}: failed to persist {} commits: {e}", self.config.doc_id, batch.len());
            state.record_error(e.code(), e.to_string());
        }
        if state.remote_ready {
            log::debug!("{}: sending {} commits", self.config.doc_id, batch.len());
            state.status.save = SaveState::Saving;
            self.send_commits(state, batch);
        }
    }

    fn send_commits(&self, state: &mut State, commits: Vec<Commit>) {
        for frame in commit_frames(commits, None, self.config.max_frame_bytes) {
            state.send(frame);
        }
    }

    /// Merges divergent heads and refreshes the head and document value.
    fn reconcile(self: &Arc<Self>, state: &mut State) -> Result<(), SyncError> {
        if let Some(outcome) = state.merge.merge_heads(&mut state.graph)? {
            log::info!(
                "{}: merged {} heads into {}",
                self.config.doc_id,
                outcome.commits.len() + 1,
                outcome.head
            );
            state.pending.extend(outcome.commits);
            self.arm_timer(state);
        }
        state.head = state.graph.heads().into_iter().next();
        state.value = state.graph.value(state.head.as_deref())?;
        Ok(())
    }

    fn handle_event(self: &Arc<Self>, event: SyncEvent) {
        let published = {
            let mut state = self.lock();
            if state.closed {
                return;
            }
            log::trace!("{}: remote event {}", self.config.doc_id, event.kind());
            if let Err(e) = self.apply_event(&mut state, event) {
                log::error!("{}: failed to apply remote event: {e}", self.config.doc_id);
                state.record_error(e.code(), e.to_string());
            }
            state.settle();
            state.published()
        };
        self.publish(published);
    }

    fn apply_event(self: &Arc<Self>, state: &mut State, event: SyncEvent) -> Result<(), SyncError> {
        match event {
            SyncEvent::Commits { commits, sync_id } => {
                self.apply_commits(state, commits)?;
                if let Some(sync_id) = sync_id {
                    state.repository.set_last_sync_id(sync_id)?;
                }
            }
            SyncEvent::Ack { acks, ref_errors, .. } => {
                self.fold_acks(state, &acks)?;
                for (ref_id, RefError { code, message }) in ref_errors {
                    log::warn!("{}: relay rejected {ref_id}: {code}: {message}", self.config.doc_id);
                    state.record_error(code, format!("{ref_id}: {message}"));
                }
            }
            SyncEvent::Ready => {
                state.remote_ready = true;
                state.status.connect = ConnectState::Online;
                state.status.read = ReadState::Online;
                if let Some(timer) = state.timer.take() {
                    timer.abort();
                }
                let buffered = std::mem::take(&mut state.pending);
                state.repository.add_commits(&buffered)?;

                let unacked = state.repository.unacknowledged()?;
                if !unacked.is_empty() {
                    log::info!("{}: resending {} unacknowledged commits", self.config.doc_id, unacked.len());
                    state.status.save = SaveState::Saving;
                    self.send_commits(state, unacked);
                }
                if state.presence.has_local_presence() {
                    let event = state.presence.announce();
                    state.send(event);
                }
            }
            SyncEvent::ClientJoin { .. } => {
                state.presence.handle_event(&event);
                if state.remote_ready && state.presence.has_local_presence() {
                    let reply = state.presence.announce();
                    state.send(reply);
                }
            }
            SyncEvent::ClientPresence { .. } | SyncEvent::ClientLeave { .. } => {
                state.presence.handle_event(&event);
            }
            SyncEvent::RemoteState {
                connect,
                read,
                save,
            } => {
                state.status.apply(connect, read, save);
                if matches!(connect, Some(ConnectState::Offline | ConnectState::Connecting)) {
                    state.remote_ready = false;
                    state.status.read = ReadState::Offline;
                    state.presence.reset();
                }
            }
            SyncEvent::Error(info) => {
                log::warn!(
                    "{}: relay error {}: {} (fatal={}, reconnect={})",
                    self.config.doc_id,
                    info.code,
                    info.message,
                    info.fatal,
                    info.reconnect
                );
                if info.fatal {
                    state.remote_ready = false;
                    state.status.connect = ConnectState::Offline;
                    state.status.read = ReadState::Offline;
                }
                state.status.last_error = Some(info);
            }
            SyncEvent::Init { .. } => {
                log::debug!("{}: ignoring init from relay", self.config.doc_id);
            }
        }
        Ok(())
    }

    fn apply_commits(self: &Arc<Self>, state: &mut State, commits: Vec<Commit>) -> Result<(), SyncError> {
        // Known commits arriving with relay metadata acknowledge our copy.
        let known: Vec<AckCommit> = commits
            .iter()
            .filter(|c| state.graph.contains(&c.ref_id) && c.server_metadata().is_some())
            .map(|c| AckCommit {
                ref_id: c.ref_id.clone(),
                metadata: c.metadata.clone(),
            })
            .collect();
        if !known.is_empty() {
            self.fold_acks(state, &known)?;
        }

        let fresh: Vec<Commit> = commits
            .iter()
            .filter(|c| !state.graph.contains(&c.ref_id))
            .cloned()
            .collect();
        if fresh.is_empty() {
            return Ok(());
        }

        let outcome = state.graph.insert_batch(fresh.clone())?;
        state.repository.add_commits(&fresh)?;
        if !outcome.deferred.is_empty() {
            log::debug!(
                "{}: {} commits wait for missing parents",
                self.config.doc_id,
                outcome.deferred.len()
            );
        }
        if !outcome.inserted.is_empty() {
            self.reconcile(state)?;
        }
        Ok(())
    }

    fn fold_acks(&self, state: &mut State, acks: &[AckCommit]) -> Result<(), SyncError> {
        state.repository.acknowledge(acks)?;
        for ack in acks {
            if let Some(commit) = state.graph.get(&ack.ref_id) {
                let merged = metadata::merge_json(&commit.metadata, &ack.metadata);
                state.graph.set_metadata(&ack.ref_id, merged);
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::commit::{ServerMetadata, SERVER_METADATA_KEY};
    use crate::hash::compute_ref;
    use crate::merge::KeyWiseMerge;
    use crate::repository::MemoryRepository;
    use serde_json::json;

    #[derive(Clone, Default)]
    struct Recorder {
        sent: Arc<Mutex<Vec<SyncEvent>>>,
        closed: Arc<Mutex<bool>>,
        connects: Arc<Mutex<Vec<RemoteParams>>>,
    }

    impl Remote for Recorder {
        fn send(&self, event: SyncEvent) -> Result<(), SyncError> {
            self.sent.lock().unwrap().push(event);
            Ok(())
        }

        fn shutdown(&self) {
            *self.closed.lock().unwrap() = true;
        }
    }

    impl RemoteConnector for Recorder {
        fn connect(
            &self,
            params: RemoteParams,
            _events: mpsc::UnboundedSender<SyncEvent>,
        ) -> Result<Box<dyn Remote>, SyncError> {
            self.connects.lock().unwrap().push(params);
            Ok(Box::new(self.clone()))
        }
    }

    impl Recorder {
        fn take(&self) -> Vec<SyncEvent> {
            std::mem::take(&mut *self.sent.lock().unwrap())
        }
    }

    fn open(repo: &MemoryRepository, remote: Option<&Recorder>) -> Coordinator {
        open_with(CoordinatorConfig::for_testing("doc", "alice", "a1"), repo, remote)
    }

    fn open_with(config: CoordinatorConfig, repo: &MemoryRepository, remote: Option<&Recorder>) -> Coordinator {
        let connector = remote.map(|r| Arc::new(r.clone()) as Arc<dyn RemoteConnector>);
        Coordinator::open(
            config,
            Arc::new(KeyWiseMerge),
            Box::new(repo.clone()),
            connector,
        )
        .unwrap()
    }

    fn stamped(commit: &Commit, sync_id: u64, index: u32) -> Commit {
        commit.with_server_metadata(&ServerMetadata {
            main: true,
            sync_id: SyncId(sync_id),
            sync_index: index,
        })
    }

    fn remote_commit(base: Option<&str>, old: &Value, new: &Value) -> Commit {
        let delta = delta::encode_opt(delta::diff(old, new).as_ref());
        Commit {
            ref_id: compute_ref(base, None, &delta, &Value::Null),
            base_ref: base.map(str::to_string),
            merge_ref: None,
            delta,
            metadata: Value::Null,
        }
    }

    #[tokio::test]
    async fn test_edit_updates_doc_and_buffers() {
        let repo = MemoryRepository::new();
        let coordinator = open(&repo, None);
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();
        let _sub = coordinator.subscribe_doc(move |v| sink.lock().unwrap().push(v.clone()));

        let first = coordinator.edit_document(json!({"a": 1}), Value::Null).unwrap();
        assert!(first.is_some());
        assert_eq!(coordinator.phase(), Phase::Buffering);
        assert_eq!(coordinator.doc(), json!({"a": 1}));
        assert_eq!(coordinator.edit_document(json!({"a": 1}), Value::Null).unwrap(), None);

        coordinator.flush_now().unwrap();
        assert_eq!(repo.len(), 1);
        assert_eq!(coordinator.phase(), Phase::Idle);
        assert_eq!(*seen.lock().unwrap(), vec![Value::Null, json!({"a": 1})]);
    }

    #[tokio::test]
    async fn test_debounce_coalesces_edits() {
        let repo = MemoryRepository::new();
        let remote = Recorder::default();
        let coordinator = open(&repo, Some(&remote));
        coordinator.apply_remote_event(SyncEvent::Ready);

        coordinator.edit_document(json!({"n": 1}), Value::Null).unwrap();
        coordinator.edit_document(json!({"n": 2}), Value::Null).unwrap();
        coordinator.edit_document(json!({"n": 3}), Value::Null).unwrap();
        tokio::time::sleep(Duration::from_millis(60)).await;

        let batches: Vec<usize> = remote
            .take()
            .into_iter()
            .filter_map(|e| match e {
                SyncEvent::Commits { commits, .. } => Some(commits.len()),
                _ => None,
            })
            .collect();
        assert_eq!(batches, vec![3]);
        assert_eq!(coordinator.phase(), Phase::Flushing);
        assert_eq!(coordinator.sync_status().save, SaveState::Saving);
    }

    #[tokio::test]
    async fn test_ack_marks_synced_and_merges_metadata() {
        let repo = MemoryRepository::new();
        let remote = Recorder::default();
        let coordinator = open(&repo, Some(&remote));
        coordinator.apply_remote_event(SyncEvent::Ready);
        let ref_id = coordinator
            .edit_document(json!({"a": 1}), json!({"author": "alice"}))
            .unwrap()
            .unwrap();
        coordinator.flush_now().unwrap();

        let server = ServerMetadata {
            main: true,
            sync_id: SyncId(1),
            sync_index: 0,
        };
        coordinator.apply_remote_event(SyncEvent::Ack {
            acks: vec![AckCommit {
                ref_id: ref_id.clone(),
                metadata: json!({ SERVER_METADATA_KEY: server }),
            }],
            ref_errors: Default::default(),
            sync_id: Some(SyncId(1)),
        });

        assert_eq!(coordinator.phase(), Phase::Synced);
        let commit = coordinator.commit(&ref_id).unwrap();
        assert_eq!(commit.metadata["author"], "alice");
        assert_eq!(commit.server_metadata(), Some(server));
        assert_eq!(repo.clone().last_sync_id(), None);
    }

    #[tokio::test]
    async fn test_cursor_follows_delivered_commits_not_acks() {
        let repo = MemoryRepository::new();
        let remote = Recorder::default();
        let coordinator = open(&repo, Some(&remote));
        coordinator.apply_remote_event(SyncEvent::Ready);
        let ours = coordinator.edit_document(json!({"a": 1}), Value::Null).unwrap().unwrap();
        coordinator.flush_now().unwrap();

        // a sibling batch took syncId 1 and is still on its way when our ack arrives
        let server = ServerMetadata {
            main: false,
            sync_id: SyncId(2),
            sync_index: 0,
        };
        coordinator.apply_remote_event(SyncEvent::Ack {
            acks: vec![AckCommit {
                ref_id: ours.clone(),
                metadata: json!({ SERVER_METADATA_KEY: server }),
            }],
            ref_errors: Default::default(),
            sync_id: Some(SyncId(2)),
        });
        assert_eq!(coordinator.snapshot().sync_cursor, None);
        coordinator.shutdown().unwrap();

        let reopened = open(&repo.reopen(), Some(&remote));
        let params = remote.connects.lock().unwrap().last().cloned().unwrap();
        assert_eq!(params.last_sync_cursor, None);

        let theirs = remote_commit(None, &Value::Null, &json!({"b": 1}));
        reopened.apply_remote_event(SyncEvent::Commits {
            commits: vec![stamped(&theirs, 1, 0)],
            sync_id: Some(SyncId(2)),
        });
        let snapshot = reopened.snapshot();
        assert_eq!(snapshot.sync_cursor, Some(SyncId(2)));
        assert_eq!(snapshot.heads, reopened.heads());
        assert!(reopened.commit(&theirs.ref_id).is_some());
        assert!(reopened.commit(&ours).is_some());
    }

    #[tokio::test]
    async fn test_large_resend_is_split_into_frames() {
        let repo = MemoryRepository::new();
        let remote = Recorder::default();
        let config = CoordinatorConfig {
            max_frame_bytes: 1_500,
            ..CoordinatorConfig::for_testing("doc", "alice", "a1")
        };
        let coordinator = open_with(config, &repo, Some(&remote));

        let mut doc = serde_json::Map::new();
        let mut refs = Vec::new();
        for i in 0..4 {
            doc.insert(format!("k{i}"), json!("x".repeat(500)));
            let ref_id = coordinator
                .edit_document(Value::Object(doc.clone()), Value::Null)
                .unwrap()
                .unwrap();
            refs.push(ref_id);
            coordinator.flush_now().unwrap();
        }
        assert!(remote.take().is_empty());

        coordinator.apply_remote_event(SyncEvent::Ready);
        let frames: Vec<SyncEvent> = remote
            .take()
            .into_iter()
            .filter(|e| matches!(e, SyncEvent::Commits { .. }))
            .collect();
        assert!(frames.len() > 1, "expected a split resend");
        let mut sent = Vec::new();
        for frame in &frames {
            assert!(frame.encode().unwrap().len() <= 1_500);
            if let SyncEvent::Commits { commits, sync_id } = frame {
                assert_eq!(*sync_id, None);
                sent.extend(commits.iter().map(|c| c.ref_id.clone()));
            }
        }
        assert_eq!(sent, refs);
    }

    #[tokio::test]
    async fn test_offline_edits_resent_on_ready() {
        let repo = MemoryRepository::new();
        let remote = Recorder::default();
        let coordinator = open(&repo, Some(&remote));

        coordinator.edit_document(json!({"x": 1}), Value::Null).unwrap();
        coordinator.flush_now().unwrap();
        assert_eq!(coordinator.phase(), Phase::Offline);
        assert!(remote.take().is_empty());

        coordinator.update_presence(json!({"cursor": 1})).unwrap();
        coordinator.apply_remote_event(SyncEvent::Ready);
        let sent = remote.take();
        assert!(matches!(&sent[0], SyncEvent::Commits { commits, .. } if commits.len() == 1));
        assert!(matches!(&sent[1], SyncEvent::ClientJoin { .. }));
    }

    #[tokio::test]
    async fn test_remote_divergence_is_merged() {
        let repo = MemoryRepository::new();
        let remote = Recorder::default();
        let coordinator = open(&repo, Some(&remote));
        coordinator.apply_remote_event(SyncEvent::Ready);

        let root = remote_commit(None, &Value::Null, &json!({"a": 0, "b": 0}));
        coordinator.apply_remote_event(SyncEvent::Commits {
            commits: vec![stamped(&root, 1, 0)],
            sync_id: Some(SyncId(1)),
        });
        assert_eq!(coordinator.head_ref(), Some(root.ref_id.clone()));

        coordinator.edit_document(json!({"a": 1, "b": 0}), Value::Null).unwrap();
        let theirs = remote_commit(Some(&root.ref_id), &json!({"a": 0, "b": 0}), &json!({"a": 0, "b": 2}));
        coordinator.apply_remote_event(SyncEvent::Commits {
            commits: vec![stamped(&theirs, 2, 0)],
            sync_id: Some(SyncId(2)),
        });

        assert_eq!(coordinator.heads().len(), 1);
        assert_eq!(coordinator.doc(), json!({"a": 1, "b": 2}));
        let head = coordinator.commit(&coordinator.head_ref().unwrap()).unwrap();
        assert!(head.is_merge());
        assert_eq!(coordinator.phase(), Phase::Buffering);
    }

    #[tokio::test]
    async fn test_orphans_wait_for_parents() {
        let repo = MemoryRepository::new();
        let coordinator = open(&repo, Some(&Recorder::default()));
        let root = remote_commit(None, &Value::Null, &json!({"v": 1}));
        let child = remote_commit(Some(&root.ref_id), &json!({"v": 1}), &json!({"v": 2}));

        coordinator.apply_remote_event(SyncEvent::Commits {
            commits: vec![stamped(&child, 2, 0)],
            sync_id: None,
        });
        assert_eq!(coordinator.doc(), Value::Null);

        coordinator.apply_remote_event(SyncEvent::Commits {
            commits: vec![stamped(&root, 1, 0)],
            sync_id: None,
        });
        assert_eq!(coordinator.doc(), json!({"v": 2}));
    }

    #[tokio::test]
    async fn test_sibling_join_gets_presence_reply() {
        let remote = Recorder::default();
        let coordinator = open(&MemoryRepository::new(), Some(&remote));
        coordinator.apply_remote_event(SyncEvent::Ready);
        coordinator.update_presence(json!("here")).unwrap();
        remote.take();

        coordinator.apply_remote_event(SyncEvent::ClientJoin {
            info: ClientInfo {
                user_id: "bob".into(),
                client_id: "b1".into(),
                presence: None,
            },
        });
        let sent = remote.take();
        assert!(matches!(&sent[..], [SyncEvent::ClientPresence { info }] if info.client_id == "a1"));
        assert_eq!(coordinator.clients().len(), 2);

        coordinator.apply_remote_event(SyncEvent::RemoteState {
            connect: Some(ConnectState::Offline),
            read: None,
            save: None,
        });
        assert_eq!(coordinator.clients().len(), 1);
        assert_eq!(coordinator.sync_status().connect, ConnectState::Offline);
    }

    #[tokio::test]
    async fn test_reopen_restores_document() {
        let repo = MemoryRepository::new();
        let coordinator = open(&repo, None);
        coordinator.edit_document(json!({"k": "v"}), Value::Null).unwrap();
        coordinator.shutdown().unwrap();
        assert!(matches!(
            coordinator.edit_document(json!({}), Value::Null),
            Err(SyncError::Closed)
        ));

        let reopened = open(&repo.reopen(), None);
        assert_eq!(reopened.doc(), json!({"k": "v"}));
    }

    #[tokio::test]
    async fn test_shutdown_leaves_and_closes_remote() {
        let remote = Recorder::default();
        let coordinator = open(&MemoryRepository::new(), Some(&remote));
        coordinator.apply_remote_event(SyncEvent::Ready);
        coordinator.update_presence(json!(1)).unwrap();
        remote.take();

        coordinator.shutdown().unwrap();
        assert!(matches!(&remote.take()[..], [SyncEvent::ClientLeave { .. }]));
        assert!(*remote.closed.lock().unwrap());
        coordinator.shutdown().unwrap();
    }

    #[test]
    fn test_open_requires_runtime() {
        let result = Coordinator::open(
            CoordinatorConfig::new("doc", "u", "c"),
            Arc::new(KeyWiseMerge),
            Box::new(MemoryRepository::new()),
            None,
        );
        assert!(matches!(result, Err(SyncError::NoRuntime)));
    }
}
