//! In-memory [`DocStore`] for tests and ephemeral relays.
//!
//! Document state lives in the factory, so closing a store and opening the
//! same document again sees everything accepted before.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};

use crate::commit::{Commit, SyncId};
use crate::hash::RefScheme;

use super::batch::{plan_batch, DocHead};
use super::{collect_page, AddResult, CommitsPage, DocStore, DocStoreFactory, StoreError};

#[derive(Debug, Default)]
struct MemoryDoc {
    commits: HashMap<String, Commit>,
    /// `(syncId, syncIndex, ref)`, sorted by construction.
    log: Vec<(SyncId, u32, String)>,
    head: DocHead,
    fail_writes: bool,
}

type SharedDoc = Arc<Mutex<MemoryDoc>>;

fn lock(doc: &SharedDoc) -> MutexGuard<'_, MemoryDoc> {
    doc.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

pub struct MemoryDocStore {
    doc_id: String,
    doc: SharedDoc,
    verify: Option<RefScheme>,
    closed: bool,
}

impl MemoryDocStore {
    /// A standalone store not shared with any factory.
    pub fn new(doc_id: impl Into<String>) -> Self {
        Self {
            doc_id: doc_id.into(),
            doc: SharedDoc::default(),
            verify: None,
            closed: false,
        }
    }

    pub fn with_verify_refs(mut self, scheme: RefScheme) -> Self {
        self.verify = Some(scheme);
        self
    }

    /// Makes every following write fail, to exercise `storage-failure`.
    pub fn set_fail_writes(&self, fail: bool) {
        lock(&self.doc).fail_writes = fail;
    }

    fn open_doc(&self) -> Result<MutexGuard<'_, MemoryDoc>, StoreError> {
        if self.closed {
            return Err(StoreError::Closed(self.doc_id.clone()));
        }
        Ok(lock(&self.doc))
    }
}

impl DocStore for MemoryDocStore {
    fn doc_id(&self) -> &str {
        &self.doc_id
    }

    fn get_commits_event(&self, since: Option<SyncId>, limit: usize) -> Result<CommitsPage, StoreError> {
        let doc = self.open_doc()?;
        let since = since.unwrap_or(SyncId::ZERO);
        let start = doc.log.partition_point(|(sync_id, _, _)| *sync_id <= since);
        let entries = doc.log[start..].iter().map(|(sync_id, _, ref_id)| {
            doc.commits
                .get(ref_id)
                .cloned()
                .map(|commit| (*sync_id, commit))
                .ok_or_else(|| StoreError::Database(format!("sync log names missing commit {ref_id}")))
        });
        collect_page(entries, limit, doc.head.last_sync_id())
    }

    fn add(&mut self, commits: &[Commit]) -> Result<AddResult, StoreError> {
        let verify = self.verify;
        let mut doc = self.open_doc()?;
        let plan = {
            let stored = &doc.commits;
            plan_batch(commits, &doc.head, verify.as_ref(), |ref_id| {
                Ok(stored.get(ref_id).map(|c| c.metadata.clone()))
            })?
        };
        if plan.is_noop() {
            return Ok(plan.into_result());
        }
        if doc.fail_writes {
            return Ok(plan.fail_storage("write rejected"));
        }

        for commit in &plan.accepted {
            let index = commit.server_metadata().map_or(0, |s| s.sync_index);
            let sync_id = plan.sync_id.unwrap_or(SyncId::ZERO);
            doc.log.push((sync_id, index, commit.ref_id.clone()));
            doc.commits.insert(commit.ref_id.clone(), commit.clone());
        }
        doc.head = plan.next.clone();
        Ok(plan.into_result())
    }

    fn head(&self) -> Result<Option<String>, StoreError> {
        Ok(self.open_doc()?.head.head.clone())
    }

    fn commit_count(&self) -> Result<u64, StoreError> {
        Ok(self.open_doc()?.head.commit_count)
    }

    fn delete(&mut self) -> Result<(), StoreError> {
        let mut doc = self.open_doc()?;
        *doc = MemoryDoc::default();
        Ok(())
    }

    fn close(&mut self) -> Result<(), StoreError> {
        self.closed = true;
        Ok(())
    }
}

/// Hands out [`MemoryDocStore`]s that share state per document id.
#[derive(Clone, Default)]
pub struct MemoryStoreFactory {
    docs: Arc<Mutex<HashMap<String, SharedDoc>>>,
    verify: Option<RefScheme>,
}

impl MemoryStoreFactory {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_verify_refs(mut self, scheme: RefScheme) -> Self {
        self.verify = Some(scheme);
        self
    }

    pub fn document_count(&self) -> usize {
        self.docs.lock().map_or(0, |docs| docs.len())
    }
}

impl DocStoreFactory for MemoryStoreFactory {
    fn open(&self, doc_id: &str) -> Result<Box<dyn DocStore>, StoreError> {
        let mut docs = self
            .docs
            .lock()
            .map_err(|_| StoreError::Database("memory store poisoned".into()))?;
        let doc = docs.entry(doc_id.to_string()).or_default().clone();
        Ok(Box::new(MemoryDocStore {
            doc_id: doc_id.to_string(),
            doc,
            verify: self.verify,
            closed: false,
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorCode;
    use serde_json::{json, Value};

    fn stored_metadata(store: &dyn DocStore, ref_id: &str) -> Option<Value> {
        store
            .get_commits_event(None, usize::MAX)
            .ok()?
            .commits
            .into_iter()
            .find(|c| c.ref_id == ref_id)
            .map(|c| c.metadata)
    }

    fn commit(ref_id: &str, base: Option<&str>) -> Commit {
        Commit {
            ref_id: ref_id.into(),
            base_ref: base.map(Into::into),
            merge_ref: None,
            delta: json!([ref_id]),
            metadata: Value::Null,
        }
    }

    #[test]
    fn test_add_is_idempotent() {
        let mut store = MemoryDocStore::new("doc");
        let first = store.add(&[commit("1", None)]).unwrap();
        let second = store.add(&[commit("1", None)]).unwrap();

        assert_eq!(first.acks, second.acks);
        assert_eq!(store.commit_count().unwrap(), 1);
        assert!(second.accepted.is_empty());
        assert!(second.sync_id.is_none());
    }

    #[test]
    fn test_pages_follow_sync_order() {
        let mut store = MemoryDocStore::new("doc");
        store.add(&[commit("1", None), commit("2", Some("1"))]).unwrap();
        store.add(&[commit("3", Some("2"))]).unwrap();

        let all = store.get_commits_event(None, 100).unwrap();
        let refs: Vec<&str> = all.commits.iter().map(|c| c.ref_id.as_str()).collect();
        assert_eq!(refs, vec!["1", "2", "3"]);
        assert_eq!(all.sync_id, Some(SyncId(2)));
        assert!(!all.has_more);

        let since_first = store.get_commits_event(Some(SyncId(1)), 100).unwrap();
        assert_eq!(since_first.commits.len(), 1);
        assert_eq!(since_first.commits[0].ref_id, "3");

        let caught_up = store.get_commits_event(Some(SyncId(2)), 100).unwrap();
        assert!(caught_up.commits.is_empty());
        assert_eq!(caught_up.sync_id, Some(SyncId(2)));
    }

    #[test]
    fn test_page_does_not_split_a_sync_id() {
        let mut store = MemoryDocStore::new("doc");
        store.add(&[commit("1", None), commit("2", Some("1"))]).unwrap();
        store.add(&[commit("3", Some("2"))]).unwrap();

        let page = store.get_commits_event(None, 1).unwrap();
        assert_eq!(page.commits.len(), 2);
        assert!(page.has_more);
        let rest = store.get_commits_event(page.sync_id, 1).unwrap();
        assert_eq!(rest.commits[0].ref_id, "3");
        assert!(!rest.has_more);
    }

    #[test]
    fn test_failed_write_keeps_head() {
        let mut store = MemoryDocStore::new("doc");
        store.add(&[commit("1", None)]).unwrap();
        store.set_fail_writes(true);

        let result = store.add(&[commit("2", Some("1"))]).unwrap();
        assert_eq!(result.ref_errors["2"].code, ErrorCode::StorageFailure);
        assert_eq!(store.head().unwrap().as_deref(), Some("1"));
        assert_eq!(store.commit_count().unwrap(), 1);
    }

    #[test]
    fn test_factory_state_survives_reopen() {
        let factory = MemoryStoreFactory::new();
        let mut store = factory.open("doc").unwrap();
        store.add(&[commit("1", None)]).unwrap();
        store.close().unwrap();
        assert!(matches!(store.head(), Err(StoreError::Closed(_))));

        let mut reopened = factory.open("doc").unwrap();
        assert_eq!(reopened.head().unwrap().as_deref(), Some("1"));
        let result = reopened.add(&[commit("2", Some("1"))]).unwrap();
        assert!(result.ref_errors.is_empty());
        assert!(stored_metadata(reopened.as_ref(), "2").is_some());
        assert_eq!(factory.document_count(), 1);
    }

    #[test]
    fn test_delete_forgets_everything() {
        let mut store = MemoryDocStore::new("doc");
        store.add(&[commit("1", None)]).unwrap();
        store.delete().unwrap();
        assert_eq!(store.commit_count().unwrap(), 0);
        assert!(store.get_commits_event(None, 10).unwrap().commits.is_empty());
    }
}
