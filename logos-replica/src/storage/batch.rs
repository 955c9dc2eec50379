//! Batch acceptance shared by every [`DocStore`](super::DocStore) backend.
//!
//! A batch is decided entirely in memory against a lookup of stored refs.
//! The backend then persists [`BatchPlan::accepted`] and [`BatchPlan::next`]
//! in one atomic write, or reports [`BatchPlan::fail_storage`] if it can't.

use std::collections::{BTreeMap, HashMap};

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::commit::{AckCommit, Commit, RefError, ServerMetadata, SyncId};
use crate::error::ErrorCode;
use crate::graph::validate_batch;
use crate::hash::RefScheme;

use super::{AddResult, StoreError};

/// Per-document pointer state, persisted alongside every batch.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DocHead {
    /// Main-branch head.
    pub head: Option<String>,
    /// Last issued syncId; zero before the first accepted batch.
    pub last_sync_id: u64,
    pub commit_count: u64,
}

impl DocHead {
    pub fn last_sync_id(&self) -> Option<SyncId> {
        (self.last_sync_id > 0).then_some(SyncId(self.last_sync_id))
    }
}

/// Decisions for one `add` call.
#[derive(Debug, Clone, Default)]
pub struct BatchPlan {
    /// Newly accepted commits, stamped with server metadata, in syncIndex order.
    pub accepted: Vec<Commit>,
    /// Acks for accepted and already-known commits, in submission order.
    pub acks: Vec<AckCommit>,
    pub ref_errors: BTreeMap<String, RefError>,
    /// Issued only when something was accepted.
    pub sync_id: Option<SyncId>,
    /// Pointer state after the batch.
    pub next: DocHead,
}

impl BatchPlan {
    pub fn is_noop(&self) -> bool {
        self.accepted.is_empty()
    }

    pub fn into_result(self) -> AddResult {
        AddResult {
            acks: self.acks,
            ref_errors: self.ref_errors,
            sync_id: self.sync_id,
            accepted: self.accepted,
        }
    }

    /// The atomic write failed: nothing new was stored.
    ///
    /// Acks of previously known refs stay valid.
    pub fn fail_storage(self, message: &str) -> AddResult {
        let mut ref_errors = self.ref_errors;
        let accepted: Vec<&str> = self.accepted.iter().map(|c| c.ref_id.as_str()).collect();
        for ref_id in &accepted {
            ref_errors.insert(
                (*ref_id).to_string(),
                RefError::new(ErrorCode::StorageFailure, message),
            );
        }
        let acks = self
            .acks
            .into_iter()
            .filter(|ack| !accepted.contains(&ack.ref_id.as_str()))
            .collect();
        AddResult {
            acks,
            ref_errors,
            sync_id: None,
            accepted: Vec::new(),
        }
    }
}

/// Every commit of `commits` rejected with the same error.
pub fn reject_all(commits: &[Commit], code: ErrorCode, message: &str) -> AddResult {
    AddResult {
        ref_errors: commits
            .iter()
            .map(|c| (c.ref_id.clone(), RefError::new(code, message)))
            .collect(),
        ..AddResult::default()
    }
}

/// Decides every commit of a batch.
///
/// `stored` returns the stored metadata of a ref, or `None` if the store
/// does not know it. With `verify`, refs are recomputed and mismatches are
/// rejected as `bad-request`.
pub fn plan_batch<F>(
    commits: &[Commit],
    current: &DocHead,
    verify: Option<&RefScheme>,
    mut stored: F,
) -> Result<BatchPlan, StoreError>
where
    F: FnMut(&str) -> Result<Option<Value>, StoreError>,
{
    let mut plan = BatchPlan {
        next: current.clone(),
        ..BatchPlan::default()
    };

    if let Err(e) = validate_batch(commits) {
        log::debug!("rejecting batch of {}: {e}", commits.len());
        let message = e.to_string();
        for commit in commits {
            plan.ref_errors.insert(
                commit.ref_id.clone(),
                RefError::new(ErrorCode::OutOfOrder, message.as_str()),
            );
        }
        return Ok(plan);
    }

    let sync_id = SyncId(current.last_sync_id).next();
    let mut sync_index = 0u32;
    // Metadata of every ref known so far: stored ones looked up, batch ones accepted.
    let mut known: HashMap<String, Value> = HashMap::new();

    for commit in commits {
        if let Some(metadata) = known.get(&commit.ref_id) {
            plan.acks.push(AckCommit {
                ref_id: commit.ref_id.clone(),
                metadata: metadata.clone(),
            });
            continue;
        }
        if plan.ref_errors.contains_key(&commit.ref_id) {
            continue;
        }
        if let Some(metadata) = stored(&commit.ref_id)? {
            plan.acks.push(AckCommit {
                ref_id: commit.ref_id.clone(),
                metadata: metadata.clone(),
            });
            known.insert(commit.ref_id.clone(), metadata);
            continue;
        }

        if let Some(scheme) = verify {
            let expected = scheme.compute(
                commit.base_ref.as_deref(),
                commit.merge_ref.as_deref(),
                &commit.delta,
                &commit.metadata,
            );
            if expected != commit.ref_id {
                plan.ref_errors.insert(
                    commit.ref_id.clone(),
                    RefError::new(ErrorCode::BadRequest, "ref does not match commit content"),
                );
                continue;
            }
        }

        let mut missing = None;
        for (field, parent) in [("baseRef", &commit.base_ref), ("mergeRef", &commit.merge_ref)] {
            let Some(parent) = parent else { continue };
            if known.contains_key(parent) {
                continue;
            }
            match stored(parent)? {
                Some(metadata) => {
                    known.insert(parent.clone(), metadata);
                }
                None => {
                    missing = Some(field);
                    break;
                }
            }
        }
        if let Some(field) = missing {
            plan.ref_errors.insert(
                commit.ref_id.clone(),
                RefError::new(ErrorCode::UnknownRef, format!("unknown {field}")),
            );
            continue;
        }

        let main = match plan.next.head.as_deref() {
            Some(head) => commit.parents().any(|p| p == head),
            None => commit.base_ref.is_none() && commit.merge_ref.is_none(),
        };
        let stamped = commit.with_server_metadata(&ServerMetadata {
            main,
            sync_id,
            sync_index,
        });
        sync_index += 1;
        if main {
            plan.next.head = Some(stamped.ref_id.clone());
        }
        plan.next.commit_count += 1;
        plan.acks.push(AckCommit {
            ref_id: stamped.ref_id.clone(),
            metadata: stamped.metadata.clone(),
        });
        known.insert(stamped.ref_id.clone(), stamped.metadata.clone());
        plan.accepted.push(stamped);
    }

    if !plan.accepted.is_empty() {
        plan.next.last_sync_id = sync_id.0;
        plan.sync_id = Some(sync_id);
    }
    Ok(plan)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hash::compute_ref;
    use serde_json::json;

    fn commit(ref_id: &str, base: Option<&str>) -> Commit {
        Commit {
            ref_id: ref_id.into(),
            base_ref: base.map(Into::into),
            merge_ref: None,
            delta: json!([1]),
            metadata: Value::Null,
        }
    }

    fn nothing_stored(_: &str) -> Result<Option<Value>, StoreError> {
        Ok(None)
    }

    #[test]
    fn test_linear_batch_is_accepted_in_order() {
        let batch = vec![commit("1", None), commit("2", Some("1"))];
        let plan = plan_batch(&batch, &DocHead::default(), None, nothing_stored).unwrap();

        assert_eq!(plan.sync_id, Some(SyncId(1)));
        assert_eq!(plan.next.head.as_deref(), Some("2"));
        assert_eq!(plan.next.commit_count, 2);
        let indices: Vec<u32> = plan
            .accepted
            .iter()
            .map(|c| c.server_metadata().unwrap().sync_index)
            .collect();
        assert_eq!(indices, vec![0, 1]);
        assert!(plan.accepted.iter().all(|c| c.server_metadata().unwrap().main));
    }

    #[test]
    fn test_out_of_order_batch_is_rejected_whole() {
        let batch = vec![commit("2", Some("1")), commit("1", None)];
        let plan = plan_batch(&batch, &DocHead::default(), None, nothing_stored).unwrap();
        assert!(plan.is_noop());
        assert_eq!(plan.sync_id, None);
        assert_eq!(plan.ref_errors.len(), 2);
        assert!(plan
            .ref_errors
            .values()
            .all(|e| e.code == ErrorCode::OutOfOrder));
    }

    #[test]
    fn test_unknown_parent_rejects_only_that_commit() {
        let batch = vec![commit("1", None), commit("x", Some("missing")), commit("2", Some("1"))];
        let plan = plan_batch(&batch, &DocHead::default(), None, nothing_stored).unwrap();

        assert_eq!(plan.accepted.len(), 2);
        let error = &plan.ref_errors["x"];
        assert_eq!(error.code, ErrorCode::UnknownRef);
        assert_eq!(error.message, "unknown baseRef");
    }

    #[test]
    fn test_known_ref_is_acked_with_stored_metadata() {
        let stored_meta = json!({"server": {"main": true, "syncId": "0000000000000001", "syncIndex": 0}});
        let head = DocHead {
            head: Some("1".into()),
            last_sync_id: 1,
            commit_count: 1,
        };
        let lookup = |r: &str| Ok((r == "1").then(|| stored_meta.clone()));
        let plan = plan_batch(&[commit("1", None)], &head, None, lookup).unwrap();

        assert!(plan.is_noop());
        assert_eq!(plan.sync_id, None);
        assert_eq!(plan.acks[0].metadata, stored_meta);
        assert_eq!(plan.next, head);
    }

    #[test]
    fn test_side_branch_is_not_main() {
        let head = DocHead {
            head: Some("2".into()),
            last_sync_id: 4,
            commit_count: 2,
        };
        let lookup = |r: &str| Ok(matches!(r, "1" | "2").then(|| json!({})));
        let plan = plan_batch(&[commit("b", Some("1"))], &head, None, lookup).unwrap();

        let server = plan.accepted[0].server_metadata().unwrap();
        assert!(!server.main);
        assert_eq!(server.sync_id, SyncId(5));
        assert_eq!(plan.next.head.as_deref(), Some("2"));
    }

    #[test]
    fn test_verify_rejects_forged_ref() {
        let delta = json!([1]);
        let good = Commit {
            ref_id: compute_ref(None, None, &delta, &Value::Null),
            ..commit("", None)
        };
        let forged = commit("forged", None);
        let plan = plan_batch(
            &[good.clone(), forged],
            &DocHead::default(),
            Some(&RefScheme::default()),
            nothing_stored,
        )
        .unwrap();

        assert_eq!(plan.accepted.len(), 1);
        assert_eq!(plan.accepted[0].ref_id, good.ref_id);
        assert_eq!(plan.ref_errors["forged"].code, ErrorCode::BadRequest);
    }

    #[test]
    fn test_fail_storage_converts_acceptances() {
        let stored_meta = json!({"k": 1});
        let lookup = |r: &str| Ok((r == "old").then(|| stored_meta.clone()));
        let batch = vec![commit("old", None), commit("new", Some("old"))];
        let result = plan_batch(&batch, &DocHead::default(), None, lookup)
            .unwrap()
            .fail_storage("disk full");

        assert_eq!(result.acks.len(), 1);
        assert_eq!(result.acks[0].ref_id, "old");
        assert_eq!(result.ref_errors["new"].code, ErrorCode::StorageFailure);
        assert!(result.sync_id.is_none());
        assert!(result.accepted.is_empty());
    }
}
