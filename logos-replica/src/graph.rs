//! In-memory commit DAG keyed by ref.
//!
//! Commits live in a flat map; parent links are lookups by ref, never owning
//! pointers. A commit is only inserted once every parent it names is present,
//! so the graph stays acyclic by construction. Commits that arrive before
//! their parents are parked as a pending branch until the parents show up.

use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet, VecDeque};

use serde_json::Value;
use thiserror::Error;

use crate::commit::Commit;
use crate::delta::{self, Delta, DeltaError};

#[derive(Debug, Clone, PartialEq, Error)]
pub enum GraphError {
    #[error("commit {0} is referenced before it is defined in the batch")]
    OutOfOrder(String),
    #[error("commit {ref_id} references unknown {field} {parent}")]
    UnknownRef {
        ref_id: String,
        parent: String,
        field: &'static str,
    },
    #[error("commit {0} is not in the graph")]
    Missing(String),
    #[error(transparent)]
    Delta(#[from] DeltaError),
}

/// Result of the batch-local validation pass.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BatchRefs {
    /// Refs defined by the batch.
    pub new_refs: BTreeSet<String>,
    /// Parent refs the batch uses without defining them.
    pub referenced_external_refs: BTreeSet<String>,
}

/// Checks that no commit in `commits` is referenced before it is defined.
///
/// Runs in one pass and has no side effects; callers decide what to do with
/// the external refs (the relay requires them to exist, clients park them).
pub fn validate_batch(commits: &[Commit]) -> Result<BatchRefs, GraphError> {
    let mut refs = BatchRefs::default();
    let mut referenced = HashSet::new();

    for commit in commits {
        if referenced.contains(commit.ref_id.as_str()) && !refs.new_refs.contains(&commit.ref_id) {
            return Err(GraphError::OutOfOrder(commit.ref_id.clone()));
        }
        refs.new_refs.insert(commit.ref_id.clone());
        for parent in commit.parents() {
            referenced.insert(parent);
            if !refs.new_refs.contains(parent) {
                refs.referenced_external_refs.insert(parent.to_string());
            }
        }
    }

    Ok(refs)
}

/// Outcome of inserting a batch.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct InsertOutcome {
    /// Refs that became part of the graph, in insertion order.
    pub inserted: Vec<String>,
    /// Refs parked because a parent is still missing.
    pub deferred: Vec<String>,
}

#[derive(Debug, Clone, Default)]
pub struct CommitGraph {
    commits: HashMap<String, Commit>,
    children: HashMap<String, Vec<String>>,
    heads: BTreeSet<String>,
    /// Materialized document values by ref.
    values: HashMap<String, Value>,
    /// Commits waiting for a parent, keyed by ref.
    pending: BTreeMap<String, Commit>,
}

impl CommitGraph {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.commits.len()
    }

    pub fn is_empty(&self) -> bool {
        self.commits.is_empty()
    }

    pub fn contains(&self, ref_id: &str) -> bool {
        self.commits.contains_key(ref_id)
    }

    pub fn get(&self, ref_id: &str) -> Option<&Commit> {
        self.commits.get(ref_id)
    }

    pub fn children(&self, ref_id: &str) -> &[String] {
        self.children.get(ref_id).map_or(&[], Vec::as_slice)
    }

    /// Refs no commit names as a parent, in ref order.
    pub fn heads(&self) -> Vec<String> {
        self.heads.iter().cloned().collect()
    }

    pub fn pending_len(&self) -> usize {
        self.pending.len()
    }

    /// Inserts a commit whose parents are all present.
    ///
    /// Returns `Ok(false)` if the ref is already known.
    pub fn insert(&mut self, commit: Commit) -> Result<bool, GraphError> {
        if self.commits.contains_key(&commit.ref_id) {
            return Ok(false);
        }
        if let Some(parent) = &commit.base_ref {
            self.require(&commit.ref_id, parent, "baseRef")?;
        }
        if let Some(parent) = &commit.merge_ref {
            self.require(&commit.ref_id, parent, "mergeRef")?;
        }

        for parent in commit.parents() {
            self.heads.remove(parent);
            self.children
                .entry(parent.to_string())
                .or_default()
                .push(commit.ref_id.clone());
        }
        self.heads.insert(commit.ref_id.clone());
        self.pending.remove(&commit.ref_id);
        self.commits.insert(commit.ref_id.clone(), commit);
        Ok(true)
    }

    fn require(&self, ref_id: &str, parent: &str, field: &'static str) -> Result<(), GraphError> {
        if self.commits.contains_key(parent) {
            Ok(())
        } else {
            Err(GraphError::UnknownRef {
                ref_id: ref_id.to_string(),
                parent: parent.to_string(),
                field,
            })
        }
    }

    /// Validates and inserts an ordered batch.
    ///
    /// Known refs are skipped. Commits with a missing parent are parked and
    /// retried on every later batch.
    pub fn insert_batch(&mut self, commits: Vec<Commit>) -> Result<InsertOutcome, GraphError> {
        validate_batch(&commits)?;
        self.insert_all(commits)
    }

    /// Inserts commits in any order, parking those whose parents are missing.
    ///
    /// Used when reloading a local store, whose order is not a batch order.
    pub fn insert_all(&mut self, commits: Vec<Commit>) -> Result<InsertOutcome, GraphError> {
        let mut outcome = InsertOutcome::default();
        for commit in commits {
            if self.commits.contains_key(&commit.ref_id) {
                continue;
            }
            if commit.parents().all(|p| self.commits.contains_key(p)) {
                let ref_id = commit.ref_id.clone();
                self.insert(commit)?;
                outcome.inserted.push(ref_id);
            } else {
                self.pending.insert(commit.ref_id.clone(), commit);
            }
        }

        loop {
            let ready: Vec<String> = self
                .pending
                .values()
                .filter(|c| c.parents().all(|p| self.commits.contains_key(p)))
                .map(|c| c.ref_id.clone())
                .collect();
            if ready.is_empty() {
                break;
            }
            for ref_id in ready {
                if let Some(commit) = self.pending.remove(&ref_id) {
                    self.insert(commit)?;
                    outcome.inserted.push(ref_id);
                }
            }
        }

        outcome.deferred = self.pending.keys().cloned().collect();
        Ok(outcome)
    }

    /// Replaces the metadata of a known commit.
    pub fn set_metadata(&mut self, ref_id: &str, metadata: Value) -> bool {
        match self.commits.get_mut(ref_id) {
            Some(commit) => {
                commit.metadata = metadata;
                true
            }
            None => false,
        }
    }

    /// Document value at `ref_id`; `None` is the empty document (`null`).
    ///
    /// Walks the base chain back to the nearest cached value, collapses the
    /// chain's deltas into one and applies it.
    pub fn value(&mut self, ref_id: Option<&str>) -> Result<Value, GraphError> {
        let Some(ref_id) = ref_id else {
            return Ok(Value::Null);
        };
        if let Some(cached) = self.values.get(ref_id) {
            return Ok(cached.clone());
        }

        let mut chain = Vec::new();
        let mut cursor = ref_id.to_string();
        let base = loop {
            if let Some(cached) = self.values.get(&cursor) {
                break cached.clone();
            }
            let commit = self
                .commits
                .get(&cursor)
                .ok_or_else(|| GraphError::Missing(cursor.clone()))?;
            chain.push(delta::decode_opt(&commit.delta)?);
            match &commit.base_ref {
                Some(parent) => cursor = parent.clone(),
                None => break Value::Null,
            }
        };

        let mut collapsed: Option<Delta> = None;
        for step in chain.into_iter().rev() {
            collapsed = match (collapsed, step) {
                (None, step) => step,
                (Some(acc), None) => Some(acc),
                (Some(acc), Some(step)) => delta::flatten(&acc, &step)?,
            };
        }

        let value = delta::patch_opt(&base, collapsed.as_ref())?;
        self.values.insert(ref_id.to_string(), value.clone());
        Ok(value)
    }

    /// Seeds the value cache, e.g. with a value the caller just computed.
    pub fn cache_value(&mut self, ref_id: &str, value: Value) {
        self.values.insert(ref_id.to_string(), value);
    }

    /// Breadth-first distances from `ref_id` to each of its ancestors (itself at 0).
    pub fn ancestors(&self, ref_id: &str) -> HashMap<String, usize> {
        let mut distances = HashMap::new();
        let mut queue = VecDeque::from([(ref_id.to_string(), 0usize)]);
        while let Some((current, distance)) = queue.pop_front() {
            if distances.contains_key(&current) {
                continue;
            }
            if let Some(commit) = self.commits.get(&current) {
                for parent in commit.parents() {
                    queue.push_back((parent.to_string(), distance + 1));
                }
            }
            distances.insert(current, distance);
        }
        distances
    }

    /// Common ancestor with the smallest combined distance; ties go to the
    /// lowest ref so every replica picks the same base.
    pub fn nearest_common_ancestor(&self, a: &str, b: &str) -> Option<String> {
        let from_a = self.ancestors(a);
        let from_b = self.ancestors(b);
        from_a
            .iter()
            .filter_map(|(ref_id, da)| from_b.get(ref_id).map(|db| (da + db, ref_id)))
            .min()
            .map(|(_, ref_id)| ref_id.clone())
    }

    /// Whether `ancestor` is reachable from `descendant` through parent links.
    pub fn is_ancestor(&self, ancestor: &str, descendant: &str) -> bool {
        self.ancestors(descendant).contains_key(ancestor)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn commit(ref_id: &str, base: Option<&str>, merge: Option<&str>) -> Commit {
        Commit {
            ref_id: ref_id.to_string(),
            base_ref: base.map(str::to_string),
            merge_ref: merge.map(str::to_string),
            delta: Value::Null,
            metadata: Value::Null,
        }
    }

    fn edit(ref_id: &str, base: Option<&str>, old: &Value, new: &Value) -> Commit {
        let mut c = commit(ref_id, base, None);
        c.delta = delta::encode_opt(delta::diff(old, new).as_ref());
        c
    }

    #[test]
    fn test_validate_rejects_forward_reference() {
        let batch = vec![commit("2", Some("1"), None), commit("1", None, None)];
        assert_eq!(
            validate_batch(&batch),
            Err(GraphError::OutOfOrder("1".into()))
        );
    }

    #[test]
    fn test_validate_accepts_ordered_batch() {
        let batch = vec![commit("1", None, None), commit("2", Some("1"), None)];
        let refs = validate_batch(&batch).unwrap();
        assert_eq!(refs.new_refs, BTreeSet::from(["1".into(), "2".into()]));
        assert!(refs.referenced_external_refs.is_empty());
    }

    #[test]
    fn test_validate_reports_external_refs() {
        let batch = vec![commit("3", Some("1"), Some("2"))];
        let refs = validate_batch(&batch).unwrap();
        assert_eq!(
            refs.referenced_external_refs,
            BTreeSet::from(["1".into(), "2".into()])
        );
    }

    #[test]
    fn test_heads_track_divergence() {
        let mut graph = CommitGraph::new();
        graph.insert(commit("a", None, None)).unwrap();
        graph.insert(commit("b", Some("a"), None)).unwrap();
        graph.insert(commit("c", Some("a"), None)).unwrap();
        assert_eq!(graph.heads(), vec!["b".to_string(), "c".to_string()]);
        assert_eq!(graph.children("a"), &["b".to_string(), "c".to_string()]);

        graph.insert(commit("m", Some("b"), Some("c"))).unwrap();
        assert_eq!(graph.heads(), vec!["m".to_string()]);
    }

    #[test]
    fn test_insert_requires_parents() {
        let mut graph = CommitGraph::new();
        let err = graph.insert(commit("b", Some("a"), None)).unwrap_err();
        assert!(matches!(err, GraphError::UnknownRef { field: "baseRef", .. }));
        assert!(graph.is_empty());
    }

    #[test]
    fn test_batch_parks_orphans_until_parent_arrives() {
        let mut graph = CommitGraph::new();
        let outcome = graph.insert_batch(vec![commit("b", Some("a"), None)]).unwrap();
        assert!(outcome.inserted.is_empty());
        assert_eq!(outcome.deferred, vec!["b".to_string()]);

        let outcome = graph.insert_batch(vec![commit("a", None, None)]).unwrap();
        assert_eq!(outcome.inserted, vec!["a".to_string(), "b".to_string()]);
        assert_eq!(graph.pending_len(), 0);
        assert_eq!(graph.heads(), vec!["b".to_string()]);
    }

    #[test]
    fn test_insert_all_accepts_children_first() {
        let mut graph = CommitGraph::new();
        let outcome = graph
            .insert_all(vec![commit("c", Some("b"), None), commit("b", Some("a"), None), commit("a", None, None)])
            .unwrap();
        assert_eq!(outcome.inserted.len(), 3);
        assert!(outcome.deferred.is_empty());
        assert_eq!(graph.heads(), vec!["c".to_string()]);
    }

    #[test]
    fn test_duplicate_insert_is_noop() {
        let mut graph = CommitGraph::new();
        assert!(graph.insert(commit("a", None, None)).unwrap());
        assert!(!graph.insert(commit("a", None, None)).unwrap());
        assert_eq!(graph.len(), 1);
    }

    #[test]
    fn test_value_materializes_chain() {
        let v0 = json!({"n": 0});
        let v1 = json!({"n": 1, "tag": "x"});
        let v2 = json!({"n": 2});
        let mut graph = CommitGraph::new();
        graph.insert(edit("a", None, &Value::Null, &v0)).unwrap();
        graph.insert(edit("b", Some("a"), &v0, &v1)).unwrap();
        graph.insert(edit("c", Some("b"), &v1, &v2)).unwrap();

        assert_eq!(graph.value(Some("c")).unwrap(), v2);
        assert_eq!(graph.value(Some("b")).unwrap(), v1);
        assert_eq!(graph.value(None).unwrap(), Value::Null);
        assert!(matches!(graph.value(Some("zz")), Err(GraphError::Missing(_))));
    }

    #[test]
    fn test_nearest_common_ancestor() {
        let mut graph = CommitGraph::new();
        graph.insert(commit("a", None, None)).unwrap();
        graph.insert(commit("b", Some("a"), None)).unwrap();
        graph.insert(commit("c", Some("b"), None)).unwrap();
        graph.insert(commit("d", Some("b"), None)).unwrap();
        graph.insert(commit("e", Some("d"), None)).unwrap();

        assert_eq!(graph.nearest_common_ancestor("c", "e"), Some("b".into()));
        assert_eq!(graph.nearest_common_ancestor("b", "e"), Some("b".into()));
        assert!(graph.is_ancestor("a", "e"));
        assert!(!graph.is_ancestor("c", "e"));
    }

    #[test]
    fn test_unrelated_roots_have_no_common_ancestor() {
        let mut graph = CommitGraph::new();
        graph.insert(commit("x", None, None)).unwrap();
        graph.insert(commit("y", None, None)).unwrap();
        assert_eq!(graph.nearest_common_ancestor("x", "y"), None);
    }
}
