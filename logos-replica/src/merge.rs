//! Deterministic reduction of divergent heads into a single head.
//!
//! Heads are sorted, the two lowest are merged through a caller-supplied
//! three-way merge function, and the resulting merge commit replaces them.
//! Every replica that sees the same head set performs the same sequence of
//! merges and therefore produces the same merge refs.

use std::cmp::Ordering;
use std::sync::Arc;

use serde_json::{Map, Value};

use crate::commit::Commit;
use crate::delta;
use crate::graph::{CommitGraph, GraphError};
use crate::hash::RefScheme;

/// One side of a three-way merge.
#[derive(Debug, Clone, PartialEq)]
pub struct MergeInput {
    pub ref_id: String,
    pub value: Value,
    pub metadata: Value,
}

#[derive(Debug, Clone, PartialEq)]
pub struct MergeResult {
    pub value: Value,
    pub metadata: Value,
}

/// Three-way merge over materialized document values.
///
/// `base` is `None` when the two sides share no ancestor.
pub trait MergeFn: Send + Sync {
    fn merge(&self, base: Option<&MergeInput>, left: &MergeInput, right: &MergeInput)
        -> MergeResult;
}

impl<F> MergeFn for F
where
    F: Fn(Option<&MergeInput>, &MergeInput, &MergeInput) -> MergeResult + Send + Sync,
{
    fn merge(
        &self,
        base: Option<&MergeInput>,
        left: &MergeInput,
        right: &MergeInput,
    ) -> MergeResult {
        self(base, left, right)
    }
}

/// Wraps a closure as a shared merge function.
pub fn merge_fn<F>(f: F) -> Arc<dyn MergeFn>
where
    F: Fn(Option<&MergeInput>, &MergeInput, &MergeInput) -> MergeResult + Send + Sync + 'static,
{
    Arc::new(f)
}

/// Key-wise merge of JSON objects.
///
/// A key changed on only one side takes that side's value. A key changed
/// on both sides takes the right side. Non-object documents take the right
/// side whole. Metadata is kept from the left side.
#[derive(Debug, Clone, Copy, Default)]
pub struct KeyWiseMerge;

impl MergeFn for KeyWiseMerge {
    fn merge(
        &self,
        base: Option<&MergeInput>,
        left: &MergeInput,
        right: &MergeInput,
    ) -> MergeResult {
        let empty = Map::new();
        let base_map = match base.map(|b| &b.value) {
            Some(Value::Object(map)) => map,
            _ => &empty,
        };
        let value = match (&left.value, &right.value) {
            (Value::Object(l), Value::Object(r)) => {
                let mut merged = Map::new();
                for key in l.keys().chain(r.keys()).chain(base_map.keys()) {
                    if merged.contains_key(key) {
                        continue;
                    }
                    let b = base_map.get(key);
                    let lv = l.get(key);
                    let rv = r.get(key);
                    let chosen = if rv != b { rv } else { lv };
                    if let Some(v) = chosen {
                        merged.insert(key.clone(), v.clone());
                    }
                }
                Value::Object(merged)
            }
            _ => right.value.clone(),
        };
        MergeResult {
            value,
            metadata: left.metadata.clone(),
        }
    }
}

type HeadOrder = Arc<dyn Fn(&str, &str) -> Ordering + Send + Sync>;

/// The merges performed by one call to [`MergeEngine::merge_heads`].
#[derive(Debug, Clone, PartialEq)]
pub struct MergeOutcome {
    /// The single head left after reduction.
    pub head: String,
    /// Merge commits in creation order; each is already in the graph.
    pub commits: Vec<Commit>,
}

#[derive(Clone)]
pub struct MergeEngine {
    merge_fn: Arc<dyn MergeFn>,
    scheme: RefScheme,
    order: Option<HeadOrder>,
}

impl std::fmt::Debug for MergeEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MergeEngine")
            .field("scheme", &self.scheme)
            .field("custom_order", &self.order.is_some())
            .finish()
    }
}

impl MergeEngine {
    pub fn new(merge_fn: Arc<dyn MergeFn>, scheme: RefScheme) -> Self {
        Self {
            merge_fn,
            scheme,
            order: None,
        }
    }

    /// Overrides the head tie-break order (default: ref string order).
    pub fn with_order<F>(mut self, order: F) -> Self
    where
        F: Fn(&str, &str) -> Ordering + Send + Sync + 'static,
    {
        self.order = Some(Arc::new(order));
        self
    }

    fn sort(&self, heads: &mut [String]) {
        match &self.order {
            Some(order) => heads.sort_by(|a, b| order(a, b).then_with(|| a.cmp(b))),
            None => heads.sort(),
        }
    }

    /// Reduces the graph's heads to one, inserting merge commits as it goes.
    ///
    /// Returns `None` when the graph has at most one head.
    pub fn merge_heads(&self, graph: &mut CommitGraph) -> Result<Option<MergeOutcome>, GraphError> {
        let mut heads = graph.heads();
        if heads.len() < 2 {
            return Ok(None);
        }
        self.sort(&mut heads);

        let mut commits = Vec::new();
        while heads.len() > 1 {
            let left = heads.remove(0);
            let right = heads.remove(0);
            let commit = self.merge_pair(graph, &left, &right)?;
            log::debug!("merged {left} + {right} -> {}", commit.ref_id);
            heads.push(commit.ref_id.clone());
            self.sort(&mut heads);
            commits.push(commit);
        }

        Ok(heads.pop().map(|head| MergeOutcome { head, commits }))
    }

    fn merge_pair(
        &self,
        graph: &mut CommitGraph,
        left: &str,
        right: &str,
    ) -> Result<Commit, GraphError> {
        let base = match graph.nearest_common_ancestor(left, right) {
            Some(base_ref) => Some(self.input(graph, &base_ref)?),
            None => None,
        };
        let left_input = self.input(graph, left)?;
        let right_input = self.input(graph, right)?;

        let merged = self
            .merge_fn
            .merge(base.as_ref(), &left_input, &right_input);

        let delta = delta::encode_opt(delta::diff(&left_input.value, &merged.value).as_ref());
        let ref_id = self
            .scheme
            .compute(Some(left), Some(right), &delta, &merged.metadata);
        let commit = Commit {
            ref_id: ref_id.clone(),
            base_ref: Some(left.to_string()),
            merge_ref: Some(right.to_string()),
            delta,
            metadata: merged.metadata,
        };

        graph.insert(commit.clone())?;
        graph.cache_value(&ref_id, merged.value);
        Ok(commit)
    }

    fn input(&self, graph: &mut CommitGraph, ref_id: &str) -> Result<MergeInput, GraphError> {
        let value = graph.value(Some(ref_id))?;
        let metadata = graph
            .get(ref_id)
            .map(|c| c.metadata.clone())
            .unwrap_or(Value::Null);
        Ok(MergeInput {
            ref_id: ref_id.to_string(),
            value,
            metadata,
        })
    }
}
