//! Deterministic content addressing for commits.
//!
//! Canonical form (scheme version 1):
//! ```text
//! sha256( json([baseRef | null, mergeRef | null, delta (, metadata)]) )
//!   └─► base64url, no padding (43 chars)
//! ```
//!
//! `serde_json` maps are `BTreeMap`-backed, so object keys serialize in
//! sorted order and the encoding is canonical for a given `Value`.

use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use serde_json::Value;
use sha2::{Digest, Sha256};

/// Identifies the canonical byte encoding fed into the digest.
pub const HASH_SCHEME_VERSION: u32 = 1;

/// Length of every ref produced by [`compute_ref`].
pub const REF_LEN: usize = 43;

/// Which fields participate in the ref.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct RefScheme {
    /// Hash commit metadata too. Off by default: the relay stamps server
    /// metadata onto commits after their ref is fixed.
    pub include_metadata: bool,
}

impl RefScheme {
    pub fn with_metadata() -> Self {
        Self {
            include_metadata: true,
        }
    }

    pub fn compute(
        &self,
        base_ref: Option<&str>,
        merge_ref: Option<&str>,
        delta: &Value,
        metadata: &Value,
    ) -> String {
        let mut parts = vec![
            base_ref.map_or(Value::Null, |r| Value::String(r.to_string())),
            merge_ref.map_or(Value::Null, |r| Value::String(r.to_string())),
            delta.clone(),
        ];
        if self.include_metadata {
            parts.push(metadata.clone());
        }
        // Serializing a Value tree cannot fail.
        let canonical = serde_json::to_vec(&Value::Array(parts)).unwrap_or_default();
        let digest = Sha256::digest(&canonical);
        URL_SAFE_NO_PAD.encode(digest)
    }
}

/// Computes a commit ref with the default scheme (metadata excluded).
pub fn compute_ref(
    base_ref: Option<&str>,
    merge_ref: Option<&str>,
    delta: &Value,
    metadata: &Value,
) -> String {
    RefScheme::default().compute(base_ref, merge_ref, delta, metadata)
}

/// Whether `candidate` has the shape of a ref produced by this module.
pub fn is_well_formed(candidate: &str) -> bool {
    candidate.len() == REF_LEN
        && candidate
            .bytes()
            .all(|b| b.is_ascii_alphanumeric() || b == b'-' || b == b'_')
}
