//! Commit records and the relay-assigned ordering metadata.

use serde::{Deserialize, Deserializer, Serialize, Serializer};
use serde_json::{Map, Value};

use crate::error::ErrorCode;

/// Key under which the relay embeds [`ServerMetadata`] in commit metadata.
pub const SERVER_METADATA_KEY: &str = "server";

/// Key used to wrap non-object client metadata before embedding server metadata.
pub const CLIENT_METADATA_KEY: &str = "client";

/// An immutable, content-addressed node of the commit graph.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Commit {
    #[serde(rename = "ref")]
    pub ref_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub base_ref: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub merge_ref: Option<String>,
    #[serde(default)]
    pub delta: Value,
    #[serde(default)]
    pub metadata: Value,
}

impl Commit {
    /// Parent refs in `(base, merge)` order.
    pub fn parents(&self) -> impl Iterator<Item = &str> {
        self.base_ref
            .as_deref()
            .into_iter()
            .chain(self.merge_ref.as_deref())
    }

    pub fn is_merge(&self) -> bool {
        self.merge_ref.is_some()
    }

    /// Relay-assigned metadata, if this commit has been accepted by a relay.
    pub fn server_metadata(&self) -> Option<ServerMetadata> {
        let server = self.metadata.get(SERVER_METADATA_KEY)?;
        serde_json::from_value(server.clone()).ok()
    }

    /// Returns a copy of this commit with `server` embedded in its metadata.
    pub fn with_server_metadata(&self, server: &ServerMetadata) -> Commit {
        let mut commit = self.clone();
        commit.metadata = embed_server_metadata(&self.metadata, server);
        commit
    }
}

/// Embeds relay metadata under [`SERVER_METADATA_KEY`].
///
/// Object metadata keeps its keys; anything else is moved under
/// [`CLIENT_METADATA_KEY`].
pub fn embed_server_metadata(metadata: &Value, server: &ServerMetadata) -> Value {
    let mut object = match metadata {
        Value::Object(map) => map.clone(),
        Value::Null => Map::new(),
        other => {
            let mut map = Map::new();
            map.insert(CLIENT_METADATA_KEY.to_string(), other.clone());
            map
        }
    };
    object.insert(
        SERVER_METADATA_KEY.to_string(),
        serde_json::to_value(server).unwrap_or(Value::Null),
    );
    Value::Object(object)
}

/// Per-document batch identifier issued by the relay, once per `add()` call.
///
/// On the wire this is a 16-digit lowercase hex string, so string order and
/// numeric order agree.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct SyncId(pub u64);

impl SyncId {
    pub const ZERO: SyncId = SyncId(0);

    pub fn next(self) -> SyncId {
        SyncId(self.0 + 1)
    }

    pub fn parse(s: &str) -> Option<SyncId> {
        u64::from_str_radix(s, 16).ok().map(SyncId)
    }
}

impl std::fmt::Display for SyncId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:016x}", self.0)
    }
}

impl Serialize for SyncId {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for SyncId {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = String::deserialize(deserializer)?;
        SyncId::parse(&raw)
            .ok_or_else(|| serde::de::Error::custom(format!("invalid syncId: {raw}")))
    }
}

/// Ordering metadata the relay embeds in every accepted commit.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ServerMetadata {
    /// The commit extended the relay's head (fast-forward or merge of it).
    pub main: bool,
    pub sync_id: SyncId,
    pub sync_index: u32,
}

/// One acknowledged commit in an `ack` event.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AckCommit {
    #[serde(rename = "ref")]
    pub ref_id: String,
    #[serde(default)]
    pub metadata: Value,
}

/// Why a single commit of a batch was rejected.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RefError {
    pub code: ErrorCode,
    pub message: String,
}

impl RefError {
    pub fn new(code: ErrorCode, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
        }
    }
}

/// The state a client needs to resume from a given point.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Snapshot {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sync_cursor: Option<SyncId>,
    pub heads: Vec<String>,
}
