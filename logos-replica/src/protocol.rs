//! JSON event protocol shared by the coordinator and the relay.
//!
//! One event per text frame, tagged by `type`:
//! ```text
//! client                                   relay
//!   │ ── init {version, auth, localStoreId} ──► │
//!   │ ◄──────────── commits (backlog) ───────── │
//!   │ ◄──────────── ready ───────────────────── │
//!   │ ── commits ─────────────────────────────► │
//!   │ ◄──────────── ack {acks, refErrors} ───── │ ──► commits (siblings)
//!   │ ── client-join / client-presence ───────► │ ──► relayed (siblings)
//! ```
//!
//! The relay refuses inbound payloads above [`MAX_PAYLOAD_BYTES`] before
//! parsing. Both sides split outgoing commits with [`commit_frames`] so no
//! frame they produce crosses that limit unless a single commit does.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

use crate::commit::{AckCommit, Commit, RefError, SyncId};
use crate::error::ErrorCode;

/// Wire protocol version carried in `init`.
pub const PROTOCOL_VERSION: u32 = 1;

/// Largest accepted text payload, in bytes.
pub const MAX_PAYLOAD_BYTES: usize = 1_000_000;

/// Standard WebSocket close codes used by the relay.
pub mod close_code {
    pub const NORMAL: u16 = 1000;
    pub const UNSUPPORTED_DATA: u16 = 1003;
    pub const MESSAGE_TOO_BIG: u16 = 1009;
    pub const INTERNAL_ERROR: u16 = 1011;
}

/// Identity and presence of one client session.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ClientInfo {
    pub user_id: String,
    pub client_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub presence: Option<Value>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ConnectState {
    Connecting,
    Online,
    Offline,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ReadState {
    Online,
    Offline,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum SaveState {
    Saving,
    Saved,
}

/// Body of an `error` event.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorInfo {
    pub code: ErrorCode,
    pub message: String,
    #[serde(default)]
    pub fatal: bool,
    #[serde(default)]
    pub reconnect: bool,
}

/// Top-level protocol event.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum SyncEvent {
    #[serde(rename_all = "camelCase")]
    Init {
        version: u32,
        #[serde(default)]
        auth: Value,
        local_store_id: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        last_sync_cursor: Option<SyncId>,
    },
    #[serde(rename_all = "camelCase")]
    Commits {
        commits: Vec<Commit>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        sync_id: Option<SyncId>,
    },
    #[serde(rename_all = "camelCase")]
    Ack {
        acks: Vec<AckCommit>,
        #[serde(default)]
        ref_errors: BTreeMap<String, RefError>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        sync_id: Option<SyncId>,
    },
    Ready,
    ClientJoin {
        info: ClientInfo,
    },
    ClientPresence {
        info: ClientInfo,
    },
    #[serde(rename_all = "camelCase")]
    ClientLeave {
        user_id: String,
        client_id: String,
    },
    RemoteState {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        connect: Option<ConnectState>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        read: Option<ReadState>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        save: Option<SaveState>,
    },
    Error(ErrorInfo),
}

impl SyncEvent {
    pub fn init(auth: Value, local_store_id: impl Into<String>, cursor: Option<SyncId>) -> Self {
        SyncEvent::Init {
            version: PROTOCOL_VERSION,
            auth,
            local_store_id: local_store_id.into(),
            last_sync_cursor: cursor,
        }
    }

    pub fn error(code: ErrorCode, message: impl Into<String>, fatal: bool, reconnect: bool) -> Self {
        SyncEvent::Error(ErrorInfo {
            code,
            message: message.into(),
            fatal,
            reconnect,
        })
    }

    /// The `type` tag, for logging.
    pub fn kind(&self) -> &'static str {
        match self {
            SyncEvent::Init { .. } => "init",
            SyncEvent::Commits { .. } => "commits",
            SyncEvent::Ack { .. } => "ack",
            SyncEvent::Ready => "ready",
            SyncEvent::ClientJoin { .. } => "client-join",
            SyncEvent::ClientPresence { .. } => "client-presence",
            SyncEvent::ClientLeave { .. } => "client-leave",
            SyncEvent::RemoteState { .. } => "remote-state",
            SyncEvent::Error(_) => "error",
        }
    }

    /// Serialize to a text frame.
    pub fn encode(&self) -> Result<String, ProtocolError> {
        serde_json::to_string(self).map_err(|e| ProtocolError::Serialization(e.to_string()))
    }

    /// Parse a text frame of any size.
    pub fn decode(text: &str) -> Result<Self, ProtocolError> {
        serde_json::from_str(text).map_err(|e| ProtocolError::Malformed(e.to_string()))
    }

    /// Parse a text frame, refusing oversized payloads before parsing.
    pub fn decode_limited(text: &str, limit: usize) -> Result<Self, ProtocolError> {
        if text.len() > limit {
            return Err(ProtocolError::TooLarge {
                size: text.len(),
                limit,
            });
        }
        Self::decode(text)
    }
}

/// Encoded size of a `commits` event without its commits.
const COMMITS_FRAME_OVERHEAD: usize = 64;

/// Splits `commits` into `commits` events of at most `budget` encoded bytes.
///
/// Order is kept; a commit larger than the budget travels alone. An event
/// carries a syncId only once every commit of that syncId has been emitted,
/// so a receiver that advances its cursor per event never skips the rest of
/// a group. The last event carries `sync_id`.
pub fn commit_frames(commits: Vec<Commit>, sync_id: Option<SyncId>, budget: usize) -> Vec<SyncEvent> {
    let mut chunks: Vec<Vec<Commit>> = Vec::new();
    let mut current = Vec::new();
    let mut size = COMMITS_FRAME_OVERHEAD;
    for commit in commits {
        let len = serde_json::to_string(&commit).map_or(0, |text| text.len()) + 1;
        if !current.is_empty() && size + len > budget {
            chunks.push(std::mem::take(&mut current));
            size = COMMITS_FRAME_OVERHEAD;
        }
        size += len;
        current.push(commit);
    }
    chunks.push(current);

    let group_of = |commit: Option<&Commit>| commit.and_then(Commit::server_metadata).map(|m| m.sync_id);
    let completed: Vec<Option<SyncId>> = chunks
        .windows(2)
        .map(|pair| {
            let tail = group_of(pair[0].last());
            if tail != group_of(pair[1].first()) {
                tail
            } else {
                None
            }
        })
        .chain(std::iter::once(sync_id))
        .collect();

    chunks
        .into_iter()
        .zip(completed)
        .map(|(commits, sync_id)| SyncEvent::Commits { commits, sync_id })
        .collect()
}

/// Observable connectivity of a coordinator.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SyncStatus {
    pub connect: ConnectState,
    pub read: ReadState,
    pub save: SaveState,
    pub last_error: Option<ErrorInfo>,
}

impl Default for SyncStatus {
    fn default() -> Self {
        Self {
            connect: ConnectState::Offline,
            read: ReadState::Offline,
            save: SaveState::Saved,
            last_error: None,
        }
    }
}

impl SyncStatus {
    /// Folds a `remote-state` event in; absent fields keep their value.
    pub fn apply(
        &mut self,
        connect: Option<ConnectState>,
        read: Option<ReadState>,
        save: Option<SaveState>,
    ) {
        if let Some(connect) = connect {
            self.connect = connect;
        }
        if let Some(read) = read {
            self.read = read;
        }
        if let Some(save) = save {
            self.save = save;
        }
    }
}

/// Wire codec errors.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ProtocolError {
    #[error("serialization error: {0}")]
    Serialization(String),
    #[error("malformed event: {0}")]
    Malformed(String),
    #[error("payload of {size} bytes exceeds {limit}")]
    TooLarge { size: usize, limit: usize },
    #[error("unsupported protocol version {0}")]
    UnsupportedVersion(u32),
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_init_wire_shape() {
        let event = SyncEvent::init(json!({"token": "t"}), "store-1", Some(SyncId(2)));
        let value: Value = serde_json::from_str(&event.encode().unwrap()).unwrap();
        assert_eq!(value["type"], "init");
        assert_eq!(value["version"], PROTOCOL_VERSION);
        assert_eq!(value["localStoreId"], "store-1");
        assert_eq!(value["lastSyncCursor"], "0000000000000002");
    }

    #[test]
    fn test_ack_parses_ref_errors() {
        let text = r#"{
            "type": "ack",
            "acks": [{"ref": "a", "metadata": {"server": {"main": true, "syncId": "0000000000000001", "syncIndex": 0}}}],
            "refErrors": {"b": {"code": "unknown-ref", "message": "unknown baseRef"}},
            "syncId": "0000000000000001"
        }"#;
        let SyncEvent::Ack { acks, ref_errors, sync_id } = SyncEvent::decode(text).unwrap() else {
            panic!("expected ack");
        };
        assert_eq!(acks[0].ref_id, "a");
        assert_eq!(ref_errors["b"].code, ErrorCode::UnknownRef);
        assert_eq!(sync_id, Some(SyncId(1)));
    }

    #[test]
    fn test_unit_and_presence_events() {
        assert_eq!(SyncEvent::decode(r#"{"type":"ready"}"#).unwrap(), SyncEvent::Ready);

        let join = SyncEvent::ClientJoin {
            info: ClientInfo {
                user_id: "u".into(),
                client_id: "c".into(),
                presence: Some(json!({"cursor": 3})),
            },
        };
        let value: Value = serde_json::from_str(&join.encode().unwrap()).unwrap();
        assert_eq!(value["type"], "client-join");
        assert_eq!(value["info"]["userId"], "u");

        let leave = SyncEvent::decode(r#"{"type":"client-leave","userId":"u","clientId":"c"}"#);
        assert_eq!(leave.unwrap().kind(), "client-leave");
    }

    #[test]
    fn test_error_event_is_flat() {
        let event = SyncEvent::error(ErrorCode::Unauthorized, "nope", true, false);
        let value: Value = serde_json::from_str(&event.encode().unwrap()).unwrap();
        assert_eq!(
            value,
            json!({"type": "error", "code": "unauthorized", "message": "nope", "fatal": true, "reconnect": false})
        );
    }

    #[test]
    fn test_remote_state_partial_fields() {
        let event = SyncEvent::decode(r#"{"type":"remote-state","save":"saving"}"#).unwrap();
        let SyncEvent::RemoteState { connect, read, save } = event else {
            panic!("expected remote-state");
        };
        let mut status = SyncStatus::default();
        status.apply(connect, read, save);
        assert_eq!(status.save, SaveState::Saving);
        assert_eq!(status.connect, ConnectState::Offline);
    }

    #[test]
    fn test_read_state_is_online_or_offline() {
        let states: Vec<ReadState> = serde_json::from_str(r#"["online","offline"]"#).unwrap();
        assert_eq!(states, vec![ReadState::Online, ReadState::Offline]);
        assert!(serde_json::from_str::<ReadState>(r#""loading""#).is_err());
    }

    #[test]
    fn test_decode_rejects_garbage_and_oversize() {
        assert!(matches!(
            SyncEvent::decode("{not json"),
            Err(ProtocolError::Malformed(_))
        ));
        assert!(matches!(
            SyncEvent::decode(r#"{"type":"teleport"}"#),
            Err(ProtocolError::Malformed(_))
        ));
        let big = format!(r#"{{"type":"commits","commits":[],"pad":"{}"}}"#, "x".repeat(MAX_PAYLOAD_BYTES));
        assert!(matches!(
            SyncEvent::decode_limited(&big, MAX_PAYLOAD_BYTES),
            Err(ProtocolError::TooLarge { .. })
        ));
        // relay output is not held to the relay's inbound limit
        assert!(matches!(SyncEvent::decode(&big), Ok(SyncEvent::Commits { .. })));
    }

    fn sized(ref_id: &str, bytes: usize, sync_id: Option<u64>) -> Commit {
        let metadata = match sync_id {
            Some(id) => json!({
                "server": {
                    "main": true,
                    "syncId": SyncId(id),
                    "syncIndex": 0
                }
            }),
            None => Value::Null,
        };
        Commit {
            ref_id: ref_id.into(),
            base_ref: None,
            merge_ref: None,
            delta: json!("x".repeat(bytes)),
            metadata,
        }
    }

    fn frame_summary(frames: &[SyncEvent]) -> Vec<(Vec<String>, Option<SyncId>)> {
        frames
            .iter()
            .map(|frame| match frame {
                SyncEvent::Commits { commits, sync_id } => {
                    (commits.iter().map(|c| c.ref_id.clone()).collect(), *sync_id)
                }
                other => panic!("unexpected {}", other.kind()),
            })
            .collect()
    }

    #[test]
    fn test_commit_frames_stay_under_budget() {
        let commits = vec![sized("a", 600_000, Some(1)), sized("b", 600_000, Some(2))];
        let frames = commit_frames(commits, Some(SyncId(2)), MAX_PAYLOAD_BYTES);
        assert_eq!(
            frame_summary(&frames),
            vec![
                (vec!["a".to_string()], Some(SyncId(1))),
                (vec!["b".to_string()], Some(SyncId(2))),
            ]
        );
        for frame in &frames {
            let text = frame.encode().unwrap();
            assert!(text.len() <= MAX_PAYLOAD_BYTES, "{} bytes", text.len());
            assert!(SyncEvent::decode_limited(&text, MAX_PAYLOAD_BYTES).is_ok());
        }
    }

    #[test]
    fn test_commit_frames_hold_back_split_sync_id() {
        // a and b share syncId 1 but do not fit one frame together
        let commits = vec![
            sized("a", 600, Some(1)),
            sized("b", 600, Some(1)),
            sized("c", 600, Some(2)),
        ];
        let frames = commit_frames(commits, Some(SyncId(2)), 1_000);
        assert_eq!(
            frame_summary(&frames),
            vec![
                (vec!["a".to_string()], None),
                (vec!["b".to_string()], Some(SyncId(1))),
                (vec!["c".to_string()], Some(SyncId(2))),
            ]
        );
    }

    #[test]
    fn test_commit_frames_keep_small_batches_whole() {
        let commits = vec![sized("a", 10, None), sized("b", 10, None)];
        let frames = commit_frames(commits, None, MAX_PAYLOAD_BYTES);
        assert_eq!(frame_summary(&frames), vec![(vec!["a".to_string(), "b".to_string()], None)]);

        let oversized = commit_frames(vec![sized("big", 5_000, None)], None, 1_000);
        assert_eq!(oversized.len(), 1);
    }
}
