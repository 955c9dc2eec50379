//! Per-connection protocol state machine of the relay.
//!
//! ```text
//! Connected ──accept()──► Unauthenticated ──init──► Authenticated
//!                                                        │ backlog + ready
//!                                                        ▼
//!                      Closed ◄──fatal error / close── Streaming
//! ```
//!
//! A [`Session`] is transport-agnostic: it turns incoming frames and relayed
//! messages into [`Outbound`] actions. The owner processes one input at a
//! time, which is what keeps auth checks, presence bookkeeping and store
//! writes of one connection from racing.

use std::collections::BTreeMap;
use std::sync::Arc;

use tokio::sync::broadcast;
use tokio::sync::broadcast::error::RecvError;
use uuid::Uuid;

use crate::auth::Authenticator;
use crate::commit::{Commit, SyncId};
use crate::error::ErrorCode;
use crate::protocol::{close_code, ProtocolError, SyncEvent, MAX_PAYLOAD_BYTES, PROTOCOL_VERSION};
use crate::relay::{DocumentRelay, PeerInfo, RelayMessage};
use crate::storage::reject_all;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Connected,
    Unauthenticated,
    Authenticated,
    Streaming,
    Closed,
}

/// What the transport should do next.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outbound {
    Text(String),
    Close { code: u16, reason: String },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SessionLimits {
    /// Commits per backlog page.
    pub page_size: usize,
    /// Largest accepted text frame, in bytes; backlog frames are cut to fit it.
    pub max_payload: usize,
}

impl Default for SessionLimits {
    fn default() -> Self {
        Self {
            page_size: 500,
            max_payload: MAX_PAYLOAD_BYTES,
        }
    }
}

pub struct Session {
    id: Uuid,
    relay: Arc<DocumentRelay>,
    authenticator: Arc<dyn Authenticator>,
    limits: SessionLimits,
    state: ConnectionState,
    peer: Option<PeerInfo>,
    /// Presence-joined client ids on this connection, with their user.
    joined: BTreeMap<String, String>,
    receiver: Option<broadcast::Receiver<Arc<RelayMessage>>>,
}

impl Session {
    pub fn new(
        id: Uuid,
        relay: Arc<DocumentRelay>,
        authenticator: Arc<dyn Authenticator>,
        limits: SessionLimits,
    ) -> Self {
        Self {
            id,
            relay,
            authenticator,
            limits,
            state: ConnectionState::Connected,
            peer: None,
            joined: BTreeMap::new(),
            receiver: None,
        }
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn doc_id(&self) -> &str {
        self.relay.doc_id()
    }

    pub fn state(&self) -> ConnectionState {
        self.state
    }

    pub fn is_closed(&self) -> bool {
        self.state == ConnectionState::Closed
    }

    /// Transport is up; the peer must now send `init`.
    pub fn accept(&mut self) {
        if self.state == ConnectionState::Connected {
            self.state = ConnectionState::Unauthenticated;
        }
    }

    /// Next message fanned out by the relay; pending forever before auth.
    pub async fn next_relayed(&mut self) -> Result<Arc<RelayMessage>, RecvError> {
        match self.receiver.as_mut() {
            Some(receiver) => receiver.recv().await,
            None => std::future::pending().await,
        }
    }

    pub async fn handle_text(&mut self, text: &str) -> Vec<Outbound> {
        if self.is_closed() {
            return Vec::new();
        }
        let event = match SyncEvent::decode_limited(text, self.limits.max_payload) {
            Ok(event) => event,
            Err(ProtocolError::TooLarge { size, limit }) => {
                log::warn!("[{}] {size} byte frame exceeds {limit}", self.id);
                return self.close(close_code::MESSAGE_TOO_BIG, "message too big");
            }
            Err(e) => {
                log::warn!("[{}] malformed event: {e}", self.id);
                let mut out = self.event(&SyncEvent::error(ErrorCode::BadRequest, e.to_string(), true, false));
                out.extend(self.close(close_code::UNSUPPORTED_DATA, "malformed event"));
                return out;
            }
        };

        match self.state {
            ConnectionState::Connected | ConnectionState::Unauthenticated => match event {
                SyncEvent::Init {
                    version,
                    auth,
                    local_store_id,
                    last_sync_cursor,
                } => self.init(version, &auth, local_store_id, last_sync_cursor).await,
                other => self.fatal_error(
                    ErrorCode::BadRequest,
                    format!("expected init, got {}", other.kind()),
                    false,
                ),
            },
            ConnectionState::Authenticated | ConnectionState::Streaming => match event {
                SyncEvent::Init { .. } => {
                    self.fatal_error(ErrorCode::BadRequest, "already initialized", false)
                }
                SyncEvent::Commits { commits, .. } => self.commits(&commits).await,
                SyncEvent::ClientJoin { .. }
                | SyncEvent::ClientPresence { .. }
                | SyncEvent::ClientLeave { .. } => self.presence(event),
                other => {
                    log::debug!("[{}] ignoring client-sent {}", self.id, other.kind());
                    self.event(&SyncEvent::error(
                        ErrorCode::BadRequest,
                        format!("unexpected {} event", other.kind()),
                        false,
                        false,
                    ))
                }
            },
            ConnectionState::Closed => Vec::new(),
        }
    }

    pub fn handle_binary(&mut self) -> Vec<Outbound> {
        if self.is_closed() {
            return Vec::new();
        }
        log::warn!("[{}] binary frame refused", self.id);
        self.close(close_code::UNSUPPORTED_DATA, "binary frames are not supported")
    }

    pub fn handle_relayed(&mut self, message: Result<Arc<RelayMessage>, RecvError>) -> Vec<Outbound> {
        if self.is_closed() {
            return Vec::new();
        }
        match message {
            Ok(message) if message.is_for(self.id, self.peer.as_ref()) => {
                message.frames.iter().cloned().map(Outbound::Text).collect()
            }
            Ok(_) => Vec::new(),
            Err(RecvError::Lagged(missed)) => {
                log::warn!("[{}] lagged by {missed} messages on {}", self.id, self.doc_id());
                self.fatal_error(
                    ErrorCode::Internal,
                    format!("connection fell {missed} messages behind"),
                    true,
                )
            }
            Err(RecvError::Closed) => self.close(close_code::INTERNAL_ERROR, "relay closed"),
        }
    }

    /// Server-initiated close.
    pub fn shutdown(&mut self) -> Vec<Outbound> {
        if self.is_closed() {
            return Vec::new();
        }
        self.close(close_code::NORMAL, "server shutting down")
    }

    /// Marks the session closed and tells siblings every joined client left.
    ///
    /// Returns the number of synthesized `client-leave` events.
    pub fn teardown(&mut self) -> usize {
        self.state = ConnectionState::Closed;
        self.receiver = None;
        let joined = std::mem::take(&mut self.joined);
        for (client_id, user_id) in &joined {
            self.relay.relay_from(
                self.id,
                &SyncEvent::ClientLeave {
                    user_id: user_id.clone(),
                    client_id: client_id.clone(),
                },
            );
        }
        joined.len()
    }

    async fn init(
        &mut self,
        version: u32,
        auth: &serde_json::Value,
        local_store_id: String,
        cursor: Option<SyncId>,
    ) -> Vec<Outbound> {
        if version != PROTOCOL_VERSION {
            return self.fatal_error(
                ErrorCode::BadRequest,
                ProtocolError::UnsupportedVersion(version).to_string(),
                false,
            );
        }
        let identity = match self.authenticator.authenticate(self.doc_id(), auth) {
            Ok(identity) => identity,
            Err(e) => {
                log::info!("[{}] authentication for {} failed: {e}", self.id, self.doc_id());
                return self.fatal_error(ErrorCode::Unauthorized, e.to_string(), false);
            }
        };
        log::info!(
            "[{}] {} authenticated on {} (store {local_store_id}, cursor {cursor:?})",
            self.id,
            identity.user_id,
            self.doc_id()
        );
        let peer = PeerInfo {
            user_id: identity.user_id,
            local_store_id,
        };
        self.state = ConnectionState::Authenticated;

        let (pages, receiver) = match self
            .relay
            .subscribe(self.id, peer.clone(), cursor, self.limits.page_size)
            .await
        {
            Ok(subscribed) => subscribed,
            Err(e) => {
                log::error!("[{}] backlog read for {} failed: {e}", self.id, self.doc_id());
                let mut out = self.event(&SyncEvent::error(ErrorCode::Internal, e.to_string(), true, true));
                out.extend(self.close(close_code::INTERNAL_ERROR, "storage failure"));
                return out;
            }
        };
        self.peer = Some(peer);
        self.receiver = Some(receiver);

        let mut out = Vec::new();
        for page in pages {
            for frame in page.into_frames(self.limits.max_payload) {
                out.extend(self.event(&frame));
            }
        }
        out.extend(self.event(&SyncEvent::Ready));
        self.state = ConnectionState::Streaming;
        out
    }

    async fn commits(&mut self, commits: &[Commit]) -> Vec<Outbound> {
        let Some(peer) = self.peer.clone() else {
            return Vec::new();
        };
        let result = match self.relay.submit(&peer, commits).await {
            Ok(result) => result,
            Err(e) => {
                log::error!("[{}] add to {} failed: {e}", self.id, self.doc_id());
                reject_all(commits, ErrorCode::StorageFailure, &e.to_string())
            }
        };
        log::debug!(
            "[{}] batch of {} on {}: {} acked, {} rejected, syncId {:?}",
            self.id,
            commits.len(),
            self.doc_id(),
            result.acks.len(),
            result.ref_errors.len(),
            result.sync_id
        );
        self.event(&result.ack_event())
    }

    fn presence(&mut self, event: SyncEvent) -> Vec<Outbound> {
        let Some(peer) = self.peer.as_ref() else {
            return Vec::new();
        };
        let (claimed_user, client_id) = match &event {
            SyncEvent::ClientJoin { info } | SyncEvent::ClientPresence { info } => {
                (info.user_id.as_str(), info.client_id.as_str())
            }
            SyncEvent::ClientLeave { user_id, client_id } => (user_id.as_str(), client_id.as_str()),
            _ => return Vec::new(),
        };
        if claimed_user != peer.user_id {
            log::warn!(
                "[{}] {} claimed presence as {claimed_user}",
                self.id,
                peer.user_id
            );
            return self.event(&SyncEvent::error(
                ErrorCode::BadRequest,
                "presence userId does not match the authenticated user",
                false,
                false,
            ));
        }

        match &event {
            SyncEvent::ClientLeave { .. } => {
                self.joined.remove(client_id);
            }
            _ => {
                self.joined
                    .insert(client_id.to_string(), claimed_user.to_string());
            }
        }
        self.relay.relay_from(self.id, &event);
        Vec::new()
    }

    fn event(&self, event: &SyncEvent) -> Vec<Outbound> {
        match event.encode() {
            Ok(text) => vec![Outbound::Text(text)],
            Err(e) => {
                log::error!("[{}] cannot encode {}: {e}", self.id, event.kind());
                Vec::new()
            }
        }
    }

    /// Best-effort `error` event followed by a normal close.
    fn fatal_error(&mut self, code: ErrorCode, message: impl Into<String>, reconnect: bool) -> Vec<Outbound> {
        let message = message.into();
        let mut out = self.event(&SyncEvent::error(code, message.as_str(), true, reconnect));
        out.extend(self.close(close_code::NORMAL, &message));
        out
    }

    fn close(&mut self, code: u16, reason: &str) -> Vec<Outbound> {
        self.state = ConnectionState::Closed;
        self.receiver = None;
        vec![Outbound::Close {
            code,
            reason: close_reason(reason),
        }]
    }
}

/// Close frame reasons are limited to 123 bytes.
fn close_reason(reason: &str) -> String {
    let mut end = reason.len().min(123);
    while !reason.is_char_boundary(end) {
        end -= 1;
    }
    reason[..end].to_string()
}
