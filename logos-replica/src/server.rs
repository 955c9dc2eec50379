//! WebSocket relay server with document-scoped routing.
//!
//! Architecture:
//! ```text
//! Client A ──┐  ws://host/<docId>
//!            ├── Session ──┐
//! Client B ──┘             ├── DocumentRelay (docId) ── DocStore
//!                          │         │
//!                          │         └── broadcast ──► other sessions
//!                          ▼
//!                    RelayRegistry (evicts idle documents)
//! ```
//!
//! Each connection runs in its own task and processes its frames one at a
//! time. Documents are independent; within a document, store appends are
//! serialized by the relay.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

use futures_util::{Sink, SinkExt, StreamExt};
use serde_json::{json, Value};
use thiserror::Error;
use tokio::net::{TcpListener, TcpStream};
use tokio::runtime::Handle;
use tokio::sync::{broadcast, mpsc, watch};
use tokio_tungstenite::tungstenite::handshake::server::{ErrorResponse, Request, Response};
use tokio_tungstenite::tungstenite::http::StatusCode;
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::tungstenite::{self, Message};
use uuid::Uuid;

use crate::auth::{AllowAnonymous, Authenticator};
use crate::client::{remote_state, ChannelRemote};
use crate::connection::{Outbound, Session, SessionLimits};
use crate::coordinator::{Remote, RemoteConnector, RemoteParams};
use crate::error::{ErrorCode, SyncError};
use crate::hash::RefScheme;
use crate::protocol::{ConnectState, ReadState, SyncEvent, MAX_PAYLOAD_BYTES};
use crate::relay::{RelayMessage, RelayRegistry};
use crate::storage::{DocStoreFactory, MemoryStoreFactory, RocksStoreFactory, StoreConfig, StoreError};

/// Longest accepted document id.
pub const MAX_DOC_ID_LEN: usize = 256;

/// Server configuration.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Address to bind to
    pub bind_addr: String,
    /// Broadcast channel capacity per document
    pub broadcast_capacity: usize,
    /// Commits per backlog page
    pub page_size: usize,
    /// Largest accepted text frame, in bytes
    pub max_payload: usize,
    /// Recompute refs and reject mismatches
    pub verify_refs: bool,
    /// Persistence storage path (None = in-memory only)
    pub storage_path: Option<PathBuf>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_addr: "127.0.0.1:9090".to_string(),
            broadcast_capacity: 256,
            page_size: 500,
            max_payload: MAX_PAYLOAD_BYTES,
            verify_refs: false,
            storage_path: None,
        }
    }
}

impl ServerConfig {
    /// Ephemeral port, in-memory storage, small pages.
    pub fn for_testing() -> Self {
        Self {
            bind_addr: "127.0.0.1:0".to_string(),
            broadcast_capacity: 64,
            page_size: 2,
            ..Self::default()
        }
    }

    pub fn limits(&self) -> SessionLimits {
        SessionLimits {
            page_size: self.page_size,
            max_payload: self.max_payload,
        }
    }
}

#[derive(Debug, Error)]
pub enum ServerError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error("websocket error: {0}")]
    WebSocket(#[from] tungstenite::Error),
}

/// The relay server.
pub struct SyncServer {
    config: ServerConfig,
    registry: Arc<RelayRegistry>,
    authenticator: Arc<dyn Authenticator>,
    shutdown: watch::Sender<bool>,
}

impl SyncServer {
    /// Opens RocksDB storage if `storage_path` is set, memory otherwise.
    pub fn new(config: ServerConfig) -> Result<Self, ServerError> {
        let verify = config.verify_refs.then(RefScheme::default);
        let factory: Arc<dyn DocStoreFactory> = match &config.storage_path {
            Some(path) => {
                let mut factory = RocksStoreFactory::open(StoreConfig {
                    path: path.clone(),
                    ..StoreConfig::default()
                })?;
                if let Some(scheme) = verify {
                    factory = factory.with_verify_refs(scheme);
                }
                Arc::new(factory)
            }
            None => {
                let mut factory = MemoryStoreFactory::new();
                if let Some(scheme) = verify {
                    factory = factory.with_verify_refs(scheme);
                }
                Arc::new(factory)
            }
        };
        Ok(Self::with_factory(config, factory))
    }

    /// Uses `factory` as is; `verify_refs` is the factory's business here.
    pub fn with_factory(config: ServerConfig, factory: Arc<dyn DocStoreFactory>) -> Self {
        let registry = Arc::new(
            RelayRegistry::new(factory, config.broadcast_capacity).with_frame_budget(config.max_payload),
        );
        let (shutdown, _) = watch::channel(false);
        Self {
            config,
            registry,
            authenticator: Arc::new(AllowAnonymous),
            shutdown,
        }
    }

    pub fn with_authenticator(mut self, authenticator: Arc<dyn Authenticator>) -> Self {
        self.authenticator = authenticator;
        self
    }

    pub fn bind_addr(&self) -> &str {
        &self.config.bind_addr
    }

    pub fn registry(&self) -> &Arc<RelayRegistry> {
        &self.registry
    }

    /// Bind and serve until [`shutdown`](Self::shutdown).
    pub async fn run(&self) -> Result<(), ServerError> {
        let listener = TcpListener::bind(&self.config.bind_addr).await?;
        log::info!("relay listening on {}", listener.local_addr()?);
        self.serve(listener).await
    }

    /// Serve connections from an already bound listener.
    pub async fn serve(&self, listener: TcpListener) -> Result<(), ServerError> {
        let mut shutdown = self.shutdown.subscribe();
        if *shutdown.borrow() {
            return Ok(());
        }
        loop {
            let (stream, addr) = tokio::select! {
                accepted = listener.accept() => accepted?,
                _ = shutdown.changed() => {
                    log::info!("relay stopped accepting connections");
                    return Ok(());
                }
            };
            log::debug!("new TCP connection from {addr}");

            let registry = Arc::clone(&self.registry);
            let authenticator = Arc::clone(&self.authenticator);
            let limits = self.config.limits();
            let shutdown = self.shutdown.subscribe();
            tokio::spawn(async move {
                if let Err(e) =
                    handle_connection(stream, addr, registry, authenticator, limits, shutdown).await
                {
                    log::error!("connection error from {addr}: {e}");
                }
            });
        }
    }

    /// Stops accepting and closes every connection with a normal close.
    pub fn shutdown(&self) {
        self.shutdown.send_replace(true);
    }

    /// Connects coordinators to this server's relays without a socket.
    pub fn local_connector(&self) -> LocalConnector {
        LocalConnector {
            registry: Arc::clone(&self.registry),
            authenticator: Arc::clone(&self.authenticator),
            limits: self.config.limits(),
            auth: Value::Null,
        }
    }
}

/// Document id from the last path segment of the upgrade request.
///
/// Ids are 1..=256 characters of `[A-Za-z0-9._~-]`.
pub fn parse_doc_id(path: &str) -> Option<String> {
    let path = path.split(['?', '#']).next().unwrap_or_default();
    let segment = path.trim_end_matches('/').rsplit('/').next()?;
    let valid = !segment.is_empty()
        && segment.len() <= MAX_DOC_ID_LEN
        && segment
            .bytes()
            .all(|b| b.is_ascii_alphanumeric() || matches!(b, b'.' | b'_' | b'~' | b'-'));
    valid.then(|| segment.to_string())
}

enum Step {
    Incoming(Option<Result<Message, tungstenite::Error>>),
    Relayed(Result<Arc<RelayMessage>, broadcast::error::RecvError>),
    Shutdown,
}

async fn handle_connection(
    stream: TcpStream,
    addr: SocketAddr,
    registry: Arc<RelayRegistry>,
    authenticator: Arc<dyn Authenticator>,
    limits: SessionLimits,
    mut shutdown: watch::Receiver<bool>,
) -> Result<(), ServerError> {
    let mut doc_id = None;
    let ws = tokio_tungstenite::accept_hdr_async(stream, |request: &Request, response: Response| {
        match parse_doc_id(request.uri().path()) {
            Some(id) => {
                doc_id = Some(id);
                Ok(response)
            }
            None => {
                let mut rejection = ErrorResponse::new(Some("invalid document id".to_string()));
                *rejection.status_mut() = StatusCode::BAD_REQUEST;
                Err(rejection)
            }
        }
    })
    .await?;
    let Some(doc_id) = doc_id else {
        return Ok(());
    };
    let (mut sink, mut stream) = ws.split();

    let id = Uuid::new_v4();
    let relay = match registry.join(&doc_id, id).await {
        Ok(relay) => relay,
        Err(e) => {
            let close = Outbound::Close {
                code: crate::protocol::close_code::INTERNAL_ERROR,
                reason: "storage unavailable".into(),
            };
            write_all(&mut sink, vec![close]).await;
            return Err(e.into());
        }
    };
    log::info!("[{id}] {addr} connected to {doc_id}");

    let mut session = Session::new(id, relay, authenticator, limits);
    session.accept();

    loop {
        let step = tokio::select! {
            incoming = stream.next() => Step::Incoming(incoming),
            relayed = session.next_relayed() => Step::Relayed(relayed),
            _ = shutdown.changed() => Step::Shutdown,
        };
        let out = match step {
            Step::Incoming(Some(Ok(Message::Text(text)))) => session.handle_text(text.as_str()).await,
            Step::Incoming(Some(Ok(Message::Binary(_)))) => session.handle_binary(),
            Step::Incoming(Some(Ok(Message::Ping(data)))) => {
                if sink.send(Message::Pong(data)).await.is_err() {
                    break;
                }
                continue;
            }
            Step::Incoming(Some(Ok(Message::Close(_)))) | Step::Incoming(None) => {
                log::info!("[{id}] {addr} closed the connection");
                break;
            }
            Step::Incoming(Some(Ok(_))) => continue,
            Step::Incoming(Some(Err(e))) => {
                log::warn!("[{id}] websocket error from {addr}: {e}");
                break;
            }
            Step::Relayed(message) => session.handle_relayed(message),
            Step::Shutdown => session.shutdown(),
        };
        if !write_all(&mut sink, out).await || session.is_closed() {
            break;
        }
    }

    let leaves = session.teardown();
    if leaves > 0 {
        log::debug!("[{id}] synthesized {leaves} client-leave events");
    }
    registry.release(&doc_id, &id).await;
    Ok(())
}

/// Writes `out` in order. Returns false once the socket is closed or broken.
async fn write_all<S>(sink: &mut S, out: Vec<Outbound>) -> bool
where
    S: Sink<Message, Error = tungstenite::Error> + Unpin,
{
    for item in out {
        match item {
            Outbound::Text(text) => {
                if let Err(e) = sink.send(Message::Text(text.into())).await {
                    log::debug!("write failed: {e}");
                    return false;
                }
            }
            Outbound::Close { code, reason } => {
                let frame = CloseFrame {
                    code: CloseCode::from(code),
                    reason: reason.into(),
                };
                let _ = sink.send(Message::Close(Some(frame))).await;
                return false;
            }
        }
    }
    true
}

/// In-process [`RemoteConnector`]: a coordinator talks to a relay session
/// through channels instead of a socket.
#[derive(Clone)]
pub struct LocalConnector {
    registry: Arc<RelayRegistry>,
    authenticator: Arc<dyn Authenticator>,
    limits: SessionLimits,
    auth: Value,
}

impl LocalConnector {
    /// Sent as `init.auth`; `null` means `{"userId": <coordinator user>}`.
    pub fn with_auth(mut self, auth: Value) -> Self {
        self.auth = auth;
        self
    }
}

impl RemoteConnector for LocalConnector {
    fn connect(
        &self,
        params: RemoteParams,
        events: mpsc::UnboundedSender<SyncEvent>,
    ) -> Result<Box<dyn Remote>, SyncError> {
        let runtime = Handle::try_current().map_err(|_| SyncError::NoRuntime)?;
        let (out_tx, out_rx) = mpsc::unbounded_channel();
        runtime.spawn(run_local(self.clone(), params, out_rx, events));
        Ok(Box::new(ChannelRemote::new(out_tx)))
    }
}

enum LocalStep {
    Outgoing(Option<SyncEvent>),
    Relayed(Result<Arc<RelayMessage>, broadcast::error::RecvError>),
}

async fn run_local(
    connector: LocalConnector,
    params: RemoteParams,
    mut outgoing: mpsc::UnboundedReceiver<SyncEvent>,
    events: mpsc::UnboundedSender<SyncEvent>,
) {
    let _ = events.send(remote_state(ConnectState::Connecting, ReadState::Offline));
    let id = Uuid::new_v4();
    let relay = match connector.registry.join(&params.doc_id, id).await {
        Ok(relay) => relay,
        Err(e) => {
            let _ = events.send(SyncEvent::error(ErrorCode::Network, e.to_string(), true, false));
            let _ = events.send(remote_state(ConnectState::Offline, ReadState::Offline));
            return;
        }
    };
    let _ = events.send(remote_state(ConnectState::Online, ReadState::Offline));

    let mut session = Session::new(id, relay, Arc::clone(&connector.authenticator), connector.limits);
    session.accept();
    let auth = if connector.auth.is_null() {
        json!({ "userId": params.user_id })
    } else {
        connector.auth.clone()
    };
    let init = SyncEvent::init(auth, params.local_store_id.clone(), params.last_sync_cursor);
    let mut out = match init.encode() {
        Ok(text) => session.handle_text(&text).await,
        Err(e) => {
            log::error!("failed to encode init: {e}");
            Vec::new()
        }
    };

    loop {
        if !deliver(out, &events) || session.is_closed() {
            break;
        }
        let step = tokio::select! {
            event = outgoing.recv() => LocalStep::Outgoing(event),
            relayed = session.next_relayed() => LocalStep::Relayed(relayed),
        };
        out = match step {
            LocalStep::Outgoing(Some(event)) => match event.encode() {
                Ok(text) => session.handle_text(&text).await,
                Err(e) => {
                    log::error!("dropping unencodable {} event: {e}", event.kind());
                    Vec::new()
                }
            },
            LocalStep::Outgoing(None) => break,
            LocalStep::Relayed(message) => session.handle_relayed(message),
        };
    }

    session.teardown();
    connector.registry.release(&params.doc_id, &id).await;
    let _ = events.send(remote_state(ConnectState::Offline, ReadState::Offline));
}

/// Decodes session output into coordinator events. Returns false on close.
fn deliver(out: Vec<Outbound>, events: &mpsc::UnboundedSender<SyncEvent>) -> bool {
    for item in out {
        match item {
            Outbound::Text(text) => match SyncEvent::decode(&text) {
                Ok(event) => {
                    if events.send(event).is_err() {
                        return false;
                    }
                }
                Err(e) => log::error!("session produced an undecodable event: {e}"),
            },
            Outbound::Close { code, reason } => {
                log::debug!("local session closed ({code}): {reason}");
                return false;
            }
        }
    }
    true
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_server_config_default() {
        let config = ServerConfig::default();
        assert_eq!(config.bind_addr, "127.0.0.1:9090");
        assert_eq!(config.broadcast_capacity, 256);
        assert_eq!(config.max_payload, 1_000_000);
        assert!(!config.verify_refs);
        assert!(config.storage_path.is_none());
    }

    #[test]
    fn test_parse_doc_id() {
        assert_eq!(parse_doc_id("/doc-1").as_deref(), Some("doc-1"));
        assert_eq!(parse_doc_id("/api/v1/My.Doc_~x/").as_deref(), Some("My.Doc_~x"));
        assert_eq!(parse_doc_id("/doc?token=1").as_deref(), Some("doc"));
        assert_eq!(parse_doc_id("/"), None);
        assert_eq!(parse_doc_id("/bad%20id"), None);
        assert_eq!(parse_doc_id(&format!("/{}", "a".repeat(256))).map(|d| d.len()), Some(256));
        assert_eq!(parse_doc_id(&format!("/{}", "a".repeat(257))), None);
    }

    #[test]
    fn test_server_with_storage() {
        let dir = tempfile::tempdir().unwrap();
        let config = ServerConfig {
            storage_path: Some(dir.path().join("db")),
            ..ServerConfig::for_testing()
        };
        let server = SyncServer::new(config).unwrap();
        assert_eq!(server.bind_addr(), "127.0.0.1:0");
    }

    #[tokio::test]
    async fn test_serve_returns_after_shutdown() {
        let server = Arc::new(SyncServer::new(ServerConfig::for_testing()).unwrap());
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let running = {
            let server = Arc::clone(&server);
            tokio::spawn(async move { server.serve(listener).await })
        };
        server.shutdown();
        running.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_local_connector_reaches_ready() {
        let server = SyncServer::new(ServerConfig::for_testing()).unwrap();
        let connector = server.local_connector();
        let (tx, mut rx) = mpsc::unbounded_channel();
        let remote = connector
            .connect(
                RemoteParams {
                    doc_id: "doc".into(),
                    user_id: "alice".into(),
                    client_id: "c".into(),
                    local_store_id: "c".into(),
                    last_sync_cursor: None,
                },
                tx,
            )
            .unwrap();

        loop {
            match rx.recv().await.unwrap() {
                SyncEvent::Ready => break,
                SyncEvent::Error(info) => panic!("unexpected error {info:?}"),
                _ => {}
            }
        }
        assert_eq!(server.registry().relay_count().await, 1);

        remote.shutdown();
        loop {
            if let Some(SyncEvent::RemoteState {
                connect: Some(ConnectState::Offline),
                ..
            }) = rx.recv().await
            {
                break;
            }
        }
        assert_eq!(server.registry().relay_count().await, 0);
    }
}
