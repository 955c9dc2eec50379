//! WebSocket [`Remote`] for talking to a relay.
//!
//! Provides:
//! - Connection lifecycle (connect, reconnect after a delay, shutdown)
//! - `init` handshake carrying the last seen sync cursor
//! - `remote-state` events synthesized from socket state
//!
//! Outgoing events go through an unbounded channel, so `send` never blocks
//! the coordinator. A background task owns the socket.

use std::sync::Mutex;
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use serde_json::{json, Value};
use tokio::net::TcpStream;
use tokio::runtime::Handle;
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};

use crate::commit::SyncId;
use crate::coordinator::{Remote, RemoteConnector, RemoteParams};
use crate::error::{ErrorCode, SyncError};
use crate::protocol::{ConnectState, ReadState, SyncEvent};

/// Remote connection settings.
#[derive(Debug, Clone)]
pub struct RemoteConfig {
    /// Base URL; the document id is appended as the last path segment.
    pub server_url: String,
    /// Opaque credentials sent in `init`; `null` sends `{"userId": <user>}`.
    pub auth: Value,
    /// Delay before reconnecting after a lost connection (`None` = give up).
    pub reconnect_delay: Option<Duration>,
}

impl RemoteConfig {
    pub fn new(server_url: impl Into<String>) -> Self {
        Self {
            server_url: server_url.into(),
            auth: Value::Null,
            reconnect_delay: Some(Duration::from_secs(2)),
        }
    }

    pub fn with_auth(mut self, auth: Value) -> Self {
        self.auth = auth;
        self
    }

    /// No reconnects, so tests observe a single session.
    pub fn for_testing(server_url: impl Into<String>) -> Self {
        Self {
            reconnect_delay: None,
            ..Self::new(server_url)
        }
    }

    pub fn session_url(&self, doc_id: &str) -> String {
        format!("{}/{}", self.server_url.trim_end_matches('/'), doc_id)
    }
}

pub struct WebSocketConnector {
    config: RemoteConfig,
}

impl WebSocketConnector {
    pub fn new(config: RemoteConfig) -> Self {
        Self { config }
    }
}

impl RemoteConnector for WebSocketConnector {
    fn connect(
        &self,
        params: RemoteParams,
        events: mpsc::UnboundedSender<SyncEvent>,
    ) -> Result<Box<dyn Remote>, SyncError> {
        let runtime = Handle::try_current().map_err(|_| SyncError::NoRuntime)?;
        let (out_tx, out_rx) = mpsc::unbounded_channel();
        runtime.spawn(run_session(self.config.clone(), params, out_rx, events));
        Ok(Box::new(ChannelRemote::new(out_tx)))
    }
}

/// Handle to a background session task fed through a channel.
pub struct ChannelRemote {
    outgoing: Mutex<Option<mpsc::UnboundedSender<SyncEvent>>>,
}

impl ChannelRemote {
    pub(crate) fn new(outgoing: mpsc::UnboundedSender<SyncEvent>) -> Self {
        Self {
            outgoing: Mutex::new(Some(outgoing)),
        }
    }
}

impl Remote for ChannelRemote {
    fn send(&self, event: SyncEvent) -> Result<(), SyncError> {
        let outgoing = self.outgoing.lock().map_err(|_| SyncError::Closed)?;
        match outgoing.as_ref() {
            Some(tx) => tx.send(event).map_err(|_| SyncError::Closed),
            None => Err(SyncError::Closed),
        }
    }

    /// Dropping the sender makes the session close its socket and exit.
    fn shutdown(&self) {
        if let Ok(mut outgoing) = self.outgoing.lock() {
            outgoing.take();
        }
    }
}

enum SessionEnd {
    Shutdown,
    Lost { reconnect: bool },
}

pub(crate) fn remote_state(connect: ConnectState, read: ReadState) -> SyncEvent {
    SyncEvent::RemoteState {
        connect: Some(connect),
        read: Some(read),
        save: None,
    }
}

async fn run_session(
    config: RemoteConfig,
    params: RemoteParams,
    mut outgoing: mpsc::UnboundedReceiver<SyncEvent>,
    events: mpsc::UnboundedSender<SyncEvent>,
) {
    let url = config.session_url(&params.doc_id);
    let mut cursor = params.last_sync_cursor;

    loop {
        let _ = events.send(remote_state(ConnectState::Connecting, ReadState::Offline));
        let end = match tokio_tungstenite::connect_async(url.as_str()).await {
            Ok((ws, _)) => {
                log::info!("connected to {url}");
                let _ = events.send(remote_state(ConnectState::Online, ReadState::Offline));
                drive(ws, &config, &params, &mut cursor, &mut outgoing, &events).await
            }
            Err(e) => {
                log::warn!("connecting to {url} failed: {e}");
                let _ = events.send(SyncEvent::error(
                    ErrorCode::Network,
                    e.to_string(),
                    true,
                    config.reconnect_delay.is_some(),
                ));
                SessionEnd::Lost { reconnect: true }
            }
        };
        let _ = events.send(remote_state(ConnectState::Offline, ReadState::Offline));

        let reconnect = match end {
            SessionEnd::Shutdown => false,
            SessionEnd::Lost { reconnect } => reconnect,
        };
        let Some(delay) = config.reconnect_delay.filter(|_| reconnect) else {
            log::debug!("session for {} finished", params.doc_id);
            return;
        };
        tokio::time::sleep(delay).await;
        if outgoing.is_closed() || events.is_closed() {
            return;
        }
        log::info!("reconnecting to {url} from cursor {cursor:?}");
    }
}

async fn drive(
    ws: WebSocketStream<MaybeTlsStream<TcpStream>>,
    config: &RemoteConfig,
    params: &RemoteParams,
    cursor: &mut Option<SyncId>,
    outgoing: &mut mpsc::UnboundedReceiver<SyncEvent>,
    events: &mpsc::UnboundedSender<SyncEvent>,
) -> SessionEnd {
    let (mut sink, mut stream) = ws.split();

    let auth = if config.auth.is_null() {
        json!({ "userId": params.user_id })
    } else {
        config.auth.clone()
    };
    let init = SyncEvent::init(auth, params.local_store_id.clone(), *cursor);
    let sent = match init.encode() {
        Ok(text) => sink.send(Message::Text(text.into())).await.is_ok(),
        Err(e) => {
            log::error!("failed to encode init: {e}");
            false
        }
    };
    if !sent {
        return SessionEnd::Lost { reconnect: true };
    }

    loop {
        tokio::select! {
            out = outgoing.recv() => match out {
                Some(event) => {
                    let text = match event.encode() {
                        Ok(text) => text,
                        Err(e) => {
                            log::error!("dropping unencodable {} event: {e}", event.kind());
                            continue;
                        }
                    };
                    if let Err(e) = sink.send(Message::Text(text.into())).await {
                        log::warn!("write failed: {e}");
                        return SessionEnd::Lost { reconnect: true };
                    }
                }
                None => {
                    let _ = sink.send(Message::Close(None)).await;
                    return SessionEnd::Shutdown;
                }
            },
            incoming = stream.next() => match incoming {
                Some(Ok(Message::Text(text))) => {
                    let event = match SyncEvent::decode(text.as_str()) {
                        Ok(event) => event,
                        Err(e) => {
                            log::warn!("ignoring undecodable event: {e}");
                            continue;
                        }
                    };
                    // An ack can overtake sibling commits still queued on
                    // the relay, so only delivered commits move the cursor.
                    if let SyncEvent::Commits { sync_id: Some(id), .. } = &event {
                        *cursor = (*cursor).max(Some(*id));
                    }
                    let fatal = match &event {
                        SyncEvent::Error(info) if info.fatal => Some(info.reconnect),
                        _ => None,
                    };
                    if events.send(event).is_err() {
                        return SessionEnd::Shutdown;
                    }
                    if let Some(reconnect) = fatal {
                        return SessionEnd::Lost { reconnect };
                    }
                }
                Some(Ok(Message::Close(frame))) => {
                    log::info!("relay closed the connection: {frame:?}");
                    return SessionEnd::Lost { reconnect: true };
                }
                Some(Ok(_)) => {}
                Some(Err(e)) => {
                    log::warn!("read failed: {e}");
                    return SessionEnd::Lost { reconnect: true };
                }
                None => return SessionEnd::Lost { reconnect: true },
            },
        }
    }
}
