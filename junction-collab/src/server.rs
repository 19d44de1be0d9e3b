//! WebSocket relay server holding the authoritative replica.
//!
//! Architecture:
//! ```text
//! Client A ──┐                     ┌── Replica (authority, Mutex)
//!            ├── connection task ──┤
//! Client B ──┘    (one per socket) ├── SessionRegistry ── outbound queues
//!                                  └── CursorTable
//! ```
//!
//! On connect a session is sent the current snapshot and registered in the
//! same critical section as delta application, so every delta is either in
//! the snapshot or relayed to the session afterwards. Frames are relayed
//! verbatim to every session except the one they came from.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use futures_util::{SinkExt, StreamExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, Mutex, RwLock};
use tokio_tungstenite::tungstenite::Message;

use crate::broadcast::{FanOut, Frame, SessionId, SessionRegistry};
use crate::presence::{CursorState, CursorTable};
use crate::protocol::{MessageKind, ProtocolError, WireMessage};
use crate::replica::{Node, Replica, YrsReplica};

/// Server configuration.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Address to bind to
    pub bind_addr: String,
    /// Outbound frames buffered per session before frames for it are dropped
    pub session_buffer: usize,
    /// Heartbeat ping interval in seconds
    pub heartbeat_interval_secs: u64,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_addr: "127.0.0.1:4545".to_string(),
            session_buffer: 256,
            heartbeat_interval_secs: 30,
        }
    }
}

/// Server statistics.
#[derive(Debug, Clone, Default)]
pub struct ServerStats {
    pub total_connections: u64,
    pub active_connections: u64,
    pub total_messages: u64,
    pub total_bytes: u64,
    pub deltas_applied: u64,
    pub cursor_updates: u64,
    pub rejected_messages: u64,
}

/// What the hub did with one inbound frame.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Relay {
    /// The frame bound a user id to the session
    pub bound: bool,
    /// The frame's delta was merged into the authoritative replica
    pub applied: bool,
    /// Fan-out result, if the frame was forwarded
    pub forwarded: Option<FanOut>,
}

/// Shared relay state handed to every connection task.
pub struct Hub<R: Replica> {
    replica: Mutex<R>,
    registry: SessionRegistry,
    cursors: RwLock<CursorTable>,
    stats: RwLock<ServerStats>,
}

impl<R: Replica> Hub<R> {
    pub fn new(replica: R) -> Self {
        Self {
            replica: Mutex::new(replica),
            registry: SessionRegistry::new(),
            cursors: RwLock::new(CursorTable::new()),
            stats: RwLock::new(ServerStats::default()),
        }
    }

    /// Register a session and queue the current snapshot as its first frame.
    pub async fn open_session(
        &self,
        outbound: mpsc::Sender<Frame>,
    ) -> Result<SessionId, ProtocolError> {
        let replica = self.replica.lock().await;
        let snapshot = replica.save()?;
        let text = WireMessage::document(&snapshot).to_text()?;
        outbound
            .try_send(Arc::from(text))
            .map_err(|_| ProtocolError::ConnectionClosed)?;
        let session = self.registry.register(outbound).await;
        drop(replica);

        let mut s = self.stats.write().await;
        s.total_connections += 1;
        s.active_connections += 1;
        Ok(session)
    }

    /// Forget a session and any cursor tied to its user id.
    pub async fn close_session(&self, session: &SessionId) {
        if let Some(removed) = self.registry.unregister(session).await {
            self.forget(&removed.session, removed.user_id.as_deref()).await;
        }
    }

    /// Drop presence and counters for a session already out of the registry.
    async fn forget(&self, session: &SessionId, user_id: Option<&str>) {
        match user_id {
            Some(user_id) => {
                self.cursors.write().await.remove(user_id);
                log::info!("Session {session} ({user_id}) left");
            }
            None => log::info!("Session {session} left before logging in"),
        }
        let mut s = self.stats.write().await;
        s.active_connections = s.active_connections.saturating_sub(1);
    }

    /// Route one inbound text frame.
    ///
    /// Errors mean the frame was dropped; the session stays open and the
    /// authoritative replica is unchanged.
    pub async fn handle_frame(
        &self,
        session: &SessionId,
        text: &str,
    ) -> Result<Relay, ProtocolError> {
        {
            let mut s = self.stats.write().await;
            s.total_messages += 1;
            s.total_bytes += text.len() as u64;
        }
        let result = self.relay(session, text).await;
        if result.is_err() {
            self.record_rejected().await;
        }
        result
    }

    async fn relay(&self, session: &SessionId, text: &str) -> Result<Relay, ProtocolError> {
        let msg = WireMessage::parse(text)?;
        let mut outcome = Relay::default();

        if let Some(user_id) = msg.user_id.as_deref() {
            outcome.bound = self.registry.bind_user(session, user_id).await;
            if outcome.bound {
                log::info!("Session {session} logged in as {user_id}");
            }
        }

        if msg.kind() == Some(MessageKind::Document) {
            log::debug!("Ignoring document frame from session {session}");
            return Ok(outcome);
        }

        let frame: Frame = Arc::from(text);

        if let Some(delta) = msg.changes_bytes()? {
            let mut replica = self.replica.lock().await;
            if let Err(e) = replica.apply_delta(&delta) {
                log::warn!("Rejected delta from session {session}: {e}");
                return Err(e.into());
            }
            // A recipient that misses a delta can never converge again.
            let (fan_out, evicted) = self.registry.broadcast_or_evict(session, &frame).await;
            drop(replica);
            for lagging in evicted {
                self.forget(&lagging.session, lagging.user_id.as_deref()).await;
            }

            log::debug!(
                "Relayed delta from {session} to {} sessions ({} dropped)",
                fan_out.delivered,
                fan_out.dropped
            );
            outcome.applied = true;
            outcome.forwarded = Some(fan_out);
            self.stats.write().await.deltas_applied += 1;
        }

        if let Some(cursor) = &msg.cursor {
            // Stored under the session's own id so disconnect cleanup finds it.
            if let Some(owner) = self.registry.user_id(session).await {
                self.cursors
                    .write()
                    .await
                    .upsert(CursorState::from_payload(owner, cursor));
            }
            if outcome.forwarded.is_none() {
                let fan_out = self.registry.broadcast_except(session, &frame).await;
                log::trace!("Relayed cursor from {session} to {} sessions", fan_out.delivered);
                outcome.forwarded = Some(fan_out);
            }
            self.stats.write().await.cursor_updates += 1;
        }

        Ok(outcome)
    }

    pub(crate) async fn record_rejected(&self) {
        self.stats.write().await.rejected_messages += 1;
    }

    /// Serialized authoritative state.
    pub async fn snapshot(&self) -> Result<Vec<u8>, ProtocolError> {
        Ok(self.replica.lock().await.save()?)
    }

    /// Current authoritative node list.
    pub async fn nodes(&self) -> Vec<Node> {
        self.replica.lock().await.nodes()
    }

    /// Last cursor the hub saw for a user.
    pub async fn cursor(&self, user_id: &str) -> Option<CursorState> {
        self.cursors.read().await.get(user_id).cloned()
    }

    pub async fn cursor_count(&self) -> usize {
        self.cursors.read().await.len()
    }

    pub fn registry(&self) -> &SessionRegistry {
        &self.registry
    }

    /// Get server statistics.
    pub async fn stats(&self) -> ServerStats {
        self.stats.read().await.clone()
    }
}

/// The relay server.
pub struct SyncServer<R: Replica = YrsReplica> {
    config: ServerConfig,
    hub: Arc<Hub<R>>,
}

impl SyncServer<YrsReplica> {
    /// Create a server around the default four-node document.
    pub fn new(config: ServerConfig) -> Self {
        Self::with_replica(config, YrsReplica::initial())
    }

    /// Create with default configuration.
    pub fn with_defaults() -> Self {
        Self::new(ServerConfig::default())
    }
}

impl<R: Replica> SyncServer<R> {
    /// Create a server around an existing replica.
    pub fn with_replica(config: ServerConfig, replica: R) -> Self {
        Self {
            config,
            hub: Arc::new(Hub::new(replica)),
        }
    }

    /// Bind the configured address and serve until the listener fails.
    pub async fn run(&self) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
        let listener = TcpListener::bind(&self.config.bind_addr).await?;
        log::info!("Sync server listening on {}", self.config.bind_addr);
        self.serve(listener).await
    }

    /// Accept connections on an already bound listener.
    pub async fn serve(
        &self,
        listener: TcpListener,
    ) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
        loop {
            let (stream, addr) = listener.accept().await?;
            log::debug!("New TCP connection from {addr}");

            let hub = self.hub.clone();
            let config = self.config.clone();
            tokio::spawn(async move {
                if let Err(e) = handle_connection(stream, addr, hub, config).await {
                    log::error!("Connection error from {addr}: {e}");
                }
            });
        }
    }

    /// Get the configured bind address.
    pub fn bind_addr(&self) -> &str {
        &self.config.bind_addr
    }

    pub fn hub(&self) -> &Arc<Hub<R>> {
        &self.hub
    }
}

/// Drive one WebSocket connection until it closes.
async fn handle_connection<R: Replica>(
    stream: TcpStream,
    addr: SocketAddr,
    hub: Arc<Hub<R>>,
    config: ServerConfig,
) -> Result<(), ProtocolError> {
    let ws_stream = tokio_tungstenite::accept_async(stream).await?;
    let (mut ws_sender, mut ws_receiver) = ws_stream.split();

    let (outbound_tx, mut outbound_rx) = mpsc::channel::<Frame>(config.session_buffer.max(1));
    let session = hub.open_session(outbound_tx).await?;
    log::info!("WebSocket session {session} established from {addr}");

    let mut heartbeat =
        tokio::time::interval(Duration::from_secs(config.heartbeat_interval_secs.max(1)));
    // The first tick completes immediately.
    heartbeat.tick().await;

    let result = loop {
        tokio::select! {
            msg = ws_receiver.next() => {
                match msg {
                    Some(Ok(Message::Text(text))) => {
                        if let Err(e) = hub.handle_frame(&session, text.as_str()).await {
                            log::warn!("Dropped frame from {addr}: {e}");
                        }
                    }
                    Some(Ok(Message::Binary(data))) => {
                        hub.record_rejected().await;
                        log::warn!("Dropped {}-byte binary frame from {addr}", data.len());
                    }
                    Some(Ok(Message::Ping(data))) => {
                        if let Err(e) = ws_sender.send(Message::Pong(data)).await {
                            break Err(e.into());
                        }
                    }
                    Some(Ok(Message::Close(_))) | None => {
                        log::info!("Connection closed from {addr}");
                        break Ok(());
                    }
                    Some(Ok(_)) => {}
                    Some(Err(e)) => {
                        log::error!("WebSocket error from {addr}: {e}");
                        break Err(e.into());
                    }
                }
            }

            frame = outbound_rx.recv() => {
                match frame {
                    Some(frame) => {
                        if let Err(e) = ws_sender.send(Message::Text(frame.to_string().into())).await {
                            break Err(e.into());
                        }
                    }
                    None => {
                        log::info!("Session {session} evicted, closing {addr}");
                        let _ = ws_sender.send(Message::Close(None)).await;
                        break Ok(());
                    }
                }
            }

            _ = heartbeat.tick() => {
                if let Err(e) = ws_sender.send(Message::Ping(Default::default())).await {
                    break Err(e.into());
                }
            }
        }
    };

    hub.close_session(&session).await;
    result
}
