//! WebSocket sync client.
//!
//! Runs one cooperative event loop per connection that owns the
//! [`SyncAgent`]. Inbound frames, UI commands and the render tick are all
//! handled in that loop, one at a time, so local edits never race with
//! remote merges.
//!
//! ```text
//! UI ── ClientCommand ──┐
//!                       ├──► event loop (SyncAgent) ──► WebSocket
//! WebSocket ────────────┘           │
//!                                   ├── SyncEvent   (mpsc)
//!                                   └── RenderFrame (watch, every tick)
//! ```

use std::time::{Duration, Instant};
use futures_util::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, watch};
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};

use crate::agent::{random_user_id, ConnectionState, RenderFrame, SyncAgent};
use crate::presence::CURSOR_INTERVAL;
use crate::protocol::ProtocolError;
use crate::replica::{NodeStatus, Replica, YrsReplica};

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// Client configuration.
#[derive(Debug, Clone)]
pub struct ClientConfig {
    /// Server URL
    pub server_url: String,
    /// Minimum spacing between outbound cursor frames
    pub cursor_interval: Duration,
    /// Render tick period
    pub render_interval: Duration,
    /// Remote cursors without updates for this long are dropped
    pub cursor_idle_timeout: Duration,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            server_url: "ws://127.0.0.1:4545".to_string(),
            cursor_interval: CURSOR_INTERVAL,
            render_interval: Duration::from_millis(16),
            cursor_idle_timeout: Duration::from_secs(30),
        }
    }
}

/// Events emitted by the sync client.
#[derive(Debug, Clone, PartialEq)]
pub enum SyncEvent {
    /// Connection established, login sent
    Connected,
    /// Initial snapshot merged
    Synced,
    /// A remote delta was merged
    RemoteDelta,
    /// A remote cursor moved
    CursorMoved(String),
    /// An inbound frame or local edit was rejected
    Rejected(ProtocolError),
    /// Connection lost
    Disconnected,
}

/// Commands from the UI layer.
#[derive(Debug, Clone)]
enum ClientCommand {
    Toggle(String),
    SetStatus(String, NodeStatus),
    PointerMoved { x: f64, y: f64 },
    Close,
}

/// The sync client.
pub struct SyncClient<R: Replica = YrsReplica> {
    user_id: String,
    config: ClientConfig,
    commands: Option<mpsc::Sender<ClientCommand>>,
    event_tx: mpsc::Sender<SyncEvent>,
    event_rx: Option<mpsc::Receiver<SyncEvent>>,
    frames: watch::Receiver<RenderFrame>,
    frame_tx: Option<watch::Sender<RenderFrame>>,
    _replica: std::marker::PhantomData<fn() -> R>,
}

impl SyncClient<YrsReplica> {
    /// Create a client with a random user id.
    pub fn new(config: ClientConfig) -> Self {
        Self::with_user(random_user_id(), config)
    }
}

impl<R: Replica> SyncClient<R> {
    /// Create a client with an explicit user id.
    pub fn with_user(user_id: impl Into<String>, config: ClientConfig) -> Self {
        let (event_tx, event_rx) = mpsc::channel(256);
        let (frame_tx, frames) = watch::channel(RenderFrame::default());
        Self {
            user_id: user_id.into(),
            config,
            commands: None,
            event_tx,
            event_rx: Some(event_rx),
            frames,
            frame_tx: Some(frame_tx),
            _replica: std::marker::PhantomData,
        }
    }

    /// Take the event receiver (can only be called once).
    pub fn take_event_rx(&mut self) -> Option<mpsc::Receiver<SyncEvent>> {
        self.event_rx.take()
    }

    /// Connect to the server and spawn the event loop.
    ///
    /// A failed attempt can be retried. Once a connection succeeds the
    /// client is spent; its local replica lives as long as the loop.
    pub async fn connect(&mut self) -> Result<(), ProtocolError> {
        if self.frame_tx.is_none() {
            return Err(ProtocolError::ConnectionClosed);
        }

        let (ws_stream, _) = tokio_tungstenite::connect_async(&self.config.server_url).await?;
        log::info!("{} connected to {}", self.user_id, self.config.server_url);
        // Only a successful handshake uses up the render channel.
        let frame_tx = self.frame_tx.take().ok_or(ProtocolError::ConnectionClosed)?;

        let (command_tx, command_rx) = mpsc::channel(256);
        self.commands = Some(command_tx);

        let agent = SyncAgent::<R>::with_timing(
            self.user_id.clone(),
            self.config.cursor_interval,
            self.config.cursor_idle_timeout,
        );
        let event_tx = self.event_tx.clone();
        let render_interval = self.config.render_interval;
        tokio::spawn(async move {
            if let Err(e) =
                run_event_loop(agent, ws_stream, command_rx, event_tx, frame_tx, render_interval).await
            {
                log::error!("Sync client event loop ended: {e}");
            }
        });
        Ok(())
    }

    async fn command(&self, command: ClientCommand) -> Result<(), ProtocolError> {
        let tx = self.commands.as_ref().ok_or(ProtocolError::ConnectionClosed)?;
        tx.send(command)
            .await
            .map_err(|_| ProtocolError::ConnectionClosed)
    }

    /// Flip a node between open and closed.
    pub async fn toggle_node(&self, node_id: impl Into<String>) -> Result<(), ProtocolError> {
        self.command(ClientCommand::Toggle(node_id.into())).await
    }

    /// Set a node's status explicitly.
    pub async fn set_status(
        &self,
        node_id: impl Into<String>,
        status: NodeStatus,
    ) -> Result<(), ProtocolError> {
        self.command(ClientCommand::SetStatus(node_id.into(), status)).await
    }

    /// Report a pointer move; cursor frames are throttled by the loop.
    pub async fn move_pointer(&self, x: f64, y: f64) -> Result<(), ProtocolError> {
        self.command(ClientCommand::PointerMoved { x, y }).await
    }

    /// Close the connection.
    pub async fn close(&self) -> Result<(), ProtocolError> {
        self.command(ClientCommand::Close).await
    }

    /// Latest published render frame.
    pub fn render_frame(&self) -> RenderFrame {
        self.frames.borrow().clone()
    }

    /// Watch render frames as they are published.
    pub fn subscribe_frames(&self) -> watch::Receiver<RenderFrame> {
        self.frames.clone()
    }

    pub fn connection_state(&self) -> ConnectionState {
        self.frames.borrow().state
    }

    pub fn user_id(&self) -> &str {
        &self.user_id
    }

    pub fn server_url(&self) -> &str {
        &self.config.server_url
    }
}

async fn run_event_loop<R: Replica>(
    mut agent: SyncAgent<R>,
    ws_stream: WsStream,
    mut commands: mpsc::Receiver<ClientCommand>,
    events: mpsc::Sender<SyncEvent>,
    frames: watch::Sender<RenderFrame>,
    render_interval: Duration,
) -> Result<(), ProtocolError> {
    let (mut ws_sender, mut ws_receiver) = ws_stream.split();

    let login = agent.on_open()?;
    ws_sender.send(Message::Text(login.into())).await?;
    frames.send_replace(agent.render_frame());
    let _ = events.try_send(SyncEvent::Connected);

    let mut render = tokio::time::interval(render_interval);
    render.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
    let mut last_tick = Instant::now();

    let result = loop {
        tokio::select! {
            msg = ws_receiver.next() => {
                match msg {
                    Some(Ok(Message::Text(text))) => {
                        match agent.handle_frame(text.as_str(), Instant::now()) {
                            Ok(effect) => {
                                if effect.document_changed {
                                    frames.send_replace(agent.render_frame());
                                }
                                if effect.synced {
                                    let _ = events.try_send(SyncEvent::Synced);
                                } else if effect.document_changed {
                                    let _ = events.try_send(SyncEvent::RemoteDelta);
                                }
                                if let Some(user_id) = effect.cursor_moved {
                                    let _ = events.try_send(SyncEvent::CursorMoved(user_id));
                                }
                            }
                            Err(e) => {
                                log::warn!("Dropped inbound frame: {e}");
                                let _ = events.try_send(SyncEvent::Rejected(e));
                            }
                        }
                    }
                    Some(Ok(Message::Ping(data))) => {
                        if let Err(e) = ws_sender.send(Message::Pong(data)).await {
                            break Err(e.into());
                        }
                    }
                    Some(Ok(Message::Close(_))) | None => break Ok(()),
                    Some(Ok(_)) => {}
                    Some(Err(e)) => break Err(e.into()),
                }
            }

            command = commands.recv() => {
                let outbound = match command {
                    Some(ClientCommand::Toggle(node_id)) => agent.toggle(&node_id),
                    Some(ClientCommand::SetStatus(node_id, status)) => agent.set_status(&node_id, status),
                    Some(ClientCommand::PointerMoved { x, y }) => agent.pointer_moved(x, y, Instant::now()),
                    Some(ClientCommand::Close) | None => {
                        let _ = ws_sender.send(Message::Close(None)).await;
                        break Ok(());
                    }
                };
                match outbound {
                    Ok(Some(text)) => {
                        if let Err(e) = ws_sender.send(Message::Text(text.into())).await {
                            break Err(e.into());
                        }
                        frames.send_replace(agent.render_frame());
                    }
                    Ok(None) => {}
                    Err(e) => {
                        let _ = events.try_send(SyncEvent::Rejected(e));
                    }
                }
            }

            _ = render.tick() => {
                let now = Instant::now();
                agent.tick(now.duration_since(last_tick), now);
                last_tick = now;
                frames.send_replace(agent.render_frame());
            }
        }
    };

    agent.on_close();
    frames.send_replace(agent.render_frame());
    let _ = events.try_send(SyncEvent::Disconnected);
    result
}
