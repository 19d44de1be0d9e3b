//! Client-side sync state machine.
//!
//! ```text
//! Disconnected ──open──► Connected ──document──► Synced
//!       ▲                    │                     │
//!       └────────close───────┴─────────────────────┘
//! ```
//!
//! The agent performs no I/O. The caller feeds it inbound frames and local
//! UI events and sends whatever outbound frames it returns, which keeps the
//! merge rules testable without a socket.

use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::presence::{CursorBoard, CursorRenderData, CursorThrottle, CURSOR_INTERVAL};
use crate::protocol::{ProtocolError, WireMessage, PROFILE_COUNT};
use crate::replica::{Node, NodeStatus, Replica};

/// Client connection state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ConnectionState {
    Disconnected,
    /// Transport open, login sent, no snapshot yet
    Connected,
    /// At least one snapshot merged
    Synced,
}

/// What changed after handling one inbound frame.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct InboundEffect {
    /// A snapshot was merged and the agent became synced
    pub synced: bool,
    /// The local replica changed and should be re-rendered
    pub document_changed: bool,
    /// A remote cursor was created or moved
    pub cursor_moved: Option<String>,
}

/// Snapshot of everything a renderer draws in one frame.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RenderFrame {
    pub state: ConnectionState,
    pub nodes: Vec<Node>,
    pub cursors: Vec<CursorRenderData>,
}

impl Default for RenderFrame {
    fn default() -> Self {
        Self {
            state: ConnectionState::Disconnected,
            nodes: Vec::new(),
            cursors: Vec::new(),
        }
    }
}

/// Generate a random local user id.
pub fn random_user_id() -> String {
    let id = Uuid::new_v4().simple().to_string();
    format!("User-{}", &id[..8])
}

/// Stable cursor profile for a user id.
pub fn profile_for(user_id: &str) -> u8 {
    let sum = user_id.bytes().fold(0u32, |acc, b| acc.wrapping_mul(31).wrapping_add(b as u32));
    (sum % PROFILE_COUNT as u32) as u8
}

/// One client's replica plus presence state.
pub struct SyncAgent<R: Replica> {
    user_id: String,
    profile: u8,
    state: ConnectionState,
    replica: R,
    cursors: CursorBoard,
    throttle: CursorThrottle,
}

impl<R: Replica> SyncAgent<R> {
    /// Create an agent with an empty replica.
    pub fn new(user_id: impl Into<String>) -> Self {
        Self::with_timing(user_id, CURSOR_INTERVAL, Duration::from_secs(30))
    }

    /// Create with explicit cursor throttle and idle timeout.
    pub fn with_timing(
        user_id: impl Into<String>,
        cursor_interval: Duration,
        cursor_idle_timeout: Duration,
    ) -> Self {
        let user_id = user_id.into();
        Self {
            profile: profile_for(&user_id),
            cursors: CursorBoard::new(user_id.clone(), cursor_idle_timeout),
            user_id,
            state: ConnectionState::Disconnected,
            replica: R::empty(),
            throttle: CursorThrottle::new(cursor_interval),
        }
    }

    /// Transport opened: move to `Connected` and return the login frame.
    pub fn on_open(&mut self) -> Result<String, ProtocolError> {
        self.state = ConnectionState::Connected;
        WireMessage::login(self.user_id.clone()).to_text()
    }

    /// Transport closed: drop presence, keep the replica.
    pub fn on_close(&mut self) {
        self.state = ConnectionState::Disconnected;
        self.cursors.clear();
    }

    /// Handle one inbound text frame.
    ///
    /// Malformed frames and merge failures are returned as errors and
    /// leave the replica untouched.
    pub fn handle_frame(&mut self, text: &str, now: Instant) -> Result<InboundEffect, ProtocolError> {
        let msg = WireMessage::parse(text)?;
        let mut effect = InboundEffect::default();

        if let Some(snapshot) = msg.document_bytes()? {
            self.replica.merge_snapshot(&snapshot)?;
            if self.state != ConnectionState::Synced {
                self.state = ConnectionState::Synced;
                effect.synced = true;
            }
            effect.document_changed = true;
        }

        if let Some(delta) = msg.changes_bytes()? {
            self.replica.apply_delta(&delta)?;
            effect.document_changed = true;
        }

        if let (Some(user_id), Some(cursor)) = (msg.user_id.as_deref(), msg.cursor.as_ref()) {
            if self.cursors.apply(user_id, cursor, now) {
                effect.cursor_moved = Some(user_id.to_string());
            }
        }

        Ok(effect)
    }

    /// Flip a node and return the changes frame to send.
    ///
    /// `None` when the node id is unknown to the local replica.
    pub fn toggle(&mut self, node_id: &str) -> Result<Option<String>, ProtocolError> {
        match self.replica.status(node_id) {
            Some(current) => self.set_status(node_id, current.toggled()),
            None => {
                log::debug!("Ignoring toggle of unknown node {node_id}");
                Ok(None)
            }
        }
    }

    /// Set a node's status and return the changes frame to send.
    pub fn set_status(
        &mut self,
        node_id: &str,
        status: NodeStatus,
    ) -> Result<Option<String>, ProtocolError> {
        if self.state == ConnectionState::Disconnected {
            return Err(ProtocolError::ConnectionClosed);
        }
        match self.replica.set_status(node_id, status)? {
            Some(delta) => Ok(Some(WireMessage::changes(self.user_id.clone(), &delta).to_text()?)),
            None => Ok(None),
        }
    }

    /// Pointer moved: return a cursor frame unless throttled or offline.
    pub fn pointer_moved(&mut self, x: f64, y: f64, now: Instant) -> Result<Option<String>, ProtocolError> {
        if self.state == ConnectionState::Disconnected || !self.throttle.try_acquire(now) {
            return Ok(None);
        }
        WireMessage::cursor(self.user_id.clone(), self.profile, x, y)
            .to_text()
            .map(Some)
    }

    /// Render tick: ease cursors and expire idle ones.
    pub fn tick(&mut self, dt: Duration, now: Instant) {
        self.cursors.advance(dt.as_secs_f64());
        for user_id in self.cursors.expire_idle(now) {
            log::debug!("Cursor of {user_id} went idle");
        }
    }

    pub fn render_frame(&self) -> RenderFrame {
        RenderFrame {
            state: self.state,
            nodes: self.replica.nodes(),
            cursors: self.cursors.render_data(),
        }
    }

    pub fn user_id(&self) -> &str {
        &self.user_id
    }

    pub fn profile(&self) -> u8 {
        self.profile
    }

    pub fn state(&self) -> ConnectionState {
        self.state
    }

    pub fn replica(&self) -> &R {
        &self.replica
    }

    pub fn cursors(&self) -> &CursorBoard {
        &self.cursors
    }
}
