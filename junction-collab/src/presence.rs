//! Cursor presence: ephemeral, last-write-wins per user id.
//!
//! ```text
//! pointer move ──► CursorThrottle (80ms) ──► cursor frame ──► hub
//!                                                            │
//!            CursorTable (hub bookkeeping) ◄─────────────────┤
//!                                                            ▼
//!            CursorBoard::apply() ◄──────────────────── other clients
//!                    │
//!                    ▼  render tick
//!            CursorBoard::advance(dt)  (exponential damping)
//! ```
//!
//! Presence is never merged into the document replica and is dropped
//! when the owning session disconnects.

use std::collections::HashMap;
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};

use crate::protocol::{CursorPayload, PROFILE_COUNT};

/// Default minimum spacing between outbound cursor frames.
pub const CURSOR_INTERVAL: Duration = Duration::from_millis(80);

/// Damping rate used when easing a rendered cursor toward its target.
pub const CURSOR_DAMPING: f64 = 10.0;

/// Last known cursor of one user.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CursorState {
    pub user_id: String,
    /// Cursor profile index in `[0, PROFILE_COUNT)`
    pub profile: u8,
    pub x: f64,
    pub y: f64,
}

impl CursorState {
    /// Build from a wire payload. Out-of-range profiles wrap into range.
    pub fn from_payload(user_id: impl Into<String>, payload: &CursorPayload) -> Self {
        Self {
            user_id: user_id.into(),
            profile: payload.profile % PROFILE_COUNT,
            x: payload.x,
            y: payload.y,
        }
    }
}

/// Frame-rate independent exponential damping toward `target`.
pub fn damp(current: f64, target: f64, lambda: f64, dt: f64) -> f64 {
    current + (target - current) * (1.0 - (-lambda * dt).exp())
}

/// Local rate limiter for outbound cursor frames.
#[derive(Debug, Clone)]
pub struct CursorThrottle {
    interval: Duration,
    last_sent: Option<Instant>,
}

impl CursorThrottle {
    pub fn new(interval: Duration) -> Self {
        Self {
            interval,
            last_sent: None,
        }
    }

    /// Returns `true` and records `now` if a frame may be sent.
    ///
    /// The first call always succeeds.
    pub fn try_acquire(&mut self, now: Instant) -> bool {
        if let Some(last) = self.last_sent {
            if now.saturating_duration_since(last) < self.interval {
                return false;
            }
        }
        self.last_sent = Some(now);
        true
    }

    pub fn interval(&self) -> Duration {
        self.interval
    }
}

impl Default for CursorThrottle {
    fn default() -> Self {
        Self::new(CURSOR_INTERVAL)
    }
}

/// Hub-side cursor bookkeeping.
#[derive(Debug, Default)]
pub struct CursorTable {
    cursors: HashMap<String, CursorState>,
}

impl CursorTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn upsert(&mut self, state: CursorState) {
        self.cursors.insert(state.user_id.clone(), state);
    }

    pub fn remove(&mut self, user_id: &str) -> Option<CursorState> {
        self.cursors.remove(user_id)
    }

    pub fn get(&self, user_id: &str) -> Option<&CursorState> {
        self.cursors.get(user_id)
    }

    pub fn len(&self) -> usize {
        self.cursors.len()
    }

    pub fn is_empty(&self) -> bool {
        self.cursors.is_empty()
    }
}

/// A remote cursor as tracked by a client.
///
/// Keeps the latest network position as the target and a separately
/// eased position for drawing.
#[derive(Debug, Clone)]
pub struct RemoteCursor {
    target: CursorState,
    rendered: (f64, f64),
    last_update: Instant,
}

impl RemoteCursor {
    fn new(state: CursorState, now: Instant) -> Self {
        let rendered = (state.x, state.y);
        Self {
            target: state,
            rendered,
            last_update: now,
        }
    }

    fn retarget(&mut self, state: CursorState, now: Instant) {
        self.target = state;
        self.last_update = now;
    }

    fn advance(&mut self, dt: f64) {
        self.rendered.0 = damp(self.rendered.0, self.target.x, CURSOR_DAMPING, dt);
        self.rendered.1 = damp(self.rendered.1, self.target.y, CURSOR_DAMPING, dt);
    }

    pub fn target(&self) -> &CursorState {
        &self.target
    }

    pub fn rendered_position(&self) -> (f64, f64) {
        self.rendered
    }
}

/// Data a rendering layer needs to draw one remote cursor.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CursorRenderData {
    pub user_id: String,
    pub profile: u8,
    pub x: f64,
    pub y: f64,
}

/// Client-side map of remote cursors.
#[derive(Debug)]
pub struct CursorBoard {
    local_user_id: String,
    cursors: HashMap<String, RemoteCursor>,
    idle_timeout: Duration,
}

impl CursorBoard {
    pub fn new(local_user_id: impl Into<String>, idle_timeout: Duration) -> Self {
        Self {
            local_user_id: local_user_id.into(),
            cursors: HashMap::new(),
            idle_timeout,
        }
    }

    /// Upsert a remote cursor. Frames carrying our own id are ignored and
    /// return `false`.
    pub fn apply(&mut self, user_id: &str, payload: &CursorPayload, now: Instant) -> bool {
        if user_id == self.local_user_id {
            return false;
        }
        let state = CursorState::from_payload(user_id, payload);
        match self.cursors.get_mut(user_id) {
            Some(cursor) => cursor.retarget(state, now),
            None => {
                self.cursors
                    .insert(user_id.to_string(), RemoteCursor::new(state, now));
            }
        }
        true
    }

    /// Ease every cursor toward its target by `dt` seconds.
    pub fn advance(&mut self, dt: f64) {
        for cursor in self.cursors.values_mut() {
            cursor.advance(dt);
        }
    }

    /// Drop cursors that have not moved within the idle timeout.
    pub fn expire_idle(&mut self, now: Instant) -> Vec<String> {
        let timeout = self.idle_timeout;
        let stale: Vec<String> = self
            .cursors
            .iter()
            .filter(|(_, c)| now.saturating_duration_since(c.last_update) > timeout)
            .map(|(id, _)| id.clone())
            .collect();
        for id in &stale {
            self.cursors.remove(id);
        }
        stale
    }

    pub fn remove(&mut self, user_id: &str) -> Option<RemoteCursor> {
        self.cursors.remove(user_id)
    }

    pub fn clear(&mut self) {
        self.cursors.clear();
    }

    pub fn get(&self, user_id: &str) -> Option<&RemoteCursor> {
        self.cursors.get(user_id)
    }

    pub fn len(&self) -> usize {
        self.cursors.len()
    }

    pub fn is_empty(&self) -> bool {
        self.cursors.is_empty()
    }

    pub fn local_user_id(&self) -> &str {
        &self.local_user_id
    }

    /// Eased positions for drawing, ordered by user id.
    pub fn render_data(&self) -> Vec<CursorRenderData> {
        let mut out: Vec<CursorRenderData> = self
            .cursors
            .values()
            .map(|c| CursorRenderData {
                user_id: c.target.user_id.clone(),
                profile: c.target.profile,
                x: c.rendered.0,
                y: c.rendered.1,
            })
            .collect();
        out.sort_by(|a, b| a.user_id.cmp(&b.user_id));
        out
    }
}
