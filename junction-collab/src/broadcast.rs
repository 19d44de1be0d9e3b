//! Session registry and fan-out to connected sessions.
//!
//! Every session owns a bounded outbound queue drained by its connection
//! task. Fan-out uses `try_send`, so a stalled client can only fill its
//! own queue: frames for it are dropped and counted, everyone else keeps
//! receiving. Frames that must not be lost go through
//! [`SessionRegistry::broadcast_or_evict`], which removes a recipient that
//! cannot take the frame so its connection closes.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::sync::{mpsc, RwLock};
use uuid::Uuid;

/// Identifier of one live connection.
pub type SessionId = Uuid;

/// A text frame shared between all recipients of one broadcast.
pub type Frame = Arc<str>;

/// Statistics for monitoring broadcast health.
#[derive(Debug, Clone, Default)]
pub struct BroadcastStats {
    pub messages_sent: u64,
    pub messages_dropped: u64,
    pub sessions_evicted: u64,
    pub active_sessions: usize,
}

struct AtomicBroadcastStats {
    messages_sent: AtomicU64,
    messages_dropped: AtomicU64,
    sessions_evicted: AtomicU64,
}

impl AtomicBroadcastStats {
    fn new() -> Self {
        Self {
            messages_sent: AtomicU64::new(0),
            messages_dropped: AtomicU64::new(0),
            sessions_evicted: AtomicU64::new(0),
        }
    }
}

/// Result of fanning one frame out.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FanOut {
    /// Recipients whose queue accepted the frame
    pub delivered: usize,
    /// Recipients whose queue was full or closed
    pub dropped: usize,
}

/// A session taken out of the registry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemovedSession {
    pub session: SessionId,
    pub user_id: Option<String>,
}

struct SessionEntry {
    user_id: Option<String>,
    outbound: mpsc::Sender<Frame>,
}

/// Live connections, each optionally tagged with a user id.
pub struct SessionRegistry {
    sessions: Arc<RwLock<HashMap<SessionId, SessionEntry>>>,
    atomic_stats: Arc<AtomicBroadcastStats>,
}

impl Default for SessionRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl SessionRegistry {
    pub fn new() -> Self {
        Self {
            sessions: Arc::new(RwLock::new(HashMap::new())),
            atomic_stats: Arc::new(AtomicBroadcastStats::new()),
        }
    }

    /// Register a connection with no user id yet.
    pub async fn register(&self, outbound: mpsc::Sender<Frame>) -> SessionId {
        let id = Uuid::new_v4();
        let mut sessions = self.sessions.write().await;
        sessions.insert(
            id,
            SessionEntry {
                user_id: None,
                outbound,
            },
        );
        id
    }

    /// Remove a connection. `None` when it was already gone.
    pub async fn unregister(&self, session: &SessionId) -> Option<RemovedSession> {
        let mut sessions = self.sessions.write().await;
        sessions.remove(session).map(|e| RemovedSession {
            session: *session,
            user_id: e.user_id,
        })
    }

    /// Bind a user id to a session.
    ///
    /// Any frame carrying a user id binds, not only the login frame. The
    /// first binding sticks for the lifetime of the session; later calls
    /// return `false` and change nothing. Uniqueness across sessions is not
    /// checked.
    pub async fn bind_user(&self, session: &SessionId, user_id: &str) -> bool {
        let mut sessions = self.sessions.write().await;
        match sessions.get_mut(session) {
            Some(entry) => match entry.user_id.as_deref() {
                None => {
                    entry.user_id = Some(user_id.to_string());
                    true
                }
                Some(bound) if bound != user_id => {
                    log::debug!("Session {session} already bound to {bound}, ignoring {user_id}");
                    false
                }
                Some(_) => false,
            },
            None => false,
        }
    }

    pub async fn user_id(&self, session: &SessionId) -> Option<String> {
        self.sessions
            .read()
            .await
            .get(session)
            .and_then(|e| e.user_id.clone())
    }

    /// Queue a frame for a single session.
    pub async fn send_to(&self, session: &SessionId, frame: Frame) -> bool {
        let sessions = self.sessions.read().await;
        match sessions.get(session) {
            Some(entry) => entry.outbound.try_send(frame).is_ok(),
            None => false,
        }
    }

    /// Queue a frame for every session except `origin`.
    ///
    /// Never waits on a recipient; a full or closed queue only affects
    /// that recipient.
    pub async fn broadcast_except(&self, origin: &SessionId, frame: &Frame) -> FanOut {
        let sessions = self.sessions.read().await;
        let mut result = FanOut::default();
        for (id, entry) in sessions.iter() {
            if id == origin {
                continue;
            }
            match entry.outbound.try_send(frame.clone()) {
                Ok(()) => result.delivered += 1,
                Err(mpsc::error::TrySendError::Full(_)) => {
                    log::warn!("Session {id} outbound queue full, dropping frame");
                    result.dropped += 1;
                }
                Err(mpsc::error::TrySendError::Closed(_)) => {
                    log::debug!("Session {id} already closed, skipping");
                    result.dropped += 1;
                }
            }
        }
        self.atomic_stats.messages_sent.fetch_add(1, Ordering::Relaxed);
        self.atomic_stats
            .messages_dropped
            .fetch_add(result.dropped as u64, Ordering::Relaxed);
        result
    }

    /// Queue a frame for every session except `origin`, evicting any
    /// recipient whose queue is full or closed.
    ///
    /// An evicted session's sender is dropped, so its connection task sees
    /// the outbound queue end and closes the socket. The client then
    /// reconnects and starts again from a fresh snapshot.
    pub async fn broadcast_or_evict(
        &self,
        origin: &SessionId,
        frame: &Frame,
    ) -> (FanOut, Vec<RemovedSession>) {
        let mut sessions = self.sessions.write().await;
        let mut result = FanOut::default();
        let mut evicted = Vec::new();
        sessions.retain(|id, entry| {
            if id == origin {
                return true;
            }
            match entry.outbound.try_send(frame.clone()) {
                Ok(()) => {
                    result.delivered += 1;
                    true
                }
                Err(e) => {
                    let reason = match e {
                        mpsc::error::TrySendError::Full(_) => "queue full",
                        mpsc::error::TrySendError::Closed(_) => "closed",
                    };
                    log::warn!("Evicting session {id} ({reason})");
                    result.dropped += 1;
                    evicted.push(RemovedSession {
                        session: *id,
                        user_id: entry.user_id.clone(),
                    });
                    false
                }
            }
        });
        self.atomic_stats.messages_sent.fetch_add(1, Ordering::Relaxed);
        self.atomic_stats
            .messages_dropped
            .fetch_add(result.dropped as u64, Ordering::Relaxed);
        self.atomic_stats
            .sessions_evicted
            .fetch_add(evicted.len() as u64, Ordering::Relaxed);
        (result, evicted)
    }

    /// Get the current session count.
    pub async fn session_count(&self) -> usize {
        self.sessions.read().await.len()
    }

    pub async fn contains(&self, session: &SessionId) -> bool {
        self.sessions.read().await.contains_key(session)
    }

    /// Get broadcast statistics.
    pub async fn stats(&self) -> BroadcastStats {
        let sessions = self.sessions.read().await;
        BroadcastStats {
            messages_sent: self.atomic_stats.messages_sent.load(Ordering::Relaxed),
            messages_dropped: self.atomic_stats.messages_dropped.load(Ordering::Relaxed),
            sessions_evicted: self.atomic_stats.sessions_evicted.load(Ordering::Relaxed),
            active_sessions: sessions.len(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn frame(text: &str) -> Frame {
        Arc::from(text)
    }

    #[tokio::test]
    async fn test_register_unregister() {
        let registry = SessionRegistry::new();
        let (tx, _rx) = mpsc::channel(4);

        let id = registry.register(tx).await;
        assert_eq!(registry.session_count().await, 1);
        assert!(registry.contains(&id).await);
        assert_eq!(registry.user_id(&id).await, None);

        let removed = registry.unregister(&id).await.unwrap();
        assert_eq!(removed.user_id, None);
        assert_eq!(registry.session_count().await, 0);
        assert_eq!(registry.unregister(&id).await, None);
    }

    #[tokio::test]
    async fn test_bind_user_once() {
        let registry = SessionRegistry::new();
        let (tx, _rx) = mpsc::channel(4);
        let id = registry.register(tx).await;

        assert!(registry.bind_user(&id, "Alice").await);
        assert!(!registry.bind_user(&id, "Mallory").await);
        assert_eq!(registry.user_id(&id).await.as_deref(), Some("Alice"));
        let removed = registry.unregister(&id).await.unwrap();
        assert_eq!(removed.user_id.as_deref(), Some("Alice"));
    }

    #[tokio::test]
    async fn test_duplicate_user_ids_allowed() {
        let registry = SessionRegistry::new();
        let (tx1, _rx1) = mpsc::channel(4);
        let (tx2, _rx2) = mpsc::channel(4);
        let a = registry.register(tx1).await;
        let b = registry.register(tx2).await;

        assert!(registry.bind_user(&a, "Same").await);
        assert!(registry.bind_user(&b, "Same").await);
    }

    #[tokio::test]
    async fn test_bind_unknown_session() {
        let registry = SessionRegistry::new();
        assert!(!registry.bind_user(&Uuid::new_v4(), "Ghost").await);
    }

    #[tokio::test]
    async fn test_broadcast_excludes_origin() {
        let registry = SessionRegistry::new();
        let (tx_a, mut rx_a) = mpsc::channel(4);
        let (tx_b, mut rx_b) = mpsc::channel(4);
        let (tx_c, mut rx_c) = mpsc::channel(4);
        let a = registry.register(tx_a).await;
        registry.register(tx_b).await;
        registry.register(tx_c).await;

        let result = registry.broadcast_except(&a, &frame("hello")).await;
        assert_eq!(result, FanOut { delivered: 2, dropped: 0 });

        assert_eq!(&*rx_b.recv().await.unwrap(), "hello");
        assert_eq!(&*rx_c.recv().await.unwrap(), "hello");
        assert!(rx_a.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_broadcast_survives_failed_recipient() {
        let registry = SessionRegistry::new();
        let (tx_a, _rx_a) = mpsc::channel(4);
        let (tx_b, rx_b) = mpsc::channel(4);
        let (tx_c, mut rx_c) = mpsc::channel(4);
        let (tx_d, mut rx_d) = mpsc::channel(4);
        let a = registry.register(tx_a).await;
        registry.register(tx_b).await;
        registry.register(tx_c).await;
        registry.register(tx_d).await;

        drop(rx_b);

        let result = registry.broadcast_except(&a, &frame("delta")).await;
        assert_eq!(result, FanOut { delivered: 2, dropped: 1 });
        assert_eq!(&*rx_c.recv().await.unwrap(), "delta");
        assert_eq!(&*rx_d.recv().await.unwrap(), "delta");
    }

    #[tokio::test]
    async fn test_full_queue_drops_without_blocking() {
        let registry = SessionRegistry::new();
        let (tx_a, _rx_a) = mpsc::channel(4);
        let (tx_slow, _rx_slow) = mpsc::channel(1);
        let (tx_fast, mut rx_fast) = mpsc::channel(8);
        let a = registry.register(tx_a).await;
        registry.register(tx_slow).await;
        registry.register(tx_fast).await;

        for i in 0..3 {
            registry.broadcast_except(&a, &frame(&format!("m{i}"))).await;
        }

        for i in 0..3 {
            assert_eq!(&*rx_fast.recv().await.unwrap(), format!("m{i}"));
        }
        let stats = registry.stats().await;
        assert_eq!(stats.messages_sent, 3);
        assert_eq!(stats.messages_dropped, 2);
        assert_eq!(stats.active_sessions, 3);
    }

    #[tokio::test]
    async fn test_evicts_recipient_with_full_queue() {
        let registry = SessionRegistry::new();
        let (tx_a, _rx_a) = mpsc::channel(4);
        let (tx_slow, mut rx_slow) = mpsc::channel(1);
        let (tx_fast, mut rx_fast) = mpsc::channel(4);
        let a = registry.register(tx_a).await;
        let slow = registry.register(tx_slow).await;
        registry.register(tx_fast).await;
        registry.bind_user(&slow, "Slow").await;

        registry.broadcast_except(&a, &frame("cursor")).await;
        let (result, evicted) = registry.broadcast_or_evict(&a, &frame("delta")).await;

        assert_eq!(result, FanOut { delivered: 1, dropped: 1 });
        assert_eq!(
            evicted,
            vec![RemovedSession { session: slow, user_id: Some("Slow".to_string()) }]
        );
        assert!(!registry.contains(&slow).await);

        // The slow session drains what it had, then its queue ends.
        assert_eq!(&*rx_slow.recv().await.unwrap(), "cursor");
        assert!(rx_slow.recv().await.is_none());

        assert_eq!(&*rx_fast.recv().await.unwrap(), "cursor");
        assert_eq!(&*rx_fast.recv().await.unwrap(), "delta");

        let stats = registry.stats().await;
        assert_eq!(stats.sessions_evicted, 1);
        assert_eq!(stats.active_sessions, 2);
    }

    #[tokio::test]
    async fn test_broadcast_or_evict_keeps_healthy_sessions() {
        let registry = SessionRegistry::new();
        let (tx_a, _rx_a) = mpsc::channel(4);
        let (tx_b, mut rx_b) = mpsc::channel(4);
        let a = registry.register(tx_a).await;
        let b = registry.register(tx_b).await;

        let (result, evicted) = registry.broadcast_or_evict(&a, &frame("delta")).await;
        assert_eq!(result, FanOut { delivered: 1, dropped: 0 });
        assert!(evicted.is_empty());
        assert!(registry.contains(&a).await);
        assert!(registry.contains(&b).await);
        assert_eq!(&*rx_b.recv().await.unwrap(), "delta");
    }

    #[tokio::test]
    async fn test_send_to_single_session() {
        let registry = SessionRegistry::new();
        let (tx, mut rx) = mpsc::channel(4);
        let id = registry.register(tx).await;

        assert!(registry.send_to(&id, frame("snapshot")).await);
        assert_eq!(&*rx.recv().await.unwrap(), "snapshot");
        assert!(!registry.send_to(&Uuid::new_v4(), frame("nobody")).await);
    }
}
