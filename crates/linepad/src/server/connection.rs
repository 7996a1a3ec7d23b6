//! Connection registry: who is connected, under which name and color,
//! and where their cursor was last seen.
//!
//! Each registered session also holds the sending side of its outbound
//! queue. Pushing onto that queue never blocks, so delivering a frame while
//! the registry lock is held never waits on a slow peer. The queue is
//! bounded: a peer that lets it fill up is told to leave through its
//! overflow signal.

use super::message::Collaborator;
use crate::document::Position;
use crate::error::RegistryError;
use bytes::Bytes;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::{mpsc, Notify, RwLock};

/// Unique connection identifier.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct ConnectionId(pub u64);

impl ConnectionId {
    /// Generate a new unique connection ID.
    pub fn new() -> Self {
        static COUNTER: AtomicU64 = AtomicU64::new(1);
        Self(COUNTER.fetch_add(1, Ordering::SeqCst))
    }
}

impl Default for ConnectionId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Conn({})", self.0)
    }
}

/// Default number of frames a session may have queued.
pub const DEFAULT_OUTBOUND_QUEUE: usize = 1024;

/// Sending side of a session's outbound frame queue.
#[derive(Clone, Debug)]
pub struct Outbound {
    tx: mpsc::Sender<Bytes>,
    /// Signalled when a frame is refused because the queue is full.
    overflow: Arc<Notify>,
}

impl Outbound {
    /// A queue holding at most `capacity` frames (at least one).
    pub fn channel(capacity: usize) -> (Self, mpsc::Receiver<Bytes>) {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        let outbound = Self {
            tx,
            overflow: Arc::new(Notify::new()),
        };
        (outbound, rx)
    }

    /// Handle the owning session waits on to learn it fell behind.
    pub fn overflow(&self) -> Arc<Notify> {
        Arc::clone(&self.overflow)
    }

    fn try_send(&self, id: ConnectionId, frame: Bytes) -> Result<(), SendError> {
        self.tx.try_send(frame).map_err(|e| match e {
            TrySendError::Full(_) => {
                self.overflow.notify_one();
                SendError::QueueFull(id)
            }
            TrySendError::Closed(_) => SendError::ChannelClosed(id),
        })
    }
}

/// Error when queueing a frame for a session fails.
#[derive(Debug, Clone, thiserror::Error)]
pub enum SendError {
    /// The session is not draining its queue.
    #[error("Outbound queue full for connection {0}")]
    QueueFull(ConnectionId),
    /// The session's writer has gone away.
    #[error("Channel closed for connection {0}")]
    ChannelClosed(ConnectionId),
}

/// Cursor palette assigned cyclically to new sessions.
pub const DEFAULT_PALETTE: [&str; 10] = [
    "#FF5733",
    "#33FF57",
    "#3357FF",
    "#FF33A8",
    "#A833FF",
    "#33FFF6",
    "#FF8F33",
    "#8FFF33",
    "#FF3333",
    "#33FF8F",
];

/// Default palette as owned strings.
pub fn default_palette() -> Vec<String> {
    DEFAULT_PALETTE.iter().map(|c| c.to_string()).collect()
}

/// A registered participant.
#[derive(Debug)]
pub struct SessionEntry {
    pub name: String,
    pub color: String,
    pub cursor: Position,
    tx: Outbound,
}

impl SessionEntry {
    pub fn to_collaborator(&self) -> Collaborator {
        Collaborator {
            name: self.name.clone(),
            color: Some(self.color.clone()),
            cursor: Some(self.cursor),
        }
    }
}

#[derive(Default)]
struct Sessions {
    by_id: HashMap<ConnectionId, SessionEntry>,
    /// Name index kept in step with `by_id`.
    by_name: HashMap<String, ConnectionId>,
}

/// Outcome of a fan-out.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct Delivery {
    pub delivered: usize,
    pub failed: usize,
}

/// Registry of active sessions.
pub struct ConnectionRegistry {
    sessions: RwLock<Sessions>,
    palette: Vec<String>,
    /// Successful registrations over the process lifetime.
    registrations: AtomicU64,
}

impl Default for ConnectionRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl ConnectionRegistry {
    /// Create a registry using the default palette.
    pub fn new() -> Self {
        Self::with_palette(default_palette())
    }

    /// Create a registry with a custom palette. An empty palette falls
    /// back to the default one.
    pub fn with_palette(palette: Vec<String>) -> Self {
        let palette = if palette.is_empty() { default_palette() } else { palette };
        Self {
            sessions: RwLock::new(Sessions::default()),
            palette,
            registrations: AtomicU64::new(0),
        }
    }

    /// Color for the `sequence`-th successful registration (1-indexed).
    ///
    /// Wraps around once the palette is exhausted, so later sessions share
    /// colors with earlier ones.
    pub fn assign_color(&self, sequence: u64) -> String {
        let index = (sequence.saturating_sub(1) % self.palette.len() as u64) as usize;
        self.palette[index].clone()
    }

    /// Register a session under `name`.
    ///
    /// Fails if any active session has exactly the same name. On success
    /// the session starts with its cursor at (0, 0) and the assigned color
    /// is returned.
    pub async fn register(
        &self,
        id: ConnectionId,
        name: &str,
        tx: Outbound,
    ) -> Result<String, RegistryError> {
        let mut sessions = self.sessions.write().await;
        if sessions.by_name.contains_key(name) {
            return Err(RegistryError::NameTaken {
                name: name.to_string(),
            });
        }

        let sequence = self.registrations.fetch_add(1, Ordering::SeqCst) + 1;
        let color = self.assign_color(sequence);

        sessions.by_name.insert(name.to_string(), id);
        sessions.by_id.insert(
            id,
            SessionEntry {
                name: name.to_string(),
                color: color.clone(),
                cursor: Position::default(),
                tx,
            },
        );
        Ok(color)
    }

    /// Remove a session. Removing an unknown id is a no-op.
    pub async fn unregister(&self, id: ConnectionId) -> Option<Collaborator> {
        let mut sessions = self.sessions.write().await;
        let entry = sessions.by_id.remove(&id)?;
        sessions.by_name.remove(&entry.name);
        Some(entry.to_collaborator())
    }

    /// Overwrite a session's cursor. Positions are not checked against any
    /// document. Returns `false` for unknown ids.
    pub async fn update_cursor(&self, id: ConnectionId, x: i64, y: i64) -> bool {
        match self.sessions.write().await.by_id.get_mut(&id) {
            Some(entry) => {
                entry.cursor = Position::new(x, y);
                true
            }
            None => false,
        }
    }

    /// Every active session except `exclude`, sorted by name.
    pub async fn snapshot_roster(&self, exclude: Option<ConnectionId>) -> Vec<Collaborator> {
        let sessions = self.sessions.read().await;
        let mut roster: Vec<Collaborator> = sessions
            .by_id
            .iter()
            .filter(|(id, _)| Some(**id) != exclude)
            .map(|(_, entry)| entry.to_collaborator())
            .collect();
        roster.sort_by(|a, b| a.name.cmp(&b.name));
        roster
    }

    /// Number of active sessions.
    pub async fn len(&self) -> usize {
        self.sessions.read().await.by_id.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }

    /// Successful registrations since the registry was created.
    pub fn registrations(&self) -> u64 {
        self.registrations.load(Ordering::SeqCst)
    }

    /// Queue `frame` for every session except `exclude`.
    ///
    /// A failed send is logged and skipped; it never stops delivery to the
    /// remaining sessions. A session whose queue is full is signalled to
    /// disconnect.
    pub async fn send_except(&self, frame: &Bytes, exclude: Option<ConnectionId>) -> Delivery {
        let sessions = self.sessions.read().await;
        let mut delivery = Delivery::default();
        for (&id, entry) in &sessions.by_id {
            if Some(id) == exclude {
                continue;
            }
            match entry.tx.try_send(id, frame.clone()) {
                Ok(()) => delivery.delivered += 1,
                Err(e) => {
                    tracing::debug!(conn = %id, name = %entry.name, "{}", e);
                    delivery.failed += 1;
                }
            }
        }
        delivery
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn outbound() -> (Outbound, mpsc::Receiver<Bytes>) {
        Outbound::channel(16)
    }

    #[test]
    fn test_connection_id_uniqueness() {
        let id1 = ConnectionId::new();
        let id2 = ConnectionId::new();
        assert_ne!(id1, id2);
    }

    #[tokio::test]
    async fn test_register_rejects_duplicate_name() {
        let registry = ConnectionRegistry::new();
        let alice = ConnectionId::new();
        let (tx, _rx) = outbound();
        registry.register(alice, "alice", tx).await.unwrap();

        let (tx, _rx2) = outbound();
        let err = registry.register(ConnectionId::new(), "alice", tx).await.unwrap_err();
        assert_eq!(err, RegistryError::NameTaken { name: "alice".to_string() });

        // The first session keeps its registration.
        assert_eq!(registry.len().await, 1);
        let roster = registry.snapshot_roster(None).await;
        assert_eq!(roster[0].name, "alice");
        assert!(registry.snapshot_roster(Some(alice)).await.is_empty());
    }

    #[tokio::test]
    async fn test_names_are_case_sensitive() {
        let registry = ConnectionRegistry::new();
        let (tx1, _rx1) = outbound();
        let (tx2, _rx2) = outbound();
        registry.register(ConnectionId::new(), "alice", tx1).await.unwrap();
        assert!(registry.register(ConnectionId::new(), "Alice", tx2).await.is_ok());
    }

    #[tokio::test]
    async fn test_name_free_after_unregister() {
        let registry = ConnectionRegistry::new();
        let id = ConnectionId::new();
        let (tx, _rx) = outbound();
        registry.register(id, "alice", tx).await.unwrap();

        let removed = registry.unregister(id).await.unwrap();
        assert_eq!(removed.name, "alice");
        assert!(registry.unregister(id).await.is_none());
        assert!(registry.is_empty().await);

        let (tx, _rx) = outbound();
        assert!(registry.register(ConnectionId::new(), "alice", tx).await.is_ok());
    }

    #[tokio::test]
    async fn test_colors_cycle_over_lifetime_registrations() {
        let registry = ConnectionRegistry::new();
        let mut receivers = Vec::new();
        let mut colors = Vec::new();
        for k in 0..12 {
            let id = ConnectionId::new();
            let (tx, rx) = outbound();
            receivers.push(rx);
            colors.push(registry.register(id, &format!("user{k}"), tx).await.unwrap());
            // Disconnects do not reset the sequence.
            registry.unregister(id).await;
        }
        for (k, color) in colors.iter().enumerate() {
            assert_eq!(color, DEFAULT_PALETTE[k % DEFAULT_PALETTE.len()]);
        }
        assert_eq!(colors[10], colors[0]);
        assert_eq!(registry.registrations(), 12);
    }

    #[tokio::test]
    async fn test_failed_registration_does_not_consume_a_color() {
        let registry = ConnectionRegistry::new();
        let (tx, _rx) = outbound();
        registry.register(ConnectionId::new(), "a", tx).await.unwrap();
        let (tx, _rx) = outbound();
        assert!(registry.register(ConnectionId::new(), "a", tx).await.is_err());
        let (tx, _rx) = outbound();
        let color = registry.register(ConnectionId::new(), "b", tx).await.unwrap();
        assert_eq!(color, DEFAULT_PALETTE[1]);
    }

    #[test]
    fn test_assign_color_custom_palette() {
        let registry = ConnectionRegistry::with_palette(vec!["red".into(), "blue".into()]);
        assert_eq!(registry.assign_color(1), "red");
        assert_eq!(registry.assign_color(2), "blue");
        assert_eq!(registry.assign_color(3), "red");

        let fallback = ConnectionRegistry::with_palette(Vec::new());
        assert_eq!(fallback.assign_color(1), DEFAULT_PALETTE[0]);
    }

    #[tokio::test]
    async fn test_cursor_updates_and_roster() {
        let registry = ConnectionRegistry::new();
        let alice = ConnectionId::new();
        let bob = ConnectionId::new();
        let (tx1, _rx1) = outbound();
        let (tx2, _rx2) = outbound();
        registry.register(alice, "alice", tx1).await.unwrap();
        registry.register(bob, "bob", tx2).await.unwrap();

        assert!(registry.update_cursor(bob, 500, 900).await);
        assert!(!registry.update_cursor(ConnectionId::new(), 1, 1).await);

        let roster = registry.snapshot_roster(Some(alice)).await;
        assert_eq!(roster.len(), 1);
        assert_eq!(roster[0].name, "bob");
        assert_eq!(roster[0].cursor, Some(Position::new(500, 900)));
        assert_eq!(roster[0].color.as_deref(), Some(DEFAULT_PALETTE[1]));

        assert_eq!(registry.snapshot_roster(None).await.len(), 2);
    }

    #[tokio::test]
    async fn test_send_except_skips_excluded_and_survives_closed_channels() {
        let registry = ConnectionRegistry::new();
        let a = ConnectionId::new();
        let (tx_a, mut rx_a) = outbound();
        let (tx_b, rx_b) = outbound();
        let (tx_c, mut rx_c) = outbound();
        registry.register(a, "a", tx_a).await.unwrap();
        registry.register(ConnectionId::new(), "b", tx_b).await.unwrap();
        registry.register(ConnectionId::new(), "c", tx_c).await.unwrap();
        drop(rx_b);

        let frame = Bytes::from_static(b"{}\n");
        let delivery = registry.send_except(&frame, Some(a)).await;
        assert_eq!(delivery, Delivery { delivered: 1, failed: 1 });

        assert_eq!(rx_c.try_recv().unwrap(), frame);
        assert!(rx_a.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_full_queue_signals_overflow() {
        let registry = ConnectionRegistry::new();
        let (tx, mut rx) = Outbound::channel(1);
        let overflow = tx.overflow();
        registry.register(ConnectionId::new(), "slow", tx).await.unwrap();

        let frame = Bytes::from_static(b"{}\n");
        assert_eq!(
            registry.send_except(&frame, None).await,
            Delivery { delivered: 1, failed: 0 }
        );
        assert_eq!(
            registry.send_except(&frame, None).await,
            Delivery { delivered: 0, failed: 1 }
        );

        // The permit is stored, so a later wait completes immediately.
        tokio::time::timeout(std::time::Duration::from_secs(1), overflow.notified())
            .await
            .unwrap();
        assert_eq!(rx.try_recv().unwrap(), frame);
        assert!(rx.try_recv().is_err());
    }
}
