//! Fan-out of envelopes to connected participants.

use super::connection::{ConnectionId, ConnectionRegistry, Delivery};
use super::message::Envelope;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

/// Relays envelopes to every registered session, optionally skipping one.
pub struct Broadcaster {
    registry: Arc<ConnectionRegistry>,
    broadcasts: AtomicU64,
    frames_delivered: AtomicU64,
    frames_failed: AtomicU64,
}

impl Broadcaster {
    pub fn new(registry: Arc<ConnectionRegistry>) -> Self {
        Self {
            registry,
            broadcasts: AtomicU64::new(0),
            frames_delivered: AtomicU64::new(0),
            frames_failed: AtomicU64::new(0),
        }
    }

    /// Encode `envelope` once and queue it for every session except
    /// `exclude`. Returns the number of sessions it was queued for.
    ///
    /// A session whose queue is gone or full is skipped; its own session
    /// task takes care of unregistering it.
    pub async fn broadcast(&self, envelope: &Envelope, exclude: Option<ConnectionId>) -> usize {
        let frame = match envelope.encode() {
            Ok(frame) => frame,
            Err(e) => {
                tracing::error!(kind = ?envelope.kind(), "Failed to encode envelope: {}", e);
                return 0;
            }
        };

        let Delivery { delivered, failed } = self.registry.send_except(&frame, exclude).await;
        self.broadcasts.fetch_add(1, Ordering::Relaxed);
        self.frames_delivered.fetch_add(delivered as u64, Ordering::Relaxed);
        self.frames_failed.fetch_add(failed as u64, Ordering::Relaxed);

        if failed > 0 {
            tracing::warn!(
                kind = ?envelope.kind(),
                delivered,
                failed,
                "Broadcast partially failed"
            );
        } else {
            tracing::trace!(kind = ?envelope.kind(), delivered, "Broadcast");
        }
        delivered
    }

    pub fn stats(&self) -> BroadcastStats {
        BroadcastStats {
            broadcasts: self.broadcasts.load(Ordering::Relaxed),
            frames_delivered: self.frames_delivered.load(Ordering::Relaxed),
            frames_failed: self.frames_failed.load(Ordering::Relaxed),
        }
    }
}

/// Counters for the broadcaster.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BroadcastStats {
    /// Envelopes fanned out.
    pub broadcasts: u64,
    /// Frames queued for a recipient.
    pub frames_delivered: u64,
    /// Frames dropped because the recipient's queue was closed or full.
    pub frames_failed: u64,
}
