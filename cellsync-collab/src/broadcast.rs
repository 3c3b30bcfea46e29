//! Room fan-out with backpressure.
//!
//! Every member of a room holds a receiver on one tokio broadcast channel.
//! A frame is encoded once and shared as `Arc<Vec<u8>>`; filtering out the
//! sender is the receiver's job. Receivers that fall more than `capacity`
//! frames behind lose the oldest ones and report the gap.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::{broadcast, RwLock};

use cellsync_core::{ActorId, Collaborator};

use crate::protocol::{ProtocolError, SyncMessage};

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BroadcastStats {
    pub messages_sent: u64,
    /// Frames lost by lagging receivers.
    pub messages_dropped: u64,
    pub active_peers: usize,
}

struct AtomicBroadcastStats {
    messages_sent: AtomicU64,
    messages_dropped: AtomicU64,
}

impl AtomicBroadcastStats {
    fn new() -> Self {
        Self {
            messages_sent: AtomicU64::new(0),
            messages_dropped: AtomicU64::new(0),
        }
    }
}

/// The members of one document room and their shared channel.
pub struct BroadcastGroup {
    sender: broadcast::Sender<Arc<Vec<u8>>>,
    peers: RwLock<HashMap<ActorId, Collaborator>>,
    capacity: usize,
    stats: AtomicBroadcastStats,
}

impl BroadcastGroup {
    /// `capacity` frames are buffered per receiver before it starts lagging.
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self {
            sender,
            peers: RwLock::new(HashMap::new()),
            capacity,
            stats: AtomicBroadcastStats::new(),
        }
    }

    /// Register a member and subscribe it to the room.
    pub async fn add_peer(&self, info: Collaborator) -> broadcast::Receiver<Arc<Vec<u8>>> {
        let mut peers = self.peers.write().await;
        peers.insert(info.session_id, info);
        self.sender.subscribe()
    }

    pub async fn remove_peer(&self, peer: &ActorId) -> Option<Collaborator> {
        self.peers.write().await.remove(peer)
    }

    /// Encode once and send to every member. Returns the receiver count.
    pub fn broadcast(&self, msg: &SyncMessage) -> Result<usize, ProtocolError> {
        Ok(self.broadcast_raw(Arc::new(msg.encode()?)))
    }

    /// Send an already-encoded frame.
    pub fn broadcast_raw(&self, encoded: Arc<Vec<u8>>) -> usize {
        let count = self.sender.send(encoded).unwrap_or(0);
        self.stats.messages_sent.fetch_add(1, Ordering::Relaxed);
        count
    }

    /// Account for frames a lagging receiver skipped.
    pub fn record_lag(&self, skipped: u64) {
        self.stats.messages_dropped.fetch_add(skipped, Ordering::Relaxed);
    }

    pub async fn peer_count(&self) -> usize {
        self.peers.read().await.len()
    }

    pub async fn peers(&self) -> Vec<Collaborator> {
        self.peers.read().await.values().cloned().collect()
    }

    pub async fn has_peer(&self, peer: &ActorId) -> bool {
        self.peers.read().await.contains_key(peer)
    }

    pub async fn stats(&self) -> BroadcastStats {
        BroadcastStats {
            messages_sent: self.stats.messages_sent.load(Ordering::Relaxed),
            messages_dropped: self.stats.messages_dropped.load(Ordering::Relaxed),
            active_peers: self.peers.read().await.len(),
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }
}
