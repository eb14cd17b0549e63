//! Room state

use crate::forwarder::TrackForwarder;
use crate::message::{PeerInfo, SignalMessage};
use crate::peer::Peer;
use crate::types::{PeerId, RoomId};
use anyhow::{anyhow, Result};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::RwLock;

/// An ephemeral voice room: its peers and the forwarder for each
/// currently publishing peer.
///
/// Peer and forwarder locks are held only to mutate or snapshot the maps,
/// never across I/O.
pub struct Room {
    id: RoomId,
    capacity: usize,
    peers: RwLock<HashMap<PeerId, Arc<Peer>>>,
    forwarders: RwLock<HashMap<PeerId, Arc<TrackForwarder>>>,
    last_empty: parking_lot::Mutex<Instant>,
    created_at: Instant,
}

impl Room {
    pub fn new(id: RoomId, capacity: usize) -> Self {
        let now = Instant::now();
        Self {
            id,
            capacity,
            peers: RwLock::new(HashMap::new()),
            forwarders: RwLock::new(HashMap::new()),
            last_empty: parking_lot::Mutex::new(now),
            created_at: now,
        }
    }

    pub fn id(&self) -> &RoomId {
        &self.id
    }

    pub fn created_at(&self) -> Instant {
        self.created_at
    }

    /// Admit a peer, enforcing room capacity under the write lock.
    pub async fn add_peer(&self, peer: Arc<Peer>) -> Result<()> {
        let mut peers = self.peers.write().await;
        if peers.len() >= self.capacity {
            return Err(anyhow!("room full"));
        }
        peers.insert(peer.id.clone(), peer);
        Ok(())
    }

    /// Remove a peer; records the moment the room last became empty.
    pub async fn remove_peer(&self, peer_id: &PeerId) {
        let mut peers = self.peers.write().await;
        peers.remove(peer_id);
        if peers.is_empty() {
            *self.last_empty.lock() = Instant::now();
        }
    }

    pub async fn peer_count(&self) -> usize {
        self.peers.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.peers.read().await.is_empty()
    }

    pub async fn peer_infos(&self) -> Vec<PeerInfo> {
        self.peers.read().await.values().map(|p| p.info()).collect()
    }

    pub async fn peers_snapshot(&self) -> Vec<Arc<Peer>> {
        self.peers.read().await.values().cloned().collect()
    }

    /// Send `msg` to every peer except `sender_id`. The peer set is
    /// snapshotted first so the lock is not held while sending.
    pub async fn broadcast(&self, sender_id: &PeerId, msg: &SignalMessage) {
        let peers: Vec<Arc<Peer>> = {
            self.peers
                .read()
                .await
                .values()
                .filter(|p| p.id != *sender_id)
                .cloned()
                .collect()
        };
        for peer in peers {
            peer.write(msg.clone());
        }
    }

    /// Install a forwarder for its sender, returning any forwarder it
    /// replaced so the caller can stop it.
    pub async fn install_forwarder(
        &self,
        forwarder: Arc<TrackForwarder>,
    ) -> Option<Arc<TrackForwarder>> {
        self.forwarders
            .write()
            .await
            .insert(forwarder.sender_id().clone(), forwarder)
    }

    /// Remove `sender_id`'s forwarder only if it is still `expected`;
    /// lets a stopped forwarder deregister itself without clobbering a
    /// replacement.
    pub async fn remove_forwarder_if(
        &self,
        sender_id: &PeerId,
        expected: &Arc<TrackForwarder>,
    ) -> bool {
        let mut forwarders = self.forwarders.write().await;
        match forwarders.get(sender_id) {
            Some(current) if Arc::ptr_eq(current, expected) => {
                forwarders.remove(sender_id);
                true
            }
            _ => false,
        }
    }

    pub async fn take_forwarder(&self, sender_id: &PeerId) -> Option<Arc<TrackForwarder>> {
        self.forwarders.write().await.remove(sender_id)
    }

    pub async fn forwarder(&self, sender_id: &PeerId) -> Option<Arc<TrackForwarder>> {
        self.forwarders.read().await.get(sender_id).cloned()
    }

    pub async fn forwarders_snapshot(&self) -> Vec<Arc<TrackForwarder>> {
        self.forwarders.read().await.values().cloned().collect()
    }

    /// A room may be reaped once its peer set has been empty for longer
    /// than `idle`.
    pub async fn is_reapable(&self, idle: Duration) -> bool {
        if !self.is_empty().await {
            return false;
        }
        self.last_empty.lock().elapsed() > idle
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::peer::SignalFrame;
    use tokio::sync::mpsc;

    fn new_peer(name: &str) -> (Arc<Peer>, mpsc::UnboundedReceiver<SignalFrame>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (
            Arc::new(Peer::new(name.to_string(), "127.0.0.1".to_string(), tx)),
            rx,
        )
    }

    #[tokio::test]
    async fn test_capacity_is_enforced() {
        let room = Room::new(RoomId::from("r1"), 2);
        let mut receivers = Vec::new();
        for name in ["a", "b"] {
            let (peer, rx) = new_peer(name);
            receivers.push(rx);
            room.add_peer(peer).await.unwrap();
        }

        let (overflow, _rx) = new_peer("c");
        assert!(room.add_peer(overflow).await.is_err());
        assert_eq!(room.peer_count().await, 2);
    }

    #[tokio::test]
    async fn test_remove_peer_marks_room_empty() {
        let room = Room::new(RoomId::from("r1"), 10);
        let (peer, _rx) = new_peer("a");
        let id = peer.id.clone();
        room.add_peer(peer).await.unwrap();

        assert!(!room.is_reapable(Duration::ZERO).await);
        room.remove_peer(&id).await;
        assert!(room.is_empty().await);
        assert!(room.is_reapable(Duration::ZERO).await);
        assert!(!room.is_reapable(Duration::from_secs(3600)).await);
    }

    #[tokio::test]
    async fn test_broadcast_skips_sender() {
        let room = Room::new(RoomId::from("r1"), 10);
        let (alice, mut alice_rx) = new_peer("alice");
        let (bob, mut bob_rx) = new_peer("bob");
        let alice_id = alice.id.clone();
        room.add_peer(alice).await.unwrap();
        room.add_peer(bob).await.unwrap();

        room.broadcast(
            &alice_id,
            &SignalMessage::PeerLeave {
                peer_id: alice_id.clone(),
            },
        )
        .await;

        assert!(matches!(
            bob_rx.try_recv(),
            Ok(SignalFrame::Message(SignalMessage::PeerLeave { .. }))
        ));
        assert!(alice_rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_forwarder_replace_and_conditional_remove() {
        use webrtc::rtp_transceiver::rtp_codec::RTCRtpCodecCapability;

        let room = Room::new(RoomId::from("r1"), 10);
        let sender = PeerId::from("s1");

        let first = Arc::new(TrackForwarder::new(
            sender.clone(),
            RTCRtpCodecCapability::default(),
        ));
        let second = Arc::new(TrackForwarder::new(
            sender.clone(),
            RTCRtpCodecCapability::default(),
        ));

        assert!(room.install_forwarder(first.clone()).await.is_none());
        let replaced = room.install_forwarder(second.clone()).await.unwrap();
        assert!(Arc::ptr_eq(&replaced, &first));

        // The stale forwarder must not be able to remove its replacement.
        assert!(!room.remove_forwarder_if(&sender, &first).await);
        assert!(room.forwarder(&sender).await.is_some());
        assert!(room.remove_forwarder_if(&sender, &second).await);
        assert!(room.forwarder(&sender).await.is_none());
    }
}
