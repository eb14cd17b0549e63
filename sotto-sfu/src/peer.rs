//! Connected peer state

use crate::message::{PeerInfo, SignalMessage};
use crate::types::PeerId;
use parking_lot::{Mutex, MutexGuard};
use std::collections::HashMap;
use std::sync::atomic::AtomicBool;
use std::sync::{Arc, OnceLock};
use std::time::Instant;
use tokio::sync::{mpsc, RwLock};
use tokio_util::sync::CancellationToken;
use tracing::warn;
use webrtc::ice_transport::ice_candidate::RTCIceCandidateInit;
use webrtc::peer_connection::RTCPeerConnection;
use webrtc::track::track_local::track_local_static_rtp::TrackLocalStaticRTP;

/// One frame on a peer's outbound signaling channel.
///
/// The channel is drained by a single writer task, which is what
/// serializes all writes to the underlying transport.
#[derive(Debug)]
pub enum SignalFrame {
    Message(SignalMessage),
    Ping,
}

pub type SignalSender = mpsc::UnboundedSender<SignalFrame>;

/// Negotiation flag block, guarded by the peer's negotiation mutex.
///
/// The mutex is only ever held for flag reads and writes, never across
/// SDP operations or network sends.
#[derive(Debug, Default)]
pub struct NegotiationState {
    pub pending: bool,
    pub in_progress: bool,
    pub making_offer: bool,
    pub ice_restart_pending: bool,
    pub last_ice_restart: Option<Instant>,
}

/// A connected participant.
///
/// The peer is registered in its room for exactly as long as its
/// signaling channel is open; closing that channel is the sole entry
/// point for teardown.
pub struct Peer {
    pub id: PeerId,
    pub name: String,
    pub ip: String,
    pub joined_at: Instant,
    pub muted: AtomicBool,

    /// Outbound tracks keyed by sender peer id; each track's stream id
    /// equals that sender's id so clients can map audio to a speaker.
    pub out_tracks: RwLock<HashMap<PeerId, Arc<TrackLocalStaticRTP>>>,

    tx: SignalSender,
    endpoint: OnceLock<Arc<RTCPeerConnection>>,
    negotiation: Mutex<NegotiationState>,
    pending_candidates: Mutex<Vec<RTCIceCandidateInit>>,
    done: CancellationToken,
}

impl Peer {
    pub fn new(name: String, ip: String, tx: SignalSender) -> Self {
        Self {
            id: PeerId::generate(),
            name,
            ip,
            joined_at: Instant::now(),
            muted: AtomicBool::new(false),
            out_tracks: RwLock::new(HashMap::new()),
            tx,
            endpoint: OnceLock::new(),
            negotiation: Mutex::new(NegotiationState::default()),
            pending_candidates: Mutex::new(Vec::new()),
            done: CancellationToken::new(),
        }
    }

    pub fn info(&self) -> PeerInfo {
        PeerInfo {
            id: self.id.clone(),
            name: self.name.clone(),
        }
    }

    /// Enqueue a signaling message. Dropped with a warning once the
    /// writer task has gone away.
    pub fn write(&self, msg: SignalMessage) {
        if self.tx.send(SignalFrame::Message(msg)).is_err() {
            warn!(peer_id = %self.id, "signaling write failed: channel closed");
        }
    }

    /// Enqueue a transport-level ping; false once the channel is closed.
    pub fn send_ping(&self) -> bool {
        self.tx.send(SignalFrame::Ping).is_ok()
    }

    /// Attach the media endpoint once it has been created.
    pub fn set_endpoint(&self, pc: Arc<RTCPeerConnection>) {
        let _ = self.endpoint.set(pc);
    }

    pub fn endpoint(&self) -> Option<&Arc<RTCPeerConnection>> {
        self.endpoint.get()
    }

    pub fn negotiation(&self) -> MutexGuard<'_, NegotiationState> {
        self.negotiation.lock()
    }

    /// Buffer an ICE candidate that arrived before the remote description.
    pub fn buffer_candidate(&self, candidate: RTCIceCandidateInit) {
        self.pending_candidates.lock().push(candidate);
    }

    /// Drain buffered candidates in arrival order.
    pub fn take_pending_candidates(&self) -> Vec<RTCIceCandidateInit> {
        std::mem::take(&mut *self.pending_candidates.lock())
    }

    /// Fire the done signal; cancels the ping loop and the negotiation
    /// worker at their next checkpoint. Idempotent.
    pub fn signal_done(&self) {
        self.done.cancel();
    }

    pub fn done(&self) -> CancellationToken {
        self.done.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn new_peer() -> (Arc<Peer>, mpsc::UnboundedReceiver<SignalFrame>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (
            Arc::new(Peer::new("alice".to_string(), "127.0.0.1".to_string(), tx)),
            rx,
        )
    }

    #[tokio::test]
    async fn test_write_is_ordered_and_survives_closed_channel() {
        let (peer, mut rx) = new_peer();
        peer.write(SignalMessage::Error {
            message: "one".to_string(),
        });
        peer.write(SignalMessage::Error {
            message: "two".to_string(),
        });

        for expected in ["one", "two"] {
            match rx.recv().await {
                Some(SignalFrame::Message(SignalMessage::Error { message })) => {
                    assert_eq!(message, expected);
                }
                other => panic!("unexpected frame: {other:?}"),
            }
        }

        drop(rx);
        // Must not panic once the writer side is gone.
        peer.write(SignalMessage::Error {
            message: "dropped".to_string(),
        });
        assert!(!peer.send_ping());
    }

    #[tokio::test]
    async fn test_pending_candidates_drain_in_fifo_order() {
        let (peer, _rx) = new_peer();
        for i in 0..3 {
            peer.buffer_candidate(RTCIceCandidateInit {
                candidate: format!("candidate-{i}"),
                ..Default::default()
            });
        }
        let drained = peer.take_pending_candidates();
        assert_eq!(
            drained.iter().map(|c| c.candidate.as_str()).collect::<Vec<_>>(),
            vec!["candidate-0", "candidate-1", "candidate-2"]
        );
        assert!(peer.take_pending_candidates().is_empty());
    }

    #[tokio::test]
    async fn test_done_signal_is_idempotent() {
        let (peer, _rx) = new_peer();
        assert!(!peer.done().is_cancelled());
        peer.signal_done();
        peer.signal_done();
        assert!(peer.done().is_cancelled());
    }
}
