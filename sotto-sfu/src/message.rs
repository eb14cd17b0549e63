//! Framed signaling messages
//!
//! Every frame on the signaling channel is a JSON object with a mandatory
//! string `type` field. The family is modelled as a tagged sum type;
//! inbound frames that fail to parse (malformed JSON or an unknown
//! `type`) are dropped silently by the signaling handler.

use crate::types::PeerId;
use serde::{Deserialize, Serialize};
use webrtc::ice_transport::ice_candidate::RTCIceCandidateInit;

/// Public identity of a peer as shown to other participants.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PeerInfo {
    pub id: PeerId,
    pub name: String,
}

/// A signaling frame, keyed by its `type` field.
///
/// `room_state`, `peer_join`, `peer_leave` and `error` only ever travel
/// server-to-client; `offer`, `answer` and `candidate` travel both ways.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum SignalMessage {
    /// First frame sent to a newly admitted peer.
    RoomState {
        self_id: PeerId,
        peers: Vec<PeerInfo>,
    },
    /// A new participant joined the room.
    PeerJoin { peer: PeerInfo },
    /// A participant left the room.
    PeerLeave { peer_id: PeerId },
    /// SDP offer.
    Offer { sdp: String },
    /// SDP answer.
    Answer { sdp: String },
    /// Trickle ICE candidate.
    Candidate { candidate: RTCIceCandidateInit },
    /// Terminal error; the peer should disconnect.
    Error { message: String },
}
