//! Per-peer negotiation driver
//!
//! Renegotiations for one peer are serialized onto a single worker task
//! so offers never interleave. The server is always the polite party in
//! an offer collision: it rolls its own offer back and answers the
//! client's instead.

use sotto_sfu::{Peer, SignalMessage};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{error, warn};
use webrtc::ice_transport::ice_candidate::RTCIceCandidateInit;
use webrtc::peer_connection::offer_answer_options::RTCOfferOptions;
use webrtc::peer_connection::peer_connection_state::RTCPeerConnectionState;
use webrtc::peer_connection::sdp::sdp_type::RTCSdpType;
use webrtc::peer_connection::sdp::session_description::RTCSessionDescription;
use webrtc::peer_connection::signaling_state::RTCSignalingState;
use webrtc::peer_connection::RTCPeerConnection;

/// Minimum spacing between ICE restarts on one peer.
const ICE_RESTART_MIN_INTERVAL: Duration = Duration::from_secs(15);
/// Poll interval while waiting for a stable signaling state.
const STABLE_POLL_INTERVAL: Duration = Duration::from_millis(50);
/// Backoff after a failed offer attempt.
const OFFER_RETRY_DELAY: Duration = Duration::from_millis(100);

/// Schedule a renegotiation for `peer`.
pub fn request(peer: &Arc<Peer>) {
    request_with_ice(peer, false);
}

/// Schedule a renegotiation with fresh ICE credentials. Rate-limited to
/// one restart per 15 seconds per peer.
pub fn request_ice_restart(peer: &Arc<Peer>) {
    request_with_ice(peer, true);
}

fn request_with_ice(peer: &Arc<Peer>, ice_restart: bool) {
    {
        let mut st = peer.negotiation();
        if ice_restart {
            let now = Instant::now();
            if st
                .last_ice_restart
                .is_some_and(|last| now.duration_since(last) < ICE_RESTART_MIN_INTERVAL)
            {
                return;
            }
            st.last_ice_restart = Some(now);
            st.ice_restart_pending = true;
        }
        st.pending = true;
        if st.in_progress {
            // The running worker picks the request up on its next pass.
            return;
        }
        st.in_progress = true;
    }

    let worker = Arc::clone(peer);
    tokio::spawn(async move { run_worker(worker).await });
}

async fn run_worker(peer: Arc<Peer>) {
    loop {
        if peer.done().is_cancelled() {
            break;
        }

        let ice_restart = {
            let mut st = peer.negotiation();
            if !st.pending {
                // `in_progress` must clear under the same lock that
                // `request` checks it under.
                st.in_progress = false;
                return;
            }
            st.ice_restart_pending
        };

        let Some(pc) = peer.endpoint().cloned() else {
            break;
        };
        if pc.connection_state() == RTCPeerConnectionState::Closed
            || pc.signaling_state() == RTCSignalingState::Closed
        {
            break;
        }
        if pc.signaling_state() != RTCSignalingState::Stable
            || pc.remote_description().await.is_none()
        {
            tokio::time::sleep(STABLE_POLL_INTERVAL).await;
            continue;
        }

        {
            let mut st = peer.negotiation();
            st.pending = false;
            st.making_offer = true;
        }

        let options = ice_restart.then(|| RTCOfferOptions {
            ice_restart: true,
            ..Default::default()
        });
        let result = create_and_set_offer(&pc, options).await;

        {
            let mut st = peer.negotiation();
            st.making_offer = false;
            match &result {
                Ok(_) => st.ice_restart_pending = false,
                Err(_) => st.pending = true,
            }
        }

        match result {
            Ok(sdp) => peer.write(SignalMessage::Offer { sdp }),
            Err(err) => {
                warn!(peer_id = %peer.id, error = %err, "failed to create offer");
                tokio::time::sleep(OFFER_RETRY_DELAY).await;
            }
        }
    }

    let mut st = peer.negotiation();
    st.pending = false;
    st.ice_restart_pending = false;
    st.in_progress = false;
}

async fn create_and_set_offer(
    pc: &Arc<RTCPeerConnection>,
    options: Option<RTCOfferOptions>,
) -> webrtc::error::Result<String> {
    let offer = pc.create_offer(options).await?;
    let sdp = offer.sdp.clone();
    pc.set_local_description(offer).await?;
    Ok(sdp)
}

/// Apply an inbound offer, resolving collisions politely.
pub async fn handle_offer(peer: &Arc<Peer>, pc: &Arc<RTCPeerConnection>, sdp: String) {
    let signaling = pc.signaling_state();
    let collision = {
        let mut st = peer.negotiation();
        let collision = st.making_offer || signaling == RTCSignalingState::HaveLocalOffer;
        if collision {
            st.pending = true;
            st.making_offer = false;
        }
        collision
    };

    if signaling == RTCSignalingState::HaveRemoteOffer {
        warn!(peer_id = %peer.id, "dropping offer while a remote offer is pending");
        return;
    }
    if signaling == RTCSignalingState::HaveLocalOffer {
        let mut rollback = RTCSessionDescription::default();
        rollback.sdp_type = RTCSdpType::Rollback;
        if let Err(err) = pc.set_local_description(rollback).await {
            warn!(peer_id = %peer.id, error = %err, "rollback failed");
            return;
        }
    }

    let offer = match RTCSessionDescription::offer(sdp) {
        Ok(offer) => offer,
        Err(err) => {
            warn!(peer_id = %peer.id, error = %err, "invalid offer SDP");
            return;
        }
    };
    if let Err(err) = pc.set_remote_description(offer).await {
        error!(peer_id = %peer.id, error = %err, "set_remote_description failed");
        return;
    }
    drain_pending_candidates(peer, pc).await;

    let answer = match pc.create_answer(None).await {
        Ok(answer) => answer,
        Err(err) => {
            warn!(peer_id = %peer.id, error = %err, "failed to create answer");
            return;
        }
    };
    let sdp_out = answer.sdp.clone();
    if let Err(err) = pc.set_local_description(answer).await {
        warn!(peer_id = %peer.id, error = %err, "failed to set local answer");
        return;
    }
    peer.write(SignalMessage::Answer { sdp: sdp_out });

    if collision {
        request(peer);
    }
}

/// Apply an inbound answer.
pub async fn handle_answer(peer: &Arc<Peer>, pc: &Arc<RTCPeerConnection>, sdp: String) {
    let answer = match RTCSessionDescription::answer(sdp) {
        Ok(answer) => answer,
        Err(err) => {
            warn!(peer_id = %peer.id, error = %err, "invalid answer SDP");
            return;
        }
    };
    if let Err(err) = pc.set_remote_description(answer).await {
        error!(peer_id = %peer.id, error = %err, "set_remote_description failed");
        return;
    }
    drain_pending_candidates(peer, pc).await;
}

/// Apply or buffer an inbound ICE candidate.
pub async fn handle_candidate(
    peer: &Arc<Peer>,
    pc: &Arc<RTCPeerConnection>,
    candidate: RTCIceCandidateInit,
) {
    if pc.remote_description().await.is_none() {
        peer.buffer_candidate(candidate);
        return;
    }
    if let Err(err) = pc.add_ice_candidate(candidate).await {
        warn!(peer_id = %peer.id, error = %err, "failed to add ICE candidate");
    }
}

async fn drain_pending_candidates(peer: &Arc<Peer>, pc: &Arc<RTCPeerConnection>) {
    for candidate in peer.take_pending_candidates() {
        if let Err(err) = pc.add_ice_candidate(candidate).await {
            warn!(peer_id = %peer.id, error = %err, "failed to add pending ICE candidate");
        }
    }
}
