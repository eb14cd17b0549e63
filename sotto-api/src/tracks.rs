//! Track attachment between forwarders and peers

use crate::negotiation;
use sotto_sfu::{Peer, Room, TrackForwarder, RTP_MTU};
use std::sync::Arc;
use tracing::error;
use webrtc::track::track_local::track_local_static_rtp::TrackLocalStaticRTP;
use webrtc::track::track_local::TrackLocal;
use webrtc::track::track_remote::TrackRemote;

/// Subscribe a newly joined peer to every forwarder already publishing
/// in the room.
pub async fn attach_existing_forwarders(room: &Arc<Room>, receiver: &Arc<Peer>) {
    for forwarder in room.forwarders_snapshot().await {
        if forwarder.sender_id() == &receiver.id {
            continue;
        }
        subscribe_to_forwarder(receiver, &forwarder).await;
    }
}

/// Create (or reuse) the receiver's downstream track for the forwarder's
/// sender and register it as a subscriber.
pub async fn subscribe_to_forwarder(receiver: &Arc<Peer>, forwarder: &Arc<TrackForwarder>) {
    if receiver.id == *forwarder.sender_id() {
        return;
    }
    let Some(pc) = receiver.endpoint().cloned() else {
        return;
    };
    let sender_id = forwarder.sender_id().clone();

    // Fast path: reuse an existing downstream track. Handles the race
    // between attach-existing and broadcast-new for a fresh joiner.
    if let Some(existing) = receiver.out_tracks.read().await.get(&sender_id).cloned() {
        forwarder.subscribe(receiver.id.clone(), existing);
        return;
    }

    let mut out_tracks = receiver.out_tracks.write().await;
    if let Some(existing) = out_tracks.get(&sender_id).cloned() {
        drop(out_tracks);
        forwarder.subscribe(receiver.id.clone(), existing);
        return;
    }

    // Stream id is the sender's peer id so the client can map the audio
    // to a speaker.
    let track = Arc::new(TrackLocalStaticRTP::new(
        forwarder.codec(),
        format!("{sender_id}-audio"),
        sender_id.to_string(),
    ));
    let rtp_sender = match pc
        .add_track(Arc::clone(&track) as Arc<dyn TrackLocal + Send + Sync>)
        .await
    {
        Ok(sender) => sender,
        Err(err) => {
            drop(out_tracks);
            error!(
                receiver_id = %receiver.id,
                sender_id = %sender_id,
                error = %err,
                "failed to add outbound track"
            );
            return;
        }
    };
    out_tracks.insert(sender_id.clone(), Arc::clone(&track));
    drop(out_tracks);

    // RTCP must be drained from the sender handle or its buffers stall.
    tokio::spawn(async move {
        let mut buf = vec![0u8; RTP_MTU];
        while rtp_sender.read(&mut buf).await.is_ok() {}
    });

    forwarder.subscribe(receiver.id.clone(), track);
    negotiation::request(receiver);
}

/// A publisher's upstream audio track arrived: build its forwarder,
/// install it in the room (stopping any predecessor), subscribe every
/// other peer, and start fan-out.
pub async fn publish_track(room: Arc<Room>, sender: Arc<Peer>, track: Arc<TrackRemote>) {
    let forwarder = Arc::new(TrackForwarder::new(
        sender.id.clone(),
        track.codec().capability.clone(),
    ));

    // The forwarder deregisters itself when it stops, unless a
    // replacement has already taken its slot.
    {
        let room = Arc::clone(&room);
        let weak = Arc::downgrade(&forwarder);
        forwarder.set_on_stop(move || {
            tokio::spawn(async move {
                if let Some(forwarder) = weak.upgrade() {
                    room.remove_forwarder_if(forwarder.sender_id(), &forwarder)
                        .await;
                }
            });
        });
    }

    if let Some(old) = room.install_forwarder(Arc::clone(&forwarder)).await {
        if !Arc::ptr_eq(&old, &forwarder) {
            old.stop();
        }
    }

    for receiver in room.peers_snapshot().await {
        if receiver.id != sender.id {
            subscribe_to_forwarder(&receiver, &forwarder).await;
        }
    }

    tokio::spawn(Arc::clone(&forwarder).run(track));
}
