//! Per-publisher RTP fan-out
//!
//! One forwarder exists per publishing peer. It reads RTP payloads from
//! the publisher's upstream track exactly once and writes each payload to
//! every subscriber's downstream track, preserving arrival order without
//! rewriting sequence numbers or timestamps.

use crate::types::PeerId;
use parking_lot::{Mutex, RwLock};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};
use webrtc::rtp_transceiver::rtp_codec::RTCRtpCodecCapability;
use webrtc::track::track_local::track_local_static_rtp::TrackLocalStaticRTP;
use webrtc::track::track_local::TrackLocalWriter;
use webrtc::track::track_remote::TrackRemote;
use webrtc::util::marshal::MarshalSize;

/// RTP read buffer size; one MTU.
pub const RTP_MTU: usize = 1500;

/// Minimum spacing between logged write errors per subscriber.
const WRITE_ERR_LOG_INTERVAL: Duration = Duration::from_secs(5);

type OnStop = Box<dyn FnOnce() + Send + 'static>;

struct FanoutState {
    /// receiver id -> that receiver's downstream track.
    subscribers: HashMap<PeerId, Arc<TrackLocalStaticRTP>>,
    /// Last time a write error was logged per receiver.
    write_err_at: HashMap<PeerId, Instant>,
}

/// Single-reader, multi-writer fan-out for one publisher's audio track.
pub struct TrackForwarder {
    sender_id: PeerId,
    codec: RTCRtpCodecCapability,
    state: RwLock<FanoutState>,
    on_stop: Mutex<Option<OnStop>>,
    done: CancellationToken,
}

impl TrackForwarder {
    pub fn new(sender_id: PeerId, codec: RTCRtpCodecCapability) -> Self {
        Self {
            sender_id,
            codec,
            state: RwLock::new(FanoutState {
                subscribers: HashMap::new(),
                write_err_at: HashMap::new(),
            }),
            on_stop: Mutex::new(None),
            done: CancellationToken::new(),
        }
    }

    pub fn sender_id(&self) -> &PeerId {
        &self.sender_id
    }

    /// Codec of the upstream track, used to create matching downstream
    /// tracks for late joiners.
    pub fn codec(&self) -> RTCRtpCodecCapability {
        self.codec.clone()
    }

    /// Callback fired exactly once when the forwarder stops, whether by
    /// upstream end-of-stream or an explicit [`stop`](Self::stop).
    pub fn set_on_stop(&self, f: impl FnOnce() + Send + 'static) {
        *self.on_stop.lock() = Some(Box::new(f));
    }

    /// Register a receiver's downstream track. Idempotent; replaces any
    /// prior entry. The sender itself is never subscribed.
    pub fn subscribe(&self, receiver_id: PeerId, track: Arc<TrackLocalStaticRTP>) {
        if receiver_id == self.sender_id {
            return;
        }
        self.state.write().subscribers.insert(receiver_id, track);
    }

    /// Remove a receiver and its error-rate state. Idempotent.
    pub fn unsubscribe(&self, receiver_id: &PeerId) {
        let mut state = self.state.write();
        state.subscribers.remove(receiver_id);
        state.write_err_at.remove(receiver_id);
    }

    pub fn subscriber_count(&self) -> usize {
        self.state.read().subscribers.len()
    }

    /// Signal the read loop to stop. Idempotent.
    pub fn stop(&self) {
        self.done.cancel();
    }

    pub fn is_stopped(&self) -> bool {
        self.done.is_cancelled()
    }

    /// Read-and-fan-out loop. Runs until the upstream track ends (read
    /// error, treated as end-of-stream) or [`stop`](Self::stop) is
    /// called; both paths fire the on-stop callback exactly once.
    pub async fn run(self: Arc<Self>, upstream: Arc<TrackRemote>) {
        let mut buf = vec![0u8; RTP_MTU];
        loop {
            tokio::select! {
                () = self.done.cancelled() => break,
                res = upstream.read(&mut buf) => match res {
                    Ok((pkt, _)) => {
                        let n = pkt.header.marshal_size() + pkt.payload.len();
                        // Writes go against a snapshot; the map may change
                        // mid-iteration.
                        let subscribers: Vec<(PeerId, Arc<TrackLocalStaticRTP>)> = self
                            .state
                            .read()
                            .subscribers
                            .iter()
                            .map(|(id, track)| (id.clone(), track.clone()))
                            .collect();
                        for (receiver_id, track) in subscribers {
                            if let Err(err) = track.write(&buf[..n]).await {
                                self.record_write_error(&receiver_id, &err);
                            }
                        }
                    }
                    Err(err) => {
                        debug!(sender_id = %self.sender_id, error = %err, "upstream track ended");
                        break;
                    }
                },
            }
        }
        self.done.cancel();
        self.fire_on_stop();
    }

    /// Write-error policy: a closed endpoint evicts the subscriber
    /// immediately; anything else keeps it, logging at most once per
    /// subscriber per five seconds.
    fn record_write_error(&self, receiver_id: &PeerId, err: &webrtc::Error) {
        let now = Instant::now();
        let endpoint_closed = matches!(
            err,
            webrtc::Error::ErrClosedPipe | webrtc::Error::ErrConnectionClosed
        );

        let should_log = {
            let mut state = self.state.write();
            let should_log = state
                .write_err_at
                .get(receiver_id)
                .is_none_or(|last| now.duration_since(*last) >= WRITE_ERR_LOG_INTERVAL);
            if should_log {
                state.write_err_at.insert(receiver_id.clone(), now);
            }
            if endpoint_closed {
                state.subscribers.remove(receiver_id);
                state.write_err_at.remove(receiver_id);
            }
            should_log
        };

        if should_log {
            warn!(
                sender_id = %self.sender_id,
                receiver_id = %receiver_id,
                error = %err,
                removed = endpoint_closed,
                "failed to write RTP to subscriber"
            );
        }
    }

    fn fire_on_stop(&self) {
        let callback = self.on_stop.lock().take();
        if let Some(callback) = callback {
            callback();
        }
    }
}
