//! Media endpoint factory and event wiring

use crate::{negotiation, tracks};
use anyhow::Context;
use sotto_sfu::{Peer, Room, SignalMessage, TurnConfig};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::UdpSocket;
use tracing::{info, warn};
use webrtc::api::interceptor_registry::register_default_interceptors;
use webrtc::api::media_engine::MediaEngine;
use webrtc::api::setting_engine::SettingEngine;
use webrtc::api::{APIBuilder, API};
use webrtc::ice::udp_mux::{UDPMuxDefault, UDPMuxParams};
use webrtc::ice::udp_network::UDPNetwork;
use webrtc::ice_transport::ice_connection_state::RTCIceConnectionState;
use webrtc::ice_transport::ice_server::RTCIceServer;
use webrtc::interceptor::registry::Registry;
use webrtc::peer_connection::configuration::RTCConfiguration;
use webrtc::peer_connection::peer_connection_state::RTCPeerConnectionState;
use webrtc::peer_connection::RTCPeerConnection;
use webrtc::rtp_transceiver::rtp_codec::RTPCodecType;

/// Wait before retrying ICE after a `disconnected` transition.
const ICE_RESTART_DELAY: Duration = Duration::from_secs(5);

/// Media transport configuration for the endpoint factory.
#[derive(Debug, Clone)]
pub struct RtcConfig {
    /// Single UDP port shared by all peers via ICE UDP mux; 0 disables
    /// the mux and falls back to ephemeral ports.
    pub udp_port: u16,
    pub stun_servers: Vec<String>,
    pub turn: Option<TurnConfig>,
}

/// Builds media endpoints with shared engine settings (UDP mux, ICE
/// timeouts) and the deployment's ICE server list.
pub struct EndpointFactory {
    api: API,
    config: RTCConfiguration,
}

impl EndpointFactory {
    pub async fn new(cfg: &RtcConfig) -> anyhow::Result<Self> {
        let mut media = MediaEngine::default();
        media
            .register_default_codecs()
            .context("failed to register codecs")?;
        let mut registry = Registry::new();
        registry = register_default_interceptors(registry, &mut media)
            .context("failed to register interceptors")?;

        let mut settings = SettingEngine::default();
        if cfg.udp_port != 0 {
            let socket = UdpSocket::bind(("0.0.0.0", cfg.udp_port))
                .await
                .with_context(|| format!("failed to bind ICE UDP mux port {}", cfg.udp_port))?;
            let mux = UDPMuxDefault::new(UDPMuxParams::new(socket));
            settings.set_udp_network(UDPNetwork::Muxed(mux));
            info!(port = cfg.udp_port, "ICE UDP mux enabled");
        }
        // Keep NAT mappings alive with frequent STUN keepalives; consumer
        // NAT entries commonly expire after 30-60s.
        settings.set_ice_timeouts(
            Some(Duration::from_secs(8)),
            Some(Duration::from_secs(30)),
            Some(Duration::from_secs(5)),
        );

        let api = APIBuilder::new()
            .with_media_engine(media)
            .with_interceptor_registry(registry)
            .with_setting_engine(settings)
            .build();

        let mut ice_servers = Vec::new();
        if !cfg.stun_servers.is_empty() {
            ice_servers.push(RTCIceServer {
                urls: cfg.stun_servers.clone(),
                ..Default::default()
            });
        }
        if let Some(turn) = &cfg.turn {
            ice_servers.push(RTCIceServer {
                urls: vec![turn.url.clone()],
                username: turn.username.clone(),
                credential: turn.credential.clone(),
                ..Default::default()
            });
            info!(server = %turn.url, "TURN server configured");
        }

        Ok(Self {
            api,
            config: RTCConfiguration {
                ice_servers,
                ..Default::default()
            },
        })
    }

    pub async fn create_endpoint(&self) -> webrtc::error::Result<Arc<RTCPeerConnection>> {
        Ok(Arc::new(
            self.api.new_peer_connection(self.config.clone()).await?,
        ))
    }
}

/// Create the peer's media endpoint and wire its event callbacks: ICE
/// state recovery, trickle candidates out, and incoming-track fan-out.
pub async fn setup_endpoint(
    factory: &EndpointFactory,
    room: &Arc<Room>,
    peer: &Arc<Peer>,
) -> anyhow::Result<()> {
    let pc = factory
        .create_endpoint()
        .await
        .context("failed to create peer connection")?;
    peer.set_endpoint(Arc::clone(&pc));

    {
        let peer = Arc::clone(peer);
        pc.on_ice_connection_state_change(Box::new(move |state: RTCIceConnectionState| {
            let peer = Arc::clone(&peer);
            Box::pin(async move {
                info!(peer_id = %peer.id, state = %state, "ICE connection state changed");
                match state {
                    RTCIceConnectionState::Failed => negotiation::request_ice_restart(&peer),
                    RTCIceConnectionState::Disconnected => schedule_ice_restart(peer),
                    _ => {}
                }
            })
        }));
    }

    {
        let peer = Arc::clone(peer);
        pc.on_peer_connection_state_change(Box::new(move |state: RTCPeerConnectionState| {
            let peer = Arc::clone(&peer);
            Box::pin(async move {
                info!(peer_id = %peer.id, state = %state, "peer connection state changed");
                if state == RTCPeerConnectionState::Failed {
                    negotiation::request_ice_restart(&peer);
                }
            })
        }));
    }

    {
        let peer = Arc::clone(peer);
        pc.on_ice_candidate(Box::new(move |candidate| {
            let peer = Arc::clone(&peer);
            Box::pin(async move {
                let Some(candidate) = candidate else { return };
                match candidate.to_json() {
                    Ok(init) => peer.write(SignalMessage::Candidate { candidate: init }),
                    Err(err) => {
                        warn!(peer_id = %peer.id, error = %err, "failed to serialize ICE candidate");
                    }
                }
            })
        }));
    }

    {
        let room = Arc::clone(room);
        let peer = Arc::clone(peer);
        pc.on_track(Box::new(move |track, _receiver, _transceiver| {
            let room = Arc::clone(&room);
            let peer = Arc::clone(&peer);
            Box::pin(async move {
                if track.kind() != RTPCodecType::Audio {
                    return;
                }
                info!(
                    peer_id = %peer.id,
                    track_id = %track.id(),
                    "received remote audio track"
                );
                tracks::publish_track(room, peer, track).await;
            })
        }));
    }

    Ok(())
}

/// After `disconnected`, give ICE a grace period before restarting.
fn schedule_ice_restart(peer: Arc<Peer>) {
    tokio::spawn(async move {
        let done = peer.done();
        tokio::select! {
            () = done.cancelled() => return,
            () = tokio::time::sleep(ICE_RESTART_DELAY) => {}
        }
        if let Some(pc) = peer.endpoint() {
            if pc.ice_connection_state() == RTCIceConnectionState::Disconnected {
                negotiation::request_ice_restart(&peer);
            }
        }
    });
}
