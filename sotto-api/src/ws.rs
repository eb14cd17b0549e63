//! WebSocket signaling handler
//!
//! One task per direction: the read loop owns admission follow-up and
//! message dispatch, a writer task drains the peer's outbound channel
//! (serializing all frames), and a ping task keeps the connection alive.
//! Teardown runs on every exit path once the peer has been registered.

use crate::middleware::{check_origin, client_ip, normalize_nickname};
use crate::rtc::setup_endpoint;
use crate::{negotiation, tracks, AppError, AppResult, AppState};
use axum::{
    extract::{
        ws::{Message, WebSocket, WebSocketUpgrade},
        ConnectInfo, Query, State,
    },
    http::HeaderMap,
    response::IntoResponse,
};
use futures::stream::{SplitSink, SplitStream};
use futures::{SinkExt, StreamExt};
use serde::Deserialize;
use sotto_sfu::{Peer, Room, RoomId, SignalFrame, SignalMessage};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

/// Transport ping interval.
const WS_PING_INTERVAL: Duration = Duration::from_secs(30);
/// Read deadline; extended by any inbound frame, pongs included.
const WS_READ_TIMEOUT: Duration = Duration::from_secs(60);

#[derive(Debug, Deserialize)]
pub struct WsQuery {
    #[serde(default)]
    pub room: String,
    #[serde(default)]
    pub name: String,
}

pub async fn ws_handler(
    State(state): State<AppState>,
    Query(query): Query<WsQuery>,
    ConnectInfo(remote): ConnectInfo<SocketAddr>,
    headers: HeaderMap,
    ws: WebSocketUpgrade,
) -> AppResult<impl IntoResponse> {
    let room = query.room.trim().to_string();
    let name = match normalize_nickname(&query.name) {
        Ok(name) if !room.is_empty() => name,
        _ => return Err(AppError::bad_request("Invalid room or name")),
    };
    let ip = client_ip(&headers, remote);
    if state.registry.is_banned(&ip) {
        return Err(AppError::forbidden("Banned"));
    }
    if !check_origin(&headers) {
        return Err(AppError::forbidden("Origin not allowed"));
    }

    let room_id = RoomId::from(room);
    Ok(ws.on_upgrade(move |socket| handle_socket(socket, state, room_id, name, ip)))
}

async fn handle_socket(
    socket: WebSocket,
    state: AppState,
    room_id: RoomId,
    name: String,
    ip: String,
) {
    let (ws_sink, ws_stream) = socket.split();
    let (tx, rx) = mpsc::unbounded_channel();
    let peer = Arc::new(Peer::new(name, ip, tx));
    tokio::spawn(write_loop(ws_sink, rx));

    let room = state.registry.get_or_create(room_id);

    if room.add_peer(Arc::clone(&peer)).await.is_err() {
        peer.write(SignalMessage::Error {
            message: "Room full".to_string(),
        });
        return;
    }

    info!(
        event = "USER_JOIN",
        room_id = %room.id(),
        peer_id = %peer.id,
        ip = %peer.ip,
        name = %peer.name,
        "peer joined"
    );

    run_session(&state, &room, &peer, ws_stream).await;
    teardown(&room, &peer).await;
}

/// Everything between admission and teardown; early returns here still
/// fall through to teardown in the caller.
async fn run_session(
    state: &AppState,
    room: &Arc<Room>,
    peer: &Arc<Peer>,
    mut ws_stream: SplitStream<WebSocket>,
) {
    // First frame: the room state, then announce the newcomer to others.
    peer.write(SignalMessage::RoomState {
        self_id: peer.id.clone(),
        peers: room.peer_infos().await,
    });
    room.broadcast(
        &peer.id,
        &SignalMessage::PeerJoin { peer: peer.info() },
    )
    .await;

    tokio::spawn(ping_loop(Arc::clone(peer)));

    if let Err(err) = setup_endpoint(&state.endpoints, room, peer).await {
        warn!(peer_id = %peer.id, error = %err, "WebRTC setup failed");
        peer.write(SignalMessage::Error {
            message: "WebRTC setup failed".to_string(),
        });
        return;
    }

    tracks::attach_existing_forwarders(room, peer).await;

    let done = peer.done();
    loop {
        let msg = tokio::select! {
            () = done.cancelled() => break,
            res = tokio::time::timeout(WS_READ_TIMEOUT, ws_stream.next()) => match res {
                Err(_) => {
                    debug!(peer_id = %peer.id, "read deadline expired");
                    break;
                }
                Ok(None) | Ok(Some(Err(_))) => break,
                Ok(Some(Ok(msg))) => msg,
            },
        };

        match msg {
            Message::Text(text) => {
                // Malformed or unknown frames are dropped silently.
                let Ok(parsed) = serde_json::from_str::<SignalMessage>(&text) else {
                    continue;
                };
                dispatch_signal(peer, parsed).await;
            }
            Message::Close(_) => break,
            // Pongs (and any other control traffic) only serve to extend
            // the read deadline.
            Message::Ping(_) | Message::Pong(_) | Message::Binary(_) => {}
        }
    }
}

async fn dispatch_signal(peer: &Arc<Peer>, msg: SignalMessage) {
    let Some(pc) = peer.endpoint().cloned() else {
        return;
    };
    match msg {
        SignalMessage::Offer { sdp } => negotiation::handle_offer(peer, &pc, sdp).await,
        SignalMessage::Answer { sdp } => negotiation::handle_answer(peer, &pc, sdp).await,
        SignalMessage::Candidate { candidate } => {
            negotiation::handle_candidate(peer, &pc, candidate).await;
        }
        _ => {}
    }
}

/// Release everything the peer holds; runs exactly once per admitted
/// peer, on every exit path.
async fn teardown(room: &Arc<Room>, peer: &Arc<Peer>) {
    peer.signal_done();

    for forwarder in room.forwarders_snapshot().await {
        forwarder.unsubscribe(&peer.id);
    }
    if let Some(forwarder) = room.take_forwarder(&peer.id).await {
        forwarder.stop();
    }

    room.remove_peer(&peer.id).await;

    if let Some(pc) = peer.endpoint() {
        if let Err(err) = pc.close().await {
            debug!(peer_id = %peer.id, error = %err, "endpoint close failed");
        }
    }

    info!(
        event = "USER_LEAVE",
        room_id = %room.id(),
        peer_id = %peer.id,
        "peer left"
    );
    room.broadcast(
        &peer.id,
        &SignalMessage::PeerLeave {
            peer_id: peer.id.clone(),
        },
    )
    .await;
}

/// Drain the peer's outbound channel into the socket. Exits when the
/// channel closes or a send fails; a failed send surfaces as a closed
/// channel to subsequent writes and pings.
async fn write_loop(
    mut sink: SplitSink<WebSocket, Message>,
    mut rx: mpsc::UnboundedReceiver<SignalFrame>,
) {
    while let Some(frame) = rx.recv().await {
        let msg = match frame {
            SignalFrame::Message(msg) => match serde_json::to_string(&msg) {
                Ok(text) => Message::Text(text),
                Err(err) => {
                    warn!(error = %err, "failed to encode signaling frame");
                    continue;
                }
            },
            SignalFrame::Ping => Message::Ping(Vec::new()),
        };
        if sink.send(msg).await.is_err() {
            break;
        }
    }
    let _ = sink.close().await;
}

async fn ping_loop(peer: Arc<Peer>) {
    let done = peer.done();
    let mut ticker = tokio::time::interval(WS_PING_INTERVAL);
    ticker.tick().await;
    loop {
        tokio::select! {
            () = done.cancelled() => return,
            _ = ticker.tick() => {
                if !peer.send_ping() {
                    warn!(peer_id = %peer.id, "ping failed: channel closed");
                    peer.signal_done();
                    return;
                }
            }
        }
    }
}
