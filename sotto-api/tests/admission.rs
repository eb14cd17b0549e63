//! Admission behavior over the real WebSocket surface: capacity, bans,
//! input validation and the admin endpoint.

mod common;

use axum::body::Body;
use axum::http::{Request, StatusCode};
use common::{spawn_server, ws_url};
use futures::StreamExt;
use sotto_api::create_router;
use std::time::Duration;
use tokio::time::{sleep, timeout};
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::{Error as WsError, Message};
use tokio_tungstenite::connect_async;
use tower::ServiceExt;

#[tokio::test]
async fn test_room_capacity_rejects_eleventh_peer() {
    let server = spawn_server().await;

    let mut admitted = Vec::new();
    for i in 0..10 {
        let (ws, _) = connect_async(ws_url(server.addr, "full-room", &format!("peer{i}")))
            .await
            .unwrap();
        admitted.push(ws);
    }

    let room = server.state.registry.get_or_create("full-room".into());
    for _ in 0..200 {
        if room.peer_count().await == 10 {
            break;
        }
        sleep(Duration::from_millis(10)).await;
    }
    assert_eq!(room.peer_count().await, 10);

    let (mut ws, _) = connect_async(ws_url(server.addr, "full-room", "peer10"))
        .await
        .unwrap();
    let frame = timeout(Duration::from_secs(5), ws.next())
        .await
        .expect("expected an error frame")
        .unwrap()
        .unwrap();
    let value: serde_json::Value = serde_json::from_str(frame.to_text().unwrap()).unwrap();
    assert_eq!(value["type"], "error");
    assert_eq!(value["message"], "Room full");

    // The server closes the channel after the error frame.
    loop {
        match timeout(Duration::from_secs(5), ws.next()).await.unwrap() {
            None | Some(Ok(Message::Close(_))) | Some(Err(_)) => break,
            Some(Ok(_)) => {}
        }
    }

    assert_eq!(room.peer_count().await, 10);
}

#[tokio::test]
async fn test_invalid_room_or_name_is_rejected() {
    let server = spawn_server().await;

    for url in [
        format!("ws://{}/ws?name=alice", server.addr),
        format!("ws://{}/ws?room=r1", server.addr),
        format!("ws://{}/ws?room=r1&name={}", server.addr, "a".repeat(13)),
    ] {
        match connect_async(url).await {
            Err(WsError::Http(response)) => {
                assert_eq!(response.status(), StatusCode::BAD_REQUEST);
            }
            other => panic!("expected 400 rejection, got {other:?}"),
        }
    }
}

#[tokio::test]
async fn test_cross_origin_upgrade_is_rejected() {
    let server = spawn_server().await;

    let mut request = ws_url(server.addr, "r1", "alice").into_client_request().unwrap();
    request
        .headers_mut()
        .insert("origin", "https://evil.example".parse().unwrap());

    match connect_async(request).await {
        Err(WsError::Http(response)) => {
            assert_eq!(response.status(), StatusCode::FORBIDDEN);
        }
        other => panic!("expected 403 rejection, got {other:?}"),
    }
}

#[tokio::test]
async fn test_ban_via_admin_blocks_new_connections() {
    let server = spawn_server().await;

    let router = create_router(server.state.clone());
    let response = router
        .oneshot(
            Request::builder()
                .uri("/admin?key=test-key&action=ban&ip=203.0.113.9")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    assert!(server.state.registry.is_banned("203.0.113.9"));

    // A connection presenting the banned IP through the trusted loopback
    // proxy is refused before upgrade.
    let mut request = ws_url(server.addr, "r1", "mallory").into_client_request().unwrap();
    request
        .headers_mut()
        .insert("x-real-ip", "203.0.113.9".parse().unwrap());
    match connect_async(request).await {
        Err(WsError::Http(response)) => {
            assert_eq!(response.status(), StatusCode::FORBIDDEN);
        }
        other => panic!("expected 403 rejection, got {other:?}"),
    }

    // Other client IPs are unaffected.
    let (ws, _) = connect_async(ws_url(server.addr, "r1", "alice")).await.unwrap();
    drop(ws);
}

#[tokio::test]
async fn test_admin_requires_key() {
    let server = spawn_server().await;

    let router = create_router(server.state.clone());
    let response = router
        .oneshot(
            Request::builder()
                .uri("/admin?action=stats")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
}

#[tokio::test]
async fn test_security_headers_on_http_responses() {
    let server = spawn_server().await;

    let router = create_router(server.state.clone());
    let response = router
        .oneshot(
            Request::builder()
                .uri("/admin?key=test-key&action=stats")
                .header("host", "chat.example.com")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();

    let headers = response.headers();
    assert_eq!(headers["x-content-type-options"], "nosniff");
    assert_eq!(headers["x-frame-options"], "DENY");
    assert_eq!(headers["referrer-policy"], "no-referrer");
    assert_eq!(headers["permissions-policy"], "microphone=(self)");
    let csp = headers["content-security-policy"].to_str().unwrap();
    assert!(csp.contains("connect-src 'self' ws://chat.example.com wss://chat.example.com stun: turn: turns:"));
}
