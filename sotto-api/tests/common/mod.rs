//! Shared helpers for integration tests

use sotto_api::{create_router, AppState, EndpointFactory, RtcConfig};
use sotto_sfu::logging::LogRing;
use sotto_sfu::{BanList, RoomRegistry, SfuConfig};
use std::net::SocketAddr;
use std::sync::Arc;
use tempfile::TempDir;

pub struct TestServer {
    pub addr: SocketAddr,
    pub state: AppState,
    _data_dir: TempDir,
}

/// Start an in-process server on an ephemeral port. Endpoints use
/// ephemeral UDP (no mux) and no STUN; loopback host candidates are
/// enough for tests.
pub async fn spawn_server() -> TestServer {
    let dir = tempfile::tempdir().unwrap();
    let bans = Arc::new(BanList::load(dir.path().join("banned.json")));
    let registry = RoomRegistry::new(SfuConfig::default(), bans);
    let endpoints = Arc::new(
        EndpointFactory::new(&RtcConfig {
            udp_port: 0,
            stun_servers: Vec::new(),
            turn: None,
        })
        .await
        .unwrap(),
    );

    let state = AppState {
        registry,
        endpoints,
        log_ring: Arc::new(LogRing::new(200)),
        admin_key: "test-key".to_string(),
        web_root: dir.path().to_path_buf(),
    };

    let router = create_router(state.clone());
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(
            listener,
            router.into_make_service_with_connect_info::<SocketAddr>(),
        )
        .await
        .unwrap();
    });

    TestServer {
        addr,
        state,
        _data_dir: dir,
    }
}

pub fn ws_url(addr: SocketAddr, room: &str, name: &str) -> String {
    format!("ws://{addr}/ws?room={room}&name={name}")
}
