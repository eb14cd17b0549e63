//! Server startup and graceful shutdown

use crate::Cli;
use anyhow::{Context, Result};
use sotto_api::{create_router, AppState, EndpointFactory, RtcConfig};
use sotto_sfu::logging::LogRing;
use sotto_sfu::{BanList, RoomRegistry, SfuConfig, TurnConfig};
use std::net::SocketAddr;
use std::sync::Arc;
use tracing::info;

pub async fn run(cli: Cli, log_ring: Arc<LogRing>) -> Result<()> {
    let turn = cli
        .turn_server
        .as_deref()
        .filter(|url| !url.is_empty())
        .map(|url| TurnConfig {
            url: url.to_string(),
            username: cli.turn_user.clone().unwrap_or_default(),
            credential: cli.turn_pass.clone().unwrap_or_default(),
        });

    let sfu_config = SfuConfig {
        turn: turn.clone(),
        ..SfuConfig::default()
    };

    let ban_list = Arc::new(BanList::load(cli.data_dir.join("banned_ips.json")));
    let registry = RoomRegistry::new(sfu_config, ban_list);

    let endpoints = EndpointFactory::new(&RtcConfig {
        udp_port: cli.rtc_udp_port,
        stun_servers: registry.config().stun_servers.clone(),
        turn,
    })
    .await
    .context("failed to initialize WebRTC")?;

    let state = AppState {
        registry,
        endpoints: Arc::new(endpoints),
        log_ring,
        admin_key: cli.admin_key.clone(),
        web_root: "web".into(),
    };
    let router = create_router(state);

    let addr = SocketAddr::from(([0, 0, 0, 0], cli.port));
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .with_context(|| format!("failed to bind {addr}"))?;
    info!(port = cli.port, "sotto server starting");

    // On SIGINT/SIGTERM, drop the server: the listener closes and any
    // remaining peers are torn down with it.
    tokio::select! {
        result = axum::serve(
            listener,
            router.into_make_service_with_connect_info::<SocketAddr>(),
        ) => {
            result.context("server failed")?;
        }
        () = shutdown_signal() => {
            info!("shutting down");
        }
    }

    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        let _ = tokio::signal::ctrl_c().await;
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(_) => std::future::pending::<()>().await,
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => {}
        () = terminate => {}
    }
}
