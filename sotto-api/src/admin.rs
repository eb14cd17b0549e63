//! Admin endpoint: stats, recent logs, and IP bans
//!
//! Everything hangs off `GET /admin?key={K}` with an `action` selector,
//! guarded by the shared admin key.

use crate::{AppError, AppResult, AppState};
use axum::{
    extract::{Query, State},
    response::{Html, IntoResponse, Response},
    Json,
};
use serde::Deserialize;
use serde_json::json;

/// How many recent log lines the `logs` action returns.
const ADMIN_LOG_LIMIT: usize = 100;

#[derive(Debug, Default, Deserialize)]
pub struct AdminQuery {
    #[serde(default)]
    key: Option<String>,
    #[serde(default)]
    action: Option<String>,
    #[serde(default)]
    ip: Option<String>,
}

pub async fn admin_handler(
    State(state): State<AppState>,
    Query(query): Query<AdminQuery>,
) -> AppResult<Response> {
    match query.key.as_deref() {
        Some(key) if !key.is_empty() && key == state.admin_key => {}
        _ => return Err(AppError::unauthorized("Unauthorized")),
    }

    match query.action.as_deref() {
        Some("stats") => Ok(stats(&state).await.into_response()),
        Some("logs") => Ok(Json(state.log_ring.recent(ADMIN_LOG_LIMIT)).into_response()),
        Some("ban") => {
            match query.ip.as_deref().map(str::trim).filter(|ip| !ip.is_empty()) {
                Some(ip) => {
                    state.registry.ban(ip);
                    Ok(format!("Banned {ip}").into_response())
                }
                None => Ok(().into_response()),
            }
        }
        _ => Ok(Html(ADMIN_PAGE).into_response()),
    }
}

async fn stats(state: &AppState) -> Json<serde_json::Value> {
    let rooms = state.registry.room_count();
    let users = state.registry.total_peers().await;
    let metrics = tokio::runtime::Handle::current().metrics();
    Json(json!({
        "rooms": rooms,
        "users": users,
        "memory_alloc_mb": resident_memory_mb().unwrap_or(0),
        "tasks": metrics.num_alive_tasks(),
    }))
}

/// Resident set size in MiB, best effort.
fn resident_memory_mb() -> Option<u64> {
    #[cfg(target_os = "linux")]
    {
        let statm = std::fs::read_to_string("/proc/self/statm").ok()?;
        let resident_pages: u64 = statm.split_whitespace().nth(1)?.parse().ok()?;
        Some(resident_pages * 4096 / (1024 * 1024))
    }
    #[cfg(not(target_os = "linux"))]
    {
        None
    }
}

/// Compact embedded admin page; good enough for a shared-secret panel.
const ADMIN_PAGE: &str = r#"<!doctype html>
<html>
<head><title>sotto admin</title><style>body{font-family:sans-serif;background:#222;color:#eee;padding:20px;}</style></head>
<body>
    <h1>sotto stats</h1>
    <div id="stats">Loading...</div>
    <h2>Recent logs</h2>
    <pre id="logs" style="background:#000;padding:10px;overflow:auto;max-height:400px;"></pre>
    <input id="banIp" placeholder="IP to ban"><button onclick="ban()">Ban</button>
    <script>
        const key = new URLSearchParams(window.location.search).get('key');
        fetch('/admin?action=stats&key='+key).then(r=>r.json()).then(d=>{
            document.getElementById('stats').innerText = JSON.stringify(d, null, 2);
        });
        fetch('/admin?action=logs&key='+key).then(r=>r.json()).then(d=>{
            document.getElementById('logs').innerText = d.join('\n');
        });
        function ban() {
            const ip = document.getElementById('banIp').value;
            fetch('/admin?action=ban&ip='+ip+'&key='+key).then(()=>location.reload());
        }
    </script>
</body>
</html>
"#;

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rtc::{EndpointFactory, RtcConfig};
    use sotto_sfu::logging::LogRing;
    use sotto_sfu::{BanList, RoomRegistry, SfuConfig};
    use std::sync::Arc;
    use tempfile::TempDir;

    async fn test_state() -> (AppState, TempDir) {
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
        (
            AppState {
                registry,
                endpoints,
                log_ring: Arc::new(LogRing::new(200)),
                admin_key: "test-key".to_string(),
                web_root: "web".into(),
            },
            dir,
        )
    }

    #[tokio::test]
    async fn test_admin_requires_key() {
        let (state, _dir) = test_state().await;

        let result = admin_handler(State(state.clone()), Query(AdminQuery::default())).await;
        assert!(result.is_err());

        let result = admin_handler(
            State(state),
            Query(AdminQuery {
                key: Some("wrong".to_string()),
                ..Default::default()
            }),
        )
        .await;
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn test_ban_action_updates_registry() {
        let (state, _dir) = test_state().await;

        let response = admin_handler(
            State(state.clone()),
            Query(AdminQuery {
                key: Some("test-key".to_string()),
                action: Some("ban".to_string()),
                ip: Some("203.0.113.9".to_string()),
            }),
        )
        .await
        .unwrap();

        assert!(response.status().is_success());
        assert!(state.registry.is_banned("203.0.113.9"));
    }

    #[tokio::test]
    async fn test_stats_shape() {
        let (state, _dir) = test_state().await;
        state.registry.get_or_create("r1".into());

        let response = stats(&state).await;
        assert_eq!(response.0["rooms"], 1);
        assert_eq!(response.0["users"], 0);
        assert!(response.0.get("memory_alloc_mb").is_some());
        assert!(response.0.get("tasks").is_some());
    }
}
