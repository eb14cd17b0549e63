//! HTTP and WebSocket surface for the sotto SFU
//!
//! Routes:
//! - `GET /ws?room={id}&name={nick}`: the signaling channel
//! - `GET /admin?key={K}`: stats, logs, bans
//! - `GET /static/...`, `/`, `/r/{id}`: client bundle and entry page
//!
//! Security headers (CSP included) are applied to every non-WS response.

pub mod admin;
pub mod error;
pub mod middleware;
pub mod negotiation;
pub mod rtc;
pub mod tracks;
pub mod ws;

pub use error::{AppError, AppResult};
pub use rtc::{EndpointFactory, RtcConfig};

use axum::{
    extract::State,
    http::header,
    response::{Html, IntoResponse, Response},
    routing::get,
    Router,
};
use serde_json::json;
use sotto_sfu::logging::LogRing;
use sotto_sfu::RoomRegistry;
use std::path::PathBuf;
use std::sync::Arc;
use tower_http::{services::ServeDir, trace::TraceLayer};
use tracing::error;

/// Shared application state
#[derive(Clone)]
pub struct AppState {
    pub registry: Arc<RoomRegistry>,
    pub endpoints: Arc<EndpointFactory>,
    pub log_ring: Arc<LogRing>,
    pub admin_key: String,
    /// Directory holding the client bundle (`static/`, `templates/`).
    pub web_root: PathBuf,
}

/// Create the HTTP router with all routes
pub fn create_router(state: AppState) -> Router {
    let static_dir = state.web_root.join("static");

    let pages = Router::new()
        .route("/admin", get(admin::admin_handler))
        .route("/static/js/config.js", get(ice_config_js))
        .nest_service("/static", ServeDir::new(static_dir))
        .route("/", get(index))
        .route("/r/:room_id", get(index))
        .layer(axum::middleware::from_fn(middleware::security_headers));

    Router::new()
        .route("/ws", get(ws::ws_handler))
        .merge(pages)
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// Serve the client entry document for `/` and `/r/{id}`.
async fn index(State(state): State<AppState>) -> Response {
    let path = state.web_root.join("templates/index.html");
    match tokio::fs::read_to_string(&path).await {
        Ok(body) => Html(body).into_response(),
        Err(err) => {
            error!(path = %path.display(), error = %err, "failed to read index template");
            AppError::internal_server_error("Internal Server Error").into_response()
        }
    }
}

/// Generated ICE configuration consumed by the browser client.
async fn ice_config_js(State(state): State<AppState>) -> impl IntoResponse {
    let config = state.registry.config();
    let mut servers = vec![json!({ "urls": config.stun_servers })];
    if let Some(turn) = &config.turn {
        servers.push(json!({
            "urls": [turn.url],
            "username": turn.username,
            "credential": turn.credential,
        }));
    }
    let body = format!("window.ICE_CONFIG={};", json!({ "iceServers": servers }));
    (
        [
            (header::CONTENT_TYPE, "application/javascript"),
            (header::CACHE_CONTROL, "no-cache, no-store, must-revalidate"),
        ],
        body,
    )
}
