//! SFU configuration

use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Core SFU configuration shared by the registry and the signaling layer.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SfuConfig {
    /// Maximum peers admitted to a single room.
    pub max_peers_per_room: usize,
    /// How long a room may stay empty before the reaper removes it.
    pub room_idle_timeout: Duration,
    /// How often the reaper sweeps the room map.
    pub reap_interval: Duration,
    /// STUN server URLs handed to every media endpoint.
    pub stun_servers: Vec<String>,
    /// Optional TURN relay for clients behind restrictive NATs.
    pub turn: Option<TurnConfig>,
}

/// TURN relay credentials.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TurnConfig {
    pub url: String,
    pub username: String,
    pub credential: String,
}

impl Default for SfuConfig {
    fn default() -> Self {
        Self {
            max_peers_per_room: 10,
            room_idle_timeout: Duration::from_secs(2 * 60 * 60),
            reap_interval: Duration::from_secs(60),
            stun_servers: vec!["stun:stun.l.google.com:19302".to_string()],
            turn: None,
        }
    }
}
