//! Room registry and background reaper

use crate::ban::BanList;
use crate::config::SfuConfig;
use crate::room::Room;
use crate::types::RoomId;
use dashmap::DashMap;
use std::sync::Arc;
use tokio::time::interval;
use tracing::{debug, info};

/// Top-level registry: the room map, the ban list, and the reaper that
/// evicts rooms left empty past the idle threshold.
pub struct RoomRegistry {
    config: Arc<SfuConfig>,
    rooms: DashMap<RoomId, Arc<Room>>,
    ban_list: Arc<BanList>,
}

impl RoomRegistry {
    /// Create the registry and start its background reaper.
    pub fn new(config: SfuConfig, ban_list: Arc<BanList>) -> Arc<Self> {
        let registry = Arc::new(Self {
            config: Arc::new(config),
            rooms: DashMap::new(),
            ban_list,
        });

        info!(
            max_peers_per_room = registry.config.max_peers_per_room,
            room_idle_timeout_secs = registry.config.room_idle_timeout.as_secs(),
            "room registry initialized"
        );

        let reaper = Arc::clone(&registry);
        tokio::spawn(async move {
            reaper.reaper_task().await;
        });

        registry
    }

    pub fn config(&self) -> &Arc<SfuConfig> {
        &self.config
    }

    /// Return the existing room or atomically create a fresh one.
    pub fn get_or_create(&self, room_id: RoomId) -> Arc<Room> {
        self.rooms
            .entry(room_id.clone())
            .or_insert_with(|| {
                info!(event = "ROOM_CREATE", room_id = %room_id, "room created");
                Arc::new(Room::new(room_id.clone(), self.config.max_peers_per_room))
            })
            .clone()
    }

    pub fn get(&self, room_id: &RoomId) -> Option<Arc<Room>> {
        self.rooms.get(room_id).map(|entry| entry.value().clone())
    }

    pub fn room_count(&self) -> usize {
        self.rooms.len()
    }

    /// Total peers across all rooms; rooms are snapshotted first so no
    /// registry lock is held while counting.
    pub async fn total_peers(&self) -> usize {
        let rooms: Vec<Arc<Room>> = self
            .rooms
            .iter()
            .map(|entry| entry.value().clone())
            .collect();
        let mut total = 0;
        for room in rooms {
            total += room.peer_count().await;
        }
        total
    }

    pub fn is_banned(&self, ip: &str) -> bool {
        self.ban_list.is_banned(ip)
    }

    pub fn ban(&self, ip: &str) {
        self.ban_list.ban(ip);
    }

    /// One reaper sweep: remove every room that has been empty for
    /// longer than the idle threshold.
    pub async fn reap_idle_rooms(&self) {
        let rooms: Vec<(RoomId, Arc<Room>)> = self
            .rooms
            .iter()
            .map(|entry| (entry.key().clone(), entry.value().clone()))
            .collect();

        for (room_id, room) in rooms {
            if room.is_reapable(self.config.room_idle_timeout).await {
                self.rooms.remove(&room_id);
                info!(
                    event = "ROOM_DESTROY",
                    room_id = %room_id,
                    reason = "expired",
                    "room destroyed"
                );
            }
        }
    }

    async fn reaper_task(self: Arc<Self>) {
        let mut ticker = interval(self.config.reap_interval);
        debug!(
            interval_secs = self.config.reap_interval.as_secs(),
            "room reaper started"
        );
        loop {
            ticker.tick().await;
            self.reap_idle_rooms().await;
        }
    }
}
