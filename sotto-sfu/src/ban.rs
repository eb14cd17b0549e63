//! Durable ban list
//!
//! Banned client IPs are kept in memory and written through to a JSON
//! file shaped as `{"203.0.113.9": true}`. A missing file at startup is
//! fine; a failed write is logged and the in-memory state is retained.

use parking_lot::RwLock;
use std::collections::{BTreeMap, HashSet};
use std::path::{Path, PathBuf};
use tracing::{error, info, warn};

pub struct BanList {
    path: PathBuf,
    banned: RwLock<HashSet<String>>,
}

impl BanList {
    /// Load the ban list from `path`, tolerating a missing file.
    pub fn load(path: impl Into<PathBuf>) -> Self {
        let path = path.into();
        let banned = match std::fs::read(&path) {
            Ok(data) => match serde_json::from_slice::<BTreeMap<String, bool>>(&data) {
                Ok(map) => map
                    .into_iter()
                    .filter_map(|(ip, banned)| banned.then_some(ip))
                    .collect(),
                Err(err) => {
                    error!(path = %path.display(), error = %err, "Failed to parse ban list");
                    HashSet::new()
                }
            },
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => HashSet::new(),
            Err(err) => {
                warn!(path = %path.display(), error = %err, "Failed to read ban list");
                HashSet::new()
            }
        };
        Self {
            path,
            banned: RwLock::new(banned),
        }
    }

    pub fn is_banned(&self, ip: &str) -> bool {
        self.banned.read().contains(ip)
    }

    /// Insert `ip` and write the list through to disk. The in-memory
    /// insert stands even when persisting fails.
    pub fn ban(&self, ip: &str) {
        let snapshot = {
            let mut banned = self.banned.write();
            banned.insert(ip.to_string());
            banned.clone()
        };
        if let Err(err) = persist(&self.path, &snapshot) {
            error!(path = %self.path.display(), error = %err, "Failed to save ban list");
        }
        info!(event = "ADMIN_BAN", ip = %ip, "banned ip");
    }

    pub fn len(&self) -> usize {
        self.banned.read().len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.banned.read().is_empty()
    }
}

fn persist(path: &Path, banned: &HashSet<String>) -> anyhow::Result<()> {
    let map: BTreeMap<&str, bool> = banned.iter().map(|ip| (ip.as_str(), true)).collect();
    let data = serde_json::to_vec(&map)?;
    std::fs::write(path, data)?;
    Ok(())
}
