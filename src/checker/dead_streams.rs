//! Dead stream registry
//!
//! Streams that probe with no usable bitrate are recorded here, keyed by
//! URL rather than name because multiple streams can share a name. A later
//! successful probe revives the stream, and entries whose URL has left the
//! playlist are pruned. The registry is persisted as a JSON file with the
//! same swallow-and-continue policy as the update tracker.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use tracing::{error, info, warn};

use crate::models::StreamId;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeadStreamEntry {
    pub stream_id: StreamId,
    pub stream_name: String,
    pub marked_dead_at: DateTime<Utc>,
}

pub struct DeadStreamTracker {
    entries: Mutex<BTreeMap<String, DeadStreamEntry>>,
    state_file: PathBuf,
}

impl DeadStreamTracker {
    pub fn new(state_file: PathBuf) -> Self {
        let entries = Self::load(&state_file);
        Self {
            entries: Mutex::new(entries),
            state_file,
        }
    }

    fn load(path: &Path) -> BTreeMap<String, DeadStreamEntry> {
        match std::fs::read_to_string(path) {
            Ok(contents) => match serde_json::from_str(&contents) {
                Ok(entries) => entries,
                Err(e) => {
                    warn!(
                        "Could not parse dead streams from {}: {}, starting fresh",
                        path.display(),
                        e
                    );
                    BTreeMap::new()
                }
            },
            Err(_) => BTreeMap::new(),
        }
    }

    fn with_entries<R>(&self, f: impl FnOnce(&mut BTreeMap<String, DeadStreamEntry>) -> R) -> R {
        let mut entries = self
            .entries
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        let result = f(&mut entries);
        if let Err(e) = persist(&self.state_file, &entries) {
            error!(
                "Failed to save dead streams to {}: {}",
                self.state_file.display(),
                e
            );
        }
        result
    }

    pub fn mark_dead(&self, url: &str, stream_id: StreamId, stream_name: &str) {
        if url.is_empty() {
            return;
        }
        self.with_entries(|entries| {
            entries.insert(
                url.to_string(),
                DeadStreamEntry {
                    stream_id,
                    stream_name: stream_name.to_string(),
                    marked_dead_at: Utc::now(),
                },
            );
        });
        warn!("Marked stream as dead: {} ({})", stream_name, url);
    }

    /// Remove a stream from the registry after a successful probe.
    pub fn mark_alive(&self, url: &str) {
        let revived = self.with_entries(|entries| entries.remove(url));
        if let Some(entry) = revived {
            info!("Revived stream: {} ({})", entry.stream_name, url);
        }
    }

    pub fn is_dead(&self, url: &str) -> bool {
        self.entries
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .contains_key(url)
    }

    pub fn dead_streams(&self) -> BTreeMap<String, DeadStreamEntry> {
        self.entries
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone()
    }

    /// Drop entries whose URL is no longer part of the playlist.
    pub fn cleanup_removed_streams(&self, current_urls: &HashSet<String>) -> usize {
        let removed = self.with_entries(|entries| {
            let before = entries.len();
            entries.retain(|url, _| current_urls.contains(url));
            before - entries.len()
        });
        if removed > 0 {
            info!(
                "Cleaned up {} dead stream(s) no longer in playlist",
                removed
            );
        }
        removed
    }
}

fn persist(path: &Path, entries: &BTreeMap<String, DeadStreamEntry>) -> std::io::Result<()> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let contents = serde_json::to_vec_pretty(entries)?;
    std::fs::write(path, contents)?;
    Ok(())
}
