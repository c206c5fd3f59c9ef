//! Durable channel update tracking
//!
//! Records which channels received playlist updates and still need a
//! quality check, which streams were already evaluated, force-check
//! overrides and the timestamp of the last global sweep. State is held
//! under a single mutex and rewritten to a JSON file (with fsync) on every
//! mutation so it survives a process restart; persistence failures are
//! logged and swallowed, leaving the in-memory state authoritative for the
//! rest of the process lifetime.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use tracing::{debug, error, info, warn};

use crate::models::{ChannelId, StreamId, UpdateRecord};

#[derive(Debug, Default, Serialize, Deserialize)]
struct TrackerState {
    #[serde(default)]
    channels: BTreeMap<ChannelId, UpdateRecord>,
    #[serde(default)]
    last_global_check: Option<DateTime<Utc>>,
}

pub struct ChannelUpdateTracker {
    state: Mutex<TrackerState>,
    state_file: PathBuf,
}

impl ChannelUpdateTracker {
    /// Load existing state from `state_file`, falling back to empty state
    /// when the file is missing or unreadable.
    pub fn new(state_file: PathBuf) -> Self {
        let state = Self::load(&state_file);
        let tracker = Self {
            state: Mutex::new(state),
            state_file,
        };
        // Make sure the file exists from the start.
        tracker.with_state(|_| {});
        tracker
    }

    fn load(path: &Path) -> TrackerState {
        match std::fs::read_to_string(path) {
            Ok(contents) => match serde_json::from_str(&contents) {
                Ok(state) => state,
                Err(e) => {
                    warn!(
                        "Could not parse tracker state from {}: {}, starting fresh",
                        path.display(),
                        e
                    );
                    TrackerState::default()
                }
            },
            Err(_) => TrackerState::default(),
        }
    }

    /// Run a mutation under the lock, then persist. I/O failures are
    /// logged; tracking continues in memory.
    fn with_state<R>(&self, f: impl FnOnce(&mut TrackerState) -> R) -> R {
        let mut state = self
            .state
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        let result = f(&mut state);
        if let Err(e) = persist(&self.state_file, &state) {
            error!(
                "Failed to save tracker state to {}: {}",
                self.state_file.display(),
                e
            );
        }
        result
    }

    fn read_state<R>(&self, f: impl FnOnce(&TrackerState) -> R) -> R {
        let state = self
            .state
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        f(&state)
    }

    /// Mark channels as having received an update; they need a check.
    /// Existing `checked_stream_ids` are preserved so unchanged streams can
    /// reuse their cached stats.
    pub fn mark_channels_updated(
        &self,
        channel_ids: &[ChannelId],
        stream_counts: Option<&HashMap<ChannelId, usize>>,
    ) {
        if channel_ids.is_empty() {
            return;
        }
        let now = Utc::now();
        self.with_state(|state| {
            for &channel_id in channel_ids {
                let record = state.channels.entry(channel_id).or_default();
                record.last_update = Some(now);
                record.needs_check = true;
                if let Some(count) = stream_counts.and_then(|c| c.get(&channel_id)) {
                    record.stream_count = Some(*count);
                }
            }
        });
        info!("Marked {} channels as updated", channel_ids.len());
    }

    /// Channels currently flagged as needing a check. Read-only; queueing
    /// paths must use [`Self::get_and_clear_channels_needing_check`] to
    /// avoid double-enqueue races.
    pub fn channels_needing_check(&self) -> Vec<ChannelId> {
        self.read_state(|state| {
            state
                .channels
                .iter()
                .filter(|(_, record)| record.needs_check)
                .map(|(&id, _)| id)
                .collect()
        })
    }

    /// Atomically collect channels needing a check and clear their flag.
    ///
    /// This is the core correctness property: a playlist refresh racing
    /// with the scheduler can neither double-queue a channel nor lose one.
    pub fn get_and_clear_channels_needing_check(
        &self,
        max_channels: Option<usize>,
    ) -> Vec<ChannelId> {
        let now = Utc::now();
        self.with_state(|state| {
            let mut channels = Vec::new();
            for (&id, record) in state.channels.iter_mut() {
                if !record.needs_check {
                    continue;
                }
                record.needs_check = false;
                record.queued_at = Some(now);
                channels.push(id);
                if let Some(max) = max_channels {
                    if channels.len() >= max {
                        break;
                    }
                }
            }
            if !channels.is_empty() {
                debug!(
                    "Atomically retrieved and cleared {} channels needing check",
                    channels.len()
                );
            }
            channels
        })
    }

    /// Record a finished check: clears `needs_check`, stamps `last_check`
    /// and replaces the set of evaluated stream ids.
    pub fn mark_channel_checked(
        &self,
        channel_id: ChannelId,
        stream_count: usize,
        checked_stream_ids: BTreeSet<StreamId>,
    ) {
        let now = Utc::now();
        self.with_state(|state| {
            let record = state.channels.entry(channel_id).or_default();
            record.needs_check = false;
            record.last_check = Some(now);
            record.stream_count = Some(stream_count);
            record.checked_stream_ids = checked_stream_ids;
        });
    }

    /// Stream ids already evaluated for a channel; these skip re-probing
    /// unless a force check is pending.
    pub fn checked_stream_ids(&self, channel_id: ChannelId) -> BTreeSet<StreamId> {
        self.read_state(|state| {
            state
                .channels
                .get(&channel_id)
                .map(|record| record.checked_stream_ids.clone())
                .unwrap_or_default()
        })
    }

    /// Flag a channel so its next check bypasses the checked-stream cache
    /// and any immunity window.
    pub fn mark_channel_for_force_check(&self, channel_id: ChannelId) {
        self.with_state(|state| {
            state.channels.entry(channel_id).or_default().force_check = true;
        });
    }

    pub fn should_force_check(&self, channel_id: ChannelId) -> bool {
        self.read_state(|state| {
            state
                .channels
                .get(&channel_id)
                .map(|record| record.force_check)
                .unwrap_or(false)
        })
    }

    pub fn clear_force_check(&self, channel_id: ChannelId) {
        self.with_state(|state| {
            if let Some(record) = state.channels.get_mut(&channel_id) {
                record.force_check = false;
            }
        });
    }

    /// Record that a global sweep was initiated. Only the timestamp moves;
    /// per-channel `needs_check` flags are untouched; those are cleared
    /// when channels are actually checked.
    pub fn mark_global_check(&self) {
        let now = Utc::now();
        self.with_state(|state| {
            state.last_global_check = Some(now);
        });
    }

    pub fn last_global_check(&self) -> Option<DateTime<Utc>> {
        self.read_state(|state| state.last_global_check)
    }
}

/// Write the full state file and flush it to disk.
fn persist(path: &Path, state: &TrackerState) -> std::io::Result<()> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let contents = serde_json::to_vec_pretty(state)?;
    let mut file = std::fs::File::create(path)?;
    file.write_all(&contents)?;
    file.sync_all()?;
    Ok(())
}
