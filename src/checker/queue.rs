//! Channel check queue
//!
//! A bounded priority queue of channel ids with de-duplication across the
//! whole lifecycle: a channel occupies at most one of {queued, in-progress,
//! completed} at any time, and failed channels are retained with their
//! error until explicitly re-queued. Lower priority values pop first; equal
//! priorities pop in insertion order.
//!
//! State machine: `(absent) -> queued -> in_progress -> {completed | failed}`.
//! `completed -> queued` only happens via an explicit
//! [`CheckQueue::remove_from_completed`] followed by [`CheckQueue::add_channel`].

use chrono::{DateTime, Utc};
use std::cmp::Reverse;
use std::collections::{BinaryHeap, HashMap, HashSet};
use std::sync::Mutex;
use std::time::Duration;
use tokio::sync::Notify;
use tracing::{debug, info, warn};

use crate::models::{ChannelId, QueueStats};

#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord)]
struct QueueEntry {
    priority: u8,
    seq: u64,
    channel_id: ChannelId,
}

#[derive(Debug, Clone)]
pub struct FailedCheck {
    pub error: String,
    pub timestamp: DateTime<Utc>,
}

#[derive(Default)]
struct QueueInner {
    heap: BinaryHeap<Reverse<QueueEntry>>,
    next_seq: u64,
    queued: HashSet<ChannelId>,
    in_progress: HashSet<ChannelId>,
    completed: HashSet<ChannelId>,
    failed: HashMap<ChannelId, FailedCheck>,
    current_channel: Option<ChannelId>,
    total_queued: u64,
    total_completed: u64,
    total_failed: u64,
}

pub struct CheckQueue {
    inner: Mutex<QueueInner>,
    notify: Notify,
    max_size: usize,
}

impl CheckQueue {
    pub fn new(max_size: usize) -> Self {
        Self {
            inner: Mutex::new(QueueInner::default()),
            notify: Notify::new(),
            max_size,
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, QueueInner> {
        self.inner
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Add a channel to the queue. Rejected when the channel already
    /// occupies any lifecycle state or the queue is at capacity.
    pub fn add_channel(&self, channel_id: ChannelId, priority: u8) -> bool {
        let mut inner = self.lock();
        if inner.queued.contains(&channel_id)
            || inner.in_progress.contains(&channel_id)
            || inner.completed.contains(&channel_id)
        {
            return false;
        }
        if inner.heap.len() >= self.max_size {
            warn!("Queue is full, cannot add channel {}", channel_id);
            return false;
        }

        let seq = inner.next_seq;
        inner.next_seq += 1;
        inner.heap.push(Reverse(QueueEntry {
            priority,
            seq,
            channel_id,
        }));
        inner.queued.insert(channel_id);
        // A failed channel being re-queued gets a fresh start.
        inner.failed.remove(&channel_id);
        inner.total_queued += 1;
        debug!("Added channel {} to queue (priority {})", channel_id, priority);
        drop(inner);

        self.notify.notify_one();
        true
    }

    /// Add several channels; returns how many were actually admitted.
    pub fn add_channels(&self, channel_ids: &[ChannelId], priority: u8) -> usize {
        let added = channel_ids
            .iter()
            .filter(|&&id| self.add_channel(id, priority))
            .count();
        info!(
            "Added {}/{} channels to checking queue",
            added,
            channel_ids.len()
        );
        added
    }

    /// Remove a channel from the completed set so it can be re-queued.
    ///
    /// Needed when new streams arrive for a channel that already finished a
    /// check cycle.
    pub fn remove_from_completed(&self, channel_id: ChannelId) -> bool {
        let mut inner = self.lock();
        let removed = inner.completed.remove(&channel_id);
        if removed {
            debug!("Removed channel {} from completed set", channel_id);
        }
        removed
    }

    /// Pop the next channel, waiting up to `timeout` for one to arrive.
    /// Moves the channel from queued to in-progress.
    pub async fn get_next_channel(&self, timeout: Duration) -> Option<ChannelId> {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            // Register for wakeups before checking, so an add between the
            // check and the wait is not lost.
            let notified = self.notify.notified();
            if let Some(channel_id) = self.try_pop() {
                return Some(channel_id);
            }
            if tokio::time::timeout_at(deadline, notified).await.is_err() {
                return self.try_pop();
            }
        }
    }

    fn try_pop(&self) -> Option<ChannelId> {
        let mut inner = self.lock();
        let Reverse(entry) = inner.heap.pop()?;
        let channel_id = entry.channel_id;
        inner.queued.remove(&channel_id);
        inner.in_progress.insert(channel_id);
        inner.current_channel = Some(channel_id);
        Some(channel_id)
    }

    /// Terminal transition: the check finished.
    pub fn mark_completed(&self, channel_id: ChannelId) {
        let mut inner = self.lock();
        inner.in_progress.remove(&channel_id);
        inner.completed.insert(channel_id);
        inner.total_completed += 1;
        if inner.current_channel == Some(channel_id) {
            inner.current_channel = None;
        }
        debug!("Marked channel {} as completed", channel_id);
    }

    /// Terminal transition: the check failed. The error is retained for
    /// inspection; the queue itself never retries failed channels.
    pub fn mark_failed(&self, channel_id: ChannelId, error: String) {
        let mut inner = self.lock();
        inner.in_progress.remove(&channel_id);
        warn!("Marked channel {} as failed: {}", channel_id, error);
        inner.failed.insert(
            channel_id,
            FailedCheck {
                error,
                timestamp: Utc::now(),
            },
        );
        inner.total_failed += 1;
        if inner.current_channel == Some(channel_id) {
            inner.current_channel = None;
        }
    }

    pub fn failure_for(&self, channel_id: ChannelId) -> Option<FailedCheck> {
        self.lock().failed.get(&channel_id).cloned()
    }

    pub fn status(&self) -> QueueStats {
        let inner = self.lock();
        QueueStats {
            queue_size: inner.heap.len(),
            queued: inner.queued.len(),
            in_progress: inner.in_progress.len(),
            completed: inner.completed.len(),
            failed: inner.failed.len(),
            current_channel: inner.current_channel,
            total_queued: inner.total_queued,
            total_completed: inner.total_completed,
            total_failed: inner.total_failed,
        }
    }

    /// Drop all queued work and lifecycle state.
    pub fn clear(&self) {
        let mut inner = self.lock();
        *inner = QueueInner::default();
        info!("Queue cleared");
    }
}
