//! Stream checker service
//!
//! The engine behind channel quality maintenance: a worker loop drains the
//! check queue and runs per-channel checks, while a scheduler loop reacts
//! to playlist-update triggers and evaluates the off-peak global sweep
//! schedule. Both loops are self-healing; a failing channel is recorded and
//! the loops keep running.

pub mod dead_streams;
pub mod queue;
pub mod tracker;

use chrono::{DateTime, Datelike, Local, TimeZone};
use std::collections::{BTreeSet, HashMap, HashSet};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::api_client::MediaProxyApi;
use crate::config::{
    Config, ConfigPatch, GlobalScheduleConfig, ScheduleFrequency, StreamAnalysisConfig,
};
use crate::errors::AppResult;
use crate::models::{
    Channel, ChannelId, ScoredStream, ServiceStatus, Stream, StreamId, StreamStats,
};
use crate::probe::throttle::{provider_for_url, ProviderThrottle};
use crate::probe::StreamProber;
use crate::scoring::{sort_by_score, Scorer};

use dead_streams::DeadStreamTracker;
use queue::CheckQueue;
use tracker::ChannelUpdateTracker;

/// Queue priority for the scheduled global sweep; pops before updates.
pub const PRIORITY_GLOBAL_SWEEP: u8 = 5;
/// Queue priority for update-triggered and manually queued channels.
pub const PRIORITY_UPDATE: u8 = 10;

const QUEUE_POP_TIMEOUT: Duration = Duration::from_secs(1);
const STOP_JOIN_TIMEOUT: Duration = Duration::from_secs(5);

pub struct StreamChecker {
    config: RwLock<Config>,
    config_path: PathBuf,
    api: Arc<dyn MediaProxyApi>,
    prober: Arc<dyn StreamProber>,
    tracker: ChannelUpdateTracker,
    dead_streams: DeadStreamTracker,
    queue: CheckQueue,
    throttle: ProviderThrottle,
    /// Coalesced "wake up now" signal for the scheduler loop.
    trigger: Notify,
    running: AtomicBool,
    checking: AtomicBool,
    config_changed: AtomicBool,
    global_action_in_progress: AtomicBool,
    cancel: Mutex<Option<CancellationToken>>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl StreamChecker {
    pub fn new(
        config: Config,
        config_path: PathBuf,
        api: Arc<dyn MediaProxyApi>,
        prober: Arc<dyn StreamProber>,
    ) -> Self {
        let state_dir = config.storage.state_dir.clone();
        let queue = CheckQueue::new(config.checker.queue.max_size);
        let service = Self {
            config: RwLock::new(config),
            config_path,
            api,
            prober,
            tracker: ChannelUpdateTracker::new(state_dir.join("channel_updates.json")),
            dead_streams: DeadStreamTracker::new(state_dir.join("dead_streams.json")),
            queue,
            throttle: ProviderThrottle::new(),
            trigger: Notify::new(),
            running: AtomicBool::new(false),
            checking: AtomicBool::new(false),
            config_changed: AtomicBool::new(false),
            global_action_in_progress: AtomicBool::new(false),
            cancel: Mutex::new(None),
            tasks: Mutex::new(Vec::new()),
        };
        info!("Stream checker service initialized");
        service
    }

    fn config_snapshot(&self) -> Config {
        self.config
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone()
    }

    /// Spawn the worker and scheduler loops.
    pub fn start(self: &Arc<Self>) {
        if self.running.swap(true, Ordering::SeqCst) {
            warn!("Stream checker service is already running");
            return;
        }

        let token = CancellationToken::new();
        {
            let mut cancel = self
                .cancel
                .lock()
                .unwrap_or_else(|poisoned| poisoned.into_inner());
            *cancel = Some(token.clone());
        }

        let worker = {
            let service = Arc::clone(self);
            let token = token.clone();
            tokio::spawn(async move { service.worker_loop(token).await })
        };
        let scheduler = {
            let service = Arc::clone(self);
            tokio::spawn(async move { service.scheduler_loop(token).await })
        };
        {
            let mut tasks = self
                .tasks
                .lock()
                .unwrap_or_else(|poisoned| poisoned.into_inner());
            tasks.push(worker);
            tasks.push(scheduler);
        }
        info!("Stream checker service started");
    }

    /// Signal both loops to stop and wait for them with a bounded timeout.
    /// An in-flight probe is not killed; the worker finishes its current
    /// channel before observing the stop signal.
    pub async fn stop(&self) {
        if !self.running.swap(false, Ordering::SeqCst) {
            warn!("Stream checker service is not running");
            return;
        }
        info!("Stream checker service stopping");

        let token = {
            let mut cancel = self
                .cancel
                .lock()
                .unwrap_or_else(|poisoned| poisoned.into_inner());
            cancel.take()
        };
        if let Some(token) = token {
            token.cancel();
        }

        let handles: Vec<JoinHandle<()>> = {
            let mut tasks = self
                .tasks
                .lock()
                .unwrap_or_else(|poisoned| poisoned.into_inner());
            tasks.drain(..).collect()
        };
        for handle in handles {
            if tokio::time::timeout(STOP_JOIN_TIMEOUT, handle).await.is_err() {
                warn!("Service loop did not stop within {:?}", STOP_JOIN_TIMEOUT);
            }
        }
        info!("Stream checker service stopped");
    }

    async fn worker_loop(self: Arc<Self>, token: CancellationToken) {
        info!("Stream checker worker started");
        loop {
            let popped = tokio::select! {
                _ = token.cancelled() => break,
                popped = self.queue.get_next_channel(QUEUE_POP_TIMEOUT) => popped,
            };
            let Some(channel_id) = popped else { continue };
            if token.is_cancelled() {
                break;
            }
            self.check_channel(channel_id).await;
        }
        info!("Stream checker worker stopped");
    }

    async fn scheduler_loop(self: Arc<Self>, token: CancellationToken) {
        info!("Stream checker scheduler started");
        loop {
            let poll_interval = self.config_snapshot().checker.poll_interval_secs;
            let triggered = tokio::select! {
                _ = token.cancelled() => break,
                _ = self.trigger.notified() => true,
                _ = tokio::time::sleep(Duration::from_secs(poll_interval)) => false,
            };

            // A trigger only queues channels when it was a real update
            // signal, not a config-change wake-up, and no global action is
            // currently in flight.
            if triggered && !self.config_changed.load(Ordering::SeqCst) {
                if self.global_action_in_progress.load(Ordering::SeqCst) {
                    info!("Skipping channel queueing - global action in progress");
                } else {
                    self.queue_updated_channels();
                }
            }

            if self.config_changed.swap(false, Ordering::SeqCst) {
                info!("Configuration change detected, applying new settings immediately");
            }

            // The global schedule is evaluated on every iteration.
            if !self.global_action_in_progress.load(Ordering::SeqCst) {
                self.check_global_schedule_at(Local::now()).await;
            }
        }
        info!("Stream checker scheduler stopped");
    }

    /// Drain channels flagged by playlist updates into the queue.
    fn queue_updated_channels(&self) {
        let config = self.config_snapshot();
        let mode = config.checker.pipeline_mode;
        if !mode.checks_on_update() {
            info!(
                "Skipping channel queueing - {:?} mode does not check on update",
                mode
            );
            return;
        }

        let max_channels = config.checker.queue.max_channels_per_run;
        // Atomic drain: a playlist refresh landing right now can neither
        // double-queue a channel nor lose one.
        let channels = self
            .tracker
            .get_and_clear_channels_needing_check(Some(max_channels));
        if channels.is_empty() {
            debug!("No channels need checking");
            return;
        }

        // Channels that already completed a cycle must be re-checkable when
        // new streams arrive.
        for &channel_id in &channels {
            self.queue.remove_from_completed(channel_id);
        }
        let added = self.queue.add_channels(&channels, PRIORITY_UPDATE);
        info!(
            "Queued {}/{} updated channels for checking",
            added,
            channels.len()
        );
    }

    async fn check_global_schedule_at(&self, now: DateTime<Local>) {
        let config = self.config_snapshot();
        let schedule = config.checker.global_check_schedule;
        if !schedule.enabled {
            debug!("Global check schedule is disabled");
            return;
        }
        if !config.checker.pipeline_mode.has_scheduled_global_action() {
            debug!(
                "Skipping global schedule check - {:?} mode has no scheduled global action",
                config.checker.pipeline_mode
            );
            return;
        }

        let last = self
            .tracker
            .last_global_check()
            .map(|t| t.with_timezone(&now.timezone()));
        if !should_run_global_check(now, last, &schedule) {
            return;
        }

        info!(
            "Starting scheduled {:?} global action",
            schedule.frequency
        );
        if self.perform_global_action().await {
            // Recorded at initiation so the next loop iteration cannot
            // stack a duplicate run while the sweep is still draining.
            self.tracker.mark_global_check();
        }
    }

    /// Run the full global action: refresh playlists, rediscover streams,
    /// queue every channel with force check. Returns false when another
    /// global action is already in flight.
    async fn perform_global_action(&self) -> bool {
        if self
            .global_action_in_progress
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            warn!("Global action already in progress, skipping");
            return false;
        }

        info!("Starting global action; regular automation paused");
        self.run_global_action_steps().await;
        self.global_action_in_progress.store(false, Ordering::SeqCst);
        info!("Global action initiated; regular automation resumed");
        true
    }

    async fn run_global_action_steps(&self) {
        info!("Global action step 1/3: refreshing playlist accounts");
        match self.api.fetch_playlist_accounts().await {
            Ok(accounts) => {
                for account in accounts.iter().filter(|a| a.is_active) {
                    if let Err(e) = self.api.refresh_playlist_account(account.id).await {
                        error!(
                            "Failed to refresh playlist account '{}': {}",
                            account.name, e
                        );
                    }
                }
            }
            Err(e) => error!("Failed to fetch playlist accounts: {}", e),
        }

        info!("Global action step 2/3: running stream discovery");
        if let Err(e) = self.api.run_stream_discovery().await {
            error!("Stream discovery failed: {}", e);
        }

        info!("Global action step 3/3: queueing all channels for checking");
        self.queue_all_channels(true).await;
    }

    async fn queue_all_channels(&self, force_check: bool) {
        let batch_size = self
            .config_snapshot()
            .checker
            .queue
            .max_channels_per_run
            .max(1);
        let channels = match self.api.fetch_channels().await {
            Ok(channels) => channels,
            Err(e) => {
                error!("Failed to queue all channels: {}", e);
                return;
            }
        };
        let channel_ids: Vec<ChannelId> = channels.iter().map(|c| c.id).collect();

        if force_check {
            for &channel_id in &channel_ids {
                self.tracker.mark_channel_for_force_check(channel_id);
            }
        }
        for &channel_id in &channel_ids {
            self.queue.remove_from_completed(channel_id);
        }

        let mut total_added = 0;
        for batch in channel_ids.chunks(batch_size) {
            total_added += self.queue.add_channels(batch, PRIORITY_GLOBAL_SWEEP);
        }
        info!(
            "Queued {}/{} channels for global check (force_check={})",
            total_added,
            channel_ids.len(),
            force_check
        );
    }

    /// Run one channel check, recording the outcome on the queue. Errors
    /// never propagate out of here; a single channel failure must not kill
    /// the worker loop.
    async fn check_channel(&self, channel_id: ChannelId) {
        self.checking.store(true, Ordering::SeqCst);
        info!("Checking channel {}", channel_id);
        if let Err(e) = self.run_channel_check(channel_id).await {
            error!("Error checking channel {}: {}", channel_id, e);
            self.queue.mark_failed(channel_id, e.to_string());
        }
        self.checking.store(false, Ordering::SeqCst);
    }

    async fn run_channel_check(&self, channel_id: ChannelId) -> AppResult<()> {
        let channel = self.api.fetch_channel(channel_id).await?;
        let streams = self.api.fetch_channel_streams(channel_id).await?;
        if streams.is_empty() {
            info!("No streams found for channel {}", channel.name);
            self.queue.mark_completed(channel_id);
            self.tracker
                .mark_channel_checked(channel_id, 0, BTreeSet::new());
            return Ok(());
        }
        info!(
            "Found {} streams for channel {}",
            streams.len(),
            channel.name
        );

        // Force check bypasses the checked-stream cache entirely; this is
        // how a dead stream gets a chance to be revived during sweeps.
        let force_check = self.tracker.should_force_check(channel_id);
        let checked_ids = if force_check {
            info!(
                "Force check enabled: analyzing all {} streams",
                streams.len()
            );
            self.tracker.clear_force_check(channel_id);
            BTreeSet::new()
        } else {
            self.tracker.checked_stream_ids(channel_id)
        };

        let to_probe = streams
            .iter()
            .filter(|s| !checked_ids.contains(&s.id))
            .count();
        if to_probe < streams.len() {
            info!(
                "{} of {} streams recently checked, reusing cached stats",
                streams.len() - to_probe,
                streams.len()
            );
        }

        let config = self.config_snapshot();
        let analysis = config.checker.stream_analysis;
        let scorer = Scorer::new(config.checker.scoring);
        let settle_delay = Duration::from_millis(config.checker.reorder_settle_delay_ms);

        // Streams are scored in the channel's current order so the stable
        // sort below preserves it for ties.
        let mut scored = Vec::with_capacity(streams.len());
        for stream in &streams {
            let entry = if checked_ids.contains(&stream.id) {
                match self.cached_score(stream, &scorer).await {
                    Some(entry) => entry,
                    None => self.analyze_and_score(stream, &analysis, &scorer).await,
                }
            } else {
                self.analyze_and_score(stream, &analysis, &scorer).await
            };
            info!("Stream '{}' scored {:.2}", entry.name, entry.score);
            scored.push(entry);
        }

        sort_by_score(&mut scored);
        let reordered: Vec<StreamId> = scored.iter().map(|s| s.stream_id).collect();
        self.api
            .update_channel_streams(channel_id, &reordered)
            .await?;

        self.verify_reorder(&channel, &reordered, settle_delay).await;

        let current_urls: HashSet<String> = streams.iter().map(|s| s.url.clone()).collect();
        self.dead_streams.cleanup_removed_streams(&current_urls);

        self.queue.mark_completed(channel_id);
        self.tracker.mark_channel_checked(
            channel_id,
            streams.len(),
            streams.iter().map(|s| s.id).collect(),
        );
        info!("Channel {} checked and streams reordered", channel.name);
        Ok(())
    }

    /// Re-fetch the channel after a short settle delay and confirm the
    /// written order landed. A mismatch is operator-visible only.
    async fn verify_reorder(&self, channel: &Channel, expected: &[StreamId], settle: Duration) {
        tokio::time::sleep(settle).await;
        match self.api.fetch_channel(channel.id).await {
            Ok(updated) if updated.streams == expected => {
                info!(
                    "Verified: channel {} streams reordered correctly",
                    channel.name
                );
            }
            Ok(updated) => {
                let shown = expected.len().min(5);
                warn!(
                    "Verification failed: stream order mismatch for channel {} (expected {:?}..., got {:?}...)",
                    channel.name,
                    &expected[..shown],
                    &updated.streams[..updated.streams.len().min(5)]
                );
            }
            Err(e) => warn!(
                "Could not verify stream update for channel {}: {}",
                channel.name, e
            ),
        }
    }

    /// Probe one stream under its provider gate, push the raw stats out and
    /// score the result.
    async fn analyze_and_score(
        &self,
        stream: &Stream,
        analysis: &StreamAnalysisConfig,
        scorer: &Scorer,
    ) -> ScoredStream {
        let provider = provider_for_url(&stream.url);
        let gate = self.throttle.acquire(&provider).await;
        info!(
            "Probing stream '{}' (id {}, provider {})",
            stream.name, stream.id, provider
        );

        let started = tokio::time::Instant::now();
        let report = self.prober.probe(stream, analysis).await;
        // Hold the provider gate for the full analysis window so a provider
        // is never hit more than once per window.
        let window = Duration::from_secs(analysis.ffmpeg_duration_secs);
        let elapsed = started.elapsed();
        if elapsed < window {
            tokio::time::sleep(window - elapsed).await;
        }
        drop(gate);

        if report.has_usable_bitrate() {
            self.dead_streams.mark_alive(&stream.url);
        } else {
            self.dead_streams
                .mark_dead(&stream.url, stream.id, &stream.name);
        }

        let stats = report.to_stats();
        if stats == StreamStats::default() {
            debug!("No stats to push for stream {}", stream.id);
        } else if let Err(e) = self.api.patch_stream_stats(stream.id, &stats).await {
            warn!("Failed to push stats for stream {}: {}", stream.id, e);
        }

        let score = scorer.score(&report);
        ScoredStream {
            stream_id: stream.id,
            name: stream.name.clone(),
            url: stream.url.clone(),
            report,
            score,
        }
    }

    /// Score an already-checked stream from its persisted stats. Returns
    /// `None` when the stats cannot be fetched, in which case the caller
    /// falls back to a fresh probe.
    async fn cached_score(&self, stream: &Stream, scorer: &Scorer) -> Option<ScoredStream> {
        let fetched = match self.api.fetch_stream(stream.id).await {
            Ok(fetched) => fetched,
            Err(e) => {
                warn!(
                    "Could not fetch cached stats for stream {}, will analyze: {}",
                    stream.id, e
                );
                return None;
            }
        };
        let report = fetched.stream_stats.unwrap_or_default().to_report();
        let score = scorer.score(&report);
        debug!(
            "Using cached stats for stream {} ('{}'): score {:.2}",
            stream.id, stream.name, score
        );
        Some(ScoredStream {
            stream_id: stream.id,
            name: stream.name.clone(),
            url: stream.url.clone(),
            report,
            score,
        })
    }

    // ---- public surface -------------------------------------------------

    pub fn status(&self) -> ServiceStatus {
        ServiceStatus {
            running: self.running.load(Ordering::SeqCst),
            checking: self.checking.load(Ordering::SeqCst),
            global_action_in_progress: self.global_action_in_progress.load(Ordering::SeqCst),
            enabled: self.config_snapshot().checker.enabled,
            queue: self.queue.status(),
            last_global_check: self.tracker.last_global_check(),
        }
    }

    pub fn config(&self) -> Config {
        self.config_snapshot()
    }

    /// Manually queue a channel for checking.
    pub fn queue_channel(&self, channel_id: ChannelId, priority: u8) -> bool {
        self.queue.add_channel(channel_id, priority)
    }

    /// Manually queue several channels; returns how many were admitted.
    pub fn queue_channels(&self, channel_ids: &[ChannelId], priority: u8) -> usize {
        self.queue.add_channels(channel_ids, priority)
    }

    /// Record that channels received playlist updates and need a check.
    pub fn mark_channels_updated(
        &self,
        channel_ids: &[ChannelId],
        stream_counts: Option<&HashMap<ChannelId, usize>>,
    ) {
        self.tracker.mark_channels_updated(channel_ids, stream_counts);
    }

    /// Wake the scheduler loop immediately instead of waiting for the next
    /// poll. Signals coalesce; only "wake up now" matters.
    pub fn trigger_check_updated_channels(&self) {
        if self.running.load(Ordering::SeqCst) {
            info!("Triggering immediate check for updated channels");
            self.trigger.notify_one();
        } else {
            warn!("Cannot trigger check - service is not running");
        }
    }

    /// Manually run a global sweep, regardless of the schedule.
    pub async fn trigger_global_action(&self) -> bool {
        if !self.running.load(Ordering::SeqCst) {
            warn!("Cannot trigger global action - service is not running");
            return false;
        }
        info!("Manual global action triggered");
        if self.perform_global_action().await {
            self.tracker.mark_global_check();
            true
        } else {
            false
        }
    }

    /// Deep-merge a partial update into the live configuration, persist it
    /// and wake the scheduler so the new settings apply without a restart.
    pub fn update_config(&self, patch: &ConfigPatch) {
        {
            let mut config = self
                .config
                .write()
                .unwrap_or_else(|poisoned| poisoned.into_inner());
            config.apply_patch(patch);
            if let Err(e) = config.save(&self.config_path) {
                error!("Failed to persist configuration: {}", e);
            }
        }
        info!("Configuration updated");

        let max_size_changed = patch
            .checker
            .as_ref()
            .and_then(|c| c.queue.as_ref())
            .and_then(|q| q.max_size)
            .is_some();
        if max_size_changed {
            info!("Queue max size updated, will apply on next restart");
        }

        if self.running.load(Ordering::SeqCst) {
            self.config_changed.store(true, Ordering::SeqCst);
            self.trigger.notify_one();
            info!("Configuration changes will be applied immediately");
        }
    }

    pub fn clear_queue(&self) {
        self.queue.clear();
    }
}

/// Decide whether the scheduled global action is due.
///
/// With no prior run recorded (fresh start), the action only fires within
/// the tolerance window around the scheduled time; otherwise it waits for
/// the scheduled time to arrive instead of running immediately on startup.
/// With a prior run it fires once per period after the scheduled time.
fn should_run_global_check(
    now: DateTime<Local>,
    last: Option<DateTime<Local>>,
    schedule: &GlobalScheduleConfig,
) -> bool {
    let Some(naive) = now
        .date_naive()
        .and_hms_opt(schedule.hour, schedule.minute, 0)
    else {
        warn!(
            "Invalid global check schedule time {:02}:{:02}",
            schedule.hour, schedule.minute
        );
        return false;
    };
    let Some(scheduled_today) = now.timezone().from_local_datetime(&naive).earliest() else {
        return false;
    };

    let Some(last) = last else {
        let minutes_off = (now - scheduled_today).num_minutes().abs();
        return minutes_off <= schedule.fresh_start_tolerance_minutes;
    };

    let period_elapsed = match schedule.frequency {
        ScheduleFrequency::Daily => last.date_naive() != now.date_naive(),
        ScheduleFrequency::Monthly => {
            now.day() == schedule.day_of_month
                && (last.month() != now.month()
                    || last.year() != now.year()
                    || (now - last).num_days() >= 30)
        }
    };
    period_elapsed && now >= scheduled_today
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::errors::AppError;
    use crate::models::{PlaylistAccount, ProbeReport, ProbeStatus, Resolution};
    use crate::scoring::DEAD_STREAM_SCORE;
    use async_trait::async_trait;
    use chrono::{TimeZone, Timelike, Utc};
    use std::sync::atomic::AtomicUsize;

    #[derive(Default)]
    struct MockApi {
        channels: Mutex<HashMap<ChannelId, Channel>>,
        channel_streams: Mutex<HashMap<ChannelId, Vec<Stream>>>,
        stream_records: Mutex<HashMap<StreamId, Stream>>,
        accounts: Vec<PlaylistAccount>,
        reorders: Mutex<Vec<(ChannelId, Vec<StreamId>)>>,
        stats_patches: Mutex<Vec<StreamId>>,
        refreshes: Mutex<Vec<i64>>,
        discovery_runs: AtomicUsize,
    }

    impl MockApi {
        fn with_channel(self, channel: Channel, streams: Vec<Stream>) -> Self {
            for stream in &streams {
                self.stream_records
                    .lock()
                    .unwrap()
                    .insert(stream.id, stream.clone());
            }
            self.channel_streams
                .lock()
                .unwrap()
                .insert(channel.id, streams);
            self.channels.lock().unwrap().insert(channel.id, channel);
            self
        }

        fn reorders(&self) -> Vec<(ChannelId, Vec<StreamId>)> {
            self.reorders.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl MediaProxyApi for MockApi {
        async fn fetch_channels(&self) -> AppResult<Vec<Channel>> {
            let mut channels: Vec<Channel> =
                self.channels.lock().unwrap().values().cloned().collect();
            channels.sort_by_key(|c| c.id);
            Ok(channels)
        }

        async fn fetch_channel(&self, channel_id: ChannelId) -> AppResult<Channel> {
            self.channels
                .lock()
                .unwrap()
                .get(&channel_id)
                .cloned()
                .ok_or_else(|| AppError::internal(format!("no channel {channel_id}")))
        }

        async fn fetch_channel_streams(&self, channel_id: ChannelId) -> AppResult<Vec<Stream>> {
            Ok(self
                .channel_streams
                .lock()
                .unwrap()
                .get(&channel_id)
                .cloned()
                .unwrap_or_default())
        }

        async fn update_channel_streams(
            &self,
            channel_id: ChannelId,
            stream_ids: &[StreamId],
        ) -> AppResult<()> {
            self.reorders
                .lock()
                .unwrap()
                .push((channel_id, stream_ids.to_vec()));
            if let Some(channel) = self.channels.lock().unwrap().get_mut(&channel_id) {
                channel.streams = stream_ids.to_vec();
            }
            Ok(())
        }

        async fn fetch_stream(&self, stream_id: StreamId) -> AppResult<Stream> {
            self.stream_records
                .lock()
                .unwrap()
                .get(&stream_id)
                .cloned()
                .ok_or_else(|| AppError::internal(format!("no stream {stream_id}")))
        }

        async fn patch_stream_stats(
            &self,
            stream_id: StreamId,
            stats: &StreamStats,
        ) -> AppResult<()> {
            self.stats_patches.lock().unwrap().push(stream_id);
            if let Some(stream) = self.stream_records.lock().unwrap().get_mut(&stream_id) {
                let mut merged = stream.stream_stats.clone().unwrap_or_default();
                merged.merge(stats);
                stream.stream_stats = Some(merged);
            }
            Ok(())
        }

        async fn fetch_playlist_accounts(&self) -> AppResult<Vec<PlaylistAccount>> {
            Ok(self.accounts.clone())
        }

        async fn refresh_playlist_account(&self, account_id: i64) -> AppResult<()> {
            self.refreshes.lock().unwrap().push(account_id);
            Ok(())
        }

        async fn run_stream_discovery(&self) -> AppResult<()> {
            self.discovery_runs.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    #[derive(Default)]
    struct MockProber {
        reports: HashMap<String, ProbeReport>,
        probes: AtomicUsize,
    }

    #[async_trait]
    impl StreamProber for MockProber {
        async fn probe(&self, stream: &Stream, _options: &StreamAnalysisConfig) -> ProbeReport {
            self.probes.fetch_add(1, Ordering::SeqCst);
            self.reports.get(&stream.url).cloned().unwrap_or_default()
        }
    }

    fn test_config(dir: &std::path::Path) -> Config {
        let mut config = Config::default();
        config.storage.state_dir = dir.to_path_buf();
        config.checker.stream_analysis.ffmpeg_duration_secs = 0;
        config.checker.stream_analysis.retries = 0;
        config.checker.stream_analysis.retry_delay_secs = 0;
        config.checker.reorder_settle_delay_ms = 0;
        config
    }

    fn service(
        dir: &tempfile::TempDir,
        api: Arc<MockApi>,
        prober: Arc<MockProber>,
    ) -> Arc<StreamChecker> {
        Arc::new(StreamChecker::new(
            test_config(dir.path()),
            dir.path().join("config.toml"),
            api,
            prober,
        ))
    }

    fn stream(id: StreamId, url: &str) -> Stream {
        Stream {
            id,
            name: format!("stream {id}"),
            url: url.to_string(),
            stream_stats: None,
        }
    }

    fn channel(id: ChannelId, stream_ids: &[StreamId]) -> Channel {
        Channel {
            id,
            name: format!("channel {id}"),
            streams: stream_ids.to_vec(),
        }
    }

    fn good_report(kbps: f64) -> ProbeReport {
        ProbeReport {
            video_codec: Some("h264".to_string()),
            resolution: Resolution::new(1920, 1080),
            fps: 50.0,
            bitrate_kbps: Some(kbps),
            status: ProbeStatus::Ok,
            ..Default::default()
        }
    }

    fn dead_report() -> ProbeReport {
        ProbeReport {
            bitrate_kbps: Some(0.0),
            status: ProbeStatus::Ok,
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn double_mark_queues_channel_exactly_once() {
        let dir = tempfile::tempdir().unwrap();
        let api = Arc::new(MockApi::default());
        let service = service(&dir, api, Arc::new(MockProber::default()));

        service.mark_channels_updated(&[42], None);
        service.mark_channels_updated(&[42], None);
        service.queue_updated_channels();

        assert_eq!(service.queue.status().queued, 1);
        assert_eq!(
            service.queue.get_next_channel(Duration::from_millis(10)).await,
            Some(42)
        );
        assert_eq!(
            service.queue.get_next_channel(Duration::from_millis(10)).await,
            None
        );

        // Nothing left to drain either.
        service.queue_updated_channels();
        assert_eq!(service.queue.status().queued, 0);
    }

    #[tokio::test]
    async fn non_checking_mode_leaves_needs_check_intact() {
        let dir = tempfile::tempdir().unwrap();
        let api = Arc::new(MockApi::default());
        let service = service(&dir, api, Arc::new(MockProber::default()));

        service.update_config(&ConfigPatch {
            checker: Some(crate::config::CheckerPatch {
                pipeline_mode: Some(crate::config::PipelineMode::RefreshOnly),
                ..Default::default()
            }),
            ..Default::default()
        });
        service.mark_channels_updated(&[42], None);
        service.queue_updated_channels();

        assert_eq!(service.queue.status().queued, 0);
        // The flag must survive so a later mode change can still queue it.
        assert_eq!(service.tracker.channels_needing_check(), vec![42]);
    }

    #[tokio::test]
    async fn check_reorders_streams_best_first() {
        let dir = tempfile::tempdir().unwrap();
        let mut prober = MockProber::default();
        prober
            .reports
            .insert("http://a.example.com/good".to_string(), good_report(5000.0));
        prober
            .reports
            .insert("http://b.example.com/dead".to_string(), dead_report());

        // Dead stream currently plays first.
        let api = Arc::new(MockApi::default().with_channel(
            channel(1, &[11, 10]),
            vec![
                stream(11, "http://b.example.com/dead"),
                stream(10, "http://a.example.com/good"),
            ],
        ));
        let service = service(&dir, api.clone(), Arc::new(prober));

        service.run_channel_check(1).await.unwrap();

        let reorders = api.reorders();
        assert_eq!(reorders.len(), 1);
        let (channel_id, order) = &reorders[0];
        assert_eq!(*channel_id, 1);
        assert_eq!(order, &vec![10, 11]);

        // The written order is a permutation of the original stream set.
        let mut sorted = order.clone();
        sorted.sort_unstable();
        assert_eq!(sorted, vec![10, 11]);

        assert_eq!(service.queue.status().completed, 1);
        assert_eq!(
            service.tracker.checked_stream_ids(1),
            BTreeSet::from([10, 11])
        );
        assert!(service.dead_streams.is_dead("http://b.example.com/dead"));
        assert!(!service.dead_streams.is_dead("http://a.example.com/good"));
    }

    #[tokio::test]
    async fn all_dead_streams_still_write_a_full_permutation() {
        let dir = tempfile::tempdir().unwrap();
        let mut prober = MockProber::default();
        prober
            .reports
            .insert("http://x.example.com/1".to_string(), dead_report());
        prober
            .reports
            .insert("http://x.example.com/2".to_string(), dead_report());

        let api = Arc::new(MockApi::default().with_channel(
            channel(2, &[20, 21]),
            vec![
                stream(20, "http://x.example.com/1"),
                stream(21, "http://x.example.com/2"),
            ],
        ));
        let service = service(&dir, api.clone(), Arc::new(prober));

        service.run_channel_check(2).await.unwrap();

        // Equal floor scores: stable sort keeps the original order, and no
        // stream is dropped from the written permutation.
        let reorders = api.reorders();
        assert_eq!(reorders[0].1, vec![20, 21]);

        let scorer = Scorer::new(Config::default().checker.scoring);
        assert_eq!(scorer.score(&dead_report()), DEAD_STREAM_SCORE);
    }

    #[tokio::test]
    async fn cached_streams_are_not_reprobed() {
        let dir = tempfile::tempdir().unwrap();
        let prober = Arc::new(MockProber::default());

        let mut cached = stream(30, "http://c.example.com/1");
        cached.stream_stats = Some(StreamStats {
            resolution: Some("1920x1080".to_string()),
            source_fps: Some(25.0),
            video_codec: Some("h264".to_string()),
            audio_codec: Some("aac".to_string()),
            ffmpeg_output_bitrate: Some(4000),
        });
        let api = Arc::new(
            MockApi::default().with_channel(channel(3, &[30]), vec![cached]),
        );
        let service = service(&dir, api.clone(), prober.clone());

        // Pretend a previous cycle already evaluated stream 30.
        service
            .tracker
            .mark_channel_checked(3, 1, BTreeSet::from([30]));

        service.run_channel_check(3).await.unwrap();
        assert_eq!(prober.probes.load(Ordering::SeqCst), 0);
        assert_eq!(api.reorders()[0].1, vec![30]);
    }

    #[tokio::test]
    async fn force_check_probes_every_stream_and_clears_flag() {
        let dir = tempfile::tempdir().unwrap();
        let mut prober = MockProber::default();
        prober
            .reports
            .insert("http://c.example.com/1".to_string(), good_report(3000.0));
        let prober = Arc::new(prober);

        let api = Arc::new(MockApi::default().with_channel(
            channel(4, &[40]),
            vec![stream(40, "http://c.example.com/1")],
        ));
        let service = service(&dir, api, prober.clone());

        service
            .tracker
            .mark_channel_checked(4, 1, BTreeSet::from([40]));
        service.tracker.mark_channel_for_force_check(4);

        service.run_channel_check(4).await.unwrap();
        assert_eq!(prober.probes.load(Ordering::SeqCst), 1);
        assert!(!service.tracker.should_force_check(4));
    }

    #[tokio::test]
    async fn empty_channel_completes_without_probing() {
        let dir = tempfile::tempdir().unwrap();
        let prober = Arc::new(MockProber::default());
        let api = Arc::new(MockApi::default().with_channel(channel(5, &[]), vec![]));
        let service = service(&dir, api.clone(), prober.clone());

        service.run_channel_check(5).await.unwrap();
        assert_eq!(prober.probes.load(Ordering::SeqCst), 0);
        assert!(api.reorders().is_empty());
        assert_eq!(service.queue.status().completed, 1);
    }

    #[tokio::test]
    async fn missing_channel_is_marked_failed() {
        let dir = tempfile::tempdir().unwrap();
        let api = Arc::new(MockApi::default());
        let service = service(&dir, api, Arc::new(MockProber::default()));

        service.check_channel(99).await;
        let failure = service.queue.failure_for(99).unwrap();
        assert!(failure.error.contains("no channel 99"));
        assert_eq!(service.queue.status().failed, 1);
    }

    #[tokio::test]
    async fn tight_loop_schedule_evaluation_runs_one_global_action() {
        let dir = tempfile::tempdir().unwrap();

        // Seed the tracker with a global check two days old.
        let two_days_ago = Utc::now() - chrono::Duration::days(2);
        std::fs::write(
            dir.path().join("channel_updates.json"),
            serde_json::to_vec(&serde_json::json!({
                "channels": {},
                "last_global_check": two_days_ago,
            }))
            .unwrap(),
        )
        .unwrap();

        let api = Arc::new(MockApi {
            accounts: vec![PlaylistAccount {
                id: 1,
                name: "main".to_string(),
                is_active: true,
            }],
            ..Default::default()
        });
        let service = service(&dir, api.clone(), Arc::new(MockProber::default()));

        // Schedule for the start of the fixed "now" hour, so now is at or
        // past the scheduled time.
        let now = Local::now();
        service.update_config(&ConfigPatch {
            checker: Some(crate::config::CheckerPatch {
                global_check_schedule: Some(crate::config::GlobalSchedulePatch {
                    hour: Some(now.hour()),
                    minute: Some(0),
                    ..Default::default()
                }),
                ..Default::default()
            }),
            ..Default::default()
        });

        for _ in 0..5 {
            service.check_global_schedule_at(now).await;
        }

        assert_eq!(api.discovery_runs.load(Ordering::SeqCst), 1);
        assert_eq!(*api.refreshes.lock().unwrap(), vec![1]);
        assert!(service.tracker.last_global_check().unwrap() > two_days_ago);
    }

    #[tokio::test]
    async fn global_action_marks_all_channels_for_force_check() {
        let dir = tempfile::tempdir().unwrap();
        let api = Arc::new(
            MockApi::default()
                .with_channel(channel(1, &[]), vec![])
                .with_channel(channel(2, &[]), vec![]),
        );
        let service = service(&dir, api, Arc::new(MockProber::default()));

        assert!(service.perform_global_action().await);
        assert!(service.tracker.should_force_check(1));
        assert!(service.tracker.should_force_check(2));
        assert_eq!(service.queue.status().queued, 2);
        assert!(!service.global_action_in_progress.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn start_stop_lifecycle() {
        let dir = tempfile::tempdir().unwrap();
        let api = Arc::new(MockApi::default());
        let service = service(&dir, api, Arc::new(MockProber::default()));

        assert!(!service.status().running);
        assert!(!service.trigger_global_action().await);

        service.start();
        assert!(service.status().running);
        // Starting twice is a no-op.
        service.start();

        service.stop().await;
        assert!(!service.status().running);
        service.stop().await;
    }

    #[test]
    fn fresh_start_only_runs_inside_tolerance_window() {
        let schedule = GlobalScheduleConfig {
            enabled: true,
            frequency: ScheduleFrequency::Daily,
            hour: 3,
            minute: 0,
            day_of_month: 1,
            fresh_start_tolerance_minutes: 10,
        };
        let at = |h, m| Local.with_ymd_and_hms(2026, 8, 5, h, m, 0).unwrap();

        assert!(should_run_global_check(at(3, 0), None, &schedule));
        assert!(should_run_global_check(at(3, 10), None, &schedule));
        assert!(should_run_global_check(at(2, 50), None, &schedule));
        assert!(!should_run_global_check(at(3, 11), None, &schedule));
        assert!(!should_run_global_check(at(14, 0), None, &schedule));
        assert!(!should_run_global_check(at(0, 5), None, &schedule));
    }

    #[test]
    fn daily_schedule_runs_once_per_day_after_the_hour() {
        let schedule = GlobalScheduleConfig {
            enabled: true,
            frequency: ScheduleFrequency::Daily,
            hour: 3,
            minute: 0,
            day_of_month: 1,
            fresh_start_tolerance_minutes: 10,
        };
        let at = |d, h, m| Local.with_ymd_and_hms(2026, 8, d, h, m, 0).unwrap();

        // Last run two days ago, past the scheduled time: due.
        assert!(should_run_global_check(at(5, 4, 0), Some(at(3, 3, 1)), &schedule));
        // Already ran today: not due, even well past the hour.
        assert!(!should_run_global_check(at(5, 23, 0), Some(at(5, 3, 1)), &schedule));
        // Different day but before the scheduled time: not due yet.
        assert!(!should_run_global_check(at(5, 2, 59), Some(at(4, 3, 1)), &schedule));
    }

    #[test]
    fn monthly_schedule_requires_day_and_fresh_month() {
        let schedule = GlobalScheduleConfig {
            enabled: true,
            frequency: ScheduleFrequency::Monthly,
            hour: 3,
            minute: 0,
            day_of_month: 1,
            fresh_start_tolerance_minutes: 10,
        };
        let at = |y, mo, d, h| Local.with_ymd_and_hms(y, mo, d, h, 0, 0).unwrap();

        // First of the month, last run previous month: due.
        assert!(should_run_global_check(
            at(2026, 8, 1, 4),
            Some(at(2026, 7, 1, 3)),
            &schedule
        ));
        // Wrong day of month: never due.
        assert!(!should_run_global_check(
            at(2026, 8, 5, 4),
            Some(at(2026, 7, 1, 3)),
            &schedule
        ));
        // Same month already ran: not due.
        assert!(!should_run_global_check(
            at(2026, 8, 1, 4),
            Some(at(2026, 8, 1, 3)),
            &schedule
        ));
        // Same month last year: due again.
        assert!(should_run_global_check(
            at(2026, 8, 1, 4),
            Some(at(2025, 8, 1, 3)),
            &schedule
        ));
    }

    #[tokio::test]
    async fn update_config_persists_to_disk() {
        let dir = tempfile::tempdir().unwrap();
        let api = Arc::new(MockApi::default());
        let service = service(&dir, api, Arc::new(MockProber::default()));

        service.update_config(&ConfigPatch {
            checker: Some(crate::config::CheckerPatch {
                poll_interval_secs: Some(120),
                ..Default::default()
            }),
            ..Default::default()
        });

        assert_eq!(service.config().checker.poll_interval_secs, 120);
        let on_disk = Config::load(&dir.path().join("config.toml")).unwrap();
        assert_eq!(on_disk.checker.poll_interval_secs, 120);
    }
}
