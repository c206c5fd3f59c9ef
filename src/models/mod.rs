//! Core data model shared across the service
//!
//! Channels and streams are owned by the external media proxy; this service
//! only reads them, measures stream quality and writes back a new stream
//! order. Probe reports are created fresh per probe attempt and never
//! mutated afterwards, only superseded.

use chrono::{DateTime, Utc};
use serde::de::Deserializer;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fmt;

pub type ChannelId = i64;
pub type StreamId = i64;

/// A channel as exposed by the external media proxy.
///
/// The `streams` field is the ordered list of stream ids currently assigned
/// to the channel; reordering means PATCHing a permutation of this list.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Channel {
    pub id: ChannelId,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub streams: Vec<StreamId>,
}

/// A single playable source URL belonging to a channel.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Stream {
    pub id: StreamId,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub url: String,
    /// Persisted quality-stat blob. The external API sometimes returns this
    /// as a JSON-encoded string rather than an object.
    #[serde(default, deserialize_with = "de_stream_stats")]
    pub stream_stats: Option<StreamStats>,
}

/// The quality-stat blob persisted per stream on the external system.
///
/// Only raw measurements are stored, never scores: scoring weights can
/// change between runs, so scores are always recomputed from these fields.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct StreamStats {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resolution: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source_fps: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub video_codec: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub audio_codec: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ffmpeg_output_bitrate: Option<i64>,
}

impl StreamStats {
    /// Merge `update` into `self`, keeping existing values for fields the
    /// update does not carry.
    pub fn merge(&mut self, update: &StreamStats) {
        if update.resolution.is_some() {
            self.resolution = update.resolution.clone();
        }
        if update.source_fps.is_some() {
            self.source_fps = update.source_fps;
        }
        if update.video_codec.is_some() {
            self.video_codec = update.video_codec.clone();
        }
        if update.audio_codec.is_some() {
            self.audio_codec = update.audio_codec.clone();
        }
        if update.ffmpeg_output_bitrate.is_some() {
            self.ffmpeg_output_bitrate = update.ffmpeg_output_bitrate;
        }
    }

    /// Reconstruct a probe report from persisted stats.
    ///
    /// Used for streams that were checked recently and are not re-probed.
    /// Error flags and frame counters are not persisted, so the report
    /// assumes a clean run; a missing or zero bitrate still marks the
    /// stream as dead for scoring purposes.
    pub fn to_report(&self) -> ProbeReport {
        ProbeReport {
            video_codec: self.video_codec.clone(),
            audio_codec: self.audio_codec.clone(),
            resolution: self
                .resolution
                .as_deref()
                .and_then(Resolution::parse)
                .unwrap_or_default(),
            fps: self.source_fps.unwrap_or(0.0),
            bitrate_kbps: self
                .ffmpeg_output_bitrate
                .filter(|&b| b > 0)
                .map(|b| b as f64),
            frames_decoded: None,
            frames_dropped: None,
            interlacing: Interlacing::Unknown,
            errors: CriticalErrors::default(),
            status: ProbeStatus::Ok,
            probed_at: Utc::now(),
        }
    }
}

fn de_stream_stats<'de, D>(deserializer: D) -> Result<Option<StreamStats>, D::Error>
where
    D: Deserializer<'de>,
{
    let value = Option::<serde_json::Value>::deserialize(deserializer)?;
    Ok(match value {
        None | Some(serde_json::Value::Null) => None,
        Some(serde_json::Value::String(s)) => serde_json::from_str(&s).ok(),
        Some(other) => serde_json::from_value(other).ok(),
    })
}

/// Video resolution; `0x0` is the "unknown or dead" sentinel.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Resolution {
    pub width: u32,
    pub height: u32,
}

impl Resolution {
    pub fn new(width: u32, height: u32) -> Self {
        Self { width, height }
    }

    pub fn is_known(&self) -> bool {
        self.width > 0 && self.height > 0
    }

    /// Parse a "1920x1080" style string.
    pub fn parse(s: &str) -> Option<Self> {
        let (w, h) = s.trim().split_once('x')?;
        Some(Self {
            width: w.trim().parse().ok()?,
            height: h.trim().parse().ok()?,
        })
    }
}

impl fmt::Display for Resolution {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}x{}", self.width, self.height)
    }
}

/// Interlace detection outcome.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Interlacing {
    Interlaced,
    Progressive,
    #[default]
    Unknown,
}

/// Critical provider-side error flags surfaced during analysis.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CriticalErrors {
    pub decode: bool,
    pub discontinuity: bool,
    pub timeout: bool,
}

impl CriticalErrors {
    pub fn any(&self) -> bool {
        self.decode || self.discontinuity || self.timeout
    }
}

/// Overall outcome of a probe attempt.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProbeStatus {
    Ok,
    Timeout,
    Error,
    #[default]
    Unknown,
}

impl ProbeStatus {
    pub fn is_ok(&self) -> bool {
        matches!(self, ProbeStatus::Ok)
    }
}

impl fmt::Display for ProbeStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ProbeStatus::Ok => write!(f, "OK"),
            ProbeStatus::Timeout => write!(f, "Timeout"),
            ProbeStatus::Error => write!(f, "Error"),
            ProbeStatus::Unknown => write!(f, "Unknown"),
        }
    }
}

/// Everything a single probe attempt learned about a stream.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProbeReport {
    pub video_codec: Option<String>,
    pub audio_codec: Option<String>,
    pub resolution: Resolution,
    pub fps: f64,
    /// Measured transfer bitrate in kbps; `None` means not available.
    pub bitrate_kbps: Option<f64>,
    pub frames_decoded: Option<u64>,
    pub frames_dropped: Option<u64>,
    pub interlacing: Interlacing,
    pub errors: CriticalErrors,
    pub status: ProbeStatus,
    pub probed_at: DateTime<Utc>,
}

impl Default for ProbeReport {
    fn default() -> Self {
        Self {
            video_codec: None,
            audio_codec: None,
            resolution: Resolution::default(),
            fps: 0.0,
            bitrate_kbps: None,
            frames_decoded: None,
            frames_dropped: None,
            interlacing: Interlacing::Unknown,
            errors: CriticalErrors::default(),
            status: ProbeStatus::Unknown,
            probed_at: Utc::now(),
        }
    }
}

impl ProbeReport {
    /// A stream without a positive bitrate measurement is considered dead.
    pub fn has_usable_bitrate(&self) -> bool {
        self.bitrate_kbps.map(|b| b > 0.0).unwrap_or(false)
    }

    /// The subset of fields pushed back to the external system.
    pub fn to_stats(&self) -> StreamStats {
        StreamStats {
            resolution: self
                .resolution
                .is_known()
                .then(|| self.resolution.to_string()),
            source_fps: (self.fps > 0.0).then_some(self.fps),
            video_codec: self.video_codec.clone(),
            audio_codec: self.audio_codec.clone(),
            ffmpeg_output_bitrate: self.bitrate_kbps.filter(|&b| b > 0.0).map(|b| b as i64),
        }
    }
}

/// A stream together with its analysis result and computed score.
#[derive(Debug, Clone)]
pub struct ScoredStream {
    pub stream_id: StreamId,
    pub name: String,
    pub url: String,
    pub report: ProbeReport,
    pub score: f64,
}

/// Durable per-channel check bookkeeping.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct UpdateRecord {
    #[serde(default)]
    pub last_update: Option<DateTime<Utc>>,
    #[serde(default)]
    pub needs_check: bool,
    #[serde(default)]
    pub last_check: Option<DateTime<Utc>>,
    #[serde(default)]
    pub stream_count: Option<usize>,
    #[serde(default)]
    pub checked_stream_ids: BTreeSet<StreamId>,
    #[serde(default)]
    pub force_check: bool,
    #[serde(default)]
    pub queued_at: Option<DateTime<Utc>>,
}

/// An M3U-style source account on the external system.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PlaylistAccount {
    pub id: i64,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub is_active: bool,
}

/// Snapshot of queue state, exposed through the service status.
#[derive(Debug, Clone, Default, Serialize)]
pub struct QueueStats {
    pub queue_size: usize,
    pub queued: usize,
    pub in_progress: usize,
    pub completed: usize,
    pub failed: usize,
    pub current_channel: Option<ChannelId>,
    pub total_queued: u64,
    pub total_completed: u64,
    pub total_failed: u64,
}

/// Snapshot of overall service state.
#[derive(Debug, Clone, Serialize)]
pub struct ServiceStatus {
    pub running: bool,
    pub checking: bool,
    pub global_action_in_progress: bool,
    pub enabled: bool,
    pub queue: QueueStats,
    pub last_global_check: Option<DateTime<Utc>>,
}
