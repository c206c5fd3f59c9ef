//! Service configuration
//!
//! Configuration is a typed struct loaded from a TOML file; a default file
//! is written on first start. Live updates arrive as a [`ConfigPatch`]
//! (every field optional, nested sections merged recursively) so settings
//! can be applied without a restart.

use anyhow::Result;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    pub api: ApiConfig,
    pub storage: StorageConfig,
    pub checker: CheckerConfig,
}

/// Connection settings for the external media proxy.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApiConfig {
    pub base_url: String,
    pub token: Option<String>,
    pub request_timeout_secs: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageConfig {
    /// Directory holding the durable tracker and dead-stream state files.
    pub state_dir: PathBuf,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CheckerConfig {
    pub enabled: bool,
    pub pipeline_mode: PipelineMode,
    /// Seconds the scheduler loop sleeps between wake-ups when untriggered.
    pub poll_interval_secs: u64,
    /// Delay before re-fetching a channel to verify a reorder landed.
    pub reorder_settle_delay_ms: u64,
    pub global_check_schedule: GlobalScheduleConfig,
    pub stream_analysis: StreamAnalysisConfig,
    pub scoring: ScoringConfig,
    pub queue: QueueConfig,
}

/// What the automation is allowed to do.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PipelineMode {
    /// No automation at all.
    Disabled,
    /// Check channels when their playlist updates; no scheduled sweep.
    CheckOnUpdate,
    /// Check on update plus the scheduled global sweep.
    CheckOnUpdateScheduled,
    /// Playlist refresh handling only; never checks on update.
    RefreshOnly,
    /// Playlist refresh handling plus the scheduled global sweep.
    RefreshScheduled,
    /// Only the scheduled global sweep.
    ScheduledOnly,
}

impl PipelineMode {
    pub fn checks_on_update(&self) -> bool {
        matches!(
            self,
            PipelineMode::CheckOnUpdate | PipelineMode::CheckOnUpdateScheduled
        )
    }

    pub fn has_scheduled_global_action(&self) -> bool {
        matches!(
            self,
            PipelineMode::CheckOnUpdateScheduled
                | PipelineMode::RefreshScheduled
                | PipelineMode::ScheduledOnly
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ScheduleFrequency {
    Daily,
    Monthly,
}

/// Off-peak window for the fleet-wide sweep.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GlobalScheduleConfig {
    pub enabled: bool,
    pub frequency: ScheduleFrequency,
    pub hour: u32,
    pub minute: u32,
    /// Day of month for monthly frequency (1-31).
    pub day_of_month: u32,
    /// On a fresh start with no recorded sweep, only run when within this
    /// many minutes of the scheduled time.
    pub fresh_start_tolerance_minutes: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StreamAnalysisConfig {
    /// Seconds of stream to read when measuring bitrate and frame stats.
    pub ffmpeg_duration_secs: u64,
    /// Frames to inspect for interlace detection.
    pub idet_frames: u32,
    /// Timeout per analysis operation.
    pub timeout_secs: u64,
    pub retries: u32,
    pub retry_delay_secs: u64,
    pub user_agent: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScoringConfig {
    pub weights: ScoringWeights,
    pub prefer_h265: bool,
    pub penalize_interlaced: bool,
    pub penalize_dropped_frames: bool,
}

/// Relative component weights; not required to sum to 1.0.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScoringWeights {
    pub bitrate: f64,
    pub resolution: f64,
    pub fps: f64,
    pub codec: f64,
    pub errors: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueueConfig {
    pub max_size: usize,
    /// Cap on channels drained from the tracker per scheduler wake-up.
    pub max_channels_per_run: usize,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            api: ApiConfig {
                base_url: "http://localhost:9191".to_string(),
                token: None,
                request_timeout_secs: 30,
            },
            storage: StorageConfig {
                state_dir: PathBuf::from("./data"),
            },
            checker: CheckerConfig {
                enabled: true,
                pipeline_mode: PipelineMode::CheckOnUpdateScheduled,
                poll_interval_secs: 60,
                reorder_settle_delay_ms: 500,
                global_check_schedule: GlobalScheduleConfig {
                    enabled: true,
                    frequency: ScheduleFrequency::Daily,
                    hour: 3,
                    minute: 0,
                    day_of_month: 1,
                    fresh_start_tolerance_minutes: 10,
                },
                stream_analysis: StreamAnalysisConfig {
                    ffmpeg_duration_secs: 30,
                    idet_frames: 500,
                    timeout_secs: 30,
                    retries: 1,
                    retry_delay_secs: 10,
                    user_agent: "VLC/3.0.14".to_string(),
                },
                scoring: ScoringConfig {
                    weights: ScoringWeights {
                        bitrate: 0.30,
                        resolution: 0.25,
                        fps: 0.15,
                        codec: 0.10,
                        errors: 0.20,
                    },
                    prefer_h265: true,
                    penalize_interlaced: true,
                    penalize_dropped_frames: true,
                },
                queue: QueueConfig {
                    max_size: 1000,
                    max_channels_per_run: 50,
                },
            },
        }
    }
}

impl Config {
    pub fn load(path: &Path) -> Result<Self> {
        if path.exists() {
            let contents = std::fs::read_to_string(path)?;
            Ok(toml::from_str(&contents)?)
        } else {
            let default_config = Self::default();
            default_config.save(path)?;
            Ok(default_config)
        }
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let contents = toml::to_string_pretty(self)?;
        std::fs::write(path, contents)?;
        Ok(())
    }

    /// Deep-merge a partial update into the live configuration.
    pub fn apply_patch(&mut self, patch: &ConfigPatch) {
        if let Some(api) = &patch.api {
            merge_field(&mut self.api.base_url, &api.base_url);
            if let Some(token) = &api.token {
                self.api.token = token.clone();
            }
            merge_field(&mut self.api.request_timeout_secs, &api.request_timeout_secs);
        }
        if let Some(checker) = &patch.checker {
            merge_field(&mut self.checker.enabled, &checker.enabled);
            merge_field(&mut self.checker.pipeline_mode, &checker.pipeline_mode);
            merge_field(&mut self.checker.poll_interval_secs, &checker.poll_interval_secs);
            merge_field(
                &mut self.checker.reorder_settle_delay_ms,
                &checker.reorder_settle_delay_ms,
            );
            if let Some(schedule) = &checker.global_check_schedule {
                let target = &mut self.checker.global_check_schedule;
                merge_field(&mut target.enabled, &schedule.enabled);
                merge_field(&mut target.frequency, &schedule.frequency);
                merge_field(&mut target.hour, &schedule.hour);
                merge_field(&mut target.minute, &schedule.minute);
                merge_field(&mut target.day_of_month, &schedule.day_of_month);
                merge_field(
                    &mut target.fresh_start_tolerance_minutes,
                    &schedule.fresh_start_tolerance_minutes,
                );
            }
            if let Some(analysis) = &checker.stream_analysis {
                let target = &mut self.checker.stream_analysis;
                merge_field(&mut target.ffmpeg_duration_secs, &analysis.ffmpeg_duration_secs);
                merge_field(&mut target.idet_frames, &analysis.idet_frames);
                merge_field(&mut target.timeout_secs, &analysis.timeout_secs);
                merge_field(&mut target.retries, &analysis.retries);
                merge_field(&mut target.retry_delay_secs, &analysis.retry_delay_secs);
                if let Some(user_agent) = &analysis.user_agent {
                    target.user_agent = sanitize_user_agent(user_agent);
                }
            }
            if let Some(scoring) = &checker.scoring {
                let target = &mut self.checker.scoring;
                if let Some(weights) = &scoring.weights {
                    merge_field(&mut target.weights.bitrate, &weights.bitrate);
                    merge_field(&mut target.weights.resolution, &weights.resolution);
                    merge_field(&mut target.weights.fps, &weights.fps);
                    merge_field(&mut target.weights.codec, &weights.codec);
                    merge_field(&mut target.weights.errors, &weights.errors);
                }
                merge_field(&mut target.prefer_h265, &scoring.prefer_h265);
                merge_field(&mut target.penalize_interlaced, &scoring.penalize_interlaced);
                merge_field(
                    &mut target.penalize_dropped_frames,
                    &scoring.penalize_dropped_frames,
                );
            }
            if let Some(queue) = &checker.queue {
                merge_field(&mut self.checker.queue.max_size, &queue.max_size);
                merge_field(
                    &mut self.checker.queue.max_channels_per_run,
                    &queue.max_channels_per_run,
                );
            }
        }
    }
}

fn merge_field<T: Clone>(target: &mut T, source: &Option<T>) {
    if let Some(value) = source {
        *target = value.clone();
    }
}

/// Restrict a user agent to a safe character set and a sane length.
fn sanitize_user_agent(user_agent: &str) -> String {
    let sanitized: String = user_agent
        .chars()
        .filter(|c| {
            c.is_ascii_alphanumeric() || " ./_-()".contains(*c)
        })
        .take(200)
        .collect();
    let sanitized = sanitized.trim().to_string();
    if sanitized.is_empty() {
        "VLC/3.0.14".to_string()
    } else {
        sanitized
    }
}

/// Partial configuration update; absent fields keep their current value.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ConfigPatch {
    pub api: Option<ApiPatch>,
    pub checker: Option<CheckerPatch>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct ApiPatch {
    pub base_url: Option<String>,
    pub token: Option<Option<String>>,
    pub request_timeout_secs: Option<u64>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct CheckerPatch {
    pub enabled: Option<bool>,
    pub pipeline_mode: Option<PipelineMode>,
    pub poll_interval_secs: Option<u64>,
    pub reorder_settle_delay_ms: Option<u64>,
    pub global_check_schedule: Option<GlobalSchedulePatch>,
    pub stream_analysis: Option<StreamAnalysisPatch>,
    pub scoring: Option<ScoringPatch>,
    pub queue: Option<QueuePatch>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct GlobalSchedulePatch {
    pub enabled: Option<bool>,
    pub frequency: Option<ScheduleFrequency>,
    pub hour: Option<u32>,
    pub minute: Option<u32>,
    pub day_of_month: Option<u32>,
    pub fresh_start_tolerance_minutes: Option<i64>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct StreamAnalysisPatch {
    pub ffmpeg_duration_secs: Option<u64>,
    pub idet_frames: Option<u32>,
    pub timeout_secs: Option<u64>,
    pub retries: Option<u32>,
    pub retry_delay_secs: Option<u64>,
    pub user_agent: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct ScoringPatch {
    pub weights: Option<ScoringWeightsPatch>,
    pub prefer_h265: Option<bool>,
    pub penalize_interlaced: Option<bool>,
    pub penalize_dropped_frames: Option<bool>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct ScoringWeightsPatch {
    pub bitrate: Option<f64>,
    pub resolution: Option<f64>,
    pub fps: Option<f64>,
    pub codec: Option<f64>,
    pub errors: Option<f64>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct QueuePatch {
    pub max_size: Option<usize>,
    pub max_channels_per_run: Option<usize>,
}
