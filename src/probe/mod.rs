//! Stream probing
//!
//! Inspects a stream URL with ffprobe/ffmpeg subprocesses and condenses the
//! findings into a [`ProbeReport`]: codecs, resolution, frame rate,
//! measured bitrate, frame drop counters, interlace status and critical
//! provider-side error flags. Every subprocess call runs under a hard
//! timeout; a probe never fails the caller, it reports what it could learn.

pub mod throttle;

use async_trait::async_trait;
use chrono::Utc;
use regex::Regex;
use std::process::Stdio;
use std::time::Duration;
use tokio::process::Command;
use tracing::{debug, info, warn};

use crate::config::StreamAnalysisConfig;
use crate::errors::ProbeError;
use crate::models::{CriticalErrors, Interlacing, ProbeReport, ProbeStatus, Resolution, Stream};

/// Extra headroom on top of the analysis window for ffmpeg startup,
/// network latency and shutdown.
const TRANSFER_TIMEOUT_BUFFER_SECS: u64 = 10;

/// Duration of the critical-error transcode pass.
const CRITICAL_CHECK_DURATION_SECS: u64 = 20;

#[async_trait]
pub trait StreamProber: Send + Sync {
    /// Probe a stream, retrying per the analysis options. Failures are
    /// encoded in the returned report's status and error flags.
    async fn probe(&self, stream: &Stream, options: &StreamAnalysisConfig) -> ProbeReport;
}

/// Probes streams by shelling out to ffprobe and ffmpeg.
pub struct FfmpegProber {
    ffmpeg_command: String,
    ffprobe_command: String,
}

impl Default for FfmpegProber {
    fn default() -> Self {
        Self::new()
    }
}

impl FfmpegProber {
    pub fn new() -> Self {
        Self {
            ffmpeg_command: "ffmpeg".to_string(),
            ffprobe_command: "ffprobe".to_string(),
        }
    }

    pub fn with_commands(ffmpeg_command: String, ffprobe_command: String) -> Self {
        Self {
            ffmpeg_command,
            ffprobe_command,
        }
    }

    /// Verify ffmpeg and ffprobe are runnable.
    pub async fn ensure_tools(&self) -> Result<(), ProbeError> {
        for tool in [&self.ffmpeg_command, &self.ffprobe_command] {
            self.run_tool(tool, &["-version".to_string()], Duration::from_secs(10))
                .await?;
        }
        Ok(())
    }

    async fn run_tool(
        &self,
        tool: &str,
        args: &[String],
        timeout: Duration,
    ) -> Result<std::process::Output, ProbeError> {
        let mut cmd = Command::new(tool);
        cmd.args(args);
        cmd.stdin(Stdio::null());
        cmd.stdout(Stdio::piped());
        cmd.stderr(Stdio::piped());
        cmd.kill_on_drop(true);

        let output = tokio::time::timeout(timeout, cmd.output())
            .await
            .map_err(|_| ProbeError::timeout(tool, timeout.as_secs()))?
            .map_err(|e| ProbeError::spawn(tool, e.to_string()))?;
        Ok(output)
    }

    /// Codec, resolution and frame rate via ffprobe.
    async fn media_info(&self, url: &str, timeout: Duration) -> Result<MediaInfo, ProbeError> {
        let args = vec![
            "-v".to_string(),
            "error".to_string(),
            "-show_entries".to_string(),
            "stream=codec_type,codec_name,width,height,avg_frame_rate".to_string(),
            "-of".to_string(),
            "json".to_string(),
            url.to_string(),
        ];
        let output = self.run_tool(&self.ffprobe_command, &args, timeout).await?;
        let stdout = String::from_utf8_lossy(&output.stdout);
        parse_media_info(&stdout).map_err(|e| ProbeError::parse_failed("ffprobe", e))
    }

    /// Measured bitrate and frame statistics from a timed ffmpeg read.
    ///
    /// ffmpeg runs with `-re`, so it reads at real time and the call takes
    /// at least the analysis duration.
    async fn transfer_stats(
        &self,
        url: &str,
        options: &StreamAnalysisConfig,
    ) -> Result<TransferStats, ProbeError> {
        let args = vec![
            "-re".to_string(),
            "-v".to_string(),
            "debug".to_string(),
            "-user_agent".to_string(),
            options.user_agent.clone(),
            "-i".to_string(),
            url.to_string(),
            "-t".to_string(),
            options.ffmpeg_duration_secs.to_string(),
            "-f".to_string(),
            "null".to_string(),
            "-".to_string(),
        ];
        let timeout = Duration::from_secs(
            options.timeout_secs + options.ffmpeg_duration_secs + TRANSFER_TIMEOUT_BUFFER_SECS,
        );
        let output = self.run_tool(&self.ffmpeg_command, &args, timeout).await?;
        let stderr = String::from_utf8_lossy(&output.stderr);
        Ok(parse_transfer_stats(&stderr, options.ffmpeg_duration_secs))
    }

    /// Interlace detection with ffmpeg's idet filter.
    async fn interlace_status(
        &self,
        url: &str,
        options: &StreamAnalysisConfig,
    ) -> Result<Interlacing, ProbeError> {
        let args = vec![
            "-user_agent".to_string(),
            options.user_agent.clone(),
            "-analyzeduration".to_string(),
            "5000000".to_string(),
            "-probesize".to_string(),
            "5000000".to_string(),
            "-i".to_string(),
            url.to_string(),
            "-vf".to_string(),
            "idet".to_string(),
            "-frames:v".to_string(),
            options.idet_frames.to_string(),
            "-an".to_string(),
            "-f".to_string(),
            "null".to_string(),
            "-".to_string(),
        ];
        let timeout = Duration::from_secs(options.timeout_secs);
        let output = self.run_tool(&self.ffmpeg_command, &args, timeout).await?;
        let stderr = String::from_utf8_lossy(&output.stderr);
        Ok(parse_idet_counts(&stderr))
    }

    /// A short transcode pass that surfaces provider-side problems the
    /// plain read does not: slice decode errors, timestamp discontinuities
    /// and connection timeouts.
    async fn critical_errors(&self, url: &str, options: &StreamAnalysisConfig) -> CriticalErrors {
        let args = vec![
            "-probesize".to_string(),
            "500000".to_string(),
            "-analyzeduration".to_string(),
            "1000000".to_string(),
            "-fflags".to_string(),
            "+genpts+discardcorrupt".to_string(),
            "-flags".to_string(),
            "low_delay".to_string(),
            "-avoid_negative_ts".to_string(),
            "make_zero".to_string(),
            "-timeout".to_string(),
            "5000000".to_string(),
            "-rw_timeout".to_string(),
            "5000000".to_string(),
            "-user_agent".to_string(),
            options.user_agent.clone(),
            "-i".to_string(),
            url.to_string(),
            "-t".to_string(),
            CRITICAL_CHECK_DURATION_SECS.to_string(),
            "-map".to_string(),
            "0:v:0".to_string(),
            "-map".to_string(),
            "0:a:0?".to_string(),
            "-c:v".to_string(),
            "libx265".to_string(),
            "-preset".to_string(),
            "veryfast".to_string(),
            "-c:a".to_string(),
            "aac".to_string(),
            "-b:a".to_string(),
            "128k".to_string(),
            "-f".to_string(),
            "null".to_string(),
            "-".to_string(),
        ];
        let timeout = Duration::from_secs(options.timeout_secs);
        match self.run_tool(&self.ffmpeg_command, &args, timeout).await {
            Ok(output) => {
                let stderr = String::from_utf8_lossy(&output.stderr);
                detect_critical_errors(&stderr)
            }
            Err(e) => {
                warn!("Critical error check failed: {}", e);
                CriticalErrors {
                    timeout: true,
                    ..Default::default()
                }
            }
        }
    }

    async fn probe_once(&self, stream: &Stream, options: &StreamAnalysisConfig) -> ProbeReport {
        let mut report = ProbeReport {
            probed_at: Utc::now(),
            ..Default::default()
        };
        let url = &stream.url;
        let timeout = Duration::from_secs(options.timeout_secs);

        match self.media_info(url, timeout).await {
            Ok(info) => {
                report.video_codec = info.video_codec;
                report.audio_codec = info.audio_codec;
                report.resolution = info.resolution;
                report.fps = info.fps;
                debug!(
                    "Media info for '{}': {:?} {} @ {} fps",
                    stream.name, report.video_codec, report.resolution, report.fps
                );
            }
            Err(e) => warn!("No media info for '{}': {}", stream.name, e),
        }

        match self.transfer_stats(url, options).await {
            Ok(stats) => {
                report.bitrate_kbps = stats.bitrate_kbps;
                report.frames_decoded = stats.frames_decoded;
                report.frames_dropped = stats.frames_dropped;
                report.status = ProbeStatus::Ok;
            }
            Err(ProbeError::Timeout { .. }) => report.status = ProbeStatus::Timeout,
            Err(e) => {
                warn!("Transfer analysis failed for '{}': {}", stream.name, e);
                report.status = ProbeStatus::Error;
            }
        }

        // Interlace detection is skipped when the stream already failed.
        if report.status.is_ok() {
            match self.interlace_status(url, options).await {
                Ok(status) => report.interlacing = status,
                Err(e) => warn!("Interlace check failed for '{}': {}", stream.name, e),
            }
        }

        report.errors = self.critical_errors(url, options).await;

        report
    }
}

#[async_trait]
impl StreamProber for FfmpegProber {
    async fn probe(&self, stream: &Stream, options: &StreamAnalysisConfig) -> ProbeReport {
        if stream.url.is_empty() {
            warn!("Stream '{}' (id {}) has no URL", stream.name, stream.id);
            return ProbeReport {
                status: ProbeStatus::Error,
                ..Default::default()
            };
        }

        let mut report = self.probe_once(stream, options).await;
        for attempt in 1..=options.retries {
            if report.status.is_ok() {
                break;
            }
            info!(
                "Stream '{}' failed with status '{}', retrying in {}s ({}/{})",
                stream.name, report.status, options.retry_delay_secs, attempt, options.retries
            );
            tokio::time::sleep(Duration::from_secs(options.retry_delay_secs)).await;
            report = self.probe_once(stream, options).await;
        }
        report
    }
}

struct MediaInfo {
    video_codec: Option<String>,
    audio_codec: Option<String>,
    resolution: Resolution,
    fps: f64,
}

struct TransferStats {
    bitrate_kbps: Option<f64>,
    frames_decoded: Option<u64>,
    frames_dropped: Option<u64>,
}

/// Parse ffprobe's JSON stream listing: the first stream carrying a width
/// is the video stream, the first without one is audio.
fn parse_media_info(stdout: &str) -> Result<MediaInfo, String> {
    let mut info = MediaInfo {
        video_codec: None,
        audio_codec: None,
        resolution: Resolution::default(),
        fps: 0.0,
    };
    if stdout.trim().is_empty() {
        return Ok(info);
    }

    let data: serde_json::Value = serde_json::from_str(stdout).map_err(|e| e.to_string())?;
    let streams = match data.get("streams").and_then(|v| v.as_array()) {
        Some(streams) => streams,
        None => return Ok(info),
    };

    for stream in streams {
        let codec_name = stream
            .get("codec_name")
            .and_then(|v| v.as_str())
            .map(|s| s.to_string());
        let width = stream.get("width").and_then(|v| v.as_u64());
        if let Some(width) = width {
            if info.video_codec.is_none() {
                info.video_codec = codec_name;
                let height = stream.get("height").and_then(|v| v.as_u64()).unwrap_or(0);
                info.resolution = Resolution::new(width as u32, height as u32);
                info.fps = stream
                    .get("avg_frame_rate")
                    .and_then(|v| v.as_str())
                    .map(parse_frame_rate)
                    .unwrap_or(0.0);
            }
        } else if info.audio_codec.is_none() {
            info.audio_codec = codec_name;
        }
    }

    Ok(info)
}

/// Parse an "num/den" average frame rate, rounded to two decimals.
fn parse_frame_rate(rate: &str) -> f64 {
    let Some((num, den)) = rate.split_once('/') else {
        return rate.trim().parse().unwrap_or(0.0);
    };
    let num: f64 = num.trim().parse().unwrap_or(0.0);
    let den: f64 = den.trim().parse().unwrap_or(0.0);
    if den == 0.0 {
        return 0.0;
    }
    ((num / den) * 100.0).round() / 100.0
}

/// Extract the transfer bitrate and frame counters from ffmpeg's debug
/// stderr. Bitrate comes from the "Statistics: N bytes read" line divided
/// over the analysis window; decode errors count as dropped frames.
fn parse_transfer_stats(stderr: &str, duration_secs: u64) -> TransferStats {
    let mut stats = TransferStats {
        bitrate_kbps: None,
        frames_decoded: None,
        frames_dropped: None,
    };

    let bytes_re = Regex::new(r"(\d+)\s*bytes read").ok();
    let decoded_re = Regex::new(r"(\d+)\s*frames decoded").ok();
    let errors_re = Regex::new(r"(\d+)\s*decode errors").ok();

    for line in stderr.lines() {
        if line.contains("Statistics:") {
            if let Some(caps) = bytes_re.as_ref().and_then(|re| re.captures(line)) {
                if let Ok(total_bytes) = caps[1].parse::<u64>() {
                    if total_bytes > 0 && duration_secs > 0 {
                        stats.bitrate_kbps =
                            Some((total_bytes as f64 * 8.0) / 1000.0 / duration_secs as f64);
                    }
                }
            }
        }
        if line.contains("Input stream #") && line.contains("frames decoded") {
            if let Some(caps) = decoded_re.as_ref().and_then(|re| re.captures(line)) {
                stats.frames_decoded = caps[1].parse().ok();
            }
            if let Some(caps) = errors_re.as_ref().and_then(|re| re.captures(line)) {
                stats.frames_dropped = caps[1].parse().ok();
            }
        }
    }

    stats
}

/// Tally idet's frame detection counters and call the majority.
fn parse_idet_counts(stderr: &str) -> Interlacing {
    let tff_re = Regex::new(r"TFF:\s*(\d+)").ok();
    let bff_re = Regex::new(r"BFF:\s*(\d+)").ok();
    let progressive_re = Regex::new(r"Progressive:\s*(\d+)").ok();

    let mut interlaced: u64 = 0;
    let mut progressive: u64 = 0;

    for line in stderr.lines() {
        if !line.contains("Single frame detection:") && !line.contains("Multi frame detection:") {
            continue;
        }
        if let Some(caps) = tff_re.as_ref().and_then(|re| re.captures(line)) {
            interlaced += caps[1].parse::<u64>().unwrap_or(0);
        }
        if let Some(caps) = bff_re.as_ref().and_then(|re| re.captures(line)) {
            interlaced += caps[1].parse::<u64>().unwrap_or(0);
        }
        if let Some(caps) = progressive_re.as_ref().and_then(|re| re.captures(line)) {
            progressive += caps[1].parse::<u64>().unwrap_or(0);
        }
    }

    if interlaced > progressive {
        Interlacing::Interlaced
    } else if progressive > interlaced {
        Interlacing::Progressive
    } else {
        Interlacing::Unknown
    }
}

/// Scan transcode stderr for the known critical-error markers.
fn detect_critical_errors(stderr: &str) -> CriticalErrors {
    CriticalErrors {
        decode: stderr.contains("decode_slice_header error"),
        discontinuity: stderr.contains("timestamp discontinuity"),
        timeout: stderr.contains("Connection timed out"),
    }
}
