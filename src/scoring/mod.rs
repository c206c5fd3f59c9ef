//! Stream quality scoring
//!
//! Converts a probe report into a single weighted score. Scoring is a pure
//! function of the report and the configured weights: identical inputs
//! always produce the identical score, and scores are never persisted so
//! weight changes take effect on the next check.

use crate::config::ScoringConfig;
use crate::models::{Interlacing, ProbeReport, ScoredStream};
use std::cmp::Ordering;

/// Sentinel below every computable score. A stream without a usable bitrate
/// measurement is dead and must sort after all scored streams.
pub const DEAD_STREAM_SCORE: f64 = -1.0;

/// Bitrate at which the bitrate component saturates.
const BITRATE_CEILING_KBPS: f64 = 8000.0;

/// Frame rate at which the fps component saturates.
const FPS_CEILING: f64 = 60.0;

/// Dropped-frame ratio below which no penalty applies.
const DROP_RATE_THRESHOLD: f64 = 0.01;

pub struct Scorer {
    config: ScoringConfig,
}

impl Scorer {
    pub fn new(config: ScoringConfig) -> Self {
        Self { config }
    }

    /// Score a probe report, rounded to two decimals.
    ///
    /// Components are clamped to [0, 1] before weighting; the weights are
    /// relative and need not sum to 1.0.
    pub fn score(&self, report: &ProbeReport) -> f64 {
        if !report.has_usable_bitrate() {
            return DEAD_STREAM_SCORE;
        }

        let weights = &self.config.weights;
        let score = self.bitrate_component(report) * weights.bitrate
            + self.resolution_component(report) * weights.resolution
            + self.fps_component(report) * weights.fps
            + self.codec_component(report) * weights.codec
            + self.error_component(report) * weights.errors;

        (score * 100.0).round() / 100.0
    }

    fn bitrate_component(&self, report: &ProbeReport) -> f64 {
        match report.bitrate_kbps {
            Some(kbps) if kbps > 0.0 => (kbps / BITRATE_CEILING_KBPS).min(1.0),
            _ => 0.0,
        }
    }

    /// Step function on vertical resolution.
    fn resolution_component(&self, report: &ProbeReport) -> f64 {
        if !report.resolution.is_known() {
            return 0.0;
        }
        match report.resolution.height {
            h if h >= 1080 => 1.0,
            h if h >= 720 => 0.7,
            h if h >= 576 => 0.5,
            _ => 0.3,
        }
    }

    fn fps_component(&self, report: &ProbeReport) -> f64 {
        if report.fps > 0.0 {
            (report.fps / FPS_CEILING).min(1.0)
        } else {
            0.0
        }
    }

    fn codec_component(&self, report: &ProbeReport) -> f64 {
        let codec = match &report.video_codec {
            Some(codec) => codec.to_lowercase(),
            None => return 0.0,
        };
        if codec.contains("h265") || codec.contains("hevc") {
            if self.config.prefer_h265 { 1.0 } else { 0.8 }
        } else if codec.contains("h264") || codec.contains("avc") {
            if self.config.prefer_h265 { 0.8 } else { 1.0 }
        } else if !codec.is_empty() && codec != "n/a" {
            0.5
        } else {
            0.0
        }
    }

    /// Starts at 1.0 and loses fixed penalties per observed problem.
    fn error_component(&self, report: &ProbeReport) -> f64 {
        let mut component = 1.0;
        if !report.status.is_ok() {
            component -= 0.5;
        }
        if report.errors.decode {
            component -= 0.2;
        }
        if report.errors.discontinuity {
            component -= 0.2;
        }
        if report.errors.timeout {
            component -= 0.3;
        }
        if self.config.penalize_interlaced && report.interlacing == Interlacing::Interlaced {
            component -= 0.1;
        }
        if self.config.penalize_dropped_frames {
            if let (Some(dropped), Some(decoded)) = (report.frames_dropped, report.frames_decoded)
            {
                if decoded > 0 {
                    let drop_rate = dropped as f64 / decoded as f64;
                    if drop_rate > DROP_RATE_THRESHOLD {
                        component -= (drop_rate * 5.0).min(0.3);
                    }
                }
            }
        }
        component.max(0.0)
    }
}

/// Stable sort by score descending: equal scores keep their original
/// relative order.
pub fn sort_by_score(streams: &mut [ScoredStream]) {
    streams.sort_by(|a, b| b.score.partial_cmp(&a.score).unwrap_or(Ordering::Equal));
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use crate::models::{CriticalErrors, ProbeStatus, Resolution};

    fn scorer() -> Scorer {
        Scorer::new(Config::default().checker.scoring)
    }

    fn healthy_report() -> ProbeReport {
        ProbeReport {
            video_codec: Some("hevc".to_string()),
            audio_codec: Some("aac".to_string()),
            resolution: Resolution::new(1920, 1080),
            fps: 60.0,
            bitrate_kbps: Some(8000.0),
            frames_decoded: Some(1500),
            frames_dropped: Some(0),
            status: ProbeStatus::Ok,
            ..Default::default()
        }
    }

    #[test]
    fn perfect_stream_scores_full_weight_sum() {
        // All components saturate, so the score equals the weight total.
        assert_eq!(scorer().score(&healthy_report()), 1.0);
    }

    #[test]
    fn scoring_is_deterministic() {
        let report = healthy_report();
        let scorer = scorer();
        let first = scorer.score(&report);
        for _ in 0..10 {
            assert_eq!(scorer.score(&report), first);
        }
    }

    #[test]
    fn missing_bitrate_hits_dead_stream_floor() {
        let mut report = healthy_report();
        report.bitrate_kbps = None;
        assert_eq!(scorer().score(&report), DEAD_STREAM_SCORE);

        report.bitrate_kbps = Some(0.0);
        assert_eq!(scorer().score(&report), DEAD_STREAM_SCORE);
    }

    #[test]
    fn dead_stream_ranks_below_any_scored_stream() {
        // Worst possible live stream: minimal bitrate, unknown everything,
        // failed status with every error flag set.
        let worst = ProbeReport {
            bitrate_kbps: Some(1.0),
            status: ProbeStatus::Error,
            errors: CriticalErrors {
                decode: true,
                discontinuity: true,
                timeout: true,
            },
            ..Default::default()
        };
        assert!(scorer().score(&worst) > DEAD_STREAM_SCORE);
    }

    #[test]
    fn resolution_steps() {
        let scorer = scorer();
        let mut report = healthy_report();

        report.resolution = Resolution::new(1280, 720);
        let hd = scorer.score(&report);
        report.resolution = Resolution::new(1920, 1080);
        let full_hd = scorer.score(&report);
        report.resolution = Resolution::new(720, 576);
        let sd = scorer.score(&report);
        report.resolution = Resolution::new(640, 360);
        let low = scorer.score(&report);
        report.resolution = Resolution::default();
        let unknown = scorer.score(&report);

        assert!(full_hd > hd && hd > sd && sd > low && low > unknown);
    }

    #[test]
    fn status_and_error_penalties_reduce_score() {
        let scorer = scorer();
        let clean = scorer.score(&healthy_report());

        let mut report = healthy_report();
        report.status = ProbeStatus::Timeout;
        let failed = scorer.score(&report);
        assert_eq!(failed, clean - 0.5 * 0.20);

        report.errors.decode = true;
        report.errors.discontinuity = true;
        report.errors.timeout = true;
        let all_errors = scorer.score(&report);
        assert!(all_errors < failed);
        // The error component floors at zero rather than going negative.
        assert_eq!(all_errors, clean - 1.0 * 0.20);
    }

    #[test]
    fn interlace_penalty_is_configurable() {
        let mut report = healthy_report();
        report.interlacing = Interlacing::Interlaced;

        let penalizing = scorer();
        assert_eq!(penalizing.score(&report), 1.0 - 0.1 * 0.20);

        let mut config = Config::default().checker.scoring;
        config.penalize_interlaced = false;
        let lenient = Scorer::new(config);
        assert_eq!(lenient.score(&report), 1.0);
    }

    #[test]
    fn dropped_frame_penalty_kicks_in_above_one_percent() {
        let scorer = scorer();

        let mut report = healthy_report();
        report.frames_decoded = Some(1000);
        report.frames_dropped = Some(5);
        assert_eq!(scorer.score(&report), 1.0);

        report.frames_dropped = Some(40);
        // 4% dropped: penalty 0.04 * 5 = 0.2 on the error component.
        assert_eq!(scorer.score(&report), 1.0 - 0.2 * 0.20);

        report.frames_dropped = Some(900);
        // Penalty caps at 0.3.
        assert_eq!(scorer.score(&report), 1.0 - 0.3 * 0.20);
    }

    #[test]
    fn codec_preference_flips_with_config() {
        let scorer = scorer();
        let mut report = healthy_report();

        report.video_codec = Some("h264".to_string());
        let h264 = scorer.score(&report);
        report.video_codec = Some("hevc".to_string());
        let hevc = scorer.score(&report);
        assert!(hevc > h264);

        let mut config = Config::default().checker.scoring;
        config.prefer_h265 = false;
        let h264_first = Scorer::new(config);
        report.video_codec = Some("h264".to_string());
        let h264 = h264_first.score(&report);
        report.video_codec = Some("hevc".to_string());
        let hevc = h264_first.score(&report);
        assert!(h264 > hevc);

        report.video_codec = Some("mpeg2video".to_string());
        let other = scorer.score(&report);
        report.video_codec = None;
        let absent = scorer.score(&report);
        assert!(other > absent);
    }

    #[test]
    fn healthy_hd_stream_outranks_dead_stream() {
        let scorer = scorer();
        let good = ProbeReport {
            video_codec: Some("h264".to_string()),
            resolution: Resolution::new(1920, 1080),
            fps: 60.0,
            bitrate_kbps: Some(5000.0),
            status: ProbeStatus::Ok,
            ..Default::default()
        };
        let dead = ProbeReport {
            resolution: Resolution::default(),
            bitrate_kbps: Some(0.0),
            status: ProbeStatus::Ok,
            ..Default::default()
        };

        let good_score = scorer.score(&good);
        let dead_score = scorer.score(&dead);
        assert!(good_score > 0.8, "expected near-full score, got {good_score}");
        assert_eq!(dead_score, DEAD_STREAM_SCORE);
        assert!(good_score > dead_score);
    }

    #[test]
    fn sort_is_stable_for_equal_scores() {
        fn scored(id: i64, score: f64) -> ScoredStream {
            ScoredStream {
                stream_id: id,
                name: format!("stream {id}"),
                url: format!("http://example.com/{id}"),
                report: ProbeReport::default(),
                score,
            }
        }

        let mut streams = vec![
            scored(1, 0.5),
            scored(2, 0.9),
            scored(3, 0.5),
            scored(4, DEAD_STREAM_SCORE),
            scored(5, 0.5),
        ];
        sort_by_score(&mut streams);
        let order: Vec<i64> = streams.iter().map(|s| s.stream_id).collect();
        assert_eq!(order, vec![2, 1, 3, 5, 4]);
    }
}
