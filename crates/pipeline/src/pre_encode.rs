//! PreEncoder: the per-file decision core.
//!
//! Consumes a [`MediaInfo`], applies the skip rules, runs the quality-targeted
//! CRF search across candidate encoders, selects which streams survive and
//! with what directive, and produces an [`EncodePlan`] for the Encoder. The
//! chosen encoder/CRF pair is persisted to the state sidecar so an
//! interrupted run resumes without re-searching.

use av1_batch_config::Config;
use chrono::Local;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fs::OpenOptions;
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::format::human_size;
use crate::fsops::{move_file, unique_destination};
use crate::language::{LanguageClassifier, LanguageDetector};
use crate::paths::OutputPaths;
use crate::probe::{AudioStreamInfo, MediaInfo, SubtitleStreamInfo, VideoStreamInfo};
use crate::probe::normalize_language_tag;
use crate::state::{plan_fingerprint, EncodeState};
use crate::tools::Tools;

/// Error type for the pre-encode stage. Soft skips are not errors; they are
/// the [`PreEncodeOutcome::Skip`] variant.
#[derive(Debug, Error)]
pub enum PreEncodeError {
    /// No usable video stream in the input.
    #[error("no usable video streams")]
    NoStreams,

    /// No audio stream survived the language filter and audio is required.
    #[error("no suitable audio stream")]
    NoSuitableAudio,

    /// Every candidate encoder failed the CRF search.
    #[error("CRF search failed for all candidate encoders")]
    CrfSearchExhausted,

    /// IO error while persisting state or the skip ledger.
    #[error("IO error: {0}")]
    Io(#[from] io::Error),
}

impl PreEncodeError {
    /// Quarantine directory name for this error.
    pub fn kind(&self) -> &'static str {
        match self {
            PreEncodeError::NoStreams => "no_streams",
            PreEncodeError::NoSuitableAudio => "NoSuitableAudio",
            PreEncodeError::CrfSearchExhausted => "CrfSearchExhausted",
            PreEncodeError::Io(_) => "Io",
        }
    }
}

/// Why a file was skipped rather than encoded.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SkipReason {
    /// The container comment already carries the encoded sentinel.
    AlreadyEncoded,
    /// The filename carries an oversize marker from a previous run.
    OversizeMarker,
    /// Container bit-rate at or below the configured floor.
    BitRateBelowThreshold,
    /// Container format is blacklisted.
    UnsupportedContainer,
}

impl SkipReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            SkipReason::AlreadyEncoded => "already encoded",
            SkipReason::OversizeMarker => "oversize marker in filename",
            SkipReason::BitRateBelowThreshold => "bit-rate below threshold",
            SkipReason::UnsupportedContainer => "container format blacklisted",
        }
    }
}

impl std::fmt::Display for SkipReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Pipeline mode carried on the plan.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Mode {
    Video,
    AudioOnly,
    PhonePreset,
}

impl Mode {
    pub fn as_str(&self) -> &'static str {
        match self {
            Mode::Video => "video",
            Mode::AudioOnly => "audio_only",
            Mode::PhonePreset => "phone_preset",
        }
    }
}

/// Output container. The initial guess is MP4; the Encoder switches to MKV
/// when the container rejects a stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Container {
    Mp4,
    Mkv,
}

impl Container {
    pub fn extension(&self) -> &'static str {
        match self {
            Container::Mp4 => "mp4",
            Container::Mkv => "mkv",
        }
    }
}

/// Per-stream handling decision.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum StreamDirective {
    /// Pass the stream through untouched.
    Copy,
    /// Re-encode with the given codec and optional bit-rate.
    Reencode {
        codec: String,
        bitrate_bps: Option<u64>,
    },
}

/// A kept video stream with its capped output frame rate.
#[derive(Debug, Clone, PartialEq)]
pub struct PlannedVideo {
    pub stream: VideoStreamInfo,
    pub fps: f64,
}

/// A kept audio stream with its directive and the language that admitted it.
#[derive(Debug, Clone, PartialEq)]
pub struct PlannedAudio {
    pub stream: AudioStreamInfo,
    pub directive: StreamDirective,
    /// Tagged or detected language; cached so detection runs once per stream.
    pub resolved_language: String,
}

/// A kept subtitle stream with its directive for the initial container.
#[derive(Debug, Clone, PartialEq)]
pub struct PlannedSubtitle {
    pub stream: SubtitleStreamInfo,
    pub directive: StreamDirective,
}

/// Structured key/value record embedded in the output container's comment
/// field. The `comment` field is the exact sentinel skip rule 1 tests.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CommentPayload {
    pub comment: String,
    pub encoders: String,
    #[serde(rename = "CRF")]
    pub crf: u32,
    #[serde(rename = "source file")]
    pub source_file: String,
    #[serde(rename = "source file size")]
    pub source_file_size: String,
    #[serde(rename = "source file md5")]
    pub source_file_md5: String,
    #[serde(rename = "source file sha256")]
    pub source_file_sha256: String,
    #[serde(rename = "estimated ratio")]
    pub estimated_ratio: f64,
}

impl CommentPayload {
    /// Serialized form for `-metadata comment=…`: a compact key/value block.
    pub fn to_comment_text(&self) -> String {
        serde_yaml::to_string(self)
            .unwrap_or_default()
            .trim()
            .to_string()
    }
}

/// The product of pre-encoding, consumed exactly once by the Encoder.
#[derive(Debug, Clone, PartialEq)]
pub struct EncodePlan {
    pub mode: Mode,
    /// Chosen video encoder; empty iff the plan carries no video.
    pub video_encoder: String,
    pub video_crf: u32,
    /// CRF-search size estimate in (0, 1]; 1.0 when unknown.
    pub estimated_size_ratio: f64,
    pub video: Vec<PlannedVideo>,
    pub audio: Vec<PlannedAudio>,
    pub subtitles: Vec<PlannedSubtitle>,
    pub output_container: Container,
    pub comment_payload: CommentPayload,
    /// Total wall time spent in the CRF search.
    pub crf_search_elapsed: Duration,
}

/// Outcome of pre-encoding: a plan, or a soft skip already recorded in the
/// ledger and skip bucket.
#[derive(Debug)]
pub enum PreEncodeOutcome {
    Plan(Box<EncodePlan>),
    Skip(SkipReason),
}

/// Per-run flags that alter pre-encode decisions.
#[derive(Debug, Clone, Default)]
pub struct AnalyzeOptions {
    /// Fixed encoder/CRF, no search; also disables the oversize-marker skip.
    pub manual_mode: bool,
    /// Produce an audio-less plan instead of failing when no audio survives.
    pub allow_no_audio: bool,
    /// Scratch directory for the CRF search and language clips.
    pub temp_work_dir: Option<PathBuf>,
}

/// The decision core.
pub struct PreEncoder<'a> {
    cfg: &'a Config,
    tools: Arc<Tools>,
    paths: &'a OutputPaths,
    detector: LanguageDetector,
}

impl<'a> PreEncoder<'a> {
    pub fn new(cfg: &'a Config, tools: Arc<Tools>, paths: &'a OutputPaths) -> Self {
        let detector = LanguageDetector::new(tools.clone(), cfg.languages.clone());
        Self {
            cfg,
            tools,
            paths,
            detector,
        }
    }

    /// Replace the language classifier; used by tests.
    pub fn with_classifier(mut self, classifier: Arc<dyn LanguageClassifier>) -> Self {
        self.detector = LanguageDetector::with_classifier(
            self.tools.clone(),
            self.cfg.languages.clone(),
            classifier,
        );
        self
    }

    /// Analyze one probed video file: skip rules, stream selection, CRF
    /// search (or resume), sidecar persistence.
    pub fn analyze(
        &self,
        media: &MediaInfo,
        opts: &AnalyzeOptions,
    ) -> Result<PreEncodeOutcome, PreEncodeError> {
        if let Some(reason) = self.skip_reason(media, opts.manual_mode) {
            self.record_skip(media, reason)?;
            return Ok(PreEncodeOutcome::Skip(reason));
        }

        if media.video_streams.is_empty() {
            return Err(PreEncodeError::NoStreams);
        }

        let video = self.select_video_streams(media)?;
        let audio = self.select_audio_streams(media, opts)?;
        let subtitles = self.select_subtitle_streams(media);

        let fingerprint = plan_fingerprint(&media.md5, Mode::Video.as_str(), &self.cfg.video);
        let state_path = self.paths.state_path(&media.path);

        let (encoder, crf, estimated_ratio, search_elapsed) =
            if let Some(state) = EncodeState::load_matching(&state_path, &fingerprint) {
                info!(
                    file = %media.file_name(),
                    encoder = %state.encoder,
                    crf = state.crf,
                    "resuming with stored encoder/CRF, skipping CRF search"
                );
                (state.encoder, state.crf, 1.0, Duration::ZERO)
            } else if opts.manual_mode {
                let encoder = self
                    .cfg
                    .video
                    .encoders
                    .first()
                    .cloned()
                    .unwrap_or_default();
                (encoder, self.cfg.video.manual_crf, 1.0, Duration::ZERO)
            } else {
                match self.crf_search(media, opts.temp_work_dir.as_deref()) {
                    Ok(found) => found,
                    Err(PreEncodeError::CrfSearchExhausted)
                        if self.cfg.video.allow_manual_fallback =>
                    {
                        warn!(
                            file = %media.file_name(),
                            "CRF search exhausted, falling back to manual settings"
                        );
                        let encoder = self
                            .cfg
                            .video
                            .encoders
                            .first()
                            .cloned()
                            .unwrap_or_default();
                        (encoder, self.cfg.video.manual_crf, 1.0, Duration::ZERO)
                    }
                    Err(e) => return Err(e),
                }
            };

        EncodeState::new(fingerprint, encoder.clone(), crf).save(&state_path)?;

        let comment_payload = CommentPayload {
            comment: self.cfg.video.comment_sentinel.clone(),
            encoders: self.cfg.video.encoders.join(", "),
            crf,
            source_file: media.file_name(),
            source_file_size: human_size(media.size_bytes),
            source_file_md5: media.md5.clone(),
            source_file_sha256: media.sha256.clone(),
            estimated_ratio,
        };

        Ok(PreEncodeOutcome::Plan(Box::new(EncodePlan {
            mode: Mode::Video,
            video_encoder: encoder,
            video_crf: crf,
            estimated_size_ratio: estimated_ratio,
            video,
            audio,
            subtitles,
            output_container: Container::Mp4,
            comment_payload,
            crf_search_elapsed: search_elapsed,
        })))
    }

    /// Build an audio-only plan: every audio stream re-encoded to Opus at
    /// the fixed profile bit-rate.
    pub fn analyze_audio_only(
        &self,
        media: &MediaInfo,
    ) -> Result<PreEncodeOutcome, PreEncodeError> {
        if self.comment_is_sentinel(media) {
            self.record_skip(media, SkipReason::AlreadyEncoded)?;
            return Ok(PreEncodeOutcome::Skip(SkipReason::AlreadyEncoded));
        }
        if media.audio_streams.is_empty() {
            return Err(PreEncodeError::NoSuitableAudio);
        }

        let audio = media
            .audio_streams
            .iter()
            .map(|stream| PlannedAudio {
                stream: stream.clone(),
                directive: StreamDirective::Reencode {
                    codec: self.cfg.video.opus_encoder.clone(),
                    bitrate_bps: Some(self.cfg.audio.target_bitrate_bps),
                },
                resolved_language: stream.language.clone(),
            })
            .collect();

        let comment_payload = CommentPayload {
            comment: self.cfg.video.comment_sentinel.clone(),
            encoders: self.cfg.video.opus_encoder.clone(),
            crf: 0,
            source_file: media.file_name(),
            source_file_size: human_size(media.size_bytes),
            source_file_md5: media.md5.clone(),
            source_file_sha256: media.sha256.clone(),
            estimated_ratio: 1.0,
        };

        Ok(PreEncodeOutcome::Plan(Box::new(EncodePlan {
            mode: Mode::AudioOnly,
            video_encoder: String::new(),
            video_crf: 0,
            estimated_size_ratio: 1.0,
            video: Vec::new(),
            audio,
            subtitles: Vec::new(),
            output_container: Container::Mkv,
            comment_payload,
            crf_search_elapsed: Duration::ZERO,
        })))
    }

    /// Build a phone-preset plan: fixed bit-rates, scale and frame rate, no
    /// CRF search, default stream mapping.
    pub fn analyze_phone(&self, media: &MediaInfo) -> Result<PreEncodeOutcome, PreEncodeError> {
        if self.comment_is_sentinel(media) {
            self.record_skip(media, SkipReason::AlreadyEncoded)?;
            return Ok(PreEncodeOutcome::Skip(SkipReason::AlreadyEncoded));
        }
        if media.video_streams.is_empty() {
            return Err(PreEncodeError::NoStreams);
        }

        let encoder = self
            .cfg
            .video
            .encoders
            .first()
            .cloned()
            .unwrap_or_default();
        let comment_payload = CommentPayload {
            comment: self.cfg.video.comment_sentinel.clone(),
            encoders: encoder.clone(),
            crf: 0,
            source_file: media.file_name(),
            source_file_size: human_size(media.size_bytes),
            source_file_md5: media.md5.clone(),
            source_file_sha256: media.sha256.clone(),
            estimated_ratio: 1.0,
        };

        Ok(PreEncodeOutcome::Plan(Box::new(EncodePlan {
            mode: Mode::PhonePreset,
            video_encoder: encoder,
            video_crf: 0,
            estimated_size_ratio: 1.0,
            video: Vec::new(),
            audio: Vec::new(),
            subtitles: Vec::new(),
            output_container: Container::Mp4,
            comment_payload,
            crf_search_elapsed: Duration::ZERO,
        })))
    }

    fn comment_is_sentinel(&self, media: &MediaInfo) -> bool {
        let sentinel = &self.cfg.video.comment_sentinel;
        !sentinel.is_empty() && media.comment_tag.contains(sentinel)
    }

    /// First matching skip rule, or None when the file should be encoded.
    fn skip_reason(&self, media: &MediaInfo, manual_mode: bool) -> Option<SkipReason> {
        if self.comment_is_sentinel(media) {
            return Some(SkipReason::AlreadyEncoded);
        }

        if !manual_mode {
            let name = media.file_name();
            if self
                .cfg
                .video
                .oversize_markers
                .iter()
                .any(|marker| !marker.is_empty() && name.contains(marker))
            {
                return Some(SkipReason::OversizeMarker);
            }
        }

        if media.container_bitrate_bps <= self.cfg.video.bitrate_floor_bps {
            return Some(SkipReason::BitRateBelowThreshold);
        }

        let blacklisted = media
            .container_format
            .split(',')
            .map(str::trim)
            .any(|part| {
                self.cfg
                    .video
                    .container_blacklist
                    .iter()
                    .any(|b| b.eq_ignore_ascii_case(part))
            });
        if blacklisted {
            return Some(SkipReason::UnsupportedContainer);
        }

        None
    }

    /// Write the ledger entry and move the file into the skip bucket.
    fn record_skip(&self, media: &MediaInfo, reason: SkipReason) -> io::Result<()> {
        info!(file = %media.file_name(), reason = %reason, "skipping");

        let ledger = self.paths.skip_ledger();
        if let Some(parent) = ledger.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let line = format!(
            "{}\t{}\t{}\n",
            Local::now().format("%Y-%m-%d %H:%M:%S"),
            media.path.display(),
            reason
        );
        // One write call per record; O_APPEND keeps concurrent appends whole.
        let mut file = OpenOptions::new().create(true).append(true).open(&ledger)?;
        file.write_all(line.as_bytes())?;

        if media.path.exists() {
            let bucket = self.paths.skip_bucket(&media.path);
            let dir = bucket.parent().unwrap_or_else(|| Path::new("."));
            std::fs::create_dir_all(dir)?;
            let target = unique_destination(dir, &media.file_name());
            move_file(&media.path, &target)?;
        }
        Ok(())
    }

    /// Video stream selection: drop unknown frame rates and skip-listed
    /// codecs, then cap every kept stream's output rate at the maximum
    /// frame rate among the kept set.
    fn select_video_streams(&self, media: &MediaInfo) -> Result<Vec<PlannedVideo>, PreEncodeError> {
        let mut kept: Vec<(VideoStreamInfo, f64)> = Vec::new();
        for stream in &media.video_streams {
            let fps = match stream.fps() {
                Some(f) if f >= 1.0 && f <= self.cfg.video.max_fps => f,
                _ => {
                    debug!(index = stream.index, "dropping video stream with unusable frame rate");
                    continue;
                }
            };
            if self
                .cfg
                .video
                .skip_video_codecs
                .iter()
                .any(|c| c.eq_ignore_ascii_case(&stream.codec_name))
            {
                debug!(index = stream.index, codec = %stream.codec_name, "dropping skip-listed video codec");
                continue;
            }
            kept.push((stream.clone(), fps));
        }

        if kept.is_empty() {
            return Err(PreEncodeError::NoStreams);
        }

        let max_fps = kept.iter().map(|(_, f)| *f).fold(f64::MIN, f64::max);
        Ok(kept
            .into_iter()
            .map(|(stream, fps)| PlannedVideo {
                stream,
                fps: fps.min(max_fps),
            })
            .collect())
    }

    /// Audio stream selection: language filter (tagged, or detected once per
    /// untagged stream), then copy-vs-reencode by codec family and sample
    /// rate, with the Opus bit-rate bounded by the per-channel budget.
    fn select_audio_streams(
        &self,
        media: &MediaInfo,
        opts: &AnalyzeOptions,
    ) -> Result<Vec<PlannedAudio>, PreEncodeError> {
        let allow: Vec<String> = self
            .cfg
            .languages
            .allow
            .iter()
            .map(|l| normalize_language_tag(l))
            .collect();
        let mut detected_cache: HashMap<u32, String> = HashMap::new();
        let mut kept = Vec::new();

        for stream in &media.audio_streams {
            let resolved = if stream.language.is_empty() || stream.language == "und" {
                detected_cache
                    .entry(stream.index)
                    .or_insert_with(|| {
                        self.detector.detect(
                            &media.path,
                            stream.index,
                            media.duration_seconds,
                            opts.temp_work_dir.as_deref(),
                        )
                    })
                    .clone()
            } else {
                stream.language.clone()
            };

            if !allow.iter().any(|l| *l == resolved) {
                debug!(index = stream.index, language = %resolved, "dropping audio stream by language");
                continue;
            }

            let in_opus_family = self
                .cfg
                .video
                .opus_family_codecs
                .iter()
                .any(|c| c.eq_ignore_ascii_case(&stream.codec_name));
            let directive = if in_opus_family
                && stream.sample_rate_hz >= self.cfg.video.min_sample_rate_hz
            {
                StreamDirective::Copy
            } else {
                StreamDirective::Reencode {
                    codec: self.cfg.video.opus_encoder.clone(),
                    bitrate_bps: Some(opus_bitrate_budget(
                        stream,
                        self.cfg.video.per_channel_budget_bps,
                    )),
                }
            };

            kept.push(PlannedAudio {
                stream: stream.clone(),
                directive,
                resolved_language: resolved,
            });
        }

        if kept.is_empty() && !opts.allow_no_audio {
            return Err(PreEncodeError::NoSuitableAudio);
        }
        Ok(kept)
    }

    /// Subtitle stream selection: allow-listed languages only; directive
    /// follows the initial container.
    fn select_subtitle_streams(&self, media: &MediaInfo) -> Vec<PlannedSubtitle> {
        let allow: Vec<String> = self
            .cfg
            .languages
            .allow
            .iter()
            .map(|l| normalize_language_tag(l))
            .collect();

        media
            .subtitle_streams
            .iter()
            .filter(|s| !s.language.is_empty() && allow.iter().any(|l| *l == s.language))
            .map(|s| PlannedSubtitle {
                stream: s.clone(),
                directive: subtitle_directive(&s.codec_name, Container::Mp4),
            })
            .collect()
    }

    /// Try each candidate encoder's CRF search in priority order; keep the
    /// one with the lowest encoded percentage, ties to priority order.
    fn crf_search(
        &self,
        media: &MediaInfo,
        temp_dir: Option<&Path>,
    ) -> Result<(String, u32, f64, Duration), PreEncodeError> {
        let started = Instant::now();
        let mut best: Option<(String, u32, u32)> = None;

        for encoder in &self.cfg.video.encoders {
            let output = match self.tools.crf_search(
                encoder,
                &media.path,
                &self.cfg.video.sample_every,
                self.cfg.video.max_encoded_percent,
                self.cfg.video.target_vmaf,
                temp_dir,
            ) {
                Ok(out) => out,
                Err(e) => {
                    warn!(encoder = %encoder, error = %e, "CRF-search helper could not be spawned");
                    continue;
                }
            };

            if !output.success() {
                warn!(
                    encoder = %encoder,
                    exit_code = output.exit_code,
                    "CRF search failed for encoder"
                );
                continue;
            }

            let (crf, percent) = match parse_crf_search_output(&output.stdout) {
                Some(parsed) => parsed,
                None => {
                    warn!(encoder = %encoder, "could not parse CRF-search output");
                    continue;
                }
            };

            if crf == 0 || crf > self.cfg.video.max_crf || percent == 0 {
                warn!(encoder = %encoder, crf, percent, "CRF-search result out of bounds");
                continue;
            }
            if percent > self.cfg.video.max_encoded_percent {
                warn!(encoder = %encoder, percent, "CRF-search estimate exceeds size ceiling");
                continue;
            }

            debug!(encoder = %encoder, crf, percent, "CRF-search candidate");
            let better = match &best {
                None => true,
                Some((_, _, best_percent)) => percent < *best_percent,
            };
            if better {
                best = Some((encoder.clone(), crf, percent));
            }
        }

        let elapsed = started.elapsed();
        match best {
            Some((encoder, crf, percent)) => {
                info!(
                    encoder = %encoder,
                    crf,
                    percent,
                    elapsed_secs = elapsed.as_secs(),
                    "CRF search complete"
                );
                Ok((encoder, crf, percent as f64 / 100.0, elapsed))
            }
            None => Err(PreEncodeError::CrfSearchExhausted),
        }
    }
}

/// Opus bit-rate for one re-encoded stream: the smaller of the stream's own
/// bit-rate and channels × per-channel budget; the budget alone when the
/// stream does not report a rate.
pub fn opus_bitrate_budget(stream: &AudioStreamInfo, per_channel_bps: u64) -> u64 {
    let channel_budget = u64::from(stream.channels.max(1)) * per_channel_bps;
    match stream.effective_bit_rate() {
        0 => channel_budget,
        rate => rate.min(channel_budget),
    }
}

/// Subtitle directive for a codec in a given container. MKV copies anything;
/// MP4 copies only its native text codecs and converts the rest to
/// `mov_text` (bitmap formats will fail there and trigger the MKV retry).
pub fn subtitle_directive(codec_name: &str, container: Container) -> StreamDirective {
    match container {
        Container::Mkv => StreamDirective::Copy,
        Container::Mp4 => match codec_name {
            "mov_text" | "tx3g" => StreamDirective::Copy,
            _ => StreamDirective::Reencode {
                codec: "mov_text".to_string(),
                bitrate_bps: None,
            },
        },
    }
}

/// Parses `crf <N>` and `(<N>%)` (or `ratio <N>%`) out of CRF-search output.
pub fn parse_crf_search_output(stdout: &str) -> Option<(u32, u32)> {
    let lower = stdout.to_lowercase();

    let mut crf: Option<u32> = None;
    let mut words = lower.split_whitespace().peekable();
    while let Some(word) = words.next() {
        if word == "crf" {
            if let Some(next) = words.peek() {
                let digits: String = next.chars().take_while(|c| c.is_ascii_digit()).collect();
                if let Ok(value) = digits.parse() {
                    crf = Some(value);
                    break;
                }
            }
        }
    }

    let mut percent: Option<u32> = None;
    for (i, _) in lower.match_indices('(') {
        let tail = &lower[i + 1..];
        let digits: String = tail.chars().take_while(|c| c.is_ascii_digit()).collect();
        if !digits.is_empty() && tail[digits.len()..].starts_with("%)") {
            percent = digits.parse().ok();
            if percent.is_some() {
                break;
            }
        }
    }
    if percent.is_none() {
        let mut words = lower.split_whitespace().peekable();
        while let Some(word) = words.next() {
            if word == "ratio" {
                if let Some(next) = words.peek() {
                    let digits: String =
                        next.chars().take_while(|c| c.is_ascii_digit()).collect();
                    if next[digits.len()..].starts_with('%') {
                        percent = digits.parse().ok();
                        break;
                    }
                }
            }
        }
    }

    match (crf, percent) {
        (Some(c), Some(p)) => Some((c, p)),
        _ => None,
    }
}
