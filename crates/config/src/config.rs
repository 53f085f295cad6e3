//! Core configuration structures and loading logic

use serde::{Deserialize, Serialize};
use std::env;
use std::fs;
use std::path::{Path, PathBuf};

/// Error type for configuration operations
#[derive(Debug)]
pub enum ConfigError {
    /// IO error reading config file
    Io(std::io::Error),
    /// TOML parsing error
    Parse(toml::de::Error),
}

impl std::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConfigError::Io(e) => write!(f, "Failed to read config file: {}", e),
            ConfigError::Parse(e) => write!(f, "Failed to parse config: {}", e),
        }
    }
}

impl std::error::Error for ConfigError {}

impl From<std::io::Error> for ConfigError {
    fn from(e: std::io::Error) -> Self {
        ConfigError::Io(e)
    }
}

impl From<toml::de::Error> for ConfigError {
    fn from(e: toml::de::Error) -> Self {
        ConfigError::Parse(e)
    }
}

/// Video pipeline configuration: skip thresholds, CRF search knobs, stream
/// selection rules and the output sentinel.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct VideoConfig {
    /// Candidate encoders for the CRF search, in priority order.
    #[serde(default = "default_encoders")]
    pub encoders: Vec<String>,
    /// Audio encoder used when a stream is re-encoded.
    #[serde(default = "default_opus_encoder")]
    pub opus_encoder: String,
    /// File extensions recognized as video inputs (lowercase, with dot).
    #[serde(default = "default_video_extensions")]
    pub extensions: Vec<String>,
    /// Container formats that are never re-encoded (soft skip).
    #[serde(default)]
    pub container_blacklist: Vec<String>,
    /// Video codecs whose streams are dropped during stream selection.
    #[serde(default = "default_skip_video_codecs")]
    pub skip_video_codecs: Vec<String>,
    /// Audio codecs that are copied instead of re-encoded to Opus.
    #[serde(default = "default_opus_family_codecs")]
    pub opus_family_codecs: Vec<String>,
    /// Minimum audio sample rate for a copy directive (Hz).
    #[serde(default = "default_min_sample_rate_hz")]
    pub min_sample_rate_hz: u32,
    /// Per-channel Opus bit-rate budget in bits per second.
    #[serde(default = "default_per_channel_budget_bps")]
    pub per_channel_budget_bps: u64,
    /// Container bit-rate at or below which a file is skipped (bps).
    #[serde(default = "default_bitrate_floor_bps")]
    pub bitrate_floor_bps: u64,
    /// Fixed CRF used in manual mode and as the search fallback.
    #[serde(default = "default_manual_crf")]
    pub manual_crf: u32,
    /// Absolute CRF ceiling; oversize escalation never exceeds it.
    #[serde(default = "default_max_crf")]
    pub max_crf: u32,
    /// Percentage by which CRF grows on each oversize retry.
    #[serde(default = "default_crf_increment_percent")]
    pub manual_crf_increment_percent: u32,
    /// VMAF quality floor handed to the CRF-search helper.
    #[serde(default = "default_target_vmaf")]
    pub target_vmaf: u32,
    /// Maximum acceptable encoded size percentage from the CRF search.
    #[serde(default = "default_max_encoded_percent")]
    pub max_encoded_percent: u32,
    /// Sampling interval handed to the CRF-search helper (e.g. "7m").
    #[serde(default = "default_sample_every")]
    pub sample_every: String,
    /// Output/input size ratio above which an encode is retried.
    #[serde(default = "default_oversize_ratio")]
    pub oversize_ratio: f64,
    /// Maximum number of oversize CRF escalations before giving up.
    #[serde(default = "default_max_oversize_retries")]
    pub max_oversize_retries: u32,
    /// Filename tokens marking inputs that previously came out oversized.
    /// Matched as case-sensitive substrings; the tokens are machine-written
    /// by this tool so they round-trip byte-identical.
    #[serde(default = "default_oversize_markers")]
    pub oversize_markers: Vec<String>,
    /// Sentinel written into the output comment tag and tested by skip rule 1.
    #[serde(default = "default_comment_sentinel")]
    pub comment_sentinel: String,
    /// Frame-rate ceiling applied when capping kept video streams.
    #[serde(default = "default_max_fps")]
    pub max_fps: f64,
    /// When every candidate encoder fails the CRF search, fall back to the
    /// first candidate at `manual_crf` instead of failing the file.
    #[serde(default = "default_allow_manual_fallback")]
    pub allow_manual_fallback: bool,
}

fn default_encoders() -> Vec<String> {
    vec!["libsvtav1".to_string()]
}

fn default_opus_encoder() -> String {
    "libopus".to_string()
}

fn default_video_extensions() -> Vec<String> {
    [
        ".mkv", ".mp4", ".avi", ".mov", ".m4v", ".ts", ".m2ts", ".wmv", ".mpg", ".flv", ".webm",
        ".vob", ".rmvb", ".3gp", ".mts", ".asf",
    ]
    .iter()
    .map(|s| s.to_string())
    .collect()
}

fn default_skip_video_codecs() -> Vec<String> {
    vec!["mjpeg".to_string(), "png".to_string()]
}

fn default_opus_family_codecs() -> Vec<String> {
    vec!["opus".to_string(), "libopus".to_string()]
}

fn default_min_sample_rate_hz() -> u32 {
    8000
}

fn default_per_channel_budget_bps() -> u64 {
    128_000
}

fn default_bitrate_floor_bps() -> u64 {
    100_000
}

fn default_manual_crf() -> u32 {
    23
}

fn default_max_crf() -> u32 {
    63
}

fn default_crf_increment_percent() -> u32 {
    15
}

fn default_target_vmaf() -> u32 {
    95
}

fn default_max_encoded_percent() -> u32 {
    97
}

fn default_sample_every() -> String {
    "7m".to_string()
}

fn default_oversize_ratio() -> f64 {
    1.0
}

fn default_max_oversize_retries() -> u32 {
    5
}

fn default_oversize_markers() -> Vec<String> {
    vec!["_over_sized".to_string()]
}

fn default_comment_sentinel() -> String {
    "encoded_by_av1_batch".to_string()
}

fn default_max_fps() -> f64 {
    240.0
}

fn default_allow_manual_fallback() -> bool {
    true
}

impl Default for VideoConfig {
    fn default() -> Self {
        Self {
            encoders: default_encoders(),
            opus_encoder: default_opus_encoder(),
            extensions: default_video_extensions(),
            container_blacklist: Vec::new(),
            skip_video_codecs: default_skip_video_codecs(),
            opus_family_codecs: default_opus_family_codecs(),
            min_sample_rate_hz: default_min_sample_rate_hz(),
            per_channel_budget_bps: default_per_channel_budget_bps(),
            bitrate_floor_bps: default_bitrate_floor_bps(),
            manual_crf: default_manual_crf(),
            max_crf: default_max_crf(),
            manual_crf_increment_percent: default_crf_increment_percent(),
            target_vmaf: default_target_vmaf(),
            max_encoded_percent: default_max_encoded_percent(),
            sample_every: default_sample_every(),
            oversize_ratio: default_oversize_ratio(),
            max_oversize_retries: default_max_oversize_retries(),
            oversize_markers: default_oversize_markers(),
            comment_sentinel: default_comment_sentinel(),
            max_fps: default_max_fps(),
            allow_manual_fallback: default_allow_manual_fallback(),
        }
    }
}

/// Audio-only pipeline configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct AudioConfig {
    /// File extensions recognized as audio inputs (lowercase, with dot).
    #[serde(default = "default_audio_extensions")]
    pub extensions: Vec<String>,
    /// Fixed Opus bit-rate for audio-only encodes (bps).
    #[serde(default = "default_audio_bitrate_bps")]
    pub target_bitrate_bps: u64,
}

fn default_audio_extensions() -> Vec<String> {
    [".flac", ".wav", ".mp3", ".opus", ".m4a", ".m4b"]
        .iter()
        .map(|s| s.to_string())
        .collect()
}

fn default_audio_bitrate_bps() -> u64 {
    50_000
}

impl Default for AudioConfig {
    fn default() -> Self {
        Self {
            extensions: default_audio_extensions(),
            target_bitrate_bps: default_audio_bitrate_bps(),
        }
    }
}

/// Phone-preset pipeline configuration (fixed parameters, no CRF search)
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PhoneConfig {
    /// Target video bit-rate in kbps.
    #[serde(default = "default_phone_video_kbps")]
    pub video_bitrate_kbps: u64,
    /// Target audio bit-rate in bps.
    #[serde(default = "default_phone_audio_bps")]
    pub audio_bitrate_bps: u64,
    /// Output frame rate.
    #[serde(default = "default_phone_fps")]
    pub fps: u32,
    /// Output scale height; width follows the source aspect.
    #[serde(default = "default_phone_scale_height")]
    pub scale_height: u32,
}

fn default_phone_video_kbps() -> u64 {
    3000
}

fn default_phone_audio_bps() -> u64 {
    50_000
}

fn default_phone_fps() -> u32 {
    20
}

fn default_phone_scale_height() -> u32 {
    414
}

impl Default for PhoneConfig {
    fn default() -> Self {
        Self {
            video_bitrate_kbps: default_phone_video_kbps(),
            audio_bitrate_bps: default_phone_audio_bps(),
            fps: default_phone_fps(),
            scale_height: default_phone_scale_height(),
        }
    }
}

/// Language filtering and detection configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct LanguageConfig {
    /// Allowed language codes for audio and subtitle streams. Both two- and
    /// three-letter forms are accepted; "und" admits untagged streams that
    /// pass detection.
    #[serde(default = "default_allowed_languages")]
    pub allow: Vec<String>,
    /// Number of audio clips sampled per detection.
    #[serde(default = "default_language_clips")]
    pub clips: u32,
    /// Duration of each sampled clip in seconds.
    #[serde(default = "default_clip_seconds")]
    pub clip_seconds: u32,
    /// Percentage of the duration skipped at each end before sampling.
    #[serde(default = "default_edge_skip_percent")]
    pub edge_skip_percent: f64,
    /// Classifier confidence below which a clip counts as undetected.
    #[serde(default = "default_min_confidence")]
    pub min_confidence: f64,
}

fn default_allowed_languages() -> Vec<String> {
    ["jpn", "eng", "zho", "chi", "ja", "jp", "en", "zh", "und"]
        .iter()
        .map(|s| s.to_string())
        .collect()
}

fn default_language_clips() -> u32 {
    3
}

fn default_clip_seconds() -> u32 {
    20
}

fn default_edge_skip_percent() -> f64 {
    5.0
}

fn default_min_confidence() -> f64 {
    0.5
}

impl Default for LanguageConfig {
    fn default() -> Self {
        Self {
            allow: default_allowed_languages(),
            clips: default_language_clips(),
            clip_seconds: default_clip_seconds(),
            edge_skip_percent: default_edge_skip_percent(),
            min_confidence: default_min_confidence(),
        }
    }
}

/// Run-level settings: scanning filters and worker defaults
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RunConfig {
    /// Default number of parallel workers (CLI `--processes` overrides).
    #[serde(default = "default_processes")]
    pub processes: u32,
    /// Files smaller than this are not considered media inputs (bytes).
    #[serde(default = "default_min_file_size")]
    pub min_file_size_bytes: u64,
    /// Directory-name keywords excluded from scanning. Keeps output, raw
    /// archive, skip and quarantine trees out of the candidate set.
    #[serde(default = "default_exclude_dir_keywords")]
    pub exclude_dir_keywords: Vec<String>,
}

fn default_processes() -> u32 {
    4
}

fn default_min_file_size() -> u64 {
    100_000
}

fn default_exclude_dir_keywords() -> Vec<String> {
    [
        "_encoded", "_raw", "encode_error", "skipped", "oversized", "converted", ".ab-av1-",
        "checked",
    ]
    .iter()
    .map(|s| s.to_string())
    .collect()
}

impl Default for RunConfig {
    fn default() -> Self {
        Self {
            processes: default_processes(),
            min_file_size_bytes: default_min_file_size(),
            exclude_dir_keywords: default_exclude_dir_keywords(),
        }
    }
}

/// External tool resolution
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ToolsConfig {
    /// Transcoder binary name or path.
    #[serde(default = "default_ffmpeg")]
    pub ffmpeg: String,
    /// Media inspector binary name or path.
    #[serde(default = "default_ffprobe")]
    pub ffprobe: String,
    /// CRF-search helper binary name or path.
    #[serde(default = "default_ab_av1")]
    pub ab_av1: String,
    /// Speech language classifier binary name or path.
    #[serde(default = "default_whisper")]
    pub whisper: String,
    /// Directory prepended to the tool names above; when unset the tools
    /// must resolve on PATH.
    #[serde(default)]
    pub module_dir: Option<PathBuf>,
}

fn default_ffmpeg() -> String {
    "ffmpeg".to_string()
}

fn default_ffprobe() -> String {
    "ffprobe".to_string()
}

fn default_ab_av1() -> String {
    "ab-av1".to_string()
}

fn default_whisper() -> String {
    "whisper-cli".to_string()
}

impl Default for ToolsConfig {
    fn default() -> Self {
        Self {
            ffmpeg: default_ffmpeg(),
            ffprobe: default_ffprobe(),
            ab_av1: default_ab_av1(),
            whisper: default_whisper(),
            module_dir: None,
        }
    }
}

/// Main configuration structure
#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq)]
pub struct Config {
    #[serde(default)]
    pub video: VideoConfig,
    #[serde(default)]
    pub audio: AudioConfig,
    #[serde(default)]
    pub phone: PhoneConfig,
    #[serde(default)]
    pub languages: LanguageConfig,
    #[serde(default)]
    pub run: RunConfig,
    #[serde(default)]
    pub tools: ToolsConfig,
}

impl Config {
    /// Load configuration from a TOML file
    ///
    /// Parses the config file and handles missing optional fields with defaults.
    pub fn load_from_file<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let content = fs::read_to_string(path)?;
        Self::parse_toml(&content)
    }

    /// Parse configuration from a TOML string
    pub fn parse_toml(content: &str) -> Result<Self, ConfigError> {
        let config: Config = toml::from_str(content)?;
        Ok(config)
    }

    /// Apply environment variable overrides to the configuration
    ///
    /// Overrides the following values if environment variables are set:
    /// - AV1_BATCH_TARGET_VMAF -> video.target_vmaf
    /// - AV1_BATCH_MAX_ENCODED_PERCENT -> video.max_encoded_percent
    /// - AV1_BATCH_BITRATE_FLOOR -> video.bitrate_floor_bps
    /// - AV1_BATCH_OVERSIZE_RATIO -> video.oversize_ratio
    /// - AV1_BATCH_SAMPLE_EVERY -> video.sample_every
    /// - AV1_BATCH_MODULE_DIR -> tools.module_dir
    pub fn apply_env_overrides(&mut self) {
        if let Ok(val) = env::var("AV1_BATCH_TARGET_VMAF") {
            if let Ok(vmaf) = val.parse::<u32>() {
                self.video.target_vmaf = vmaf;
            }
        }

        if let Ok(val) = env::var("AV1_BATCH_MAX_ENCODED_PERCENT") {
            if let Ok(pct) = val.parse::<u32>() {
                self.video.max_encoded_percent = pct;
            }
        }

        if let Ok(val) = env::var("AV1_BATCH_BITRATE_FLOOR") {
            if let Ok(floor) = val.parse::<u64>() {
                self.video.bitrate_floor_bps = floor;
            }
        }

        if let Ok(val) = env::var("AV1_BATCH_OVERSIZE_RATIO") {
            if let Ok(ratio) = val.parse::<f64>() {
                self.video.oversize_ratio = ratio;
            }
        }

        if let Ok(val) = env::var("AV1_BATCH_SAMPLE_EVERY") {
            if !val.is_empty() {
                self.video.sample_every = val;
            }
        }

        if let Ok(val) = env::var("AV1_BATCH_MODULE_DIR") {
            if !val.is_empty() {
                self.tools.module_dir = Some(PathBuf::from(val));
            }
        }
    }

    /// Load configuration from file and apply environment overrides
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let mut config = Self::load_from_file(path)?;
        config.apply_env_overrides();
        Ok(config)
    }

    /// Directory tag used for output roots, derived from the encoder list
    /// (e.g. `libsvtav1_encoded`).
    pub fn encoder_tag(&self) -> String {
        self.video.encoders.join("_")
    }
}
