//! Probe module: wraps the media inspector and normalizes its output.
//!
//! One [`MediaInfo`] is produced per input file and is read-only afterwards.
//! Probing also computes MD5 and SHA-256 over the file contents in a single
//! streaming pass; the hashes identify the file in logs, sidecars and the
//! output comment tag.

use md5::Md5;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fs::File;
use std::io::{self, Read};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use thiserror::Error;
use tracing::debug;

use crate::tools::Tools;

/// Error type for probe operations.
#[derive(Debug, Error)]
pub enum ProbeError {
    /// The file could not be opened or the inspector could not be spawned.
    #[error("unreadable input: {0}")]
    Unreadable(#[from] io::Error),

    /// The inspector ran but its output could not be interpreted.
    #[error("malformed metadata: {0}")]
    MalformedMetadata(String),

    /// No usable duration anywhere in the metadata.
    #[error("no duration found")]
    NoDuration,
}

impl ProbeError {
    /// Quarantine directory name for this error.
    pub fn kind(&self) -> &'static str {
        match self {
            ProbeError::Unreadable(_) => "Unreadable",
            ProbeError::MalformedMetadata(_) => "MalformedMetadata",
            ProbeError::NoDuration => "no_duration",
        }
    }
}

/// One video stream as reported by the inspector.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct VideoStreamInfo {
    /// Input stream index.
    pub index: u32,
    /// Codec name, lowercased (e.g. "h264", "hevc").
    pub codec_name: String,
    /// Normalized language tag; empty when untagged.
    pub language: String,
    /// Average frame rate as a rational (num, den); (0, 0) when unknown.
    pub avg_frame_rate: (u32, u32),
    /// Stream bit-rate in bps; 0 when unknown.
    pub bit_rate_bps: u64,
}

impl VideoStreamInfo {
    /// Frame rate as a float, or None for a 0/0 rational.
    pub fn fps(&self) -> Option<f64> {
        let (num, den) = self.avg_frame_rate;
        if den == 0 {
            return None;
        }
        Some(num as f64 / den as f64)
    }
}

/// One audio stream as reported by the inspector.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct AudioStreamInfo {
    /// Input stream index.
    pub index: u32,
    /// Codec name, lowercased.
    pub codec_name: String,
    /// Normalized language tag; empty when untagged.
    pub language: String,
    /// Channel count.
    pub channels: u32,
    /// Sample rate in Hz.
    pub sample_rate_hz: u32,
    /// Stream bit-rate in bps; 0 when unknown.
    pub bit_rate_bps: u64,
    /// Value of the `BPS-eng` tag in bps; 0 when absent. Kept alongside
    /// `bit_rate_bps` so diagnostics can show both sources.
    pub bps_tag_bps: u64,
}

impl AudioStreamInfo {
    /// Bit-rate used for budget decisions: `bit_rate` wins when non-zero,
    /// otherwise the `BPS-eng` tag.
    pub fn effective_bit_rate(&self) -> u64 {
        if self.bit_rate_bps > 0 {
            self.bit_rate_bps
        } else {
            self.bps_tag_bps
        }
    }
}

/// One subtitle stream as reported by the inspector.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SubtitleStreamInfo {
    /// Input stream index.
    pub index: u32,
    /// Codec name, lowercased.
    pub codec_name: String,
    /// Normalized language tag; empty when untagged.
    pub language: String,
}

/// Immutable snapshot of one input file.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct MediaInfo {
    /// Absolute input path.
    pub path: PathBuf,
    /// File size in bytes at probe time.
    pub size_bytes: u64,
    /// MD5 of the file contents (hex).
    pub md5: String,
    /// SHA-256 of the file contents (hex).
    pub sha256: String,
    /// Duration in seconds; always positive for a successfully probed file.
    pub duration_seconds: f64,
    /// Container format name (e.g. "matroska,webm").
    pub container_format: String,
    /// Container bit-rate in bps; computed from size/duration when the
    /// inspector does not report one.
    pub container_bitrate_bps: u64,
    /// Free-form comment tag from the container metadata.
    pub comment_tag: String,
    /// Video streams in input order.
    pub video_streams: Vec<VideoStreamInfo>,
    /// Audio streams in input order.
    pub audio_streams: Vec<AudioStreamInfo>,
    /// Subtitle streams in input order.
    pub subtitle_streams: Vec<SubtitleStreamInfo>,
}

impl MediaInfo {
    /// File name including extension.
    pub fn file_name(&self) -> String {
        self.path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default()
    }

    /// File stem without extension.
    pub fn stem(&self) -> String {
        self.path
            .file_stem()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default()
    }
}

/// Probes media files through the inspector adapter.
pub struct Prober {
    tools: Arc<Tools>,
}

impl Prober {
    pub fn new(tools: Arc<Tools>) -> Self {
        Self { tools }
    }

    /// Probe one file: inspector metadata plus content hashes.
    pub fn probe(&self, path: &Path) -> Result<MediaInfo, ProbeError> {
        let metadata = std::fs::metadata(path)?;
        let size_bytes = metadata.len();

        let output = self.tools.inspect_json(path)?;
        if !output.success() {
            return Err(ProbeError::MalformedMetadata(format!(
                "inspector exited with {}: {}",
                output.exit_code,
                output.stderr.trim()
            )));
        }

        let (md5, sha256) = hash_file(path)?;
        let mut info = parse_inspector_output(&output.stdout, path, size_bytes)?;
        info.md5 = md5;
        info.sha256 = sha256;
        debug!(path = %path.display(), duration = info.duration_seconds, "probed");
        Ok(info)
    }
}

/// Raw inspector JSON structures for parsing.
mod inspector_json {
    use serde::Deserialize;
    use std::collections::HashMap;

    #[derive(Debug, Deserialize)]
    pub struct InspectorOutput {
        pub streams: Option<Vec<Stream>>,
        pub format: Option<Format>,
    }

    #[derive(Debug, Deserialize)]
    pub struct Stream {
        pub index: Option<u32>,
        pub codec_type: Option<String>,
        pub codec_name: Option<String>,
        pub avg_frame_rate: Option<String>,
        pub channels: Option<u32>,
        pub sample_rate: Option<String>,
        pub bit_rate: Option<String>,
        pub nb_frames: Option<String>,
        pub duration: Option<String>,
        #[serde(default)]
        pub tags: HashMap<String, String>,
    }

    #[derive(Debug, Deserialize)]
    pub struct Format {
        pub format_name: Option<String>,
        pub duration: Option<String>,
        pub bit_rate: Option<String>,
        #[serde(default)]
        pub tags: HashMap<String, String>,
    }
}

/// Parses inspector JSON into a [`MediaInfo`] (hashes filled in separately).
pub fn parse_inspector_output(
    json_str: &str,
    path: &Path,
    size_bytes: u64,
) -> Result<MediaInfo, ProbeError> {
    let parsed: inspector_json::InspectorOutput = serde_json::from_str(json_str)
        .map_err(|e| ProbeError::MalformedMetadata(e.to_string()))?;

    let streams = parsed.streams.unwrap_or_default();
    let format = parsed
        .format
        .ok_or_else(|| ProbeError::MalformedMetadata("missing format section".to_string()))?;

    let mut video_streams = Vec::new();
    let mut audio_streams = Vec::new();
    let mut subtitle_streams = Vec::new();

    for stream in &streams {
        let index = stream.index.unwrap_or(0);
        let codec_name = stream.codec_name.clone().unwrap_or_default().to_lowercase();
        let language = stream
            .tags
            .get("language")
            .map(|l| normalize_language_tag(l))
            .unwrap_or_default();

        match stream.codec_type.as_deref().unwrap_or("") {
            "video" => {
                video_streams.push(VideoStreamInfo {
                    index,
                    codec_name,
                    language,
                    avg_frame_rate: parse_rational(stream.avg_frame_rate.as_deref().unwrap_or("")),
                    bit_rate_bps: parse_u64(stream.bit_rate.as_deref()),
                });
            }
            "audio" => {
                audio_streams.push(AudioStreamInfo {
                    index,
                    codec_name,
                    language,
                    channels: stream.channels.unwrap_or(0),
                    sample_rate_hz: parse_u64(stream.sample_rate.as_deref()) as u32,
                    bit_rate_bps: parse_u64(stream.bit_rate.as_deref()),
                    bps_tag_bps: parse_u64(stream.tags.get("BPS-eng").map(|s| s.as_str())),
                });
            }
            "subtitle" => {
                subtitle_streams.push(SubtitleStreamInfo {
                    index,
                    codec_name,
                    language,
                });
            }
            other => {
                // data/attachment streams carry no encodable payload
                debug!(codec_type = other, index, "dropping non-A/V stream");
            }
        }
    }

    let duration_seconds = resolve_duration(&format, &streams).ok_or(ProbeError::NoDuration)?;

    let container_bitrate_bps = match parse_u64(format.bit_rate.as_deref()) {
        0 => ((size_bytes as f64 * 8.0) / duration_seconds) as u64,
        reported => reported,
    };

    Ok(MediaInfo {
        path: path.to_path_buf(),
        size_bytes,
        md5: String::new(),
        sha256: String::new(),
        duration_seconds,
        container_format: format.format_name.unwrap_or_default(),
        container_bitrate_bps,
        comment_tag: format.tags.get("comment").cloned().unwrap_or_default(),
        video_streams,
        audio_streams,
        subtitle_streams,
    })
}

/// Duration resolution order: format, then the first stream that reports one,
/// then frame count divided by frame rate for the first video stream.
fn resolve_duration(
    format: &inspector_json::Format,
    streams: &[inspector_json::Stream],
) -> Option<f64> {
    if let Some(d) = format.duration.as_deref().and_then(parse_duration) {
        if d > 0.0 {
            return Some(d);
        }
    }

    for stream in streams {
        if let Some(d) = stream.duration.as_deref().and_then(parse_duration) {
            if d > 0.0 {
                return Some(d);
            }
        }
    }

    let video = streams
        .iter()
        .find(|s| s.codec_type.as_deref() == Some("video"))?;
    let frames: f64 = video.nb_frames.as_deref()?.parse().ok()?;
    let (num, den) = parse_rational(video.avg_frame_rate.as_deref()?);
    if den == 0 || num == 0 || frames <= 0.0 {
        return None;
    }
    let fps = num as f64 / den as f64;
    Some(frames / fps)
}

/// Parses a duration that is either plain seconds ("3600.5") or a timecode
/// ("1:00:00.500", hours optional).
pub fn parse_duration(s: &str) -> Option<f64> {
    let s = s.trim();
    if let Ok(secs) = s.parse::<f64>() {
        return Some(secs);
    }

    let parts: Vec<&str> = s.split(':').collect();
    let (hours, minutes, seconds) = match parts.as_slice() {
        [m, sec] => (0.0, m.parse::<f64>().ok()?, sec.parse::<f64>().ok()?),
        [h, m, sec] => (
            h.parse::<f64>().ok()?,
            m.parse::<f64>().ok()?,
            sec.parse::<f64>().ok()?,
        ),
        _ => return None,
    };
    Some(hours * 3600.0 + minutes * 60.0 + seconds)
}

/// Parses an "A/B" rational; anything unparseable becomes (0, 0).
pub fn parse_rational(s: &str) -> (u32, u32) {
    let mut parts = s.splitn(2, '/');
    let num = parts.next().and_then(|p| p.trim().parse().ok());
    let den = parts.next().and_then(|p| p.trim().parse().ok());
    match (num, den) {
        (Some(n), Some(d)) => (n, d),
        _ => (0, 0),
    }
}

fn parse_u64(s: Option<&str>) -> u64 {
    s.and_then(|v| v.trim().parse().ok()).unwrap_or(0)
}

/// Normalizes a language tag to a lowercase three-letter code where a common
/// two-letter form is known; unknown tags are only lowercased.
pub fn normalize_language_tag(tag: &str) -> String {
    let lower = tag.trim().to_lowercase();
    match lower.as_str() {
        "en" => "eng".to_string(),
        "ja" | "jp" => "jpn".to_string(),
        "zh" => "zho".to_string(),
        "de" => "deu".to_string(),
        "fr" => "fra".to_string(),
        "es" => "spa".to_string(),
        "it" => "ita".to_string(),
        "ko" => "kor".to_string(),
        "ru" => "rus".to_string(),
        "pt" => "por".to_string(),
        _ => lower,
    }
}

/// MD5 and SHA-256 over the file contents in one streaming pass.
pub fn hash_file(path: &Path) -> io::Result<(String, String)> {
    let mut file = File::open(path)?;
    let mut md5 = Md5::new();
    let mut sha256 = Sha256::new();
    let mut buf = vec![0u8; 1 << 20];

    loop {
        let n = file.read(&mut buf)?;
        if n == 0 {
            break;
        }
        md5.update(&buf[..n]);
        sha256.update(&buf[..n]);
    }

    Ok((
        format!("{:x}", md5.finalize()),
        format!("{:x}", sha256.finalize()),
    ))
}
