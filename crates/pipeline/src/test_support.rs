//! Shared helpers for unit tests: scripted command runners, canned
//! classifiers and MediaInfo builders.

use std::ffi::OsString;
use std::io;
use std::path::Path;
use std::sync::Mutex;

use crate::language::{Classification, LanguageClassifier};
use crate::probe::{AudioStreamInfo, MediaInfo, SubtitleStreamInfo, VideoStreamInfo};
use crate::tools::{CommandOutput, CommandRunner};

/// A recorded subprocess invocation.
#[derive(Debug, Clone)]
pub struct RecordedCall {
    pub program: String,
    pub args: Vec<String>,
}

/// Command runner that replays scripted outputs. A rule matches when the
/// program name contains its key or the first argument equals it; later
/// rules win over earlier ones. Unmatched invocations succeed silently.
pub struct ScriptedRunner {
    rules: Mutex<Vec<(String, CommandOutput)>>,
    pub calls: Mutex<Vec<RecordedCall>>,
}

impl ScriptedRunner {
    pub fn new() -> Self {
        Self {
            rules: Mutex::new(Vec::new()),
            calls: Mutex::new(Vec::new()),
        }
    }

    pub fn on(self, key: &str, output: CommandOutput) -> Self {
        self.rules.lock().unwrap().push((key.to_string(), output));
        self
    }

    pub fn calls_for(&self, key: &str) -> Vec<RecordedCall> {
        self.calls
            .lock()
            .unwrap()
            .iter()
            .filter(|c| c.program.contains(key) || c.args.first().map(String::as_str) == Some(key))
            .cloned()
            .collect()
    }
}

impl CommandRunner for ScriptedRunner {
    fn run(&self, program: &str, args: &[OsString]) -> io::Result<CommandOutput> {
        let call = RecordedCall {
            program: program.to_string(),
            args: args.iter().map(|a| a.to_string_lossy().into_owned()).collect(),
        };
        self.calls.lock().unwrap().push(call.clone());

        let rules = self.rules.lock().unwrap();
        for (key, output) in rules.iter().rev() {
            if call.program.contains(key) || call.args.first().map(String::as_str) == Some(key.as_str())
            {
                return Ok(output.clone());
            }
        }
        Ok(CommandOutput::default())
    }
}

/// Classifier that always answers with the same verdict.
pub struct FixedClassifier {
    pub language: String,
    pub confidence: f64,
}

impl LanguageClassifier for FixedClassifier {
    fn classify(&self, _clip: &Path) -> Option<Classification> {
        Some(Classification {
            language: self.language.clone(),
            confidence: self.confidence,
        })
    }
}

pub fn ok_output(stdout: &str) -> CommandOutput {
    CommandOutput {
        exit_code: 0,
        stdout: stdout.to_string(),
        stderr: String::new(),
    }
}

pub fn failed_output(exit_code: i32, stderr: &str) -> CommandOutput {
    CommandOutput {
        exit_code,
        stdout: String::new(),
        stderr: stderr.to_string(),
    }
}

pub fn make_video_stream(index: u32, codec: &str, fps: (u32, u32)) -> VideoStreamInfo {
    VideoStreamInfo {
        index,
        codec_name: codec.to_string(),
        language: String::new(),
        avg_frame_rate: fps,
        bit_rate_bps: 8_000_000,
    }
}

pub fn make_audio_stream(index: u32, codec: &str, language: &str, channels: u32) -> AudioStreamInfo {
    AudioStreamInfo {
        index,
        codec_name: codec.to_string(),
        language: language.to_string(),
        channels,
        sample_rate_hz: 48_000,
        bit_rate_bps: 192_000,
        bps_tag_bps: 0,
    }
}

pub fn make_subtitle_stream(index: u32, codec: &str, language: &str) -> SubtitleStreamInfo {
    SubtitleStreamInfo {
        index,
        codec_name: codec.to_string(),
        language: language.to_string(),
    }
}

pub fn make_media_info(path: &Path) -> MediaInfo {
    MediaInfo {
        path: path.to_path_buf(),
        size_bytes: 1_000_000_000,
        md5: "d41d8cd98f00b204e9800998ecf8427e".to_string(),
        sha256: "e3b0c44298fc1c149afbf4c8996fb92427ae41e4649b934ca495991b7852b855".to_string(),
        duration_seconds: 3600.0,
        container_format: "matroska,webm".to_string(),
        container_bitrate_bps: 8_000_000,
        comment_tag: String::new(),
        video_streams: vec![make_video_stream(0, "h264", (24000, 1001))],
        audio_streams: vec![make_audio_stream(1, "aac", "eng", 2)],
        subtitle_streams: Vec::new(),
    }
}

/// A MediaInfo whose file actually exists on disk, for move/quarantine tests.
pub fn make_media_info_on_disk(dir: &Path, name: &str) -> MediaInfo {
    let path = dir.join(name);
    std::fs::create_dir_all(path.parent().unwrap()).unwrap();
    std::fs::write(&path, b"fake media payload").unwrap();
    let mut info = make_media_info(&path);
    info.size_bytes = 18;
    info
}

pub fn crf_search_stdout(crf: u32, percent: u32) -> String {
    format!(
        "- crf-search sampling libsvtav1\ncrf {} VMAF 95.22 predicted video stream size 820.11 MiB ({}%) taking 31 minutes\n",
        crf, percent
    )
}
