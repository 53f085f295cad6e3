//! Encoder: the per-file execution core.
//!
//! Consumes an [`EncodePlan`], builds the transcoder invocation, runs it,
//! falls back from MP4 to MKV on container/codec mismatch, iterates with a
//! raised CRF when the output comes out larger than the input, and emits a
//! [`SuccessRecord`]. Every executed command line is appended to `cmd.txt`
//! beside the outputs.

use av1_batch_config::Config;
use chrono::Local;
use std::ffi::OsString;
use std::fs::{self, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::format::format_hms;
use crate::fsops::move_file;
use crate::paths::OutputPaths;
use crate::pre_encode::{subtitle_directive, Container, EncodePlan, Mode, StreamDirective};
use crate::probe::MediaInfo;
use crate::state::{plan_fingerprint, EncodeState};
use crate::success_log::SuccessRecord;
use crate::tools::{render_command, Tools};

/// Error type for the encode stage.
#[derive(Debug, Error)]
pub enum EncodeError {
    /// The transcoder exited non-zero for a reason other than a container
    /// mismatch.
    #[error("transcoder failed with exit code {exit_code}")]
    TranscoderFailed {
        exit_code: i32,
        command: String,
        stdout_tail: String,
        stderr_tail: String,
    },

    /// Both the MP4 attempt and the MKV retry failed.
    #[error("no container could hold the selected streams")]
    ContainerIncompatible {
        command: String,
        stderr_tail: String,
    },

    /// CRF escalation hit its ceiling with the output still oversized. The
    /// input goes to the oversize bucket, not the error quarantine.
    #[error("output still oversized at CRF {final_crf} after {attempts} retries")]
    OversizeExhausted { final_crf: u32, attempts: u32 },

    /// Filesystem error around the transcoder run.
    #[error("IO error: {0}")]
    Io(#[from] io::Error),
}

impl EncodeError {
    /// Quarantine directory name for this error.
    pub fn kind(&self) -> &'static str {
        match self {
            EncodeError::TranscoderFailed { .. } => "TranscoderFailed",
            EncodeError::ContainerIncompatible { .. } => "ContainerIncompatible",
            EncodeError::OversizeExhausted { .. } => "OversizeExhausted",
            EncodeError::Io(_) => "Io",
        }
    }
}

/// Per-run flags consumed by the Encoder.
#[derive(Debug, Clone, Copy, Default)]
pub struct EncodeOptions {
    /// Archive the original into `_raw/<mirror>/` after success.
    pub move_raw_file: bool,
    /// Preserve the input's modification time on the output.
    pub keep_mtime: bool,
}

/// The execution core.
pub struct Encoder<'a> {
    cfg: &'a Config,
    tools: Arc<Tools>,
    paths: &'a OutputPaths,
}

impl<'a> Encoder<'a> {
    pub fn new(cfg: &'a Config, tools: Arc<Tools>, paths: &'a OutputPaths) -> Self {
        Self { cfg, tools, paths }
    }

    /// Run one plan to completion.
    pub fn run(
        &self,
        media: &MediaInfo,
        plan: &EncodePlan,
        opts: &EncodeOptions,
    ) -> Result<SuccessRecord, EncodeError> {
        match plan.mode {
            Mode::Video => self.run_video(media, plan, opts),
            Mode::AudioOnly => self.run_single_attempt(
                media,
                plan,
                opts,
                self.audio_output_path(media),
                build_audio_command(media, plan, &self.audio_output_path(media)),
            ),
            Mode::PhonePreset => self.run_single_attempt(
                media,
                plan,
                opts,
                self.phone_output_path(media),
                build_phone_command(self.cfg, media, plan, &self.phone_output_path(media)),
            ),
        }
    }

    fn audio_output_path(&self, media: &MediaInfo) -> PathBuf {
        self.paths
            .audio_encoded_dir(
                &media.path,
                &self.cfg.video.opus_encoder,
                self.cfg.audio.target_bitrate_bps,
            )
            .join(format!("{}.opus", media.stem()))
    }

    fn phone_output_path(&self, media: &MediaInfo) -> PathBuf {
        self.paths
            .phone_encoded_dir(
                &media.path,
                self.cfg.video.encoders.first().map(String::as_str).unwrap_or(""),
                self.cfg.phone.video_bitrate_kbps,
                self.cfg.phone.audio_bitrate_bps,
            )
            .join(format!("{}.mp4", media.stem()))
    }

    /// Video path: container fallback plus the oversize escalation loop.
    fn run_video(
        &self,
        media: &MediaInfo,
        plan: &EncodePlan,
        opts: &EncodeOptions,
    ) -> Result<SuccessRecord, EncodeError> {
        let started = Instant::now();
        let state_path = self.paths.state_path(&media.path);
        let fingerprint = plan_fingerprint(&media.md5, plan.mode.as_str(), &self.cfg.video);
        let mut state = EncodeState::load(&state_path).unwrap_or_else(|| {
            EncodeState::new(fingerprint.clone(), plan.video_encoder.clone(), plan.video_crf)
        });

        // A surviving sidecar may carry an escalated CRF from a previous run.
        let mut crf = state.crf.max(plan.video_crf);
        let mut container = plan.output_container;
        let mut switched_container = false;
        let mut oversize_attempts = 0u32;

        loop {
            let output = self.paths.encoded_file(&media.path, container.extension());
            if let Some(parent) = output.parent() {
                fs::create_dir_all(parent)?;
            }

            let args = build_video_command(media, plan, container, crf, &output);
            let command_line = render_command(&self.tools.ffmpeg, &args);
            self.append_cmd_log(&media.path, &command_line)?;

            state.crf = crf;
            state.attempt_count += 1;
            state.save(&state_path)?;

            info!(
                file = %media.file_name(),
                container = container.extension(),
                crf,
                attempt = state.attempt_count,
                "running transcoder"
            );
            let result = self.tools.transcode(&args)?;

            if !result.success() {
                let _ = fs::remove_file(&output);

                if is_stream_write_error(&result.stderr) && !switched_container {
                    warn!(
                        file = %media.file_name(),
                        "container rejected a stream, retrying with mkv"
                    );
                    state.last_error_kind = Some("ContainerIncompatible".to_string());
                    state.save(&state_path)?;
                    container = Container::Mkv;
                    switched_container = true;
                    continue;
                }

                if switched_container {
                    state.last_error_kind = Some("ContainerIncompatible".to_string());
                    state.save(&state_path)?;
                    return Err(EncodeError::ContainerIncompatible {
                        command: command_line,
                        stderr_tail: tail(&result.stderr),
                    });
                }

                state.last_error_kind = Some("TranscoderFailed".to_string());
                state.save(&state_path)?;
                return Err(EncodeError::TranscoderFailed {
                    exit_code: result.exit_code,
                    command: command_line,
                    stdout_tail: tail(&result.stdout),
                    stderr_tail: tail(&result.stderr),
                });
            }

            let output_size = fs::metadata(&output)?.len();
            let limit = (media.size_bytes as f64 * self.cfg.video.oversize_ratio) as u64;
            if output_size > limit {
                warn!(
                    file = %media.file_name(),
                    output_size,
                    input_size = media.size_bytes,
                    crf,
                    "output oversized, escalating CRF"
                );
                fs::remove_file(&output)?;

                let next_crf = crf + crf_increment(crf, self.cfg.video.manual_crf_increment_percent);
                oversize_attempts += 1;
                if next_crf > self.cfg.video.max_crf
                    || oversize_attempts >= self.cfg.video.max_oversize_retries
                {
                    state.last_error_kind = Some("OversizeExhausted".to_string());
                    state.save(&state_path)?;
                    return Err(EncodeError::OversizeExhausted {
                        final_crf: crf,
                        attempts: oversize_attempts,
                    });
                }

                crf = next_crf;
                state.crf = crf;
                state.last_error_kind = Some("Oversize".to_string());
                state.save(&state_path)?;
                continue;
            }

            // Success.
            if opts.keep_mtime {
                preserve_mtime(&media.path, &output);
            }
            let encode_elapsed = started.elapsed();
            EncodeState::remove(&state_path);

            let record = self.build_record(media, plan, crf, &output, output_size, encode_elapsed);
            if opts.move_raw_file {
                self.archive_original(media)?;
            }
            info!(
                file = %media.file_name(),
                ratio = record.realized_ratio,
                output = %output.display(),
                "encode complete"
            );
            return Ok(record);
        }
    }

    /// Audio-only and phone-preset path: one attempt, no container fallback,
    /// no oversize loop.
    fn run_single_attempt(
        &self,
        media: &MediaInfo,
        plan: &EncodePlan,
        opts: &EncodeOptions,
        output: PathBuf,
        args: Vec<OsString>,
    ) -> Result<SuccessRecord, EncodeError> {
        let started = Instant::now();
        if let Some(parent) = output.parent() {
            fs::create_dir_all(parent)?;
        }

        let command_line = render_command(&self.tools.ffmpeg, &args);
        self.append_cmd_log_in(output.parent().unwrap_or(Path::new(".")), &command_line)?;

        let result = self.tools.transcode(&args)?;
        if !result.success() {
            let _ = fs::remove_file(&output);
            return Err(EncodeError::TranscoderFailed {
                exit_code: result.exit_code,
                command: command_line,
                stdout_tail: tail(&result.stdout),
                stderr_tail: tail(&result.stderr),
            });
        }

        if opts.keep_mtime {
            preserve_mtime(&media.path, &output);
        }
        let output_size = fs::metadata(&output)?.len();
        let record = self.build_record(
            media,
            plan,
            plan.video_crf,
            &output,
            output_size,
            started.elapsed(),
        );
        if opts.move_raw_file {
            self.archive_original(media)?;
        }
        Ok(record)
    }

    fn append_cmd_log(&self, input: &Path, command_line: &str) -> io::Result<()> {
        let cmd_path = self.paths.cmd_path(input);
        self.append_cmd_log_at(&cmd_path, command_line)
    }

    fn append_cmd_log_in(&self, dir: &Path, command_line: &str) -> io::Result<()> {
        self.append_cmd_log_at(&dir.join("cmd.txt"), command_line)
    }

    fn append_cmd_log_at(&self, cmd_path: &Path, command_line: &str) -> io::Result<()> {
        if let Some(parent) = cmd_path.parent() {
            fs::create_dir_all(parent)?;
        }
        let mut file = OpenOptions::new().create(true).append(true).open(cmd_path)?;
        writeln!(file, "{}", command_line)
    }

    fn build_record(
        &self,
        media: &MediaInfo,
        plan: &EncodePlan,
        crf: u32,
        output: &Path,
        output_size: u64,
        encode_elapsed: Duration,
    ) -> SuccessRecord {
        let realized = if media.size_bytes > 0 {
            (output_size as f64 / media.size_bytes as f64 * 10_000.0).round() / 10_000.0
        } else {
            0.0
        };
        let total = plan.crf_search_elapsed + encode_elapsed;
        let relative_input = media
            .path
            .strip_prefix(self.paths.run_root())
            .unwrap_or(&media.path);

        SuccessRecord {
            index: 0,
            input_file: relative_input.to_string_lossy().into_owned(),
            source_file_md5: media.md5.clone(),
            source_file_sha256: media.sha256.clone(),
            encoder_codec: plan.video_encoder.clone(),
            crf,
            estimated_size_ratio: plan.estimated_size_ratio,
            realized_ratio: realized,
            file_duration_seconds: media.duration_seconds,
            file_duration_formatted: format_hms(Duration::from_secs_f64(
                media.duration_seconds.max(0.0),
            )),
            crf_search_seconds: plan.crf_search_elapsed.as_secs_f64(),
            encode_seconds: encode_elapsed.as_secs_f64(),
            total_seconds: total.as_secs_f64(),
            crf_search_time_formatted: format_hms(plan.crf_search_elapsed),
            encode_time_formatted: format_hms(encode_elapsed),
            total_time_formatted: format_hms(total),
            target_vmaf: self.cfg.video.target_vmaf,
            original_size_bytes: media.size_bytes,
            encoded_size_bytes: output_size,
            encoded_file_path: output.to_string_lossy().into_owned(),
            ended_datetime: Local::now().format("%Y%m%d_%H:%M:%S").to_string(),
            host: std::env::var("HOSTNAME").unwrap_or_else(|_| "unknown".to_string()),
            platform: format!("{}-{}", std::env::consts::OS, std::env::consts::ARCH),
        }
    }

    /// Move the original into the raw archive. An existing archive entry is
    /// only overwritten by a larger original; otherwise the duplicate input
    /// is deleted.
    fn archive_original(&self, media: &MediaInfo) -> io::Result<()> {
        if !media.path.exists() {
            return Ok(());
        }
        let target = self.paths.raw_archive(&media.path);

        if target.exists() {
            let incoming = fs::metadata(&media.path)?.len();
            let existing = fs::metadata(&target)?.len();
            if incoming > existing {
                debug!(target = %target.display(), "overwriting smaller raw archive entry");
                fs::remove_file(&target)?;
                move_file(&media.path, &target)?;
            } else {
                debug!(input = %media.path.display(), "raw archive already holds this file");
                fs::remove_file(&media.path)?;
            }
            return Ok(());
        }

        move_file(&media.path, &target)
    }
}

/// CRF escalation step: `ceil(crf × percent / 100)`.
pub fn crf_increment(crf: u32, percent: u32) -> u32 {
    (crf * percent).div_ceil(100)
}

/// Does the transcoder's stderr indicate a container/codec mismatch rather
/// than a genuine failure?
pub fn is_stream_write_error(stderr: &str) -> bool {
    let lower = stderr.to_lowercase();
    [
        "could not write header",
        "codec not currently supported in container",
        "error initializing output stream",
        "incorrect codec parameters",
    ]
    .iter()
    .any(|needle| lower.contains(needle))
}

/// Formats a capped frame rate for the transcoder's `-r` flag.
fn format_fps(fps: f64) -> String {
    if (fps - fps.round()).abs() < 1e-6 {
        format!("{}", fps.round() as u64)
    } else {
        format!("{:.3}", fps)
    }
}

fn tail(s: &str) -> String {
    const TAIL_CHARS: usize = 2000;
    if s.len() <= TAIL_CHARS {
        return s.to_string();
    }
    let start = s.len() - TAIL_CHARS;
    let boundary = (start..s.len()).find(|i| s.is_char_boundary(*i)).unwrap_or(start);
    s[boundary..].to_string()
}

fn preserve_mtime(input: &Path, output: &Path) {
    let mtime = match fs::metadata(input).and_then(|m| m.modified()) {
        Ok(t) => t,
        Err(e) => {
            warn!(error = %e, "could not read input mtime");
            return;
        }
    };
    match fs::File::options().write(true).open(output) {
        Ok(file) => {
            if let Err(e) = file.set_modified(mtime) {
                warn!(error = %e, "could not preserve mtime");
            }
        }
        Err(e) => warn!(error = %e, "could not open output to preserve mtime"),
    }
}

/// Deterministic transcoder invocation for a video plan: maps in input-stream
/// order, per-stream codec directives, the comment payload, one output path.
pub fn build_video_command(
    media: &MediaInfo,
    plan: &EncodePlan,
    container: Container,
    crf: u32,
    output: &Path,
) -> Vec<OsString> {
    let mut args: Vec<OsString> = Vec::new();
    args.push("-y".into());
    args.push("-i".into());
    args.push(media.path.as_os_str().to_owned());

    args.push("-c:v".into());
    args.push(plan.video_encoder.clone().into());
    args.push("-crf".into());
    args.push(crf.to_string().into());

    for planned in &plan.video {
        args.push("-map".into());
        args.push(format!("0:{}", planned.stream.index).into());
        args.push("-r".into());
        args.push(format_fps(planned.fps).into());
    }

    args.push("-metadata".into());
    args.push(format!("comment={}", plan.comment_payload.to_comment_text()).into());

    for (out_idx, planned) in plan.audio.iter().enumerate() {
        args.push("-map".into());
        args.push(format!("0:{}", planned.stream.index).into());
        match &planned.directive {
            StreamDirective::Copy => {
                args.push(format!("-c:a:{}", out_idx).into());
                args.push("copy".into());
            }
            StreamDirective::Reencode { codec, bitrate_bps } => {
                args.push(format!("-c:a:{}", out_idx).into());
                args.push(codec.clone().into());
                if let Some(bps) = bitrate_bps {
                    args.push(format!("-b:a:{}", out_idx).into());
                    args.push(bps.to_string().into());
                }
            }
        }
    }

    for (out_idx, planned) in plan.subtitles.iter().enumerate() {
        args.push("-map".into());
        args.push(format!("0:{}", planned.stream.index).into());
        args.push(format!("-c:s:{}", out_idx).into());
        // The directive follows the container actually being written, which
        // may have switched to MKV since the plan was made.
        match subtitle_directive(&planned.stream.codec_name, container) {
            StreamDirective::Copy => args.push("copy".into()),
            StreamDirective::Reencode { codec, .. } => args.push(codec.into()),
        }
    }

    args.push(output.as_os_str().to_owned());
    args
}

/// Transcoder invocation for an audio-only plan.
pub fn build_audio_command(media: &MediaInfo, plan: &EncodePlan, output: &Path) -> Vec<OsString> {
    let mut args: Vec<OsString> = Vec::new();
    args.push("-y".into());
    args.push("-i".into());
    args.push(media.path.as_os_str().to_owned());
    args.push("-vn".into());
    args.push("-map".into());
    args.push("0:a".into());

    if let Some(first) = plan.audio.first() {
        if let StreamDirective::Reencode { codec, bitrate_bps } = &first.directive {
            args.push("-c:a".into());
            args.push(codec.clone().into());
            if let Some(bps) = bitrate_bps {
                args.push("-b:a".into());
                args.push(bps.to_string().into());
            }
        }
    }

    args.push("-metadata".into());
    args.push(format!("comment={}", plan.comment_payload.to_comment_text()).into());
    args.push(output.as_os_str().to_owned());
    args
}

/// Transcoder invocation for the phone preset: fixed scale, frame rate and
/// bit-rates, default stream mapping.
pub fn build_phone_command(
    cfg: &Config,
    media: &MediaInfo,
    plan: &EncodePlan,
    output: &Path,
) -> Vec<OsString> {
    let mut args: Vec<OsString> = Vec::new();
    args.push("-y".into());
    args.push("-i".into());
    args.push(media.path.as_os_str().to_owned());
    args.push("-vf".into());
    args.push(format!("scale=-1:{}", cfg.phone.scale_height).into());
    args.push("-r".into());
    args.push(cfg.phone.fps.to_string().into());
    args.push("-c:v".into());
    args.push(plan.video_encoder.clone().into());
    args.push("-b:v".into());
    args.push(format!("{}k", cfg.phone.video_bitrate_kbps).into());
    args.push("-c:a".into());
    args.push(cfg.video.opus_encoder.clone().into());
    args.push("-b:a".into());
    args.push(cfg.phone.audio_bitrate_bps.to_string().into());
    args.push("-metadata".into());
    args.push(format!("comment={}", plan.comment_payload.to_comment_text()).into());
    args.push(output.as_os_str().to_owned());
    args
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pre_encode::{CommentPayload, PlannedAudio, PlannedSubtitle, PlannedVideo};
    use crate::test_support::{
        make_audio_stream, make_media_info_on_disk, make_subtitle_stream, make_video_stream,
    };
    use crate::tools::{CommandOutput, CommandRunner};
    use av1_batch_config::ToolsConfig;
    use proptest::prelude::*;
    use std::sync::Mutex;
    use tempfile::TempDir;

    fn sample_plan() -> EncodePlan {
        EncodePlan {
            mode: Mode::Video,
            video_encoder: "libsvtav1".to_string(),
            video_crf: 30,
            estimated_size_ratio: 0.45,
            video: vec![PlannedVideo {
                stream: make_video_stream(0, "h264", (24, 1)),
                fps: 24.0,
            }],
            audio: vec![PlannedAudio {
                stream: make_audio_stream(1, "aac", "eng", 2),
                directive: StreamDirective::Reencode {
                    codec: "libopus".to_string(),
                    bitrate_bps: Some(192_000),
                },
                resolved_language: "eng".to_string(),
            }],
            subtitles: vec![PlannedSubtitle {
                stream: make_subtitle_stream(2, "subrip", "eng"),
                directive: subtitle_directive("subrip", Container::Mp4),
            }],
            output_container: Container::Mp4,
            comment_payload: CommentPayload {
                comment: "encoded_by_av1_batch".to_string(),
                encoders: "libsvtav1".to_string(),
                crf: 30,
                source_file: "in.mkv".to_string(),
                source_file_size: "1 GB".to_string(),
                source_file_md5: "md5".to_string(),
                source_file_sha256: "sha".to_string(),
                estimated_ratio: 0.45,
            },
            crf_search_elapsed: Duration::from_secs(60),
        }
    }

    fn args_as_strings(args: &[OsString]) -> Vec<String> {
        args.iter().map(|a| a.to_string_lossy().into_owned()).collect()
    }

    fn has_pair(args: &[String], flag: &str, value: &str) -> bool {
        args.windows(2).any(|w| w[0] == flag && w[1] == value)
    }

    /// A transcoder fake: scripted exit codes per attempt, and it writes an
    /// output file of a scripted size when the attempt succeeds.
    struct FakeTranscoder {
        attempts: Mutex<Vec<(i32, String, u64)>>, // (exit_code, stderr, output_size)
        pub commands: Mutex<Vec<Vec<String>>>,
    }

    impl FakeTranscoder {
        fn new(attempts: Vec<(i32, &str, u64)>) -> Self {
            Self {
                attempts: Mutex::new(
                    attempts
                        .into_iter()
                        .map(|(c, e, s)| (c, e.to_string(), s))
                        .collect(),
                ),
                commands: Mutex::new(Vec::new()),
            }
        }
    }

    impl CommandRunner for FakeTranscoder {
        fn run(&self, _program: &str, args: &[OsString]) -> io::Result<CommandOutput> {
            let strings = args_as_strings(args);
            self.commands.lock().unwrap().push(strings.clone());

            let mut attempts = self.attempts.lock().unwrap();
            let (exit_code, stderr, size) = if attempts.is_empty() {
                (0, String::new(), 100)
            } else {
                attempts.remove(0)
            };

            if exit_code == 0 {
                let output = PathBuf::from(strings.last().unwrap());
                if let Some(parent) = output.parent() {
                    fs::create_dir_all(parent)?;
                }
                fs::write(&output, vec![0u8; size as usize])?;
            }
            Ok(CommandOutput {
                exit_code,
                stdout: String::new(),
                stderr,
            })
        }
    }

    fn encoder_setup(
        dir: &TempDir,
        transcoder: Arc<FakeTranscoder>,
    ) -> (Config, OutputPaths, Arc<Tools>) {
        let cfg = Config::default();
        let paths = OutputPaths::new(dir.path(), "libsvtav1");
        let tools = Arc::new(Tools::with_runner(&ToolsConfig::default(), transcoder));
        (cfg, paths, tools)
    }

    #[test]
    fn test_build_video_command_shape() {
        let dir = TempDir::new().unwrap();
        let media = make_media_info_on_disk(dir.path(), "in.mkv");
        let plan = sample_plan();

        let args = args_as_strings(&build_video_command(
            &media,
            &plan,
            Container::Mp4,
            30,
            Path::new("/out/in.mp4"),
        ));

        assert_eq!(args[0], "-y");
        assert!(has_pair(&args, "-i", &media.path.to_string_lossy()));
        assert!(has_pair(&args, "-c:v", "libsvtav1"));
        assert!(has_pair(&args, "-crf", "30"));
        assert!(has_pair(&args, "-map", "0:0"));
        assert!(has_pair(&args, "-r", "24"));
        assert!(has_pair(&args, "-map", "0:1"));
        assert!(has_pair(&args, "-c:a:0", "libopus"));
        assert!(has_pair(&args, "-b:a:0", "192000"));
        assert!(has_pair(&args, "-map", "0:2"));
        assert!(has_pair(&args, "-c:s:0", "mov_text"));
        assert!(args
            .iter()
            .any(|a| a.starts_with("comment=") && a.contains("encoded_by_av1_batch")));
        assert_eq!(args.last().unwrap(), "/out/in.mp4");
    }

    #[test]
    fn test_build_video_command_mkv_copies_subtitles() {
        let dir = TempDir::new().unwrap();
        let media = make_media_info_on_disk(dir.path(), "in.mkv");
        let mut plan = sample_plan();
        plan.subtitles = vec![PlannedSubtitle {
            stream: make_subtitle_stream(2, "hdmv_pgs_subtitle", "eng"),
            directive: subtitle_directive("hdmv_pgs_subtitle", Container::Mp4),
        }];

        let args = args_as_strings(&build_video_command(
            &media,
            &plan,
            Container::Mkv,
            30,
            Path::new("/out/in.mkv"),
        ));
        assert!(has_pair(&args, "-c:s:0", "copy"));
    }

    #[test]
    fn test_maps_preserve_input_stream_order() {
        let dir = TempDir::new().unwrap();
        let media = make_media_info_on_disk(dir.path(), "in.mkv");
        let mut plan = sample_plan();
        plan.audio = vec![
            PlannedAudio {
                stream: make_audio_stream(1, "aac", "eng", 2),
                directive: StreamDirective::Copy,
                resolved_language: "eng".to_string(),
            },
            PlannedAudio {
                stream: make_audio_stream(3, "ac3", "jpn", 6),
                directive: StreamDirective::Copy,
                resolved_language: "jpn".to_string(),
            },
        ];

        let args = args_as_strings(&build_video_command(
            &media,
            &plan,
            Container::Mp4,
            30,
            Path::new("/out/in.mp4"),
        ));
        let maps: Vec<&String> = args
            .windows(2)
            .filter(|w| w[0] == "-map")
            .map(|w| &w[1])
            .collect();
        assert_eq!(maps, vec!["0:0", "0:1", "0:3", "0:2"]);
        assert!(has_pair(&args, "-c:a:1", "copy"));
    }

    #[test]
    fn test_happy_path_emits_record_and_clears_state() {
        let dir = TempDir::new().unwrap();
        let media = make_media_info_on_disk(dir.path(), "shows/in.mkv");
        // Output is 9 bytes against an 18-byte input: ratio 0.5.
        let transcoder = Arc::new(FakeTranscoder::new(vec![(0, "", 9)]));
        let (cfg, paths, tools) = encoder_setup(&dir, transcoder);
        let encoder = Encoder::new(&cfg, tools, &paths);

        let record = encoder
            .run(&media, &sample_plan(), &EncodeOptions::default())
            .unwrap();

        assert_eq!(record.crf, 30);
        assert!((record.realized_ratio - 0.5).abs() < 1e-9);
        assert!(record.realized_ratio <= 1.0);
        assert!(record.total_seconds >= record.crf_search_seconds + record.encode_seconds - 1e-6);
        assert_eq!(record.input_file, "shows/in.mkv");
        assert!(paths.encoded_file(&media.path, "mp4").exists());
        assert!(!paths.state_path(&media.path).exists(), "state cleared on success");
        // The executed command is recorded for reproducibility.
        let cmd_txt = fs::read_to_string(paths.cmd_path(&media.path)).unwrap();
        assert!(cmd_txt.contains("-crf 30"));
    }

    #[test]
    fn test_container_fallback_to_mkv() {
        let dir = TempDir::new().unwrap();
        let media = make_media_info_on_disk(dir.path(), "in.mkv");
        let transcoder = Arc::new(FakeTranscoder::new(vec![
            (1, "Could not write header for output file #0", 0),
            (0, "", 9),
        ]));
        let (cfg, paths, tools) = encoder_setup(&dir, transcoder.clone());
        let encoder = Encoder::new(&cfg, tools, &paths);

        let record = encoder
            .run(&media, &sample_plan(), &EncodeOptions::default())
            .unwrap();

        assert!(record.encoded_file_path.ends_with(".mkv"));
        assert!(paths.encoded_file(&media.path, "mkv").exists());
        assert!(!paths.encoded_file(&media.path, "mp4").exists());

        // Both commands were attempted; the second targets mkv.
        let commands = transcoder.commands.lock().unwrap();
        assert_eq!(commands.len(), 2);
        assert!(commands[0].last().unwrap().ends_with(".mp4"));
        assert!(commands[1].last().unwrap().ends_with(".mkv"));
        let cmd_txt = fs::read_to_string(paths.cmd_path(&media.path)).unwrap();
        assert!(cmd_txt.contains(".mkv"));
    }

    #[test]
    fn test_second_container_failure_is_fatal() {
        let dir = TempDir::new().unwrap();
        let media = make_media_info_on_disk(dir.path(), "in.mkv");
        let transcoder = Arc::new(FakeTranscoder::new(vec![
            (1, "Could not write header for output file #0", 0),
            (1, "Error initializing output stream 0:2", 0),
        ]));
        let (cfg, paths, tools) = encoder_setup(&dir, transcoder);
        let encoder = Encoder::new(&cfg, tools, &paths);

        let err = encoder
            .run(&media, &sample_plan(), &EncodeOptions::default())
            .unwrap_err();
        assert!(matches!(err, EncodeError::ContainerIncompatible { .. }));
        assert_eq!(err.kind(), "ContainerIncompatible");
    }

    #[test]
    fn test_oversize_escalates_crf_then_succeeds() {
        let dir = TempDir::new().unwrap();
        let media = make_media_info_on_disk(dir.path(), "in.mkv"); // 18 bytes
        // First output larger than the input, second comfortably smaller.
        let transcoder = Arc::new(FakeTranscoder::new(vec![(0, "", 20), (0, "", 14)]));
        let (cfg, paths, tools) = encoder_setup(&dir, transcoder.clone());
        let encoder = Encoder::new(&cfg, tools, &paths);

        let record = encoder
            .run(&media, &sample_plan(), &EncodeOptions::default())
            .unwrap();

        // ceil(30 × 15 / 100) = 5, so the retry runs at CRF 35.
        assert_eq!(record.crf, 35);
        let commands = transcoder.commands.lock().unwrap();
        assert!(has_pair(&commands[0], "-crf", "30"));
        assert!(has_pair(&commands[1], "-crf", "35"));
        assert!(paths.encoded_file(&media.path, "mp4").exists());
    }

    #[test]
    fn test_oversize_exhausted_after_retry_budget() {
        let dir = TempDir::new().unwrap();
        let media = make_media_info_on_disk(dir.path(), "in.mkv");
        // Every attempt oversized.
        let transcoder = Arc::new(FakeTranscoder::new(vec![
            (0, "", 40),
            (0, "", 40),
            (0, "", 40),
            (0, "", 40),
            (0, "", 40),
            (0, "", 40),
        ]));
        let (mut cfg, paths, tools) = encoder_setup(&dir, transcoder);
        cfg.video.max_oversize_retries = 2;
        let encoder = Encoder::new(&cfg, tools, &paths);

        let err = encoder
            .run(&media, &sample_plan(), &EncodeOptions::default())
            .unwrap_err();
        match err {
            EncodeError::OversizeExhausted { attempts, .. } => assert_eq!(attempts, 2),
            other => panic!("expected OversizeExhausted, got {:?}", other),
        }
        // No output file survives an exhausted escalation.
        assert!(!paths.encoded_file(&media.path, "mp4").exists());
    }

    #[test]
    fn test_oversize_stops_at_crf_ceiling() {
        let dir = TempDir::new().unwrap();
        let media = make_media_info_on_disk(dir.path(), "in.mkv");
        let transcoder = Arc::new(FakeTranscoder::new(vec![
            (0, "", 40),
            (0, "", 40),
            (0, "", 40),
            (0, "", 40),
            (0, "", 40),
        ]));
        let (mut cfg, paths, tools) = encoder_setup(&dir, transcoder);
        cfg.video.max_oversize_retries = 50; // ceiling, not budget, must stop it
        let encoder = Encoder::new(&cfg, tools, &paths);

        let mut plan = sample_plan();
        plan.video_crf = 60; // 60 → 69 would exceed 63
        let err = encoder
            .run(&media, &plan, &EncodeOptions::default())
            .unwrap_err();
        match err {
            EncodeError::OversizeExhausted { final_crf, .. } => assert_eq!(final_crf, 60),
            other => panic!("expected OversizeExhausted, got {:?}", other),
        }
    }

    #[test]
    fn test_move_raw_file_archives_original() {
        let dir = TempDir::new().unwrap();
        let media = make_media_info_on_disk(dir.path(), "shows/in.mkv");
        let transcoder = Arc::new(FakeTranscoder::new(vec![(0, "", 9)]));
        let (cfg, paths, tools) = encoder_setup(&dir, transcoder);
        let encoder = Encoder::new(&cfg, tools, &paths);

        let opts = EncodeOptions {
            move_raw_file: true,
            keep_mtime: false,
        };
        encoder.run(&media, &sample_plan(), &opts).unwrap();

        assert!(!media.path.exists());
        assert!(paths.raw_archive(&media.path).exists());
    }

    #[test]
    fn test_transcoder_failure_reports_diagnostics() {
        let dir = TempDir::new().unwrap();
        let media = make_media_info_on_disk(dir.path(), "in.mkv");
        let transcoder = Arc::new(FakeTranscoder::new(vec![(134, "Segmentation fault", 0)]));
        let (cfg, paths, tools) = encoder_setup(&dir, transcoder);
        let encoder = Encoder::new(&cfg, tools, &paths);

        let err = encoder
            .run(&media, &sample_plan(), &EncodeOptions::default())
            .unwrap_err();
        match &err {
            EncodeError::TranscoderFailed {
                exit_code,
                command,
                stderr_tail,
                ..
            } => {
                assert_eq!(*exit_code, 134);
                assert!(command.contains("-crf 30"));
                assert!(stderr_tail.contains("Segmentation fault"));
            }
            other => panic!("expected TranscoderFailed, got {:?}", other),
        }
        assert_eq!(err.kind(), "TranscoderFailed");
        // The failed state sidecar survives for the next run.
        assert!(paths.state_path(&media.path).exists());
    }

    #[test]
    fn test_is_stream_write_error() {
        assert!(is_stream_write_error(
            "Could not write header for output file #0 (incorrect codec parameters ?)"
        ));
        assert!(is_stream_write_error(
            "Subtitle codec 94213 is not supported... Error initializing output stream 0:2"
        ));
        assert!(!is_stream_write_error("Segmentation fault"));
        assert!(!is_stream_write_error(""));
    }

    #[test]
    fn test_format_fps() {
        assert_eq!(format_fps(24.0), "24");
        assert_eq!(format_fps(23.976023976), "23.976");
        assert_eq!(format_fps(29.97), "29.970");
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(100))]

        // The escalation step is exactly ceil(crf × percent / 100) and always
        // moves the CRF forward.
        #[test]
        fn prop_crf_increment(crf in 1u32..64, percent in 1u32..100) {
            let inc = crf_increment(crf, percent);
            let exact = (crf as f64) * (percent as f64) / 100.0;
            prop_assert!(inc >= 1);
            prop_assert!((inc as f64) >= exact);
            prop_assert!((inc as f64) < exact + 1.0);
        }
    }
}
