//! External tool adapters
//!
//! Every subprocess the pipeline touches (media inspector, CRF-search helper,
//! transcoder, speech classifier) goes through the [`CommandRunner`] trait so
//! tests can substitute fakes without spawning anything.

use av1_batch_config::ToolsConfig;
use std::ffi::{OsStr, OsString};
use std::io;
use std::path::Path;
use std::process::Command;
use std::sync::Arc;

/// Captured result of a finished subprocess.
#[derive(Debug, Clone, Default)]
pub struct CommandOutput {
    /// Process exit code; -1 when the process was killed by a signal.
    pub exit_code: i32,
    /// Captured standard output, lossily decoded.
    pub stdout: String,
    /// Captured standard error, lossily decoded.
    pub stderr: String,
}

impl CommandOutput {
    pub fn success(&self) -> bool {
        self.exit_code == 0
    }
}

/// Executes external commands. The production implementation spawns real
/// processes; tests inject fakes.
pub trait CommandRunner: Send + Sync {
    fn run(&self, program: &str, args: &[OsString]) -> io::Result<CommandOutput>;
}

/// Runner backed by `std::process::Command`.
#[derive(Debug, Default)]
pub struct SystemRunner;

impl CommandRunner for SystemRunner {
    fn run(&self, program: &str, args: &[OsString]) -> io::Result<CommandOutput> {
        let output = Command::new(program).args(args).output()?;
        Ok(CommandOutput {
            exit_code: output.status.code().unwrap_or(-1),
            stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
            stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
        })
    }
}

/// Renders a command line for `cmd.txt` and error reports. Arguments with
/// whitespace are single-quoted; this is a display form, not shell input.
pub fn render_command(program: &str, args: &[OsString]) -> String {
    let mut parts = Vec::with_capacity(args.len() + 1);
    parts.push(program.to_string());
    for arg in args {
        let s = arg.to_string_lossy();
        if s.is_empty() || s.contains(char::is_whitespace) {
            parts.push(format!("'{}'", s));
        } else {
            parts.push(s.into_owned());
        }
    }
    parts.join(" ")
}

/// Resolved tool set shared by every pipeline stage.
pub struct Tools {
    runner: Arc<dyn CommandRunner>,
    pub ffmpeg: String,
    pub ffprobe: String,
    pub ab_av1: String,
    pub whisper: String,
}

impl Tools {
    /// Resolve tools from configuration, spawning real processes.
    pub fn from_config(cfg: &ToolsConfig) -> Self {
        Self::with_runner(cfg, Arc::new(SystemRunner))
    }

    /// Resolve tools from configuration with an injected runner.
    pub fn with_runner(cfg: &ToolsConfig, runner: Arc<dyn CommandRunner>) -> Self {
        Self {
            runner,
            ffmpeg: resolve_tool(cfg, &cfg.ffmpeg),
            ffprobe: resolve_tool(cfg, &cfg.ffprobe),
            ab_av1: resolve_tool(cfg, &cfg.ab_av1),
            whisper: resolve_tool(cfg, &cfg.whisper),
        }
    }

    /// Run an arbitrary program through the underlying runner.
    pub fn run(&self, program: &str, args: &[OsString]) -> io::Result<CommandOutput> {
        self.runner.run(program, args)
    }

    /// Ask the media inspector for JSON stream and format metadata.
    pub fn inspect_json(&self, path: &Path) -> io::Result<CommandOutput> {
        let args = os_args(&[
            OsStr::new("-v"),
            OsStr::new("quiet"),
            OsStr::new("-print_format"),
            OsStr::new("json"),
            OsStr::new("-show_streams"),
            OsStr::new("-show_format"),
            path.as_os_str(),
        ]);
        self.runner.run(&self.ffprobe, &args)
    }

    /// Invoke the CRF-search helper for one candidate encoder.
    pub fn crf_search(
        &self,
        encoder: &str,
        input: &Path,
        sample_every: &str,
        max_encoded_percent: u32,
        min_vmaf: u32,
        temp_dir: Option<&Path>,
    ) -> io::Result<CommandOutput> {
        let mut args = os_args(&[
            OsStr::new("crf-search"),
            OsStr::new("-e"),
            OsStr::new(encoder),
            OsStr::new("-i"),
            input.as_os_str(),
            OsStr::new("--sample-every"),
            OsStr::new(sample_every),
        ]);
        args.push(OsString::from("--max-encoded-percent"));
        args.push(OsString::from(max_encoded_percent.to_string()));
        args.push(OsString::from("--min-vmaf"));
        args.push(OsString::from(min_vmaf.to_string()));
        if let Some(dir) = temp_dir {
            args.push(OsString::from("--temp-dir"));
            args.push(dir.as_os_str().to_owned());
        }
        self.runner.run(&self.ab_av1, &args)
    }

    /// Run the transcoder with a fully built argument list.
    pub fn transcode(&self, args: &[OsString]) -> io::Result<CommandOutput> {
        self.runner.run(&self.ffmpeg, args)
    }

    /// Extract one mono 16 kHz audio clip for language classification.
    pub fn extract_clip(
        &self,
        input: &Path,
        stream_index: u32,
        start_seconds: u64,
        clip_seconds: u32,
        out_path: &Path,
    ) -> io::Result<CommandOutput> {
        let mut args = os_args(&[OsStr::new("-y"), OsStr::new("-ss")]);
        args.push(OsString::from(start_seconds.to_string()));
        args.push(OsString::from("-t"));
        args.push(OsString::from(clip_seconds.to_string()));
        args.push(OsString::from("-i"));
        args.push(input.as_os_str().to_owned());
        args.push(OsString::from("-map"));
        args.push(OsString::from(format!("0:{}", stream_index)));
        args.push(OsString::from("-ac"));
        args.push(OsString::from("1"));
        args.push(OsString::from("-ar"));
        args.push(OsString::from("16000"));
        args.push(out_path.as_os_str().to_owned());
        self.runner.run(&self.ffmpeg, &args)
    }

    /// Ask the speech classifier for the language of a clip.
    pub fn classify_language(&self, clip: &Path) -> io::Result<CommandOutput> {
        let args = os_args(&[
            OsStr::new("--detect-language"),
            OsStr::new("-l"),
            OsStr::new("auto"),
            clip.as_os_str(),
        ]);
        self.runner.run(&self.whisper, &args)
    }
}

fn resolve_tool(cfg: &ToolsConfig, name: &str) -> String {
    match &cfg.module_dir {
        Some(dir) => dir.join(name).to_string_lossy().into_owned(),
        None => name.to_string(),
    }
}

fn os_args(args: &[&OsStr]) -> Vec<OsString> {
    args.iter().map(|a| a.to_os_string()).collect()
}
