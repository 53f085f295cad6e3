//! Error routing: quarantine failed inputs with their diagnostics.
//!
//! A failed file moves to `encode_error/<ErrorKind>/<mirror>/` together with
//! two siblings: `error.txt` (human-readable report) and `probe.json` (the
//! probed metadata). The original tree position is freed so a retry run does
//! not re-process the file.

use std::fs::{self, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use tracing::info;

use crate::fsops::{move_file, unique_destination};
use crate::paths::OutputPaths;
use crate::probe::MediaInfo;

const SEPARATOR: &str = "==================================================";

/// What went wrong, for the error report.
#[derive(Debug, Clone, Default)]
pub struct Diagnostics {
    /// The failing command line, when a subprocess was involved.
    pub command: Option<String>,
    /// Its exit code.
    pub exit_code: Option<i32>,
    /// Tail of its standard output.
    pub stdout_tail: String,
    /// Tail of its standard error.
    pub stderr_tail: String,
    /// Free-form context (which stage failed and why).
    pub context: String,
}

/// Quarantine a probed file: move it, write `error.txt` and `probe.json`.
/// Returns the file's new location.
pub fn quarantine(
    paths: &OutputPaths,
    kind: &str,
    media: &MediaInfo,
    diag: &Diagnostics,
) -> io::Result<PathBuf> {
    let target = quarantine_file(paths, kind, &media.path, diag)?;

    let dir = target.parent().unwrap_or_else(|| Path::new("."));
    let probe_json = serde_json::to_string_pretty(media)
        .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
    fs::write(dir.join("probe.json"), probe_json)?;

    Ok(target)
}

/// Quarantine a file that never produced a [`MediaInfo`] (probe failures).
pub fn quarantine_unprobed(
    paths: &OutputPaths,
    kind: &str,
    input: &Path,
    diag: &Diagnostics,
) -> io::Result<PathBuf> {
    quarantine_file(paths, kind, input, diag)
}

fn quarantine_file(
    paths: &OutputPaths,
    kind: &str,
    input: &Path,
    diag: &Diagnostics,
) -> io::Result<PathBuf> {
    let dir = paths.quarantine_dir(kind, input);
    fs::create_dir_all(&dir)?;

    write_error_report(&dir, input, diag)?;

    let file_name = input
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| "unnamed".to_string());
    let target = unique_destination(&dir, &file_name);

    if input.exists() {
        move_file(input, &target)?;
        info!(kind, from = %input.display(), to = %target.display(), "quarantined");
    }
    Ok(target)
}

/// Appends one report block to `error.txt` in the quarantine directory.
fn write_error_report(dir: &Path, input: &Path, diag: &Diagnostics) -> io::Result<()> {
    let mut lines = Vec::new();
    lines.push(format!("Original file: {}", input.display()));
    if !diag.context.is_empty() {
        lines.push(format!("Context: {}", diag.context));
    }
    if let Some(command) = &diag.command {
        lines.push(format!("Failed command: {}", command));
    }
    if let Some(code) = diag.exit_code {
        lines.push(format!("Exit code: {}", code));
    }
    if !diag.stdout_tail.is_empty() {
        lines.push(format!("Stdout: {}", diag.stdout_tail));
    }
    if !diag.stderr_tail.is_empty() {
        lines.push(format!("Stderr: {}", diag.stderr_tail));
    }

    let mut file = OpenOptions::new()
        .create(true)
        .append(true)
        .open(dir.join("error.txt"))?;
    writeln!(file, "{}\n{}", lines.join("\n"), SEPARATOR)
}
