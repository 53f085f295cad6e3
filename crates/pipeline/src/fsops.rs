//! Filesystem helpers shared by the pipeline stages.

use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use tracing::debug;

/// Moves a file, creating the destination's parents. Tries a rename first
/// and falls back to copy + delete when the destination is on another
/// filesystem.
pub fn move_file(src: &Path, dst: &Path) -> io::Result<()> {
    if let Some(parent) = dst.parent() {
        fs::create_dir_all(parent)?;
    }
    if fs::rename(src, dst).is_err() {
        fs::copy(src, dst)?;
        fs::remove_file(src)?;
    }
    Ok(())
}

/// Returns a destination path in `dir` that does not exist yet, appending
/// `_1`, `_2`, … to the stem on collision.
pub fn unique_destination(dir: &Path, file_name: &str) -> PathBuf {
    let candidate = dir.join(file_name);
    if !candidate.exists() {
        return candidate;
    }

    let path = Path::new(file_name);
    let stem = path
        .file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_else(|| file_name.to_string());
    let ext = path
        .extension()
        .map(|e| format!(".{}", e.to_string_lossy()))
        .unwrap_or_default();

    let mut counter = 0u32;
    loop {
        counter += 1;
        let next = dir.join(format!("{}_{}{}", stem, counter, ext));
        if !next.exists() {
            return next;
        }
    }
}

/// Removes empty directories below `root`, deepest first, repeating until a
/// pass deletes nothing so nested empties collapse fully.
pub fn remove_empty_dirs(root: &Path) {
    loop {
        let mut deleted = false;
        let mut dirs: Vec<PathBuf> = walkdir::WalkDir::new(root)
            .min_depth(1)
            .into_iter()
            .filter_map(|e| e.ok())
            .filter(|e| e.file_type().is_dir())
            .map(|e| e.path().to_path_buf())
            .collect();
        dirs.sort();
        dirs.reverse();

        for dir in dirs {
            let is_empty = fs::read_dir(&dir)
                .map(|mut entries| entries.next().is_none())
                .unwrap_or(false);
            if is_empty && fs::remove_dir(&dir).is_ok() {
                debug!(dir = %dir.display(), "removed empty directory");
                deleted = true;
            }
        }

        if !deleted {
            break;
        }
    }
}

/// Deletes scratch directories below `root` whose names start with one of
/// the given prefixes (e.g. `.ab-av1-`, `.tmp-lang-`).
pub fn delete_scratch_dirs(root: &Path, prefixes: &[&str]) {
    let scratch: Vec<PathBuf> = walkdir::WalkDir::new(root)
        .min_depth(1)
        .into_iter()
        .filter_map(|e| e.ok())
        .filter(|e| {
            e.file_type().is_dir()
                && e.file_name()
                    .to_str()
                    .map(|name| prefixes.iter().any(|p| name.starts_with(p)))
                    .unwrap_or(false)
        })
        .map(|e| e.path().to_path_buf())
        .collect();

    for dir in scratch {
        if fs::remove_dir_all(&dir).is_ok() {
            debug!(dir = %dir.display(), "deleted scratch directory");
        }
    }
}
