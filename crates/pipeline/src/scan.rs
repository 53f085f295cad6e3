//! Scanner: discovers candidate media files under the run root.
//!
//! Recursively walks the tree, filtering by extension allow-list and by
//! directory-name keywords so output, raw-archive, skip and quarantine trees
//! are never re-processed. Optionally normalizes filenames (whitespace
//! collapsing) before the run starts.

use std::fs;
use std::path::{Path, PathBuf};
use tracing::{debug, warn};
use walkdir::WalkDir;

/// Recursively collects files under `root` whose extension is in
/// `extensions` (lowercase, with dot) and whose size meets `min_size_bytes`,
/// skipping hidden directories and any directory whose name contains one of
/// `exclude_dir_keywords` (case-insensitive). The result is sorted.
pub fn enumerate(
    root: &Path,
    extensions: &[String],
    exclude_dir_keywords: &[String],
    min_size_bytes: u64,
) -> Vec<PathBuf> {
    let mut files = Vec::new();

    let walker = WalkDir::new(root).into_iter().filter_entry(|entry| {
        if entry.depth() == 0 || !entry.file_type().is_dir() {
            return true;
        }
        let name = entry.file_name().to_string_lossy().to_lowercase();
        if name.starts_with('.') {
            return false;
        }
        !exclude_dir_keywords
            .iter()
            .any(|kw| !kw.is_empty() && name.contains(&kw.to_lowercase()))
    });

    for entry in walker.filter_map(|e| e.ok()) {
        if !entry.file_type().is_file() {
            continue;
        }
        let path = entry.path();
        if !has_allowed_extension(path, extensions) {
            continue;
        }
        match entry.metadata() {
            Ok(meta) if meta.len() >= min_size_bytes => files.push(path.to_path_buf()),
            Ok(meta) => {
                debug!(path = %path.display(), size = meta.len(), "below minimum size, ignored");
            }
            Err(e) => warn!(path = %path.display(), error = %e, "could not stat candidate"),
        }
    }

    files.sort();
    files
}

/// Case-insensitive extension allow-list check.
pub fn has_allowed_extension(path: &Path, extensions: &[String]) -> bool {
    path.extension()
        .and_then(|e| e.to_str())
        .map(|e| {
            let dotted = format!(".{}", e.to_lowercase());
            extensions.iter().any(|allowed| allowed.to_lowercase() == dotted)
        })
        .unwrap_or(false)
}

/// Collapses whitespace runs in a file stem to single spaces.
pub fn normalized_file_name(name: &str) -> String {
    let path = Path::new(name);
    let stem = path
        .file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_else(|| name.to_string());
    let ext = path
        .extension()
        .map(|e| format!(".{}", e.to_string_lossy()))
        .unwrap_or_default();

    let collapsed = stem.split_whitespace().collect::<Vec<_>>().join(" ");
    format!("{}{}", collapsed, ext)
}

/// Renames files whose names need normalization; returns the (possibly
/// renamed) candidate list. A rename is skipped when its target exists.
pub fn normalize_file_names(files: Vec<PathBuf>) -> Vec<PathBuf> {
    files
        .into_iter()
        .map(|path| {
            let Some(name) = path.file_name().map(|n| n.to_string_lossy().into_owned()) else {
                return path;
            };
            let normalized = normalized_file_name(&name);
            if normalized == name {
                return path;
            }
            let target = path.with_file_name(&normalized);
            if target.exists() {
                warn!(
                    from = %path.display(),
                    to = %target.display(),
                    "normalization target exists, keeping original name"
                );
                return path;
            }
            match fs::rename(&path, &target) {
                Ok(()) => {
                    debug!(from = %path.display(), to = %target.display(), "normalized file name");
                    target
                }
                Err(e) => {
                    warn!(path = %path.display(), error = %e, "rename failed");
                    path
                }
            }
        })
        .collect()
}
