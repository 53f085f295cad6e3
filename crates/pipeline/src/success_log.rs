//! Success logging: per-file YAML records and the end-of-run aggregate.
//!
//! Each worker appends its records to a dated, randomly suffixed file beside
//! the output so concurrent workers never share a log file. At the end of a
//! run every per-file log under the run root is merged with any existing
//! aggregate, sorted by end time, re-indexed and written as
//! `combined_log.yaml`.

use chrono::Local;
use rand::Rng;
use serde::{Deserialize, Serialize};
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

/// Length of the random suffix on per-file log names.
const LOG_RANDOM_LENGTH: usize = 10;

/// One record per successful output.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SuccessRecord {
    /// Position in its log file; re-assigned when logs are combined.
    pub index: u32,
    /// Input path relative to the run root.
    pub input_file: String,
    pub source_file_md5: String,
    pub source_file_sha256: String,
    pub encoder_codec: String,
    pub crf: u32,
    /// CRF-search size estimate; 1.0 when the search was skipped.
    pub estimated_size_ratio: f64,
    /// output_size / input_size, rounded to 4 decimals.
    pub realized_ratio: f64,
    pub file_duration_seconds: f64,
    pub file_duration_formatted: String,
    pub crf_search_seconds: f64,
    pub encode_seconds: f64,
    pub total_seconds: f64,
    pub crf_search_time_formatted: String,
    pub encode_time_formatted: String,
    pub total_time_formatted: String,
    pub target_vmaf: u32,
    pub original_size_bytes: u64,
    pub encoded_size_bytes: u64,
    pub encoded_file_path: String,
    /// `%Y%m%d_%H:%M:%S`; the combined log sorts on this.
    pub ended_datetime: String,
    pub host: String,
    pub platform: String,
}

/// Appends one record to a per-file log in `dir`, creating a dated file with
/// a random suffix on first use. Returns the log path.
pub fn write_success_record(dir: &Path, record: &SuccessRecord) -> io::Result<PathBuf> {
    fs::create_dir_all(dir)?;
    let log_path = dir.join(format!(
        "log_{}_{}.yaml",
        Local::now().format("%Y%m%d"),
        random_suffix()
    ));

    let mut entries = read_record_list(&log_path);
    let mut entry = record.clone();
    entry.index = entries.iter().map(|r| r.index).max().unwrap_or(0) + 1;
    entries.push(entry);

    let yaml = serde_yaml::to_string(&entries)
        .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
    fs::write(&log_path, yaml)?;
    debug!(log = %log_path.display(), "success record written");
    Ok(log_path)
}

/// Merges every per-file log under `run_root` (plus any existing aggregate)
/// into `combined_log.yaml`: sorted by end time, indexes re-assigned, merged
/// inputs deleted. Returns the number of combined records.
pub fn combine_logs(run_root: &Path, combined_path: &Path) -> io::Result<usize> {
    let mut entries: Vec<SuccessRecord> = Vec::new();

    let per_file_logs: Vec<PathBuf> = walkdir::WalkDir::new(run_root)
        .into_iter()
        .filter_map(|e| e.ok())
        .filter(|e| e.file_type().is_file())
        .filter(|e| {
            e.file_name()
                .to_str()
                .map(is_per_file_log_name)
                .unwrap_or(false)
        })
        .map(|e| e.path().to_path_buf())
        .collect();

    for log in &per_file_logs {
        let mut records = read_record_list(log);
        if records.is_empty() {
            warn!(log = %log.display(), "per-file log held no readable records");
        }
        entries.append(&mut records);
        fs::remove_file(log)?;
    }

    if combined_path.exists() {
        entries.append(&mut read_record_list(combined_path));
    }

    if entries.is_empty() {
        return Ok(0);
    }

    entries.sort_by(|a, b| a.ended_datetime.cmp(&b.ended_datetime));
    for (i, entry) in entries.iter_mut().enumerate() {
        entry.index = (i + 1) as u32;
    }

    let yaml = serde_yaml::to_string(&entries)
        .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
    fs::write(combined_path, yaml)?;
    info!(
        combined = %combined_path.display(),
        records = entries.len(),
        "combined success log written"
    );
    Ok(entries.len())
}

/// Input stems already present in the aggregate log; the phone pipeline uses
/// this to avoid re-encoding files it has finished before.
pub fn logged_input_stems(combined_path: &Path) -> Vec<String> {
    read_record_list(combined_path)
        .iter()
        .filter_map(|r| {
            Path::new(&r.input_file)
                .file_stem()
                .map(|s| s.to_string_lossy().into_owned())
        })
        .collect()
}

/// `log_<YYYYMMDD>_<suffix>.yaml`
fn is_per_file_log_name(name: &str) -> bool {
    let Some(rest) = name.strip_prefix("log_") else {
        return false;
    };
    let Some(rest) = rest.strip_suffix(".yaml") else {
        return false;
    };
    let mut parts = rest.splitn(2, '_');
    let date = parts.next().unwrap_or("");
    let suffix = parts.next().unwrap_or("");
    date.len() == 8 && date.chars().all(|c| c.is_ascii_digit()) && !suffix.is_empty()
}

fn read_record_list(path: &Path) -> Vec<SuccessRecord> {
    let Ok(content) = fs::read_to_string(path) else {
        return Vec::new();
    };
    match serde_yaml::from_str::<Vec<SuccessRecord>>(&content) {
        Ok(records) => records,
        Err(e) => {
            warn!(log = %path.display(), error = %e, "unreadable success log");
            Vec::new()
        }
    }
}

fn random_suffix() -> String {
    const CHARSET: &[u8] = b"ABCDEFGHIJKLMNOPQRSTUVWXYZ0123456789";
    let mut rng = rand::thread_rng();
    (0..LOG_RANDOM_LENGTH)
        .map(|_| CHARSET[rng.gen_range(0..CHARSET.len())] as char)
        .collect()
}
