//! Durable per-file encode state.
//!
//! A small JSON sidecar next to the target output records the in-flight
//! encoder/CRF choice so a crashed or restarted run can resume without
//! repeating the CRF search. The sidecar is only trusted when its plan
//! fingerprint matches the current input and configuration.

use av1_batch_config::VideoConfig;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fs;
use std::io;
use std::path::Path;
use tracing::debug;

/// Persisted per-file scratch record.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct EncodeState {
    /// Stable hash over the input identity and the plan-relevant settings.
    pub plan_fingerprint: String,
    /// Chosen encoder.
    pub encoder: String,
    /// Chosen CRF.
    pub crf: u32,
    /// Transcoder attempts so far (container fallback and oversize retries).
    pub attempt_count: u32,
    /// Kind of the most recent failure, if any.
    pub last_error_kind: Option<String>,
}

impl EncodeState {
    pub fn new(plan_fingerprint: String, encoder: String, crf: u32) -> Self {
        Self {
            plan_fingerprint,
            encoder,
            crf,
            attempt_count: 0,
            last_error_kind: None,
        }
    }

    /// Load a sidecar. Returns None when the file is missing or unparseable;
    /// a corrupt sidecar is treated the same as an absent one.
    pub fn load(path: &Path) -> Option<Self> {
        let content = fs::read_to_string(path).ok()?;
        match serde_json::from_str(&content) {
            Ok(state) => Some(state),
            Err(e) => {
                debug!(path = %path.display(), error = %e, "discarding unparseable state sidecar");
                None
            }
        }
    }

    /// Load a sidecar only if its fingerprint matches; a mismatched sidecar
    /// is deleted so a stale attempt cannot leak into this run.
    pub fn load_matching(path: &Path, fingerprint: &str) -> Option<Self> {
        let state = Self::load(path)?;
        if state.plan_fingerprint == fingerprint {
            Some(state)
        } else {
            debug!(path = %path.display(), "fingerprint mismatch, removing stale state");
            Self::remove(path);
            None
        }
    }

    /// Persist the sidecar, creating parent directories as needed.
    pub fn save(&self, path: &Path) -> io::Result<()> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        let json = serde_json::to_string_pretty(self)
            .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
        fs::write(path, json)
    }

    /// Remove the sidecar; missing files are not an error.
    pub fn remove(path: &Path) {
        let _ = fs::remove_file(path);
    }
}

/// Stable fingerprint over the input identity (md5) and every setting that
/// would change the outcome of a CRF search. Two runs with the same input
/// and settings produce the same fingerprint.
pub fn plan_fingerprint(input_md5: &str, mode: &str, video: &VideoConfig) -> String {
    let mut hasher = Sha256::new();
    hasher.update(input_md5.as_bytes());
    hasher.update(b"|");
    hasher.update(mode.as_bytes());
    hasher.update(b"|");
    hasher.update(video.encoders.join(",").as_bytes());
    hasher.update(b"|");
    hasher.update(video.target_vmaf.to_le_bytes());
    hasher.update(video.max_encoded_percent.to_le_bytes());
    hasher.update(video.sample_every.as_bytes());
    format!("{:x}", hasher.finalize())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn sample_state(fingerprint: &str) -> EncodeState {
        EncodeState::new(fingerprint.to_string(), "libsvtav1".to_string(), 30)
    }

    #[test]
    fn test_save_and_load_round_trip() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("deep/nested/ep1.state.json");

        let mut state = sample_state("fp-1");
        state.attempt_count = 2;
        state.last_error_kind = Some("Oversize".to_string());
        state.save(&path).unwrap();

        let loaded = EncodeState::load(&path).expect("sidecar should load");
        assert_eq!(loaded, state);
    }

    #[test]
    fn test_load_missing_returns_none() {
        let dir = TempDir::new().unwrap();
        assert_eq!(EncodeState::load(&dir.path().join("nope.json")), None);
    }

    #[test]
    fn test_load_corrupt_returns_none() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("bad.state.json");
        fs::write(&path, "{not json").unwrap();
        assert_eq!(EncodeState::load(&path), None);
    }

    #[test]
    fn test_load_matching_accepts_same_fingerprint() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("ep1.state.json");
        sample_state("fp-same").save(&path).unwrap();

        let loaded = EncodeState::load_matching(&path, "fp-same");
        assert!(loaded.is_some());
        assert!(path.exists());
    }

    #[test]
    fn test_load_matching_deletes_stale_fingerprint() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("ep1.state.json");
        sample_state("fp-old").save(&path).unwrap();

        let loaded = EncodeState::load_matching(&path, "fp-new");
        assert!(loaded.is_none());
        assert!(!path.exists(), "stale sidecar must be removed");
    }

    #[test]
    fn test_fingerprint_stability_and_sensitivity() {
        let video = VideoConfig::default();

        let a = plan_fingerprint("aabbcc", "video", &video);
        let b = plan_fingerprint("aabbcc", "video", &video);
        assert_eq!(a, b, "same inputs must fingerprint identically");

        let c = plan_fingerprint("ddeeff", "video", &video);
        assert_ne!(a, c, "different md5 must change the fingerprint");

        let d = plan_fingerprint("aabbcc", "audio_only", &video);
        assert_ne!(a, d, "different mode must change the fingerprint");

        let mut tweaked = VideoConfig::default();
        tweaked.target_vmaf = 90;
        let e = plan_fingerprint("aabbcc", "video", &tweaked);
        assert_ne!(a, e, "different quality target must change the fingerprint");
    }
}
