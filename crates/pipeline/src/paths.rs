//! Output path policy.
//!
//! Every location the pipeline writes to is derived here, as a pure function
//! of the input path, the encoder tag and the output container. Workers never
//! collide because all derived paths mirror the input's position under the
//! run root.

use std::path::{Path, PathBuf};

/// Derives all persisted locations relative to one run root.
#[derive(Debug, Clone)]
pub struct OutputPaths {
    run_root: PathBuf,
    encoder_tag: String,
}

impl OutputPaths {
    pub fn new(run_root: &Path, encoder_tag: &str) -> Self {
        Self {
            run_root: run_root.to_path_buf(),
            encoder_tag: encoder_tag.to_string(),
        }
    }

    pub fn run_root(&self) -> &Path {
        &self.run_root
    }

    /// Input's directory relative to the run root; empty for files directly
    /// under the root or outside it.
    pub fn mirror(&self, input: &Path) -> PathBuf {
        input
            .parent()
            .and_then(|p| p.strip_prefix(&self.run_root).ok())
            .map(|p| p.to_path_buf())
            .unwrap_or_default()
    }

    /// Output directory root: `<encoder_tag>_encoded`.
    pub fn encoded_root(&self) -> PathBuf {
        self.run_root.join(format!("{}_encoded", self.encoder_tag))
    }

    /// Mirror directory for one input inside the output root.
    pub fn encoded_dir(&self, input: &Path) -> PathBuf {
        self.encoded_root().join(self.mirror(input))
    }

    /// Target output file for one input and container extension.
    pub fn encoded_file(&self, input: &Path, extension: &str) -> PathBuf {
        let stem = input
            .file_stem()
            .map(|s| s.to_string_lossy().into_owned())
            .unwrap_or_default();
        self.encoded_dir(input).join(format!("{}.{}", stem, extension))
    }

    /// Per-output encode state sidecar.
    pub fn state_path(&self, input: &Path) -> PathBuf {
        let stem = input
            .file_stem()
            .map(|s| s.to_string_lossy().into_owned())
            .unwrap_or_default();
        self.encoded_dir(input).join(format!("{}.state.json", stem))
    }

    /// Append-only transcoder command log beside the outputs.
    pub fn cmd_path(&self, input: &Path) -> PathBuf {
        self.encoded_dir(input).join("cmd.txt")
    }

    /// Raw-archive root: `_raw`.
    pub fn raw_root(&self) -> PathBuf {
        self.run_root.join("_raw")
    }

    /// Archived-original location for one input.
    pub fn raw_archive(&self, input: &Path) -> PathBuf {
        self.raw_root()
            .join(self.mirror(input))
            .join(input.file_name().unwrap_or_default())
    }

    /// Skip-bucket location for one input.
    pub fn skip_bucket(&self, input: &Path) -> PathBuf {
        self.run_root
            .join("skipped")
            .join(self.mirror(input))
            .join(input.file_name().unwrap_or_default())
    }

    /// Oversize-bucket location for one input. Distinct from the error
    /// quarantine so operators can triage these separately.
    pub fn oversize_bucket(&self, input: &Path) -> PathBuf {
        self.run_root
            .join("oversized")
            .join(self.mirror(input))
            .join(input.file_name().unwrap_or_default())
    }

    /// Quarantine directory for one error kind and input.
    pub fn quarantine_dir(&self, kind: &str, input: &Path) -> PathBuf {
        self.run_root
            .join("encode_error")
            .join(kind)
            .join(self.mirror(input))
    }

    /// Run-local append-only skip ledger.
    pub fn skip_ledger(&self) -> PathBuf {
        self.run_root.join("skipped.txt")
    }

    /// End-of-run aggregate log.
    pub fn combined_log(&self) -> PathBuf {
        self.run_root.join("combined_log.yaml")
    }

    /// Output directory for the audio-only pipeline.
    pub fn audio_encoded_dir(&self, input: &Path, opus_encoder: &str, bitrate_bps: u64) -> PathBuf {
        self.run_root
            .join(format!("Encoded_{}_{}kbps", opus_encoder, bitrate_bps / 1000))
            .join(self.mirror(input))
    }

    /// Output directory for the phone-preset pipeline.
    pub fn phone_encoded_dir(
        &self,
        input: &Path,
        video_codec: &str,
        video_kbps: u64,
        audio_bps: u64,
    ) -> PathBuf {
        self.run_root
            .join(format!(
                "converted_{}_vbitrate_{}k_abitrate_{}k",
                video_codec,
                video_kbps,
                audio_bps / 1000
            ))
            .join(self.mirror(input))
    }

    /// Completion root the `_raw` archive moves to once the input tree holds
    /// no more processable files.
    pub fn raw_completion_root(&self) -> PathBuf {
        self.run_root
            .join(format!("{}_encoded_raw_done", self.encoder_tag))
    }
}
