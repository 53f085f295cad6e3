//! Worker pool: enumerates inputs and runs the per-file pipeline in
//! parallel.
//!
//! Each worker runs one file's pipeline (probe → pre-encode → encode → log)
//! to completion before taking another; concurrency is bounded by a
//! semaphore. A transcoder crash fails only that file. On interrupt the pool
//! stops dispatching, lets running files finish and still performs end-of-run
//! cleanup.

use av1_batch_config::Config;
use rand::seq::SliceRandom;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tracing::{error, info, warn};

use crate::encode::{EncodeError, EncodeOptions, Encoder};
use crate::error_router::{quarantine, quarantine_unprobed, Diagnostics};
use crate::fsops::{self, move_file, unique_destination};
use crate::paths::OutputPaths;
use crate::pre_encode::{AnalyzeOptions, PreEncodeOutcome, PreEncoder};
use crate::probe::Prober;
use crate::scan;
use crate::success_log;
use crate::tools::Tools;

/// Scratch directory prefixes removed during end-of-run cleanup.
const SCRATCH_PREFIXES: &[&str] = &[".ab-av1-", ".tmp-lang-"];

/// Error type for orchestrator-level failures. Per-file failures never
/// surface here; they are quarantined and counted.
#[derive(Debug, Error)]
pub enum PoolError {
    #[error("run root is not a readable directory: {}", .0.display())]
    UnreadableRoot(PathBuf),

    #[error("IO error: {0}")]
    Io(#[from] io::Error),
}

/// Which pipeline a run executes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PipelineMode {
    /// Quality-targeted video re-encoding (CRF search).
    Video,
    /// Fixed-bitrate Opus encoding of audio files.
    AudioOnly,
    /// Fixed phone profile for video files.
    Phone,
}

/// Flags assembled by the CLI front-end.
#[derive(Debug, Clone)]
pub struct RunOptions {
    pub mode: PipelineMode,
    /// Parallel workers; 0 falls back to the config value, and a zero config
    /// value auto-derives from the CPU count.
    pub processes: u32,
    pub move_raw_file: bool,
    pub keep_mtime: bool,
    pub manual_mode: bool,
    pub allow_no_audio: bool,
    /// Shuffle the candidate order for even progress across subtrees.
    pub shuffle: bool,
    /// Normalize discovered filenames before processing.
    pub rename: bool,
    pub temp_work_dir: Option<PathBuf>,
}

impl Default for RunOptions {
    fn default() -> Self {
        Self {
            mode: PipelineMode::Video,
            processes: 0,
            move_raw_file: false,
            keep_mtime: false,
            manual_mode: false,
            allow_no_audio: false,
            shuffle: false,
            rename: true,
            temp_work_dir: None,
        }
    }
}

/// Exactly one outcome per dispatched file.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FileOutcome {
    /// Output produced and success record written.
    Succeeded,
    /// Skip rule matched; ledger entry written, file in the skip bucket.
    Skipped,
    /// CRF escalation exhausted; file in the oversize bucket.
    Oversized,
    /// Quarantined with diagnostics.
    Failed,
}

/// End-of-run accounting.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RunSummary {
    pub candidates: usize,
    pub succeeded: usize,
    pub skipped: usize,
    pub oversized: usize,
    pub failed: usize,
    pub interrupted: bool,
}

impl RunSummary {
    fn record(&mut self, outcome: FileOutcome) {
        match outcome {
            FileOutcome::Succeeded => self.succeeded += 1,
            FileOutcome::Skipped => self.skipped += 1,
            FileOutcome::Oversized => self.oversized += 1,
            FileOutcome::Failed => self.failed += 1,
        }
    }
}

/// The pool itself: shared config, tools and path policy.
pub struct WorkerPool {
    cfg: Arc<Config>,
    tools: Arc<Tools>,
    run_root: PathBuf,
}

impl WorkerPool {
    pub fn new(cfg: Arc<Config>, tools: Arc<Tools>, run_root: PathBuf) -> Self {
        Self {
            cfg,
            tools,
            run_root,
        }
    }

    /// Run the whole pipeline over the tree. Per-file failures are counted,
    /// never fatal; the Err variants are orchestrator-level only.
    pub async fn run(&self, opts: RunOptions) -> Result<RunSummary, PoolError> {
        if !self.run_root.is_dir() {
            return Err(PoolError::UnreadableRoot(self.run_root.clone()));
        }
        let paths = Arc::new(OutputPaths::new(&self.run_root, &self.cfg.encoder_tag()));

        let mut files = self.collect_candidates(&opts, &paths);
        let summary_candidates = files.len();
        info!(candidates = summary_candidates, "dispatching");

        if opts.shuffle {
            files.shuffle(&mut rand::thread_rng());
        }

        let interrupted = Arc::new(AtomicBool::new(false));
        {
            let interrupted = interrupted.clone();
            tokio::spawn(async move {
                if tokio::signal::ctrl_c().await.is_ok() {
                    warn!("interrupt received; draining running encodes");
                    interrupted.store(true, Ordering::SeqCst);
                }
            });
        }

        let workers = self.worker_count(&opts);
        let semaphore = Arc::new(Semaphore::new(workers));
        let mut join_set: JoinSet<FileOutcome> = JoinSet::new();
        let mut summary = RunSummary {
            candidates: summary_candidates,
            ..Default::default()
        };

        for file in files {
            if interrupted.load(Ordering::SeqCst) {
                summary.interrupted = true;
                break;
            }
            let permit = semaphore
                .clone()
                .acquire_owned()
                .await
                .expect("semaphore should not be closed");
            if interrupted.load(Ordering::SeqCst) {
                summary.interrupted = true;
                break;
            }

            let cfg = self.cfg.clone();
            let tools = self.tools.clone();
            let paths = paths.clone();
            let task_opts = opts.clone();
            join_set.spawn(async move {
                let _permit = permit;
                let name = file.display().to_string();
                match tokio::task::spawn_blocking(move || {
                    process_file(&cfg, &tools, &paths, &task_opts, &file)
                })
                .await
                {
                    Ok(outcome) => outcome,
                    Err(e) => {
                        // A panicking worker poisons only its own file.
                        error!(file = %name, error = %e, "worker panicked");
                        FileOutcome::Failed
                    }
                }
            });
        }

        while let Some(result) = join_set.join_next().await {
            match result {
                Ok(outcome) => summary.record(outcome),
                Err(e) => {
                    error!(error = %e, "worker task failed to join");
                    summary.record(FileOutcome::Failed);
                }
            }
        }

        self.cleanup(&opts, &paths);
        info!(?summary, "run complete");
        Ok(summary)
    }

    fn worker_count(&self, opts: &RunOptions) -> usize {
        let configured = if opts.processes > 0 {
            opts.processes
        } else if self.cfg.run.processes > 0 {
            self.cfg.run.processes
        } else {
            num_cpus::get() as u32
        };
        configured.max(1) as usize
    }

    fn collect_candidates(&self, opts: &RunOptions, paths: &OutputPaths) -> Vec<PathBuf> {
        let extensions = match opts.mode {
            PipelineMode::AudioOnly => &self.cfg.audio.extensions,
            _ => &self.cfg.video.extensions,
        };
        let mut files = scan::enumerate(
            &self.run_root,
            extensions,
            &self.cfg.run.exclude_dir_keywords,
            self.cfg.run.min_file_size_bytes,
        );

        if opts.rename {
            files = scan::normalize_file_names(files);
        }

        if opts.mode == PipelineMode::Phone {
            let done = success_log::logged_input_stems(&paths.combined_log());
            if !done.is_empty() {
                let before = files.len();
                files.retain(|f| {
                    f.file_stem()
                        .map(|s| !done.contains(&s.to_string_lossy().into_owned()))
                        .unwrap_or(true)
                });
                info!(
                    excluded = before - files.len(),
                    "excluded inputs already present in the success log"
                );
            }
        }

        files
    }

    /// End-of-run cleanup: scratch dirs, empty dirs, log aggregation, and
    /// the `_raw` completion move once the tree holds no more inputs.
    fn cleanup(&self, opts: &RunOptions, paths: &OutputPaths) {
        fsops::delete_scratch_dirs(&self.run_root, SCRATCH_PREFIXES);
        fsops::remove_empty_dirs(&self.run_root);

        if let Err(e) = success_log::combine_logs(&self.run_root, &paths.combined_log()) {
            warn!(error = %e, "could not combine success logs");
        }

        let remaining = scan::enumerate(
            &self.run_root,
            match opts.mode {
                PipelineMode::AudioOnly => &self.cfg.audio.extensions,
                _ => &self.cfg.video.extensions,
            },
            &self.cfg.run.exclude_dir_keywords,
            self.cfg.run.min_file_size_bytes,
        );
        if remaining.is_empty() && paths.raw_root().is_dir() {
            let done_root = paths.raw_completion_root();
            if done_root.exists() {
                warn!(target = %done_root.display(), "completion root exists; leaving _raw in place");
            } else if let Err(e) = std::fs::rename(paths.raw_root(), &done_root) {
                warn!(error = %e, "could not move raw archive to completion root");
            } else {
                info!(target = %done_root.display(), "raw archive moved to completion root");
            }
        }
    }
}

/// The sequential per-file pipeline. Exactly one observable outcome per
/// input: success, skip, oversize or quarantine.
fn process_file(
    cfg: &Config,
    tools: &Arc<Tools>,
    paths: &OutputPaths,
    opts: &RunOptions,
    file: &Path,
) -> FileOutcome {
    let prober = Prober::new(tools.clone());
    let media = match prober.probe(file) {
        Ok(media) => media,
        Err(e) => {
            warn!(file = %file.display(), error = %e, "probe failed");
            let diag = Diagnostics {
                context: e.to_string(),
                ..Default::default()
            };
            if quarantine_unprobed(paths, e.kind(), file, &diag).is_err() {
                error!(file = %file.display(), "could not quarantine unprobeable file");
            }
            return FileOutcome::Failed;
        }
    };

    let pre = PreEncoder::new(cfg, tools.clone(), paths);
    let analyze_opts = AnalyzeOptions {
        manual_mode: opts.manual_mode,
        allow_no_audio: opts.allow_no_audio,
        temp_work_dir: opts.temp_work_dir.clone(),
    };
    let outcome = match opts.mode {
        PipelineMode::Video => pre.analyze(&media, &analyze_opts),
        PipelineMode::AudioOnly => pre.analyze_audio_only(&media),
        PipelineMode::Phone => pre.analyze_phone(&media),
    };

    let plan = match outcome {
        Ok(PreEncodeOutcome::Skip(_)) => return FileOutcome::Skipped,
        Ok(PreEncodeOutcome::Plan(plan)) => plan,
        Err(e) => {
            warn!(file = %media.file_name(), error = %e, "pre-encode failed");
            let diag = Diagnostics {
                context: e.to_string(),
                ..Default::default()
            };
            let _ = quarantine(paths, e.kind(), &media, &diag);
            return FileOutcome::Failed;
        }
    };

    let encoder = Encoder::new(cfg, tools.clone(), paths);
    let encode_opts = EncodeOptions {
        move_raw_file: opts.move_raw_file,
        keep_mtime: opts.keep_mtime,
    };
    match encoder.run(&media, &plan, &encode_opts) {
        Ok(record) => {
            let log_dir = Path::new(&record.encoded_file_path)
                .parent()
                .map(Path::to_path_buf)
                .unwrap_or_else(|| paths.encoded_dir(&media.path));
            if let Err(e) = success_log::write_success_record(&log_dir, &record) {
                error!(file = %media.file_name(), error = %e, "could not write success record");
            }
            FileOutcome::Succeeded
        }
        Err(EncodeError::OversizeExhausted { final_crf, attempts }) => {
            warn!(
                file = %media.file_name(),
                final_crf,
                attempts,
                "oversize escalation exhausted; routing to the oversize bucket"
            );
            let bucket = paths.oversize_bucket(&media.path);
            let dir = bucket.parent().map(Path::to_path_buf).unwrap_or_default();
            if std::fs::create_dir_all(&dir).is_ok() {
                let target = unique_destination(&dir, &media.file_name());
                if move_file(&media.path, &target).is_err() {
                    error!(file = %media.file_name(), "could not move to oversize bucket");
                }
            }
            FileOutcome::Oversized
        }
        Err(e) => {
            warn!(file = %media.file_name(), error = %e, "encode failed");
            let diag = diagnostics_for(&e);
            let _ = quarantine(paths, e.kind(), &media, &diag);
            FileOutcome::Failed
        }
    }
}

fn diagnostics_for(err: &EncodeError) -> Diagnostics {
    match err {
        EncodeError::TranscoderFailed {
            exit_code,
            command,
            stdout_tail,
            stderr_tail,
        } => Diagnostics {
            command: Some(command.clone()),
            exit_code: Some(*exit_code),
            stdout_tail: stdout_tail.clone(),
            stderr_tail: stderr_tail.clone(),
            context: "transcoder failed".to_string(),
        },
        EncodeError::ContainerIncompatible {
            command,
            stderr_tail,
        } => Diagnostics {
            command: Some(command.clone()),
            exit_code: None,
            stdout_tail: String::new(),
            stderr_tail: stderr_tail.clone(),
            context: "both container attempts failed".to_string(),
        },
        other => Diagnostics {
            context: other.to_string(),
            ..Default::default()
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::crf_search_stdout;
    use crate::tools::{CommandOutput, CommandRunner};
    use av1_batch_config::ToolsConfig;
    use std::ffi::OsString;
    use std::fs;
    use tempfile::TempDir;

    /// End-to-end fake for all three external tools. The inspector answers
    /// with a fixed stream layout, the CRF search with a fixed result, and
    /// the transcoder writes an output half the size of the input, unless
    /// the input path contains "crash", which simulates a transcoder crash.
    struct FakeToolchain;

    impl CommandRunner for FakeToolchain {
        fn run(&self, program: &str, args: &[OsString]) -> io::Result<CommandOutput> {
            let args: Vec<String> = args
                .iter()
                .map(|a| a.to_string_lossy().into_owned())
                .collect();

            if program.contains("ffprobe") {
                return Ok(CommandOutput {
                    exit_code: 0,
                    stdout: r#"{
                        "streams": [
                            {"index": 0, "codec_type": "video", "codec_name": "h264",
                             "avg_frame_rate": "24/1", "bit_rate": "8000000"},
                            {"index": 1, "codec_type": "audio", "codec_name": "aac",
                             "channels": 2, "sample_rate": "48000", "bit_rate": "192000",
                             "tags": {"language": "eng"}}
                        ],
                        "format": {"format_name": "matroska", "duration": "60.0",
                                   "bit_rate": "8000000", "tags": {}}
                    }"#
                    .to_string(),
                    stderr: String::new(),
                });
            }

            if args.first().map(String::as_str) == Some("crf-search") {
                return Ok(CommandOutput {
                    exit_code: 0,
                    stdout: crf_search_stdout(30, 45),
                    stderr: String::new(),
                });
            }

            // Transcoder.
            let input = args
                .windows(2)
                .find(|w| w[0] == "-i")
                .map(|w| w[1].clone())
                .unwrap_or_default();
            if input.contains("crash") {
                return Ok(CommandOutput {
                    exit_code: 134,
                    stdout: String::new(),
                    stderr: "Segmentation fault".to_string(),
                });
            }
            let output = PathBuf::from(args.last().unwrap());
            if let Some(parent) = output.parent() {
                fs::create_dir_all(parent)?;
            }
            let input_size = fs::metadata(&input).map(|m| m.len()).unwrap_or(1000);
            fs::write(&output, vec![0u8; (input_size / 2) as usize])?;
            Ok(CommandOutput {
                exit_code: 0,
                stdout: String::new(),
                stderr: String::new(),
            })
        }
    }

    fn pool_over(dir: &TempDir) -> WorkerPool {
        let mut cfg = Config::default();
        cfg.run.min_file_size_bytes = 10;
        let tools = Arc::new(Tools::with_runner(
            &ToolsConfig::default(),
            Arc::new(FakeToolchain),
        ));
        WorkerPool::new(Arc::new(cfg), tools, dir.path().to_path_buf())
    }

    fn seed_input(dir: &TempDir, rel: &str) -> PathBuf {
        let path = dir.path().join(rel);
        fs::create_dir_all(path.parent().unwrap()).unwrap();
        fs::write(&path, vec![0u8; 4096]).unwrap();
        path
    }

    fn video_options() -> RunOptions {
        RunOptions {
            processes: 4,
            move_raw_file: true,
            rename: false,
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn test_faulting_file_does_not_poison_the_run() {
        let dir = TempDir::new().unwrap();
        for name in [
            "shows/ok1.mkv",
            "shows/ok2.mkv",
            "shows/crash_here.mkv",
            "films/ok3.mkv",
        ] {
            seed_input(&dir, name);
        }

        let pool = pool_over(&dir);
        let summary = pool.run(video_options()).await.unwrap();

        assert_eq!(summary.candidates, 4);
        assert_eq!(summary.succeeded, 3);
        assert_eq!(summary.failed, 1);
        assert_eq!(summary.skipped + summary.oversized, 0);
        assert!(!summary.interrupted);

        // The faulting file is quarantined under its error kind.
        let quarantined = dir
            .path()
            .join("encode_error/TranscoderFailed/shows/crash_here.mkv");
        assert!(quarantined.exists());
        assert!(quarantined.with_file_name("error.txt").exists());
        assert!(quarantined.with_file_name("probe.json").exists());
    }

    #[tokio::test]
    async fn test_every_input_lands_in_exactly_one_place() {
        let dir = TempDir::new().unwrap();
        seed_input(&dir, "a/good.mkv");
        seed_input(&dir, "a/crash.mkv");

        let pool = pool_over(&dir);
        pool.run(video_options()).await.unwrap();

        // good.mkv: output + raw archive, no original, no quarantine.
        assert!(dir.path().join("libsvtav1_encoded/a/good.mp4").exists());
        assert!(dir.path().join("_raw/a/good.mkv").exists()
            || dir
                .path()
                .join("libsvtav1_encoded_raw_done/a/good.mkv")
                .exists());
        assert!(!dir.path().join("a/good.mkv").exists());

        // crash.mkv: quarantine only.
        assert!(dir
            .path()
            .join("encode_error/TranscoderFailed/a/crash.mkv")
            .exists());
        assert!(!dir.path().join("a/crash.mkv").exists());
    }

    #[tokio::test]
    async fn test_rerun_over_processed_tree_is_idempotent() {
        let dir = TempDir::new().unwrap();
        seed_input(&dir, "a/one.mkv");
        seed_input(&dir, "b/two.mkv");

        let pool = pool_over(&dir);
        let first = pool.run(video_options()).await.unwrap();
        assert_eq!(first.succeeded, 2);

        let second = pool.run(video_options()).await.unwrap();
        assert_eq!(second.candidates, 0);
        assert_eq!(second.succeeded, 0);
        assert_eq!(second.failed, 0);
    }

    #[tokio::test]
    async fn test_parallelism_levels_agree_on_outcomes() {
        let dir1 = TempDir::new().unwrap();
        let dir2 = TempDir::new().unwrap();
        for dir in [&dir1, &dir2] {
            for name in ["x/a.mkv", "x/b.mkv", "y/crash.mkv", "y/c.mkv"] {
                let path = dir.path().join(name);
                fs::create_dir_all(path.parent().unwrap()).unwrap();
                fs::write(&path, vec![0u8; 4096]).unwrap();
            }
        }

        let serial = pool_over(&dir1)
            .run(RunOptions {
                processes: 1,
                ..video_options()
            })
            .await
            .unwrap();
        let parallel = pool_over(&dir2)
            .run(RunOptions {
                processes: 4,
                ..video_options()
            })
            .await
            .unwrap();

        assert_eq!(serial.succeeded, parallel.succeeded);
        assert_eq!(serial.failed, parallel.failed);

        // Same output sets, modulo the differing temp roots.
        let outputs = |root: &Path| -> Vec<String> {
            let mut v: Vec<String> = walkdir::WalkDir::new(root.join("libsvtav1_encoded"))
                .into_iter()
                .filter_map(|e| e.ok())
                .filter(|e| e.file_type().is_file())
                .filter(|e| e.path().extension().map(|x| x == "mp4").unwrap_or(false))
                .map(|e| {
                    e.path()
                        .strip_prefix(root)
                        .unwrap()
                        .to_string_lossy()
                        .into_owned()
                })
                .collect();
            v.sort();
            v
        };
        assert_eq!(outputs(dir1.path()), outputs(dir2.path()));
    }

    #[tokio::test]
    async fn test_combined_log_written_at_end_of_run() {
        let dir = TempDir::new().unwrap();
        seed_input(&dir, "a/one.mkv");

        let pool = pool_over(&dir);
        pool.run(video_options()).await.unwrap();

        let combined = dir.path().join("combined_log.yaml");
        assert!(combined.exists());
        let text = fs::read_to_string(&combined).unwrap();
        assert!(text.contains("one.mkv"));
        assert!(text.contains("realized_ratio"));
    }

    #[tokio::test]
    async fn test_raw_archive_moves_to_completion_root_when_tree_drained() {
        let dir = TempDir::new().unwrap();
        seed_input(&dir, "a/one.mkv");

        let pool = pool_over(&dir);
        pool.run(video_options()).await.unwrap();

        // All inputs processed and archived, so _raw moved aside.
        assert!(!dir.path().join("_raw").exists());
        assert!(dir
            .path()
            .join("libsvtav1_encoded_raw_done/a/one.mkv")
            .exists());
    }

    #[tokio::test]
    async fn test_unreadable_root_is_an_orchestrator_error() {
        let dir = TempDir::new().unwrap();
        let missing = dir.path().join("nope");
        let mut cfg = Config::default();
        cfg.run.min_file_size_bytes = 10;
        let tools = Arc::new(Tools::with_runner(
            &ToolsConfig::default(),
            Arc::new(FakeToolchain),
        ));
        let pool = WorkerPool::new(Arc::new(cfg), tools, missing);

        let err = pool.run(video_options()).await.unwrap_err();
        assert!(matches!(err, PoolError::UnreadableRoot(_)));
    }

    #[test]
    fn test_worker_count_fallbacks() {
        let dir = TempDir::new().unwrap();
        let pool = pool_over(&dir);

        let explicit = RunOptions {
            processes: 7,
            ..Default::default()
        };
        assert_eq!(pool.worker_count(&explicit), 7);

        let from_config = RunOptions {
            processes: 0,
            ..Default::default()
        };
        assert_eq!(pool.worker_count(&from_config), 4); // RunConfig default
    }
}
