//! CLI entry point for the AV1 batch encoder.
//!
//! Parses arguments, loads configuration, runs preflight checks and hands
//! the run root to the worker pool. The exit code is zero on clean
//! completion even when individual files were skipped, oversized or
//! quarantined; it is non-zero only for orchestrator-level failures.

use av1_batch_config::Config;
use av1_batch_pipeline::startup::PreflightNeeds;
use av1_batch_pipeline::{
    run_preflight, PipelineMode, RunOptions, Tools, WorkerPool,
};
use clap::Parser;
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

/// AV1 batch encoder - quality-targeted re-encoding for a media library
#[derive(Parser, Debug)]
#[command(name = "av1-batch")]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Directory tree to process (defaults to the current directory)
    #[arg(long)]
    target_dir: Option<PathBuf>,

    /// Number of parallel workers (0 = from config, which may auto-derive)
    #[arg(long, default_value_t = 0)]
    processes: u32,

    /// Archive originals into _raw/ after a successful encode
    #[arg(long)]
    move_raw_file: bool,

    /// Do not normalize discovered file names before processing
    #[arg(long)]
    not_rename: bool,

    /// Fixed encoder and CRF, skipping the quality search
    #[arg(long)]
    manual_mode: bool,

    /// Produce video-only outputs when no suitable audio stream is found
    #[arg(long)]
    allow_no_audio: bool,

    /// Encode audio files to Opus instead of processing video
    #[arg(long)]
    audio_only: bool,

    /// Use the fixed phone profile instead of the quality search
    #[arg(long)]
    iphone_specific_task: bool,

    /// Process files in random order for even progress across subtrees
    #[arg(long)]
    random: bool,

    /// Preserve each input's modification time on its output
    #[arg(long)]
    keep_mtime: bool,

    /// Scratch directory for CRF-search and language-detection temp files
    #[arg(long)]
    temp_work_dir: Option<PathBuf>,

    /// Log level (TRACE, DEBUG, INFO, WARN, ERROR)
    #[arg(long, default_value = "INFO")]
    log_level: String,

    /// Path to the configuration file
    #[arg(short, long, default_value = "av1-batch.toml")]
    config: PathBuf,
}

#[tokio::main]
async fn main() -> ExitCode {
    let args = Args::parse();

    let filter = EnvFilter::try_new(args.log_level.to_lowercase())
        .unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    let config = if args.config.is_file() {
        match Config::load(&args.config) {
            Ok(cfg) => cfg,
            Err(e) => {
                error!(config = %args.config.display(), error = %e, "could not load configuration");
                return ExitCode::FAILURE;
            }
        }
    } else {
        let mut cfg = Config::default();
        cfg.apply_env_overrides();
        cfg
    };

    let run_root = match args
        .target_dir
        .clone()
        .map_or_else(std::env::current_dir, |d| d.canonicalize())
    {
        Ok(root) => root,
        Err(e) => {
            error!(error = %e, "target directory is not usable");
            return ExitCode::FAILURE;
        }
    };

    if let Some(temp) = &args.temp_work_dir {
        if let Err(e) = std::fs::create_dir_all(temp) {
            error!(dir = %temp.display(), error = %e, "could not create temp work directory");
            return ExitCode::FAILURE;
        }
    }

    let mode = if args.audio_only {
        PipelineMode::AudioOnly
    } else if args.iphone_specific_task {
        PipelineMode::Phone
    } else {
        PipelineMode::Video
    };

    let tools = Arc::new(Tools::from_config(&config.tools));
    let needs = PreflightNeeds {
        crf_search: mode == PipelineMode::Video,
    };
    if let Err(e) = run_preflight(&tools, needs) {
        error!(error = %e, "preflight failed");
        return ExitCode::FAILURE;
    }

    info!(root = %run_root.display(), ?mode, "starting run");

    let options = RunOptions {
        mode,
        processes: args.processes,
        move_raw_file: args.move_raw_file,
        keep_mtime: args.keep_mtime,
        manual_mode: args.manual_mode,
        allow_no_audio: args.allow_no_audio,
        shuffle: args.random,
        rename: !args.not_rename,
        temp_work_dir: args.temp_work_dir.clone(),
    };

    let pool = WorkerPool::new(Arc::new(config), tools, run_root);
    match pool.run(options).await {
        Ok(summary) => {
            if summary.interrupted {
                warn!("run interrupted; in-flight encodes were drained");
            }
            info!(
                candidates = summary.candidates,
                succeeded = summary.succeeded,
                skipped = summary.skipped,
                oversized = summary.oversized,
                failed = summary.failed,
                "run finished"
            );
            // Per-file failures are quarantined, not fatal.
            ExitCode::SUCCESS
        }
        Err(e) => {
            error!(error = %e, "run failed");
            ExitCode::FAILURE
        }
    }
}
