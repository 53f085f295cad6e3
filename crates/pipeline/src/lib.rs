//! AV1 Batch Encoder pipeline
//!
//! Per-file decision and execution pipeline (probe, skip rules, CRF search,
//! stream selection, transcoder invocation) plus the worker pool that runs it
//! in parallel across a directory tree.

pub mod encode;
pub mod error_router;
pub mod format;
pub mod fsops;
pub mod language;
pub mod paths;
pub mod pre_encode;
pub mod probe;
pub mod scan;
pub mod startup;
pub mod state;
pub mod success_log;
pub mod tools;
pub mod worker_pool;

#[cfg(test)]
pub(crate) mod test_support;

pub use av1_batch_config as config;
pub use av1_batch_config::Config;
pub use encode::{EncodeError, EncodeOptions, Encoder};
pub use error_router::{quarantine, Diagnostics};
pub use language::{Classification, LanguageClassifier, LanguageDetector, WhisperClassifier};
pub use paths::OutputPaths;
pub use pre_encode::{
    Container, EncodePlan, Mode, PreEncodeError, PreEncodeOutcome, PreEncoder, SkipReason,
    StreamDirective,
};
pub use probe::{MediaInfo, ProbeError, Prober};
pub use startup::{run_preflight, StartupError};
pub use state::EncodeState;
pub use success_log::SuccessRecord;
pub use tools::{CommandOutput, CommandRunner, SystemRunner, Tools};
pub use worker_pool::{FileOutcome, PipelineMode, PoolError, RunOptions, RunSummary, WorkerPool};
