//! Preflight checks: verify the external tools resolve before dispatching
//! any work. A missing tool is an orchestrator-level failure (non-zero
//! exit), unlike per-file errors which are quarantined.

use std::ffi::OsString;
use thiserror::Error;

use crate::tools::Tools;

/// Error type for preflight checks.
#[derive(Debug, Error)]
pub enum StartupError {
    #[error("required tool '{tool}' is not available: {detail}")]
    ToolMissing { tool: String, detail: String },
}

/// Which tools a run needs; the CRF-search helper is only required for the
/// quality-targeted video pipeline.
#[derive(Debug, Clone, Copy)]
pub struct PreflightNeeds {
    pub crf_search: bool,
}

/// Verify that the inspector, transcoder and (when needed) the CRF-search
/// helper all execute.
pub fn run_preflight(tools: &Tools, needs: PreflightNeeds) -> Result<(), StartupError> {
    check_tool(tools, &tools.ffprobe, "-version")?;
    check_tool(tools, &tools.ffmpeg, "-version")?;
    if needs.crf_search {
        check_tool(tools, &tools.ab_av1, "--version")?;
    }
    Ok(())
}

fn check_tool(tools: &Tools, program: &str, version_flag: &str) -> Result<(), StartupError> {
    let args = vec![OsString::from(version_flag)];
    match tools.run(program, &args) {
        Ok(out) if out.success() => Ok(()),
        Ok(out) => Err(StartupError::ToolMissing {
            tool: program.to_string(),
            detail: format!("{} exited with {}", version_flag, out.exit_code),
        }),
        Err(e) => Err(StartupError::ToolMissing {
            tool: program.to_string(),
            detail: e.to_string(),
        }),
    }
}
