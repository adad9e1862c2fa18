//! Error kinds surfaced by a workflow invocation.
//!
//! A nonzero exit code from the workload itself is not represented here; it is
//! carried as data in [`RunResult`]. Everything below short-circuits the pipeline.

use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;

use crate::models::{RunResult, EXIT_CODE_UNKNOWN};

/// Process exit status for errors caught before anything is executed.
pub const EXIT_CODE_USAGE: i32 = 2;

#[derive(Error, Debug)]
pub enum RunnerError {
    #[error("invalid request: {0}")]
    Validation(String),

    #[error("repository sync failed during {stage}:\n{output}")]
    Sync { stage: SyncStage, output: String },

    #[error("missing {} (expected next to the runner build-files)", path.display())]
    MissingBuildFile { path: PathBuf },

    #[error("{tool} not found on PATH")]
    ToolUnavailable { tool: String },

    #[error("failed to build image {image} (exit code {exit_code}):\n{output}")]
    ImageBuild { image: String, exit_code: i32, output: String },

    #[error("timed out after {}", humantime::format_duration(*timeout))]
    Cancelled { timeout: Duration, partial: Box<RunResult> },

    #[error("failed to spawn {program}: {source}")]
    Spawn {
        program: String,
        #[source]
        source: std::io::Error,
    },

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncStage {
    Clone,
    Status,
    Fetch,
    Checkout,
    Reset,
}

impl std::fmt::Display for SyncStage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            SyncStage::Clone => "clone",
            SyncStage::Status => "status",
            SyncStage::Fetch => "fetch",
            SyncStage::Checkout => "checkout",
            SyncStage::Reset => "reset",
        })
    }
}

impl RunnerError {
    /// Exit status the command surface should report for this error.
    pub fn exit_code(&self) -> i32 {
        match self {
            RunnerError::Validation(_) => EXIT_CODE_USAGE,
            _ => EXIT_CODE_UNKNOWN,
        }
    }

    pub fn is_cancelled(&self) -> bool {
        matches!(self, RunnerError::Cancelled { .. })
    }

    /// Workload output captured before a deadline cut the run short.
    ///
    /// Only cancellation has one. Failed git or image-build steps keep their
    /// tool output in [`RunnerError::tool_output`] instead.
    pub fn partial_output(&self) -> Option<&RunResult> {
        match self {
            RunnerError::Cancelled { partial, .. } => Some(partial),
            _ => None,
        }
    }

    /// Output of the external tool whose failure this is.
    pub fn tool_output(&self) -> Option<&str> {
        match self {
            RunnerError::Sync { output, .. } | RunnerError::ImageBuild { output, .. } => Some(output.as_str()),
            _ => None,
        }
    }
}

pub type RunnerResult<T> = Result<T, RunnerError>;
