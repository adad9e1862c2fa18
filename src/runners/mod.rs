pub mod docker;
pub mod git;

#[cfg(test)]
pub(crate) mod fakes;

use async_trait::async_trait;
use std::path::Path;

use crate::error::RunnerResult;
use crate::logs::LogSink;
use crate::models::RunResult;
use crate::process::Deadline;

pub use docker::DockerCli;
pub use git::GitCli;

/// Ref name git leaves pointing at whatever the last fetch retrieved.
pub const FETCH_HEAD: &str = "FETCH_HEAD";

/// Working copies on local disk, driven through a version-control tool.
#[async_trait]
pub trait VersionControl: Send + Sync {
    fn name(&self) -> &'static str;

    /// Depth-limited clone of `git_ref` into `dir`.
    async fn clone_shallow(
        &self,
        url: &str,
        git_ref: &str,
        dir: &Path,
        deadline: Deadline,
        logs: &LogSink,
    ) -> RunnerResult<()>;

    /// True when the working copy has uncommitted changes.
    async fn is_dirty(&self, dir: &Path, deadline: Deadline, logs: &LogSink) -> RunnerResult<bool>;

    async fn fetch_shallow(&self, dir: &Path, git_ref: &str, deadline: Deadline, logs: &LogSink) -> RunnerResult<()>;

    async fn checkout(&self, dir: &Path, target: &str, deadline: Deadline, logs: &LogSink) -> RunnerResult<()>;

    /// Moves the current branch (or detached head) and the working tree to `target`.
    async fn reset_hard(&self, dir: &Path, target: &str, deadline: Deadline, logs: &LogSink) -> RunnerResult<()>;
}

/// The host's local image store.
#[async_trait]
pub trait ImageStore: Send + Sync {
    async fn image_exists(&self, image: &str, deadline: Deadline) -> RunnerResult<bool>;

    async fn build_image(
        &self,
        image: &str,
        build_file: &Path,
        context_dir: &Path,
        deadline: Deadline,
        logs: &LogSink,
    ) -> RunnerResult<()>;
}

/// Starts containers from a fully assembled argument list.
#[async_trait]
pub trait ContainerRuntime: Send + Sync {
    /// Runs the container in the foreground. A nonzero exit is data.
    async fn run_container(&self, args: &[String], deadline: Deadline, logs: &LogSink) -> RunnerResult<RunResult>;

    /// Best-effort removal of a container left behind by a killed client.
    async fn remove_container(&self, name: &str) -> RunnerResult<()>;
}

/// Tool output flattened into one block for error reports.
pub(crate) fn combined_output(res: &RunResult) -> String {
    let mut out = String::with_capacity(res.stdout.len() + res.stderr.len());
    out.push_str(&res.stdout);
    out.push_str(&res.stderr);
    out.trim_end().to_string()
}

pub(crate) fn locate(program: &str) -> RunnerResult<std::path::PathBuf> {
    which::which(program).map_err(|_| crate::error::RunnerError::ToolUnavailable {
        tool: program.to_string(),
    })
}
