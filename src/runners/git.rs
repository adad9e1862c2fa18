use async_trait::async_trait;
use std::path::Path;

use super::{combined_output, locate, VersionControl};
use crate::error::{RunnerError, RunnerResult, SyncStage};
use crate::logs::LogSink;
use crate::models::RunResult;
use crate::process::{run_process, Deadline, ProcessSpec};

/// `git` on PATH, one subprocess per operation.
#[derive(Debug, Clone)]
pub struct GitCli {
    program: String,
}

impl GitCli {
    pub fn new(program: impl Into<String>) -> Self {
        Self { program: program.into() }
    }

    fn command(&self, dir: Option<&Path>) -> RunnerResult<ProcessSpec> {
        let program = locate(&self.program)?;
        let mut cmd = ProcessSpec::new(program.to_string_lossy())
            // never block on a credential prompt
            .env("GIT_TERMINAL_PROMPT", "0");
        if let Some(dir) = dir {
            cmd = cmd.arg("-C").arg(dir.to_string_lossy());
        }
        Ok(cmd)
    }

    async fn run_checked(
        &self,
        cmd: ProcessSpec,
        stage: SyncStage,
        deadline: Deadline,
        logs: &LogSink,
    ) -> RunnerResult<RunResult> {
        let res = run_process(&cmd, deadline, logs).await?;
        if res.exit_code != 0 {
            return Err(RunnerError::Sync {
                stage,
                output: combined_output(&res),
            });
        }
        Ok(res)
    }
}

impl Default for GitCli {
    fn default() -> Self {
        Self::new("git")
    }
}

#[async_trait]
impl VersionControl for GitCli {
    fn name(&self) -> &'static str {
        "git"
    }

    async fn clone_shallow(
        &self,
        url: &str,
        git_ref: &str,
        dir: &Path,
        deadline: Deadline,
        logs: &LogSink,
    ) -> RunnerResult<()> {
        if let Some(parent) = dir.parent().filter(|p| !p.as_os_str().is_empty()) {
            tokio::fs::create_dir_all(parent).await?;
        }
        let cmd = self
            .command(None)?
            .args(["clone", "--depth", "1", "--branch", git_ref, "--"])
            .arg(url)
            .arg(dir.to_string_lossy());
        self.run_checked(cmd, SyncStage::Clone, deadline, logs).await?;
        Ok(())
    }

    async fn is_dirty(&self, dir: &Path, deadline: Deadline, logs: &LogSink) -> RunnerResult<bool> {
        let cmd = self.command(Some(dir))?.args(["status", "--porcelain"]);
        let res = self.run_checked(cmd, SyncStage::Status, deadline, logs).await?;
        Ok(!res.stdout.trim().is_empty())
    }

    async fn fetch_shallow(&self, dir: &Path, git_ref: &str, deadline: Deadline, logs: &LogSink) -> RunnerResult<()> {
        let cmd = self
            .command(Some(dir))?
            .args(["fetch", "--depth", "1", "origin"])
            .arg(git_ref);
        self.run_checked(cmd, SyncStage::Fetch, deadline, logs).await?;
        Ok(())
    }

    async fn checkout(&self, dir: &Path, target: &str, deadline: Deadline, logs: &LogSink) -> RunnerResult<()> {
        let cmd = self.command(Some(dir))?.args(["checkout", target]);
        self.run_checked(cmd, SyncStage::Checkout, deadline, logs).await?;
        Ok(())
    }

    async fn reset_hard(&self, dir: &Path, target: &str, deadline: Deadline, logs: &LogSink) -> RunnerResult<()> {
        let cmd = self.command(Some(dir))?.args(["reset", "--hard", target]);
        self.run_checked(cmd, SyncStage::Reset, deadline, logs).await?;
        Ok(())
    }
}
