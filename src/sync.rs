//! Keeps a local working copy of a remote repository at a requested ref.
//!
//! A checkout directory is either absent (clone it), dirty (leave it alone),
//! or clean (fetch the ref, check it out and move it to what was fetched).
//! Local modifications are never discarded, even if that means running
//! against a stale ref.

use std::path::Path;
use std::sync::Arc;

use crate::error::{RunnerError, RunnerResult};
use crate::logs::LogSink;
use crate::process::Deadline;
use crate::runners::{VersionControl, FETCH_HEAD};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CheckoutState {
    Absent,
    Clean,
    Dirty,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncOutcome {
    Cloned,
    /// Fetched and checked out; `detached` when only the fetched head could be checked out.
    Updated { detached: bool },
    SkippedDirty,
}

pub struct RepoSynchronizer {
    vcs: Arc<dyn VersionControl>,
}

impl RepoSynchronizer {
    pub fn new(vcs: Arc<dyn VersionControl>) -> Self {
        Self { vcs }
    }

    pub async fn state(&self, dir: &Path, deadline: Deadline, logs: &LogSink) -> RunnerResult<CheckoutState> {
        if !dir.join(".git").exists() {
            return Ok(CheckoutState::Absent);
        }
        if self.vcs.is_dirty(dir, deadline, logs).await? {
            Ok(CheckoutState::Dirty)
        } else {
            Ok(CheckoutState::Clean)
        }
    }

    /// Idempotent for repeated calls against the same directory.
    pub async fn sync(
        &self,
        dir: &Path,
        url: &str,
        git_ref: &str,
        deadline: Deadline,
        logs: &LogSink,
    ) -> RunnerResult<SyncOutcome> {
        match self.state(dir, deadline, logs).await? {
            CheckoutState::Absent => {
                tracing::info!(vcs = self.vcs.name(), url, git_ref, dir = %dir.display(), "cloning");
                logs.info(format!("cloning {url}@{git_ref} into {}", dir.display()));
                self.vcs.clone_shallow(url, git_ref, dir, deadline, logs).await?;
                Ok(SyncOutcome::Cloned)
            }
            CheckoutState::Dirty => {
                tracing::warn!(dir = %dir.display(), git_ref, "checkout has local changes; skipping fetch and checkout");
                logs.info(format!(
                    "{} has uncommitted changes; running against the currently checked out ref",
                    dir.display()
                ));
                Ok(SyncOutcome::SkippedDirty)
            }
            CheckoutState::Clean => {
                logs.info(format!("updating {} to {git_ref}", dir.display()));
                self.vcs.fetch_shallow(dir, git_ref, deadline, logs).await?;
                match self.vcs.checkout(dir, git_ref, deadline, logs).await {
                    Ok(()) => {
                        // a local branch of that name may predate the fetch
                        self.vcs.reset_hard(dir, FETCH_HEAD, deadline, logs).await?;
                        Ok(SyncOutcome::Updated { detached: false })
                    }
                    Err(RunnerError::Sync { output, .. }) => {
                        tracing::debug!(git_ref, %output, "named checkout failed; using fetched head");
                        self.vcs.checkout(dir, FETCH_HEAD, deadline, logs).await?;
                        Ok(SyncOutcome::Updated { detached: true })
                    }
                    Err(other) => Err(other),
                }
            }
        }
    }
}
