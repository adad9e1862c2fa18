//! In-memory stand-ins for the capability traits. Every call is recorded.

use async_trait::async_trait;
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use std::time::Duration;

use super::{ContainerRuntime, ImageStore, VersionControl, FETCH_HEAD};
use crate::config;
use crate::error::{RunnerError, RunnerResult, SyncStage};
use crate::logs::{LogLine, LogSink, LogSource};
use crate::models::{RunResult, EXIT_CODE_UNKNOWN};
use crate::process::Deadline;

#[derive(Default)]
pub struct FakeVcs {
    pub dirty: bool,
    pub fail_clone: bool,
    /// Named-ref checkout fails, as for a bare commit.
    pub fail_named_checkout: bool,
    pub fail_fetch_head_checkout: bool,
    /// Files written into the checkout on clone, relative path -> contents.
    pub clone_files: Vec<(String, String)>,
    pub calls: Mutex<Vec<String>>,
}

impl FakeVcs {
    pub fn calls(&self) -> Vec<String> {
        self.calls.lock().unwrap().clone()
    }

    fn record(&self, call: String) {
        self.calls.lock().unwrap().push(call);
    }
}

#[async_trait]
impl VersionControl for FakeVcs {
    fn name(&self) -> &'static str {
        "fake"
    }

    async fn clone_shallow(&self, url: &str, git_ref: &str, dir: &Path, _: Deadline, _: &LogSink) -> RunnerResult<()> {
        self.record(format!("clone {url} {git_ref}"));
        if self.fail_clone {
            return Err(RunnerError::Sync {
                stage: SyncStage::Clone,
                output: "fatal: Remote branch not found".into(),
            });
        }
        std::fs::create_dir_all(dir.join(".git"))?;
        for (rel, body) in &self.clone_files {
            let path = dir.join(rel);
            if let Some(parent) = path.parent() {
                std::fs::create_dir_all(parent)?;
            }
            std::fs::write(path, body)?;
        }
        Ok(())
    }

    async fn is_dirty(&self, _: &Path, _: Deadline, _: &LogSink) -> RunnerResult<bool> {
        self.record("status".into());
        Ok(self.dirty)
    }

    async fn fetch_shallow(&self, _: &Path, git_ref: &str, _: Deadline, _: &LogSink) -> RunnerResult<()> {
        self.record(format!("fetch {git_ref}"));
        Ok(())
    }

    async fn checkout(&self, _: &Path, target: &str, _: Deadline, _: &LogSink) -> RunnerResult<()> {
        self.record(format!("checkout {target}"));
        let fail = if target == FETCH_HEAD { self.fail_fetch_head_checkout } else { self.fail_named_checkout };
        if fail {
            return Err(RunnerError::Sync {
                stage: SyncStage::Checkout,
                output: format!("error: pathspec '{target}' did not match"),
            });
        }
        Ok(())
    }

    async fn reset_hard(&self, _: &Path, target: &str, _: Deadline, _: &LogSink) -> RunnerResult<()> {
        self.record(format!("reset {target}"));
        Ok(())
    }
}

#[derive(Default)]
pub struct FakeImageStore {
    pub existing: Mutex<HashSet<String>>,
    pub builds: Mutex<Vec<(String, PathBuf)>>,
    pub fail_build: bool,
}

impl FakeImageStore {
    pub fn with_image(image: &str) -> Self {
        let store = Self::default();
        store.existing.lock().unwrap().insert(image.to_string());
        store
    }

    pub fn build_count(&self) -> usize {
        self.builds.lock().unwrap().len()
    }
}

#[async_trait]
impl ImageStore for FakeImageStore {
    async fn image_exists(&self, image: &str, _: Deadline) -> RunnerResult<bool> {
        Ok(self.existing.lock().unwrap().contains(image))
    }

    async fn build_image(&self, image: &str, build_file: &Path, _: &Path, _: Deadline, _: &LogSink) -> RunnerResult<()> {
        self.builds.lock().unwrap().push((image.to_string(), build_file.to_path_buf()));
        if self.fail_build {
            return Err(RunnerError::ImageBuild {
                image: image.to_string(),
                exit_code: 1,
                output: "step 3/7 failed".into(),
            });
        }
        self.existing.lock().unwrap().insert(image.to_string());
        Ok(())
    }
}

/// Pretends to be a container that prints `stdout_lines` and exits with
/// `exit_code` after `runtime`, unless the deadline comes first.
pub struct FakeRuntime {
    pub exit_code: i32,
    pub stdout_lines: Vec<String>,
    pub runtime: Duration,
    pub runs: Mutex<Vec<Vec<String>>>,
    pub removed: Mutex<Vec<String>>,
    /// Whether the mounted work dir still existed when the container stopped.
    pub work_dir_alive_at_exit: Mutex<Vec<bool>>,
}

impl Default for FakeRuntime {
    fn default() -> Self {
        Self {
            exit_code: 0,
            stdout_lines: Vec::new(),
            runtime: Duration::ZERO,
            runs: Mutex::new(Vec::new()),
            removed: Mutex::new(Vec::new()),
            work_dir_alive_at_exit: Mutex::new(Vec::new()),
        }
    }
}

impl FakeRuntime {
    pub fn last_args(&self) -> Vec<String> {
        self.runs.lock().unwrap().last().cloned().unwrap_or_default()
    }

    pub fn run_count(&self) -> usize {
        self.runs.lock().unwrap().len()
    }
}

/// Host side of the `<host>:/work:rw` bind mount.
pub fn work_mount(args: &[String]) -> Option<PathBuf> {
    let suffix = format!(":{}:rw", config::WORK_MOUNT);
    args.iter()
        .find_map(|a| a.strip_suffix(suffix.as_str()))
        .map(PathBuf::from)
}

#[async_trait]
impl ContainerRuntime for FakeRuntime {
    async fn run_container(&self, args: &[String], deadline: Deadline, logs: &LogSink) -> RunnerResult<RunResult> {
        self.runs.lock().unwrap().push(args.to_vec());
        let work = work_mount(args);

        let mut stdout = String::new();
        for line in &self.stdout_lines {
            stdout.push_str(LogSource::Stdout.prefix());
            stdout.push_str(line);
            stdout.push('\n');
            logs.send(LogLine::new(LogSource::Stdout, line.clone()));
        }

        let finished = tokio::select! {
            _ = tokio::time::sleep(self.runtime) => true,
            _ = tokio::time::sleep_until(deadline.at) => false,
        };
        let alive = work.map(|w| w.exists()).unwrap_or(false);
        self.work_dir_alive_at_exit.lock().unwrap().push(alive);

        if finished {
            Ok(RunResult { exit_code: self.exit_code, stdout, stderr: String::new() })
        } else {
            Err(RunnerError::Cancelled {
                timeout: deadline.timeout,
                partial: Box::new(RunResult { exit_code: EXIT_CODE_UNKNOWN, stdout, stderr: String::new() }),
            })
        }
    }

    async fn remove_container(&self, name: &str) -> RunnerResult<()> {
        self.removed.lock().unwrap().push(name.to_string());
        Ok(())
    }
}
