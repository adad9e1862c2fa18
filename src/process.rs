//! Runs an external command, draining stdout and stderr line by line into a
//! capture buffer and a [`LogSink`] while a third future waits on the process.
//!
//! All three are joined before [`run_process`] returns, so nothing the process
//! might still touch is released early. Readers stop shortly after the process
//! exits even if a leftover background child keeps the pipes open; that child
//! is then killed with the rest of the process group. On deadline expiry the
//! process is killed and reaped, then the call fails with
//! [`RunnerError::Cancelled`] carrying whatever output was captured.

use std::fmt;
use std::path::PathBuf;
use std::process::{ExitStatus, Stdio};
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncReadExt, BufReader};
use tokio::process::{Child, ChildStderr, ChildStdout, Command};
use tokio::sync::oneshot;
use tokio::time::{timeout_at, Instant};

use crate::config;
use crate::error::{RunnerError, RunnerResult};
use crate::logs::{LogLine, LogSink, LogSource};
use crate::models::{RunResult, EXIT_CODE_UNKNOWN};

/// Point in time after which an invocation is given up on.
#[derive(Debug, Clone, Copy)]
pub struct Deadline {
    pub at: Instant,
    pub timeout: Duration,
}

impl Deadline {
    pub fn after(timeout: Duration) -> Self {
        Self {
            at: Instant::now() + timeout,
            timeout,
        }
    }

    pub fn expired(&self) -> bool {
        Instant::now() >= self.at
    }
}

#[derive(Debug, Clone, Default)]
pub struct ProcessSpec {
    pub program: String,
    pub args: Vec<String>,
    pub cwd: Option<PathBuf>,
    pub envs: Vec<(String, String)>,
}

impl ProcessSpec {
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
            ..Default::default()
        }
    }

    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }

    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    pub fn current_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.cwd = Some(dir.into());
        self
    }

    pub fn env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.envs.push((key.into(), value.into()));
        self
    }
}

impl fmt::Display for ProcessSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.program)?;
        for a in &self.args {
            write!(f, " {a}")?;
        }
        Ok(())
    }
}

enum Waited {
    Exited(std::io::Result<ExitStatus>),
    Killed,
}

/// Runs `invocation` to completion or until `deadline`.
///
/// A nonzero exit is returned as data; callers decide whether it is an error.
pub async fn run_process(invocation: &ProcessSpec, deadline: Deadline, logs: &LogSink) -> RunnerResult<RunResult> {
    if deadline.expired() {
        return Err(RunnerError::Cancelled {
            timeout: deadline.timeout,
            partial: Box::new(RunResult { exit_code: EXIT_CODE_UNKNOWN, ..Default::default() }),
        });
    }

    let mut cmd = Command::new(&invocation.program);
    cmd.args(&invocation.args)
        .envs(invocation.envs.iter().map(|(k, v)| (k.as_str(), v.as_str())))
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);
    // own process group, so helpers the command forks die with it
    #[cfg(unix)]
    cmd.process_group(0);
    if let Some(dir) = &invocation.cwd {
        cmd.current_dir(dir);
    }

    tracing::debug!(command = %invocation, "spawning");
    let mut child = cmd.spawn().map_err(|source| RunnerError::Spawn {
        program: invocation.program.clone(),
        source,
    })?;

    // child.id() is gone once the child is reaped
    let pid = child.id();
    let stdout = child.stdout.take();
    let stderr = child.stderr.take();
    let mut out_buf = String::new();
    let mut err_buf = String::new();

    let (stopped_tx, stopped_rx) = oneshot::channel();
    let waiter = async {
        let waited = wait_or_kill(&mut child, pid, deadline.at).await;
        // readers may outlive the child only by a grace period
        let grace = match waited {
            Waited::Exited(_) => config::EXIT_DRAIN_GRACE,
            Waited::Killed => config::KILL_GRACE,
        };
        let _ = stopped_tx.send(Instant::now() + grace);
        waited
    };
    let readers = drain(stdout, stderr, logs, &mut out_buf, &mut err_buf, stopped_rx, pid);

    let (waited, ()) = tokio::join!(waiter, readers);

    match waited {
        Waited::Exited(Ok(status)) => {
            let exit_code = status.code().unwrap_or(EXIT_CODE_UNKNOWN);
            tracing::debug!(command = %invocation.program, exit_code, "process exited");
            Ok(RunResult { exit_code, stdout: out_buf, stderr: err_buf })
        }
        Waited::Exited(Err(e)) => {
            tracing::warn!(command = %invocation.program, error = %e, "could not wait on process");
            Ok(RunResult { exit_code: EXIT_CODE_UNKNOWN, stdout: out_buf, stderr: err_buf })
        }
        Waited::Killed => {
            tracing::warn!(command = %invocation.program, timeout = ?deadline.timeout, "process killed at deadline");
            Err(RunnerError::Cancelled {
                timeout: deadline.timeout,
                partial: Box::new(RunResult { exit_code: EXIT_CODE_UNKNOWN, stdout: out_buf, stderr: err_buf }),
            })
        }
    }
}

async fn wait_or_kill(child: &mut Child, pid: Option<u32>, deadline: Instant) -> Waited {
    tokio::select! {
        status = child.wait() => Waited::Exited(status),
        _ = tokio::time::sleep_until(deadline) => {
            kill_process_group(pid);
            // kill() also reaps, so the process is gone once this returns
            if let Err(e) = child.kill().await {
                tracing::warn!(error = %e, "failed to kill process");
            }
            Waited::Killed
        }
    }
}

/// Pumps both pipes until they close, or until the grace period that starts
/// when the waiter reports the process stopped.
async fn drain(
    stdout: Option<ChildStdout>,
    stderr: Option<ChildStderr>,
    logs: &LogSink,
    out_buf: &mut String,
    err_buf: &mut String,
    stopped: oneshot::Receiver<Instant>,
    pid: Option<u32>,
) {
    let pumps = async move {
        tokio::join!(
            pump(stdout, LogSource::Stdout, logs, out_buf),
            pump(stderr, LogSource::Stderr, logs, err_buf),
        );
    };
    tokio::pin!(pumps);

    let until = tokio::select! {
        _ = &mut pumps => return,
        at = stopped => at.unwrap_or_else(|_| Instant::now()),
    };
    if timeout_at(until, &mut pumps).await.is_err() {
        tracing::debug!(?pid, "output still open after the process stopped; killing its group");
        kill_process_group(pid);
    }
}

#[cfg(unix)]
fn kill_process_group(pid: Option<u32>) {
    if let Some(pid) = pid {
        // SAFETY: plain syscall on a process group we created at spawn time
        let rc = unsafe { libc::killpg(pid as libc::pid_t, libc::SIGKILL) };
        if rc != 0 {
            tracing::debug!(pid, error = %std::io::Error::last_os_error(), "killpg failed");
        }
    }
}

#[cfg(not(unix))]
fn kill_process_group(_pid: Option<u32>) {}

async fn pump<R>(reader: Option<R>, source: LogSource, logs: &LogSink, capture: &mut String)
where
    R: AsyncRead + Unpin,
{
    let Some(reader) = reader else { return };
    let mut reader = BufReader::new(reader);
    let mut buf = Vec::new();

    loop {
        buf.clear();
        // overlong lines are split, never dropped
        let read = (&mut reader)
            .take(config::MAX_LOG_LINE_BYTES as u64)
            .read_until(b'\n', &mut buf)
            .await;
        match read {
            Ok(0) => break,
            Ok(_) => {
                let text = String::from_utf8_lossy(&buf);
                let line = text.trim_end_matches(['\n', '\r']);
                capture.push_str(source.prefix());
                capture.push_str(line);
                capture.push('\n');
                logs.send(LogLine::new(source, line));
            }
            Err(e) => {
                tracing::warn!(?source, error = %e, "stopped reading process output");
                break;
            }
        }
    }
}
