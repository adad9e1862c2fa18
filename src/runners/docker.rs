use async_trait::async_trait;
use std::path::Path;
use std::time::Duration;

use super::{combined_output, locate, ContainerRuntime, ImageStore};
use crate::error::{RunnerError, RunnerResult};
use crate::logs::LogSink;
use crate::models::RunResult;
use crate::process::{run_process, Deadline, ProcessSpec};

const REMOVE_TIMEOUT: Duration = Duration::from_secs(30);

/// The docker CLI, treated as a black box for both images and containers.
#[derive(Debug, Clone)]
pub struct DockerCli {
    program: String,
}

impl DockerCli {
    pub fn new(program: impl Into<String>) -> Self {
        Self { program: program.into() }
    }

    fn command(&self) -> RunnerResult<ProcessSpec> {
        let program = locate(&self.program)?;
        Ok(ProcessSpec::new(program.to_string_lossy()))
    }
}

impl Default for DockerCli {
    fn default() -> Self {
        Self::new("docker")
    }
}

#[async_trait]
impl ImageStore for DockerCli {
    async fn image_exists(&self, image: &str, deadline: Deadline) -> RunnerResult<bool> {
        let cmd = self.command()?.args(["image", "inspect", image]);
        // inspect prints a JSON blob nobody needs to see
        let res = run_process(&cmd, deadline, &LogSink::discard()).await?;
        Ok(res.exit_code == 0)
    }

    async fn build_image(
        &self,
        image: &str,
        build_file: &Path,
        context_dir: &Path,
        deadline: Deadline,
        logs: &LogSink,
    ) -> RunnerResult<()> {
        let cmd = self
            .command()?
            .args(["build", "-t", image, "-f"])
            .arg(build_file.to_string_lossy())
            .arg(context_dir.to_string_lossy());
        let res = run_process(&cmd, deadline, logs).await?;
        if res.exit_code != 0 {
            return Err(RunnerError::ImageBuild {
                image: image.to_string(),
                exit_code: res.exit_code,
                output: combined_output(&res),
            });
        }
        Ok(())
    }
}

#[async_trait]
impl ContainerRuntime for DockerCli {
    async fn run_container(&self, args: &[String], deadline: Deadline, logs: &LogSink) -> RunnerResult<RunResult> {
        let cmd = self.command()?.args(args.iter().cloned());
        run_process(&cmd, deadline, logs).await
    }

    async fn remove_container(&self, name: &str) -> RunnerResult<()> {
        let cmd = self.command()?.args(["rm", "-f", name]);
        let res = run_process(&cmd, Deadline::after(REMOVE_TIMEOUT), &LogSink::discard()).await?;
        if res.exit_code != 0 {
            tracing::debug!(container = name, output = %combined_output(&res), "docker rm -f reported failure");
        }
        Ok(())
    }
}
