//! Sequences one workflow invocation: sync the repository, classify it,
//! provision the runner image, then run the workflow in a locked-down
//! container. The first failure ends the invocation.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use uuid::Uuid;

use crate::classify::classify;
use crate::config::{self, ContainerLimits, RunnerConfig};
use crate::error::{RunnerError, RunnerResult};
use crate::logs::LogSink;
use crate::models::{ProjectType, RunResult, Service, Workflow, WorkflowRequest};
use crate::ports::allocate_free_port;
use crate::process::Deadline;
use crate::provision::ImageProvisioner;
use crate::runners::{ContainerRuntime, DockerCli, GitCli, ImageStore, VersionControl};
use crate::sync::RepoSynchronizer;

/// Everything needed to assemble one `docker run` command line.
#[derive(Debug, Clone)]
pub struct ContainerPlan {
    pub name: String,
    pub image: String,
    pub limits: ContainerLimits,
    /// uid/gid the container runs as.
    pub user: Option<(u32, u32)>,
    pub workflow: Workflow,
    pub service: Service,
    pub project: ProjectType,
    pub entry: Option<String>,
    pub ui_port: u16,
    pub api_port: u16,
    pub env: Vec<(String, String)>,
    pub env_file: Option<PathBuf>,
    pub repo_dir: PathBuf,
    pub work_dir: PathBuf,
}

impl ContainerPlan {
    fn serves_split(&self) -> bool {
        self.project == ProjectType::Polyglot && self.workflow == Workflow::Run
    }

    /// Host URLs the workflow will be reachable on, for the caller's benefit.
    pub fn published(&self) -> Vec<(&'static str, u16)> {
        if self.serves_split() {
            let mut out = Vec::new();
            if self.service.wants_ui() && self.ui_port != 0 {
                out.push(("ui", self.ui_port));
            }
            if self.service.wants_api() && self.api_port != 0 {
                out.push(("api", self.api_port));
            }
            out
        } else if self.api_port != 0 {
            vec![("app", self.api_port)]
        } else {
            Vec::new()
        }
    }

    /// Arguments for the container runtime, starting at `run`.
    pub fn to_args(&self) -> Vec<String> {
        let mut args: Vec<String> = vec![
            "run".into(),
            "--rm".into(),
            "--name".into(),
            self.name.clone(),
            format!("--cpus={}", self.limits.cpus),
            format!("--memory={}", self.limits.memory),
            format!("--pids-limit={}", self.limits.pids),
            "--security-opt=no-new-privileges:true".into(),
            "--cap-drop=ALL".into(),
        ];
        if let Some((uid, gid)) = self.user {
            args.push("--user".into());
            args.push(format!("{uid}:{gid}"));
        }

        let mut env = |k: &str, v: &str| {
            args.push("-e".into());
            args.push(format!("{k}={v}"));
        };
        env("WORKFLOW", self.workflow.as_str());
        env("SERVICE", self.service.as_str());

        let mut publish: Vec<String> = Vec::new();
        if self.serves_split() {
            if self.service.wants_ui() && self.ui_port != 0 {
                env("UI_PORT", &config::UI_CONTAINER_PORT.to_string());
                publish.push(format!("{}:{}", self.ui_port, config::UI_CONTAINER_PORT));
            }
            if self.service.wants_api() && self.api_port != 0 {
                env("API_PORT", &config::API_CONTAINER_PORT.to_string());
                publish.push(format!("{}:{}", self.api_port, config::API_CONTAINER_PORT));
            }
        } else {
            env("EXPOSE_PORT", &config::EXPOSE_PORT.to_string());
            env("TARGET_PORT", &config::TARGET_PORT.to_string());
            if self.api_port != 0 {
                publish.push(format!("{}:{}", self.api_port, config::EXPOSE_PORT));
            }
        }
        if let Some(entry) = &self.entry {
            env("ENTRY", entry);
        }
        for (k, v) in &self.env {
            env(k, v);
        }

        for mapping in publish {
            args.push("-p".into());
            args.push(mapping);
        }
        if let Some(file) = &self.env_file {
            args.push("--env-file".into());
            args.push(file.to_string_lossy().into_owned());
        }

        // the only two host paths the container ever sees
        args.push("-v".into());
        args.push(format!("{}:{}:rw", self.repo_dir.display(), config::REPO_MOUNT));
        args.push("-v".into());
        args.push(format!("{}:{}:rw", self.work_dir.display(), config::WORK_MOUNT));
        args.push(self.image.clone());
        args
    }
}

pub struct WorkflowOrchestrator {
    config: RunnerConfig,
    synchronizer: RepoSynchronizer,
    provisioner: ImageProvisioner,
    runtime: Arc<dyn ContainerRuntime>,
    credentials: Vec<(String, String)>,
}

impl WorkflowOrchestrator {
    pub fn new(
        config: RunnerConfig,
        vcs: Arc<dyn VersionControl>,
        images: Arc<dyn ImageStore>,
        runtime: Arc<dyn ContainerRuntime>,
    ) -> Self {
        let credentials = config.credentials_from_env();
        Self {
            synchronizer: RepoSynchronizer::new(vcs),
            provisioner: ImageProvisioner::new(images, config.tool_dir.clone()),
            runtime,
            credentials,
            config,
        }
    }

    /// Wires the git and docker command-line backends.
    pub fn from_config(config: RunnerConfig) -> Self {
        let docker = Arc::new(DockerCli::new(config.docker_program.clone()));
        let git = Arc::new(GitCli::new(config.git_program.clone()));
        Self::new(config, git, docker.clone(), docker)
    }

    /// Runs one workflow. Log lines go to `logs` as they happen; the sink is
    /// dropped on return, which ends the caller's stream.
    pub async fn execute(&self, request: &WorkflowRequest, logs: LogSink) -> RunnerResult<RunResult> {
        request.validate()?;
        let deadline = Deadline::after(request.timeout);
        let checkout = absolute(&request.resolve_checkout_dir(&self.config.repos_root)?)?;
        let git_ref = request.git_ref();

        tracing::info!(repo = %request.repo_url, git_ref, workflow = %request.workflow, "starting workflow");
        let synced = self
            .synchronizer
            .sync(&checkout, &request.repo_url, git_ref, deadline, &logs)
            .await?;
        tracing::debug!(?synced, checkout = %checkout.display(), "repository ready");

        let project = classify(&checkout);
        logs.info(format!("detected project type: {project}"));
        if project == ProjectType::Unknown {
            tracing::warn!(checkout = %checkout.display(), "no project manifest found; falling back to the polyglot image");
        }
        require_entry(request, project)?;

        let image = self.provisioner.ensure(project, deadline, &logs).await?;
        let (ui_port, api_port) = resolve_host_ports(request, project)?;

        let work_dir = tempfile::Builder::new().prefix("runner-work-").tempdir()?;
        let plan = ContainerPlan {
            name: format!("runner-{}", Uuid::new_v4()),
            image,
            limits: self.config.limits.clone(),
            user: host_user(),
            workflow: request.workflow,
            service: request.service,
            project,
            entry: request.entry().map(str::to_string),
            ui_port,
            api_port,
            env: self.container_env(request),
            env_file: request.env_file.clone(),
            repo_dir: checkout,
            work_dir: work_dir.path().to_path_buf(),
        };
        for (what, port) in plan.published() {
            logs.info(format!("{what} will be published on http://localhost:{port}"));
        }

        tracing::info!(container = %plan.name, image = %plan.image, "starting container");
        let outcome = self.runtime.run_container(&plan.to_args(), deadline, &logs).await;

        if let Err(RunnerError::Cancelled { .. }) = &outcome {
            // the client is dead but the container may not be
            logs.info(format!("timed out; removing container {}", plan.name));
            if let Err(e) = self.runtime.remove_container(&plan.name).await {
                tracing::warn!(container = %plan.name, error = %e, "failed to remove container");
            }
        }

        // only after the container is gone
        if let Err(e) = work_dir.close() {
            tracing::warn!(error = %e, "failed to remove work directory");
        }

        match &outcome {
            Ok(res) => tracing::info!(exit_code = res.exit_code, "workflow finished"),
            Err(e) => tracing::warn!(error = %e, "workflow failed"),
        }
        outcome
    }

    /// Caller pairs first, then credentials from our environment the caller did not set.
    fn container_env(&self, request: &WorkflowRequest) -> Vec<(String, String)> {
        let mut env = request.env.clone();
        for (k, v) in &self.credentials {
            if !env.iter().any(|(existing, _)| existing == k) {
                env.push((k.clone(), v.clone()));
            }
        }
        env
    }
}

/// A single-service `run` needs to know what to execute.
pub fn require_entry(request: &WorkflowRequest, project: ProjectType) -> RunnerResult<()> {
    if request.workflow == Workflow::Run
        && project != ProjectType::Polyglot
        && request.service != Service::Ui
        && request.entry().is_none()
    {
        return Err(RunnerError::Validation(format!(
            "an entry file is required to run a {project} project (e.g. --entry server.py)"
        )));
    }
    Ok(())
}

/// Replaces 0 with a free port for every port a `run` will publish. Other
/// workflows publish only what was asked for explicitly.
pub fn resolve_host_ports(request: &WorkflowRequest, project: ProjectType) -> RunnerResult<(u16, u16)> {
    if request.workflow != Workflow::Run {
        return Ok((request.ui_port, request.api_port));
    }
    let pick = |port: u16| if port == 0 { allocate_free_port() } else { Ok(port) };

    if project == ProjectType::Polyglot {
        let ui = if request.service.wants_ui() { pick(request.ui_port)? } else { request.ui_port };
        let api = if request.service.wants_api() { pick(request.api_port)? } else { request.api_port };
        Ok((ui, api))
    } else {
        Ok((request.ui_port, pick(request.api_port)?))
    }
}

#[cfg(unix)]
fn host_user() -> Option<(u32, u32)> {
    // SAFETY: getuid/getgid cannot fail and touch no memory
    let (uid, gid) = unsafe { (libc::getuid(), libc::getgid()) };
    Some((uid, gid))
}

#[cfg(not(unix))]
fn host_user() -> Option<(u32, u32)> {
    None
}

/// Bind mounts need absolute host paths.
fn absolute(path: &Path) -> RunnerResult<PathBuf> {
    if path.is_absolute() {
        Ok(path.to_path_buf())
    } else {
        Ok(std::env::current_dir()?.join(path))
    }
}
