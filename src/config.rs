use std::path::PathBuf;
use std::time::Duration;

// Runner images and the files they are built from. Not secrets.
pub const IMAGE_PREFIX: &str = "zeno/runner-";
pub const IMAGE_TAG: &str = "latest";
pub const ENTRYPOINT_SCRIPT: &str = "runner.sh";
pub const BUILD_FILE_SUFFIX: &str = ".Dockerfile";

// Container resource ceilings
pub const CONTAINER_CPUS: &str = "2";
pub const CONTAINER_MEMORY: &str = "4g";
pub const CONTAINER_PIDS_LIMIT: u32 = 256;

// In-container ports. Single-service images listen on TARGET and are reached through EXPOSE.
pub const EXPOSE_PORT: u16 = 5001;
pub const TARGET_PORT: u16 = 5000;
pub const UI_CONTAINER_PORT: u16 = 3000;
pub const API_CONTAINER_PORT: u16 = 8000;

// Mount points inside the container
pub const REPO_MOUNT: &str = "/input";
pub const WORK_MOUNT: &str = "/work";

pub const DEFAULT_REF: &str = "main";
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(10 * 60);
pub const DEFAULT_REPOS_ROOT: &str = "repos";

/// Forwarded into the container when set in our own environment.
pub const CREDENTIAL_VARS: &[&str] = &["TEST_OPENAI_API_KEY"];

pub const MAX_LOG_LINE_BYTES: usize = 10 * 1024 * 1024;
/// How long readers may keep draining after a killed process has been reaped.
pub const KILL_GRACE: Duration = Duration::from_secs(5);
/// How long readers may keep draining after the process exited on its own.
/// Anything still holding its output open after that is killed.
pub const EXIT_DRAIN_GRACE: Duration = Duration::from_secs(1);

/// Resource ceilings handed to the container runtime.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ContainerLimits {
    pub cpus: String,
    pub memory: String,
    pub pids: u32,
}

impl Default for ContainerLimits {
    fn default() -> Self {
        Self {
            cpus: CONTAINER_CPUS.to_string(),
            memory: CONTAINER_MEMORY.to_string(),
            pids: CONTAINER_PIDS_LIMIT,
        }
    }
}

#[derive(Debug, Clone)]
pub struct RunnerConfig {
    /// Directory holding the runner build-files and entrypoint script.
    pub tool_dir: PathBuf,
    /// Parent of derived checkout directories.
    pub repos_root: PathBuf,
    pub docker_program: String,
    pub git_program: String,
    pub limits: ContainerLimits,
    pub credential_vars: Vec<String>,
}

impl Default for RunnerConfig {
    fn default() -> Self {
        Self {
            tool_dir: PathBuf::from("."),
            repos_root: PathBuf::from(DEFAULT_REPOS_ROOT),
            docker_program: "docker".to_string(),
            git_program: "git".to_string(),
            limits: ContainerLimits::default(),
            credential_vars: CREDENTIAL_VARS.iter().map(|s| s.to_string()).collect(),
        }
    }
}

impl RunnerConfig {
    /// Builds the config from `RUNNER_*` environment variables, falling back to defaults.
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let non_empty = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());
        let defaults = Self::default();

        let tool_dir = non_empty("RUNNER_TOOL_DIR")
            .map(PathBuf::from)
            .or_else(|| std::env::current_dir().ok())
            .unwrap_or(defaults.tool_dir);

        Self {
            tool_dir,
            repos_root: non_empty("RUNNER_REPOS_ROOT").map(PathBuf::from).unwrap_or(defaults.repos_root),
            docker_program: non_empty("RUNNER_DOCKER").unwrap_or(defaults.docker_program),
            git_program: non_empty("RUNNER_GIT").unwrap_or(defaults.git_program),
            limits: defaults.limits,
            credential_vars: defaults.credential_vars,
        }
    }

    /// Credential pairs from our own environment that should reach the container.
    pub fn credentials_from_env(&self) -> Vec<(String, String)> {
        self.credential_vars
            .iter()
            .filter_map(|k| std::env::var(k).ok().filter(|v| !v.is_empty()).map(|v| (k.clone(), v)))
            .collect()
    }
}
