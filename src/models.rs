use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

use crate::config;
use crate::error::RunnerError;

/// Exit code reported when the real one could not be determined.
pub const EXIT_CODE_UNKNOWN: i32 = -1;

// ---- workflow selection ----
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum Workflow {
    Run,
    Test,
    Build,
    Lint,
}

impl Workflow {
    pub fn as_str(&self) -> &'static str {
        match self {
            Workflow::Run => "run",
            Workflow::Test => "test",
            Workflow::Build => "build",
            Workflow::Lint => "lint",
        }
    }
}

impl fmt::Display for Workflow {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Workflow {
    type Err = RunnerError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim() {
            "run" => Ok(Workflow::Run),
            "test" => Ok(Workflow::Test),
            "build" => Ok(Workflow::Build),
            "lint" => Ok(Workflow::Lint),
            other => Err(RunnerError::Validation(format!(
                "workflow must be one of run|test|build|lint, got '{other}'"
            ))),
        }
    }
}

/// Which services of a polyglot project a `run` should start.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum Service {
    #[default]
    All,
    Ui,
    Api,
}

impl Service {
    pub fn as_str(&self) -> &'static str {
        match self {
            Service::All => "all",
            Service::Ui => "ui",
            Service::Api => "api",
        }
    }

    pub fn wants_ui(&self) -> bool {
        matches!(self, Service::All | Service::Ui)
    }

    pub fn wants_api(&self) -> bool {
        matches!(self, Service::All | Service::Api)
    }
}

impl fmt::Display for Service {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Service {
    type Err = RunnerError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim() {
            "all" | "" => Ok(Service::All),
            "ui" => Ok(Service::Ui),
            "api" => Ok(Service::Api),
            other => Err(RunnerError::Validation(format!(
                "service must be one of all|ui|api, got '{other}'"
            ))),
        }
    }
}

// ---- project classification ----
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum ProjectType {
    Python,
    Node,
    Polyglot,
    Unknown,
}

impl ProjectType {
    pub fn as_str(&self) -> &'static str {
        match self {
            ProjectType::Python => "python",
            ProjectType::Node => "node",
            ProjectType::Polyglot => "polyglot",
            ProjectType::Unknown => "unknown",
        }
    }

    /// The runner image flavor used for this project. Unknown projects get the
    /// polyglot image since it carries both toolchains.
    pub fn image_flavor(&self) -> ProjectType {
        match self {
            ProjectType::Unknown => ProjectType::Polyglot,
            other => *other,
        }
    }

    /// e.g. `zeno/runner-node:latest`
    pub fn image_ref(&self) -> String {
        format!("{}{}:{}", config::IMAGE_PREFIX, self.image_flavor().as_str(), config::IMAGE_TAG)
    }

    /// e.g. `runner-node.Dockerfile`
    pub fn build_file(&self) -> String {
        format!("runner-{}{}", self.image_flavor().as_str(), config::BUILD_FILE_SUFFIX)
    }
}

impl fmt::Display for ProjectType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// ---- invocation ----
#[derive(Debug, Clone)]
pub struct WorkflowRequest {
    pub repo_url: String,
    pub git_ref: String,
    pub workflow: Workflow,
    pub service: Service,
    pub entry: Option<String>,
    /// Host ports; 0 picks a free one for `run`.
    pub ui_port: u16,
    pub api_port: u16,
    /// Derived from the repository basename when absent.
    pub checkout_dir: Option<PathBuf>,
    pub timeout: Duration,
    pub env: Vec<(String, String)>,
    pub env_file: Option<PathBuf>,
}

impl WorkflowRequest {
    pub fn new(repo_url: impl Into<String>, workflow: Workflow) -> Self {
        Self {
            repo_url: repo_url.into(),
            git_ref: config::DEFAULT_REF.to_string(),
            workflow,
            service: Service::All,
            entry: None,
            ui_port: 0,
            api_port: 0,
            checkout_dir: None,
            timeout: config::DEFAULT_TIMEOUT,
            env: Vec::new(),
            env_file: None,
        }
    }

    pub fn git_ref(&self) -> &str {
        let r = self.git_ref.trim();
        if r.is_empty() { config::DEFAULT_REF } else { r }
    }

    /// Entry file, if one was given and is not blank.
    pub fn entry(&self) -> Option<&str> {
        self.entry.as_deref().map(str::trim).filter(|e| !e.is_empty())
    }

    /// Rejects anything that would make us read from the local filesystem.
    pub fn validate(&self) -> Result<(), RunnerError> {
        validate_repo_url(&self.repo_url)?;
        for (k, _) in &self.env {
            if k.is_empty() || k.contains('=') {
                return Err(RunnerError::Validation(format!("invalid environment key '{k}'")));
            }
        }
        if let Some(file) = &self.env_file {
            if !file.is_file() {
                return Err(RunnerError::Validation(format!("env file {} does not exist", file.display())));
            }
        }
        if self.timeout.is_zero() {
            return Err(RunnerError::Validation("timeout must be greater than zero".into()));
        }
        Ok(())
    }

    pub fn resolve_checkout_dir(&self, repos_root: &Path) -> Result<PathBuf, RunnerError> {
        if let Some(dir) = &self.checkout_dir {
            return Ok(dir.clone());
        }
        let name = repo_basename(&self.repo_url).ok_or_else(|| {
            RunnerError::Validation(format!("cannot derive a checkout name from '{}'", self.repo_url))
        })?;
        Ok(repos_root.join(name))
    }
}

pub fn validate_repo_url(url: &str) -> Result<(), RunnerError> {
    let trimmed = url.trim();
    if trimmed.is_empty() {
        return Err(RunnerError::Validation("repository url is required".into()));
    }
    if trimmed.to_ascii_lowercase().contains("file://") || trimmed.starts_with('/') || trimmed.starts_with('\\') {
        return Err(RunnerError::Validation(format!("invalid repo url '{trimmed}': local paths are not allowed")));
    }
    match url::Url::parse(trimmed) {
        Ok(parsed) => match parsed.scheme() {
            "http" | "https" | "ssh" | "git" => Ok(()),
            other => Err(RunnerError::Validation(format!("invalid repo url '{trimmed}': unsupported scheme '{other}'"))),
        },
        // scp-like `git@host:org/repo.git`
        Err(_) if looks_like_scp(trimmed) => Ok(()),
        Err(e) => Err(RunnerError::Validation(format!("invalid repo url '{trimmed}': {e}"))),
    }
}

fn looks_like_scp(s: &str) -> bool {
    match s.split_once(':') {
        Some((host, path)) => !host.is_empty() && !host.contains('/') && !path.is_empty() && !path.starts_with("//"),
        None => false,
    }
}

/// Last path segment of the repository URL without a trailing `.git`.
pub fn repo_basename(url: &str) -> Option<String> {
    let trimmed = url.trim();
    let path = match url::Url::parse(trimmed) {
        Ok(parsed) => parsed.path().to_string(),
        Err(_) => trimmed.rsplit_once(':').map(|(_, p)| p.to_string()).unwrap_or_else(|| trimmed.to_string()),
    };
    let last = path.trim_end_matches('/').rsplit('/').next()?.trim();
    let name = last.strip_suffix(".git").unwrap_or(last);
    if name.is_empty() || name == "." || name == ".." {
        None
    } else {
        Some(name.to_string())
    }
}

/// Outcome of one workflow invocation. A nonzero exit code is data, not an error.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct RunResult {
    pub exit_code: i32,
    pub stdout: String,
    pub stderr: String,
}

impl RunResult {
    pub fn success(&self) -> bool {
        self.exit_code == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_workflow_parse() {
        assert_eq!("lint".parse::<Workflow>().unwrap(), Workflow::Lint);
        assert!(matches!("deploy".parse::<Workflow>(), Err(RunnerError::Validation(_))));
        assert_eq!("".parse::<Service>().unwrap(), Service::All);
        assert!("web".parse::<Service>().is_err());
    }

    #[test]
    fn test_image_naming_follows_project_type() {
        assert_eq!(ProjectType::Node.image_ref(), "zeno/runner-node:latest");
        assert_eq!(ProjectType::Python.build_file(), "runner-python.Dockerfile");
        assert_eq!(ProjectType::Unknown.image_ref(), ProjectType::Polyglot.image_ref());
        assert_eq!(ProjectType::Unknown.build_file(), "runner-polyglot.Dockerfile");
    }

    #[test]
    fn test_validate_repo_url() {
        assert!(validate_repo_url("https://example.com/sample.git").is_ok());
        assert!(validate_repo_url("git@github.com:org/repo.git").is_ok());
        assert!(validate_repo_url("ssh://git@host/org/repo").is_ok());

        for bad in ["", "file:///etc", "FILE://x", "/srv/repo", "https://x/?u=file://y", "ftp://host/repo"] {
            assert!(
                matches!(validate_repo_url(bad), Err(RunnerError::Validation(_))),
                "expected '{bad}' to be rejected"
            );
        }
    }

    #[test]
    fn test_repo_basename() {
        assert_eq!(repo_basename("https://example.com/sample.git").as_deref(), Some("sample"));
        assert_eq!(repo_basename("https://example.com/org/app/").as_deref(), Some("app"));
        assert_eq!(repo_basename("git@github.com:org/tool.git").as_deref(), Some("tool"));
        assert_eq!(repo_basename("https://example.com/"), None);
    }

    #[test]
    fn test_request_defaults_and_checkout_dir() {
        let mut req = WorkflowRequest::new("https://example.com/sample.git", Workflow::Test);
        assert_eq!(req.git_ref(), "main");
        assert_eq!(req.timeout, Duration::from_secs(600));
        assert_eq!(
            req.resolve_checkout_dir(Path::new("repos")).unwrap(),
            PathBuf::from("repos/sample")
        );

        req.checkout_dir = Some(PathBuf::from("/tmp/elsewhere"));
        assert_eq!(req.resolve_checkout_dir(Path::new("repos")).unwrap(), PathBuf::from("/tmp/elsewhere"));

        req.entry = Some("  ".into());
        assert_eq!(req.entry(), None);
    }

    #[test]
    fn test_validate_env_keys() {
        let mut req = WorkflowRequest::new("https://example.com/sample.git", Workflow::Run);
        req.env.push(("OK_KEY".into(), "v".into()));
        assert!(req.validate().is_ok());
        req.env.push(("BAD=KEY".into(), "v".into()));
        assert!(req.validate().is_err());
    }

    #[test]
    fn test_missing_env_file_is_rejected() {
        let mut req = WorkflowRequest::new("https://example.com/sample.git", Workflow::Test);
        req.env_file = Some(PathBuf::from("/definitely/not/here.env"));
        assert!(matches!(req.validate(), Err(RunnerError::Validation(_))));
    }

    #[test]
    fn test_run_result_serialization() {
        let res = RunResult { exit_code: 3, stdout: "[stdout] hi\n".into(), stderr: String::new() };
        let json = serde_json::to_value(&res).unwrap();
        assert_eq!(json["exit_code"], 3);
        assert!(!res.success());
    }
}
