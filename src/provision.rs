use std::path::PathBuf;
use std::sync::Arc;

use crate::config;
use crate::error::{RunnerError, RunnerResult};
use crate::logs::LogSink;
use crate::models::ProjectType;
use crate::process::Deadline;
use crate::runners::ImageStore;

/// Makes sure the runner image for a project type is in the local store.
///
/// Building is skipped when the image is already there, so running this twice
/// for the same type (even concurrently) only costs an extra inspect or a
/// redundant build.
pub struct ImageProvisioner {
    store: Arc<dyn ImageStore>,
    tool_dir: PathBuf,
}

impl ImageProvisioner {
    pub fn new(store: Arc<dyn ImageStore>, tool_dir: impl Into<PathBuf>) -> Self {
        Self {
            store,
            tool_dir: tool_dir.into(),
        }
    }

    pub async fn ensure(&self, project: ProjectType, deadline: Deadline, logs: &LogSink) -> RunnerResult<String> {
        let image = project.image_ref();
        if self.store.image_exists(&image, deadline).await? {
            tracing::debug!(%image, "runner image already present");
            return Ok(image);
        }

        let build_file = self.tool_dir.join(project.build_file());
        for required in [build_file.clone(), self.tool_dir.join(config::ENTRYPOINT_SCRIPT)] {
            if !required.is_file() {
                return Err(RunnerError::MissingBuildFile { path: required });
            }
        }

        tracing::info!(%image, build_file = %build_file.display(), "building runner image");
        logs.info(format!("building runner image {image} using {}", project.build_file()));
        self.store
            .build_image(&image, &build_file, &self.tool_dir, deadline, logs)
            .await?;
        Ok(image)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runners::fakes::FakeImageStore;
    use std::time::Duration;

    fn deadline() -> Deadline {
        Deadline::after(Duration::from_secs(10))
    }

    fn tool_dir(files: &[&str]) -> tempfile::TempDir {
        let tmp = tempfile::tempdir().unwrap();
        for f in files {
            std::fs::write(tmp.path().join(f), "").unwrap();
        }
        tmp
    }

    #[tokio::test]
    async fn test_existing_image_skips_build() {
        let store = Arc::new(FakeImageStore::with_image("zeno/runner-node:latest"));
        // no build-files at all: they are only needed when building
        let empty = tempfile::tempdir().unwrap();

        let image = ImageProvisioner::new(store.clone(), empty.path())
            .ensure(ProjectType::Node, deadline(), &LogSink::discard())
            .await
            .unwrap();

        assert_eq!(image, "zeno/runner-node:latest");
        assert_eq!(store.build_count(), 0);
    }

    #[tokio::test]
    async fn test_built_and_existing_image_refs_match() {
        let tools = tool_dir(&["runner-python.Dockerfile", "runner.sh"]);
        let store = Arc::new(FakeImageStore::default());
        let provisioner = ImageProvisioner::new(store.clone(), tools.path());

        let built = provisioner.ensure(ProjectType::Python, deadline(), &LogSink::discard()).await.unwrap();
        let cached = provisioner.ensure(ProjectType::Python, deadline(), &LogSink::discard()).await.unwrap();

        assert_eq!(built, cached);
        assert_eq!(store.build_count(), 1);
        let builds = store.builds.lock().unwrap();
        assert_eq!(builds[0].1, tools.path().join("runner-python.Dockerfile"));
    }

    #[tokio::test]
    async fn test_unknown_uses_polyglot_build_file() {
        let tools = tool_dir(&["runner-polyglot.Dockerfile", "runner.sh"]);
        let store = Arc::new(FakeImageStore::default());

        let image = ImageProvisioner::new(store, tools.path())
            .ensure(ProjectType::Unknown, deadline(), &LogSink::discard())
            .await
            .unwrap();
        assert_eq!(image, "zeno/runner-polyglot:latest");
    }

    #[tokio::test]
    async fn test_missing_prerequisites_are_config_errors() {
        let store = Arc::new(FakeImageStore::default());

        let no_script = tool_dir(&["runner-node.Dockerfile"]);
        let err = ImageProvisioner::new(store.clone(), no_script.path())
            .ensure(ProjectType::Node, deadline(), &LogSink::discard())
            .await
            .unwrap_err();
        assert!(matches!(&err, RunnerError::MissingBuildFile { path } if path.ends_with("runner.sh")));

        let no_build_file = tool_dir(&["runner.sh"]);
        let err = ImageProvisioner::new(store.clone(), no_build_file.path())
            .ensure(ProjectType::Node, deadline(), &LogSink::discard())
            .await
            .unwrap_err();
        assert!(matches!(&err, RunnerError::MissingBuildFile { path } if path.ends_with("runner-node.Dockerfile")));
        assert_eq!(store.build_count(), 0);
    }

    #[tokio::test]
    async fn test_build_failure_is_surfaced() {
        let tools = tool_dir(&["runner-node.Dockerfile", "runner.sh"]);
        let store = Arc::new(FakeImageStore { fail_build: true, ..Default::default() });

        let err = ImageProvisioner::new(store, tools.path())
            .ensure(ProjectType::Node, deadline(), &LogSink::discard())
            .await
            .unwrap_err();
        assert!(matches!(err, RunnerError::ImageBuild { exit_code: 1, .. }));
    }
}
