use std::path::Path;

use crate::models::ProjectType;

const PYTHON_MANIFESTS: &[&str] = &["pyproject.toml", "requirements.txt", "Pipfile"];
const NODE_MANIFESTS: &[&str] = &["package.json"];

// Two-service monorepo convention: a Python API next to a Node frontend.
const PYTHON_SERVICE_DIRS: &[&str] = &["api", "backend"];
const NODE_SERVICE_DIRS: &[&str] = &["ui", "frontend"];

/// Classifies a working copy by the manifests it contains. Never fails.
pub fn classify(dir: &Path) -> ProjectType {
    let has_python = |base: &Path| PYTHON_MANIFESTS.iter().any(|m| base.join(m).is_file());
    let has_node = |base: &Path| NODE_MANIFESTS.iter().any(|m| base.join(m).is_file());

    let python_service = PYTHON_SERVICE_DIRS.iter().any(|d| has_python(&dir.join(d)));
    let node_service = NODE_SERVICE_DIRS.iter().any(|d| has_node(&dir.join(d)));
    if python_service && node_service {
        return ProjectType::Polyglot;
    }

    match (has_python(dir), has_node(dir)) {
        (true, true) => ProjectType::Polyglot,
        (true, false) => ProjectType::Python,
        (false, true) => ProjectType::Node,
        (false, false) => ProjectType::Unknown,
    }
}
