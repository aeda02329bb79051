//! Workflow loader: turns a file on disk into a [`Workflow`] value. No
//! authoring DSL of its own — dispatch by file extension to the matching
//! `serde` format, plus an upward directory search so kiln can be invoked
//! from any subdirectory of a repo.

use std::path::{Path, PathBuf};

use crate::workflow::Workflow;
use crate::{Error, Result};

const CANDIDATE_NAMES: &[&str] = &["kiln.toml", "kiln.yaml", "kiln.yml", "kiln.json"];

/// Finds the workflow file for `start_dir`: an explicit override via
/// `KILN_FILE`, else the nearest `kiln.{toml,yaml,yml,json}` found by
/// searching `start_dir` and its ancestors.
pub fn find(start_dir: &Path) -> Option<PathBuf> {
    if let Some(path) = crate::env::KILN_FILE.as_ref() {
        return Some(PathBuf::from(path));
    }
    let mut dir = Some(start_dir);
    while let Some(d) = dir {
        for name in CANDIDATE_NAMES {
            let candidate = d.join(name);
            if candidate.is_file() {
                return Some(candidate);
            }
        }
        dir = d.parent();
    }
    None
}

/// Loads and structurally validates a [`Workflow`] from `path`, dispatching
/// on its extension.
pub fn load(path: &Path) -> Result<Workflow> {
    let raw = std::fs::read_to_string(path)?;
    let workflow = match path.extension().and_then(|e| e.to_str()) {
        Some("toml") => toml::from_str(&raw)?,
        Some("yaml") | Some("yml") => serde_yaml::from_str(&raw)?,
        Some("json") => serde_json::from_str(&raw)?,
        other => {
            return Err(Error::WorkflowLoad {
                file: path.display().to_string(),
                message: format!("unrecognized workflow file extension {other:?}"),
            });
        }
    };
    validate_or_wrap(path, workflow)
}

fn validate_or_wrap(path: &Path, workflow: Workflow) -> Result<Workflow> {
    match workflow.validate() {
        Ok(()) => Ok(workflow),
        Err(Error::WorkflowLoad { message, .. }) => {
            Err(Error::WorkflowLoad { file: path.display().to_string(), message })
        }
        Err(other) => Err(other),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn loads_toml_workflow() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("kiln.toml");
        std::fs::write(
            &path,
            r#"
            [[jobs]]
            name = "build"
            [[jobs.steps]]
            name = "compile"
            command = "cargo build"
            "#,
        )
        .unwrap();
        let workflow = load(&path).unwrap();
        assert_eq!(workflow.jobs.len(), 1);
        assert_eq!(workflow.jobs[0].name, "build");
    }

    #[test]
    fn rejects_unknown_extension() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("kiln.ini");
        std::fs::write(&path, "").unwrap();
        assert!(matches!(load(&path), Err(Error::WorkflowLoad { .. })));
    }

    #[test]
    fn find_searches_upward() {
        let root = tempdir().unwrap();
        std::fs::write(root.path().join("kiln.toml"), "jobs = []").unwrap();
        let nested = root.path().join("a/b/c");
        std::fs::create_dir_all(&nested).unwrap();
        assert_eq!(find(&nested), Some(root.path().join("kiln.toml")));
    }
}
