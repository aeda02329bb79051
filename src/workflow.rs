//! The data model: [`Step`], [`Job`], [`Workflow`].
//!
//! These records are immutable once a workflow is loaded — nothing in the
//! engine mutates a `Job` or `Step` after [`Workflow::validate`] has run.
//! `serde`-derived, `IndexMap`/`IndexSet` for order-preserving collections,
//! `#[serde(rename_all = "snake_case")]` on the wire.

use indexmap::{IndexMap, IndexSet};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// An atomic executable action within a job.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub struct Step {
    /// Non-empty step name, unique within its job.
    pub name: String,
    /// The step's kind discriminator: `"shell"` or an extension tag.
    #[serde(default = "default_kind")]
    pub kind: String,
    /// Shell command (required for the `shell` kind).
    #[serde(default)]
    pub command: Option<String>,
    /// Working directory, relative to the repo root.
    #[serde(default)]
    pub dir: Option<String>,
    /// Kind-specific payload, opaque to the core engine.
    #[serde(default)]
    pub with: IndexMap<String, serde_json::Value>,
}

fn default_kind() -> String {
    "shell".to_string()
}

impl Step {
    pub fn working_dir(&self) -> &str {
        self.dir.as_deref().unwrap_or(".")
    }
}

/// A named, dependency-ordered unit of execution containing one or more steps.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub struct Job {
    /// Unique name within the workflow.
    pub name: String,
    /// Ordered, non-empty list of steps.
    pub steps: Vec<Step>,
    /// Names of jobs that must complete before this one starts.
    #[serde(default)]
    pub needs: IndexSet<String>,
    /// Globs used by change-aware selection. Empty means "no path filter".
    #[serde(default)]
    pub paths: Vec<String>,
    /// When false, this job is always selected regardless of the diff.
    #[serde(default = "default_true")]
    pub diff_enabled: bool,
    /// Globs whose hashed content contributes to the cache key.
    #[serde(default)]
    pub inputs: Vec<String>,
    /// Environment applied to every step, overriding the inherited process env.
    #[serde(default)]
    pub env: IndexMap<String, String>,
    /// Directories (relative to the workspace) saved/restored atomically.
    #[serde(default)]
    pub cache_dirs: Vec<PathBuf>,
    /// External tool names whose versions contribute to the cache key.
    #[serde(default)]
    pub requires: IndexSet<String>,
    /// Prune retention for this job's cache key family.
    #[serde(default = "default_cache_keep")]
    pub cache_keep: u32,
}

fn default_true() -> bool {
    true
}

fn default_cache_keep() -> u32 {
    5
}

impl Job {
    pub fn caching_enabled(&self) -> bool {
        !self.cache_dirs.is_empty()
    }
}

/// An ordered list of [`Job`]s with unique names, forming a DAG via `needs`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Workflow {
    pub jobs: Vec<Job>,
}

impl Workflow {
    pub fn new(jobs: Vec<Job>) -> Self {
        Self { jobs }
    }

    pub fn job(&self, name: &str) -> Option<&Job> {
        self.jobs.iter().find(|j| j.name == name)
    }

    /// Structural validation independent of the DAG: unique names, non-empty
    /// steps, `needs` referring to names present in the workflow, no
    /// self-reference, and `cache_dirs` confined to the workspace (rejected
    /// at load, not merely warned about).
    pub fn validate(&self) -> crate::Result<()> {
        let mut seen = IndexSet::new();
        for job in &self.jobs {
            if job.name.is_empty() {
                return Err(crate::Error::WorkflowLoad {
                    file: String::new(),
                    message: "job name must not be empty".into(),
                });
            }
            if !is_safe_path_component(&job.name) {
                return Err(crate::Error::WorkflowLoad {
                    file: String::new(),
                    message: format!("job name {:?} must not contain path separators or '..'", job.name),
                });
            }
            if !seen.insert(job.name.clone()) {
                return Err(crate::Error::DuplicateJob(job.name.clone()));
            }
            if job.steps.is_empty() {
                return Err(crate::Error::WorkflowLoad {
                    file: String::new(),
                    message: format!("job {:?} must have at least one step", job.name),
                });
            }
            if job.needs.contains(&job.name) {
                return Err(crate::Error::WorkflowLoad {
                    file: String::new(),
                    message: format!("job {:?} cannot depend on itself", job.name),
                });
            }
            for step in &job.steps {
                if step.name.is_empty() {
                    return Err(crate::Error::WorkflowLoad {
                        file: String::new(),
                        message: format!("job {:?} has a step with an empty name", job.name),
                    });
                }
                if !is_safe_path_component(&step.name) {
                    return Err(crate::Error::WorkflowLoad {
                        file: String::new(),
                        message: format!(
                            "job {:?} has a step name {:?} that must not contain path separators or '..'",
                            job.name, step.name
                        ),
                    });
                }
            }
            for dir in &job.cache_dirs {
                if dir.is_absolute() || dir.components().any(|c| matches!(c, std::path::Component::ParentDir)) {
                    return Err(crate::Error::CacheDirEscapesWorkspace {
                        job: job.name.clone(),
                        path: dir.display().to_string(),
                    });
                }
            }
        }
        for job in &self.jobs {
            for need in &job.needs {
                if !seen.contains(need) {
                    return Err(crate::Error::UnknownNeed {
                        job: job.name.clone(),
                        missing: need.clone(),
                    });
                }
            }
        }
        Ok(())
    }
}

/// Job and step names end up as path components (cache directories, log file
/// names), so they're held to the same rule as `cache_dirs`: no separators,
/// no `..`/`.`.
fn is_safe_path_component(name: &str) -> bool {
    !name.contains('/') && !name.contains('\\') && name != ".." && name != "."
}

#[cfg(test)]
mod tests {
    use super::*;

    fn step(name: &str) -> Step {
        Step { name: name.into(), kind: "shell".into(), command: Some("true".into()), dir: None, with: IndexMap::new() }
    }

    fn job(name: &str, needs: &[&str]) -> Job {
        Job {
            name: name.into(),
            steps: vec![step("s")],
            needs: needs.iter().map(|s| s.to_string()).collect(),
            paths: vec![],
            diff_enabled: true,
            inputs: vec![],
            env: IndexMap::new(),
            cache_dirs: vec![],
            requires: IndexSet::new(),
            cache_keep: 5,
        }
    }

    #[test]
    fn rejects_duplicate_names() {
        let wf = Workflow::new(vec![job("a", &[]), job("a", &[])]);
        assert!(matches!(wf.validate(), Err(crate::Error::DuplicateJob(_))));
    }

    #[test]
    fn rejects_unknown_need() {
        let wf = Workflow::new(vec![job("a", &["missing"])]);
        assert!(matches!(wf.validate(), Err(crate::Error::UnknownNeed { .. })));
    }

    #[test]
    fn rejects_self_reference() {
        let wf = Workflow::new(vec![job("a", &["a"])]);
        assert!(wf.validate().is_err());
    }

    #[test]
    fn rejects_escaping_cache_dir() {
        let mut j = job("a", &[]);
        j.cache_dirs.push(PathBuf::from("../escape"));
        let wf = Workflow::new(vec![j]);
        assert!(matches!(
            wf.validate(),
            Err(crate::Error::CacheDirEscapesWorkspace { .. })
        ));
    }

    #[test]
    fn accepts_well_formed_workflow() {
        let wf = Workflow::new(vec![job("a", &[]), job("b", &["a"])]);
        assert!(wf.validate().is_ok());
    }

    #[test]
    fn rejects_job_name_with_path_separator() {
        let wf = Workflow::new(vec![job("../escape", &[])]);
        assert!(matches!(wf.validate(), Err(crate::Error::WorkflowLoad { .. })));
    }

    #[test]
    fn rejects_step_name_with_path_separator() {
        let mut j = job("a", &[]);
        j.steps = vec![step("nested/step")];
        let wf = Workflow::new(vec![j]);
        assert!(matches!(wf.validate(), Err(crate::Error::WorkflowLoad { .. })));
    }
}
