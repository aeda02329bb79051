//! Given a workflow and repo facts, returns the subset of jobs to run.

use globset::{Glob, GlobSetBuilder};

use crate::plan::{RunPlan, SkipReason};
use crate::repo_facts::RepoFacts;
use crate::workflow::Workflow;
use crate::{Error, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Mode {
    All,
    Diff,
}

/// Selects which jobs run given the workflow, selection mode, repo facts,
/// and comparison ref.
///
/// In `All` mode every job is selected. In `Diff` mode a job is selected
/// unless it has `diff_enabled = true` *and* a non-empty `paths` list none
/// of whose globs match any changed path — in which case it is skipped with
/// reason `NoMatchingPaths`. Skips do not propagate: a downstream job that
/// `needs` a skipped job still runs (`needs` encodes ordering only).
pub fn select(
    workflow: &Workflow,
    mode: Mode,
    repo_facts: Option<&dyn RepoFacts>,
    compare_ref: Option<&str>,
) -> Result<RunPlan> {
    let changed = match mode {
        Mode::All => None,
        Mode::Diff => {
            let facts = repo_facts.ok_or_else(|| Error::NotARepository(".".into()))?;
            let compare_ref = compare_ref.ok_or_else(|| Error::UnknownRef("".into()))?;
            Some(facts.changed_paths(compare_ref)?)
        }
    };

    let mut selected = Vec::new();
    let mut skipped = Vec::new();

    for job in &workflow.jobs {
        let include = match mode {
            Mode::All => true,
            Mode::Diff => {
                if !job.diff_enabled {
                    true
                } else if job.paths.is_empty() {
                    true
                } else {
                    let changed = changed.as_ref().unwrap();
                    matches_any(&job.paths, changed)?
                }
            }
        };
        if include {
            selected.push(job.name.clone());
        } else {
            skipped.push((job.name.clone(), SkipReason::NoMatchingPaths));
        }
    }

    Ok(RunPlan::new(selected, skipped))
}

fn matches_any(globs: &[String], changed: &std::collections::BTreeSet<std::path::PathBuf>) -> Result<bool> {
    let mut builder = GlobSetBuilder::new();
    for g in globs {
        builder.add(Glob::new(g)?);
    }
    let set = builder.build()?;
    Ok(changed.iter().any(|p| set.is_match(p)))
}
